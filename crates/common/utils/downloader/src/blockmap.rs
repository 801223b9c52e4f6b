// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Block map documents: a file described as an ordered run of checksummed
//! blocks.
//!
//! Documents are JSON, usually gzip-compressed when hosted next to an
//! artifact and raw-deflate-compressed when embedded in its trailer.

use std::io::{Read, Write};

use base64::{Engine, engine::general_purpose::STANDARD};
use flate2::{
    Compression,
    read::{DeflateDecoder, GzDecoder},
    write::{DeflateEncoder, GzEncoder},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::{ResultExt, ensure};

use crate::error::{
    BlockMapDecodeSnafu, BlockMapInflateSnafu, DownloadError, InvalidBlockMapSnafu,
    MissingFileEntrySnafu,
};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Entry name used when a document describes a single artifact. Versioned
/// artifact names differ between releases, so both maps share this one.
pub const DEFAULT_FILE_NAME: &str = "file";

/// Block map document: `{ version, files: [...] }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMap {
    pub version: String,
    pub files:   Vec<BlockMapFile>,
}

/// Block list of one logical file inside a block map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMapFile {
    pub name:      String,
    /// Offset of the first block within the artifact
    #[serde(default)]
    pub offset:    u64,
    pub checksums: Vec<String>,
    pub sizes:     Vec<u32>,
}

/// One block of a [`BlockMapFile`], with its absolute offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block<'a> {
    pub checksum: &'a str,
    pub size:     u32,
    pub offset:   u64,
}

impl BlockMapFile {
    /// Sum of all block sizes
    #[must_use]
    pub fn total_size(&self) -> u64 { self.sizes.iter().map(|s| u64::from(*s)).sum() }

    /// Blocks in file order
    pub fn blocks(&self) -> impl Iterator<Item = Block<'_>> + '_ {
        let mut offset = self.offset;
        self.checksums
            .iter()
            .zip(self.sizes.iter())
            .map(move |(checksum, size)| {
                let block = Block {
                    checksum: checksum.as_str(),
                    size:     *size,
                    offset,
                };
                offset += u64::from(*size);
                block
            })
    }
}

impl BlockMap {
    /// Parse a document, detecting gzip, plain JSON or raw deflate.
    pub fn decode(data: &[u8]) -> Result<Self, DownloadError> {
        if data.starts_with(&GZIP_MAGIC) {
            Self::decode_gzip(data)
        } else if data.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'{') {
            Self::from_json(data)
        } else {
            Self::decode_raw_deflate(data)
        }
    }

    pub fn decode_gzip(data: &[u8]) -> Result<Self, DownloadError> {
        let mut json = Vec::new();
        GzDecoder::new(data)
            .read_to_end(&mut json)
            .context(BlockMapInflateSnafu)?;
        Self::from_json(&json)
    }

    pub fn decode_raw_deflate(data: &[u8]) -> Result<Self, DownloadError> {
        let mut json = Vec::new();
        DeflateDecoder::new(data)
            .read_to_end(&mut json)
            .context(BlockMapInflateSnafu)?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &[u8]) -> Result<Self, DownloadError> {
        let map: Self = serde_json::from_slice(json).context(BlockMapDecodeSnafu)?;
        map.validate()?;
        Ok(map)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, DownloadError> {
        serde_json::to_vec(self).context(BlockMapDecodeSnafu)
    }

    pub fn encode_gzip(&self) -> Result<Vec<u8>, DownloadError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&self.to_json()?)
            .context(BlockMapInflateSnafu)?;
        encoder.finish().context(BlockMapInflateSnafu)
    }

    pub fn encode_raw_deflate(&self) -> Result<Vec<u8>, DownloadError> {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&self.to_json()?)
            .context(BlockMapInflateSnafu)?;
        encoder.finish().context(BlockMapInflateSnafu)
    }

    /// Every file must list exactly one size per checksum.
    pub fn validate(&self) -> Result<(), DownloadError> {
        for file in &self.files {
            ensure!(
                file.checksums.len() == file.sizes.len(),
                InvalidBlockMapSnafu {
                    message: format!(
                        "file {:?} has {} checksums but {} sizes",
                        file.name,
                        file.checksums.len(),
                        file.sizes.len()
                    ),
                }
            );
        }
        Ok(())
    }

    #[must_use]
    pub fn file(&self, name: &str) -> Option<&BlockMapFile> {
        self.files.iter().find(|f| f.name == name)
    }

    /// The file a differential download targets: the first entry.
    pub fn primary_file(&self, which: &'static str) -> Result<&BlockMapFile, DownloadError> {
        self.files.first().ok_or_else(|| {
            MissingFileEntrySnafu {
                name: "<first>",
                which,
            }
            .build()
        })
    }

    /// Describe `data` with fixed-size blocks, each checksummed as base64
    /// SHA-256.
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is zero.
    #[must_use]
    pub fn from_fixed_blocks(name: &str, data: &[u8], block_size: u32) -> Self {
        assert!(block_size > 0, "block size must be positive");
        let (checksums, sizes) = data
            .chunks(block_size as usize)
            .map(|block| {
                let checksum = STANDARD.encode(Sha256::digest(block));
                #[allow(clippy::cast_possible_truncation)]
                (checksum, block.len() as u32)
            })
            .unzip();

        Self {
            version: "2".to_string(),
            files:   vec![BlockMapFile {
                name: name.to_string(),
                offset: 0,
                checksums,
                sizes,
            }],
        }
    }
}

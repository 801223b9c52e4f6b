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

//! Where the old and new block maps come from.
//!
//! Artifacts either carry their block map in a trailer
//! (`<blocks><raw-deflate JSON><u32 BE length>`) or have it published next
//! to them as `<artifact>.blockmap`.

use std::{io::SeekFrom, path::Path};

use async_trait::async_trait;
use bon::Builder;
use bytes::Bytes;
use reqwest::Url;
use snafu::{ResultExt, ensure};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tracing::debug;

use crate::{
    blockmap::BlockMap,
    config::DownloaderConfig,
    error::{
        DownloadError, EmptyBlockMapDocumentSnafu, FileReadSnafu, InvalidTrailerSnafu,
        InvalidUrlSnafu,
    },
    http::HttpExecutor,
    types::DownloadSession,
};

const LENGTH_FIELD: u64 = 4;

/// Block maps of both versions, ready for planning
#[derive(Debug, Clone)]
pub struct BlockMaps {
    pub old:      BlockMap,
    pub new:      BlockMap,
    /// Bytes that follow the blocks in the new file and are written
    /// verbatim after them
    pub trailer:  Option<Bytes>,
    /// Size of the new file, when the source learned it
    pub new_size: Option<u64>,
}

#[async_trait]
pub trait BlockMapSource: Send + Sync {
    async fn load(
        &self,
        http: &HttpExecutor,
        config: &DownloaderConfig,
        session: &DownloadSession,
    ) -> Result<BlockMaps, DownloadError>;
}

/// Block maps stored in the artifacts' own trailers.
///
/// With both sizes known the remote trailer is fetched with one range
/// request; otherwise its length field is read first.
#[derive(Debug, Clone, Default, Builder)]
pub struct EmbeddedBlockMapSource {
    /// Compressed size of the new block map, without the length field
    pub new_block_map_size: Option<u32>,
    /// Size of the complete new file
    pub new_file_size:      Option<u64>,
}

#[async_trait]
impl BlockMapSource for EmbeddedBlockMapSource {
    async fn load(
        &self,
        http: &HttpExecutor,
        config: &DownloaderConfig,
        session: &DownloadSession,
    ) -> Result<BlockMaps, DownloadError> {
        let limit = config.block_map_size_limit.as_bytes();
        let known_size = self.new_file_size.or(session.new_size);

        let (trailer, file_size) = match (self.new_block_map_size, known_size) {
            (Some(map_size), Some(file_size)) => {
                let trailer_len = u64::from(map_size) + LENGTH_FIELD;
                ensure!(
                    trailer_len <= file_size,
                    InvalidTrailerSnafu {
                        message: format!(
                            "block map of {map_size} bytes does not fit in a {file_size} byte file"
                        ),
                    }
                );
                let read = http
                    .read_range(
                        &session.new_url,
                        &session.headers,
                        file_size - trailer_len,
                        file_size - 1,
                    )
                    .await?;
                (read.data, file_size)
            }
            _ => {
                let tail = http
                    .read_tail(&session.new_url, &session.headers, LENGTH_FIELD)
                    .await?;
                let map_size = u64::from(read_length(&tail.data)?);
                ensure!(
                    map_size <= limit,
                    InvalidTrailerSnafu {
                        message: format!("block map length {map_size} exceeds {limit} bytes"),
                    }
                );
                let file_size = known_size.or(tail.total).ok_or_else(|| {
                    InvalidTrailerSnafu {
                        message: "server did not report the size of the new file",
                    }
                    .build()
                })?;
                let read = http
                    .read_tail(&session.new_url, &session.headers, map_size + LENGTH_FIELD)
                    .await?;
                (read.data, file_size)
            }
        };

        let declared = u64::from(read_length(&trailer)?);
        ensure!(
            declared + LENGTH_FIELD == trailer.len() as u64,
            InvalidTrailerSnafu {
                message: format!(
                    "length field says {declared} bytes, trailer holds {}",
                    trailer.len() as u64 - LENGTH_FIELD
                ),
            }
        );
        let new = BlockMap::decode_raw_deflate(&trailer[..trailer.len() - LENGTH_FIELD as usize])?;
        let old = read_embedded_block_map(&session.old_file, limit).await?;
        debug!(
            trailer = trailer.len(),
            file_size, "Loaded embedded block maps"
        );

        Ok(BlockMaps {
            old,
            new,
            trailer: Some(trailer),
            new_size: Some(file_size),
        })
    }
}

/// Block maps published as separate documents next to each artifact.
#[derive(Debug, Clone, Builder)]
pub struct ExternalBlockMapSource {
    #[builder(into)]
    pub old_version: String,
    #[builder(into)]
    pub new_version: String,
    #[builder(into, default = ".blockmap".to_string())]
    pub suffix:      String,
}

impl ExternalBlockMapSource {
    /// URL of the new block map: the artifact path plus the suffix.
    pub fn new_block_map_url(&self, artifact: &Url) -> Result<Url, DownloadError> {
        self.with_path(artifact, &format!("{}{}", artifact.path(), self.suffix))
    }

    /// URL of the old block map: the new one with every occurrence of the
    /// new version replaced by the old version.
    pub fn old_block_map_url(&self, artifact: &Url) -> Result<Url, DownloadError> {
        ensure!(
            !self.new_version.is_empty(),
            InvalidUrlSnafu {
                url:     artifact.as_str(),
                message: "new version must not be empty",
            }
        );
        let path = artifact
            .path()
            .replace(&self.new_version, &self.old_version);
        self.with_path(artifact, &format!("{path}{}", self.suffix))
    }

    fn with_path(&self, artifact: &Url, path: &str) -> Result<Url, DownloadError> {
        ensure!(
            !artifact.cannot_be_a_base(),
            InvalidUrlSnafu {
                url:     artifact.as_str(),
                message: "URL has no path to derive a block map location from",
            }
        );
        let mut url = artifact.clone();
        url.set_path(path);
        Ok(url)
    }
}

#[async_trait]
impl BlockMapSource for ExternalBlockMapSource {
    async fn load(
        &self,
        http: &HttpExecutor,
        config: &DownloaderConfig,
        session: &DownloadSession,
    ) -> Result<BlockMaps, DownloadError> {
        let new_url = self.new_block_map_url(&session.new_url)?;
        let old_url = self.old_block_map_url(&session.new_url)?;
        debug!(old = %old_url, new = %new_url, "Fetching block maps");

        let limit = config.block_map_size_limit.as_bytes();
        let (old, new) = futures::try_join!(
            fetch_block_map(http, &old_url, session, limit),
            fetch_block_map(http, &new_url, session, limit),
        )?;

        Ok(BlockMaps {
            old,
            new,
            trailer: None,
            new_size: None,
        })
    }
}

async fn fetch_block_map(
    http: &HttpExecutor,
    url: &Url,
    session: &DownloadSession,
    limit: u64,
) -> Result<BlockMap, DownloadError> {
    let data = http
        .download_to_bytes(url, &session.headers, limit, None)
        .await?;
    ensure!(
        !data.is_empty(),
        EmptyBlockMapDocumentSnafu { url: url.as_str() }
    );
    BlockMap::decode(&data)
}

fn read_length(data: &[u8]) -> Result<u32, DownloadError> {
    data.len()
        .checked_sub(LENGTH_FIELD as usize)
        .and_then(|start| <[u8; 4]>::try_from(&data[start..]).ok())
        .map(u32::from_be_bytes)
        .ok_or_else(|| {
            InvalidTrailerSnafu {
                message: "missing length field",
            }
            .build()
        })
}

/// Read the block map embedded at the end of a local file.
pub async fn read_embedded_block_map(path: &Path, limit: u64) -> Result<BlockMap, DownloadError> {
    let mut file = File::open(path).await.context(FileReadSnafu { path })?;
    let file_size = file
        .metadata()
        .await
        .context(FileReadSnafu { path })?
        .len();
    ensure!(
        file_size >= LENGTH_FIELD,
        InvalidTrailerSnafu {
            message: format!("{} is too small to carry a block map", path.display()),
        }
    );

    let mut length = [0u8; 4];
    file.seek(SeekFrom::Start(file_size - LENGTH_FIELD))
        .await
        .context(FileReadSnafu { path })?;
    file.read_exact(&mut length)
        .await
        .context(FileReadSnafu { path })?;
    let map_size = u64::from(u32::from_be_bytes(length));
    ensure!(
        map_size <= limit && map_size + LENGTH_FIELD <= file_size,
        InvalidTrailerSnafu {
            message: format!(
                "{} declares a {map_size} byte block map in a {file_size} byte file",
                path.display()
            ),
        }
    );

    let mut compressed = vec![0u8; usize::try_from(map_size).unwrap_or_default()];
    file.seek(SeekFrom::Start(file_size - LENGTH_FIELD - map_size))
        .await
        .context(FileReadSnafu { path })?;
    file.read_exact(&mut compressed)
        .await
        .context(FileReadSnafu { path })?;
    BlockMap::decode_raw_deflate(&compressed)
}

/// Append `map` to `data` in the embedded trailer layout.
pub fn append_embedded_block_map(data: &mut Vec<u8>, map: &BlockMap) -> Result<(), DownloadError> {
    let compressed = map.encode_raw_deflate()?;
    let len = u32::try_from(compressed.len()).map_err(|_| {
        InvalidTrailerSnafu {
            message: format!("compressed block map of {} bytes", compressed.len()),
        }
        .build()
    })?;
    data.extend_from_slice(&compressed);
    data.extend_from_slice(&len.to_be_bytes());
    Ok(())
}

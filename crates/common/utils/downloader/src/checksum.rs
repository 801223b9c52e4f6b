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

use base64::{Engine, engine::general_purpose::STANDARD};
use snafu::ensure;

use crate::error::{ChecksumMismatchSnafu, DownloadError, InvalidChecksumSnafu};

const SHA512_LEN: usize = 64;

/// Expected SHA-512 of the reconstructed file. Accepts hex (128 chars) or
/// base64.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedChecksum {
    raw:    String,
    digest: [u8; SHA512_LEN],
}

impl ExpectedChecksum {
    pub fn parse(value: &str) -> Result<Self, DownloadError> {
        let trimmed = value.trim();
        let bytes = if trimmed.len() == SHA512_LEN * 2
            && trimmed.bytes().all(|b| b.is_ascii_hexdigit())
        {
            hex::decode(trimmed).ok()
        } else {
            STANDARD.decode(trimmed).ok()
        };

        let digest = bytes
            .and_then(|b| <[u8; SHA512_LEN]>::try_from(b).ok())
            .ok_or_else(|| InvalidChecksumSnafu { value }.build())?;

        Ok(Self {
            raw: trimmed.to_string(),
            digest,
        })
    }

    /// Compare against a computed digest. The error carries both values in
    /// the encoding the caller supplied.
    pub fn verify(&self, actual: &[u8]) -> Result<(), DownloadError> {
        ensure!(
            actual == self.digest.as_slice(),
            ChecksumMismatchSnafu {
                expected: self.raw.as_str(),
                actual:   if self.is_hex() {
                    hex::encode(actual)
                } else {
                    STANDARD.encode(actual)
                },
            }
        );
        Ok(())
    }

    fn is_hex(&self) -> bool { self.raw.len() == SHA512_LEN * 2 }
}

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

use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
};

use reqwest::Response;
use sha2::{Digest, Sha512};
use snafu::{ResultExt, ensure};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::DownloaderConfig,
    error::{
        DownloadError, FileReadSnafu, FileWriteSnafu, OldFileTruncatedSnafu,
        ResponseLengthMismatchSnafu,
    },
    http::next_chunk,
    splitter::Segment,
    types::{ProgressCallback, ProgressInfo},
};

/// Ordered writer for the reconstructed file.
///
/// Every byte passes through the running SHA-512 before reaching the
/// buffered destination writer, in strictly increasing new-file order.
pub struct ReconstructionSink {
    old:            File,
    old_path:       PathBuf,
    dest:           BufWriter<File>,
    dest_path:      PathBuf,
    hasher:         Sha512,
    written:        u64,
    copy_buf:       Vec<u8>,
    progress:       Option<ProgressCallback>,
    transferred:    u64,
    download_total: u64,
}

impl ReconstructionSink {
    /// Open `old_path` for reading and create `dest_path`, truncating it.
    pub async fn open(
        old_path: &Path,
        dest_path: &Path,
        config: &DownloaderConfig,
        progress: Option<ProgressCallback>,
        download_total: u64,
    ) -> Result<Self, DownloadError> {
        let old = File::open(old_path).await.context(FileReadSnafu {
            path: old_path,
        })?;
        let dest = File::create(dest_path).await.context(FileWriteSnafu {
            path: dest_path,
        })?;

        Ok(Self {
            old,
            old_path: old_path.to_path_buf(),
            dest: BufWriter::with_capacity(config.write_buffer_size.as_usize(), dest),
            dest_path: dest_path.to_path_buf(),
            hasher: Sha512::new(),
            written: 0,
            copy_buf: vec![0; config.copy_buffer_size.as_usize().max(1)],
            progress,
            transferred: 0,
            download_total,
        })
    }

    pub async fn apply(&mut self, segment: Segment<'_>) -> Result<(), DownloadError> {
        match segment {
            Segment::Copy { old_start, len } => self.copy(old_start, len).await,
            Segment::Data(data) => self.write_payload(data).await,
        }
    }

    /// Append `[old_start, old_start + len)` of the old file.
    pub async fn copy(&mut self, old_start: u64, len: u64) -> Result<(), DownloadError> {
        self.old
            .seek(SeekFrom::Start(old_start))
            .await
            .context(FileReadSnafu {
                path: &self.old_path,
            })?;

        let mut remaining = len;
        while remaining > 0 {
            let want = usize::try_from(remaining).map_or(self.copy_buf.len(), |r| {
                r.min(self.copy_buf.len())
            });
            let n = self
                .old
                .read(&mut self.copy_buf[..want])
                .await
                .context(FileReadSnafu {
                    path: &self.old_path,
                })?;
            ensure!(
                n > 0,
                OldFileTruncatedSnafu {
                    path:   &self.old_path,
                    offset: old_start + (len - remaining),
                    len:    remaining,
                }
            );
            self.hasher.update(&self.copy_buf[..n]);
            self.dest
                .write_all(&self.copy_buf[..n])
                .await
                .context(FileWriteSnafu {
                    path: &self.dest_path,
                })?;
            self.written += n as u64;
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Append bytes received from the network.
    pub async fn write_payload(&mut self, data: &[u8]) -> Result<(), DownloadError> {
        self.write(data).await?;
        self.transferred += data.len() as u64;
        if let Some(progress) = &self.progress {
            progress.report(ProgressInfo {
                transferred: self.transferred,
                total:       self.download_total,
                delta:       data.len() as u64,
            });
        }
        Ok(())
    }

    /// Stream a single-range response body, which must be exactly
    /// `expected` bytes long.
    pub async fn write_response(
        &mut self,
        mut response: Response,
        expected: u64,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let mut received = 0u64;
        while let Some(chunk) = next_chunk(&mut response, token).await? {
            received += chunk.len() as u64;
            ensure!(
                received <= expected,
                ResponseLengthMismatchSnafu {
                    expected,
                    actual: received,
                }
            );
            self.write_payload(&chunk).await?;
        }
        ensure!(
            received == expected,
            ResponseLengthMismatchSnafu {
                expected,
                actual: received,
            }
        );
        Ok(())
    }

    /// Append the trailing metadata, flush and sync. Returns the final size
    /// and SHA-512 digest.
    pub async fn finish(mut self, trailer: Option<&[u8]>) -> Result<(u64, Vec<u8>), DownloadError> {
        if let Some(trailer) = trailer {
            self.write(trailer).await?;
        }
        self.dest.flush().await.context(FileWriteSnafu {
            path: &self.dest_path,
        })?;
        self.dest
            .get_mut()
            .sync_all()
            .await
            .context(FileWriteSnafu {
                path: &self.dest_path,
            })?;
        Ok((self.written, self.hasher.finalize().to_vec()))
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), DownloadError> {
        self.hasher.update(data);
        self.dest.write_all(data).await.context(FileWriteSnafu {
            path: &self.dest_path,
        })?;
        self.written += data.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    async fn sink(dir: &TempDir, old: &[u8]) -> ReconstructionSink {
        let old_path = dir.path().join("old.bin");
        tokio::fs::write(&old_path, old).await.unwrap();
        ReconstructionSink::open(
            &old_path,
            &dir.path().join("new.bin"),
            &DownloaderConfig::default(),
            None,
            0,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_copy_and_payload_in_order() {
        let dir = TempDir::new().unwrap();
        let mut sink = sink(&dir, b"0123456789").await;

        sink.apply(Segment::Copy {
            old_start: 5,
            len:       3,
        })
        .await
        .unwrap();
        sink.apply(Segment::Data(b"abc")).await.unwrap();
        sink.copy(0, 2).await.unwrap();
        let (size, digest) = sink.finish(Some(b"T")).await.unwrap();

        let written = tokio::fs::read(dir.path().join("new.bin")).await.unwrap();
        assert_eq!(written, b"567abc01T");
        assert_eq!(size, 9);
        assert_eq!(digest, Sha512::digest(b"567abc01T").to_vec());
    }

    #[tokio::test]
    async fn test_copy_past_end_of_old_file() {
        let dir = TempDir::new().unwrap();
        let mut sink = sink(&dir, b"0123").await;
        let err = sink.copy(2, 5).await.unwrap_err();
        assert!(matches!(err, DownloadError::OldFileTruncated {
            offset: 4,
            len: 3,
            ..
        }));
    }

    #[tokio::test]
    async fn test_small_copy_buffer() {
        let dir = TempDir::new().unwrap();
        let old_path = dir.path().join("old.bin");
        tokio::fs::write(&old_path, b"abcdefghij").await.unwrap();
        let config = DownloaderConfig::builder()
            .copy_buffer_size(blockdelta_base::readable_size::ReadableSize(3))
            .build();
        let mut sink =
            ReconstructionSink::open(&old_path, &dir.path().join("new.bin"), &config, None, 0)
                .await
                .unwrap();
        sink.copy(1, 8).await.unwrap();
        let (size, _) = sink.finish(None).await.unwrap();
        assert_eq!(size, 8);
        let written = tokio::fs::read(dir.path().join("new.bin")).await.unwrap();
        assert_eq!(written, b"bcdefghi");
    }
}

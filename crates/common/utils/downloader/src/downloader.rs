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
    io::ErrorKind,
    path::{Path, PathBuf},
};

use base64::{Engine, engine::general_purpose::STANDARD};
use blockdelta_base::readable_size::ReadableSize;
use jiff::Timestamp;
use snafu::{ResultExt, ensure};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::{
    checksum::ExpectedChecksum,
    config::DownloaderConfig,
    error::{CancelledSnafu, DownloadError, FileWriteSnafu, SizeMismatchSnafu, VersionMismatchSnafu},
    http::HttpExecutor,
    multi_range::MultiRangeExecutor,
    plan::{Plan, PlanBuilder, PlanSummary},
    sequential::SequentialExecutor,
    sink::ReconstructionSink,
    source::{BlockMapSource, BlockMaps},
    types::{DownloadOutcome, DownloadResult, DownloadSession},
};

const TEMP_SUFFIX: &str = "download";

/// Rebuilds a new artifact from an installed old one plus the changed
/// blocks fetched over HTTP.
///
/// Components:
/// - `PlanBuilder`: diffs the block maps into COPY/DOWNLOAD operations
/// - `MultiRangeExecutor`: batches DOWNLOAD ranges into multipart requests
/// - `SequentialExecutor`: one request per DOWNLOAD operation
/// - `ReconstructionSink`: ordered, hashed writes to a temporary file
pub struct DifferentialDownloader {
    config:  DownloaderConfig,
    http:    HttpExecutor,
    planner: PlanBuilder,
}

impl DifferentialDownloader {
    pub fn new(config: DownloaderConfig) -> Result<Self, DownloadError> {
        let http = HttpExecutor::new(&config)?;
        Ok(Self::with_executor(config, http))
    }

    /// Share an existing executor between downloaders.
    #[must_use]
    pub fn with_executor(config: DownloaderConfig, http: HttpExecutor) -> Self {
        let planner = PlanBuilder::new(config.plan.clone());
        Self {
            config,
            http,
            planner,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &DownloaderConfig { &self.config }

    #[must_use]
    pub const fn http(&self) -> &HttpExecutor { &self.http }

    /// Load block maps from `source` and run the download.
    pub async fn download(
        &self,
        source: &(impl BlockMapSource + ?Sized),
        session: &DownloadSession,
    ) -> Result<DownloadOutcome, DownloadError> {
        let maps = tokio::select! {
            () = session.cancellation.cancelled() => return Ok(DownloadOutcome::Cancelled),
            maps = source.load(&self.http, &self.config, session) => maps?,
        };
        self.download_with_block_maps(session, &maps).await
    }

    /// Run the download with block maps the caller already has.
    ///
    /// This method will:
    /// 1. Reject block maps of different versions
    /// 2. Build the plan and check it accounts for every byte of the new file
    /// 3. Execute it with multi-range requests or sequentially
    /// 4. Append the trailer, verify the SHA-512 and move the file in place
    ///
    /// The temporary output is removed on every failure and on cancellation.
    pub async fn download_with_block_maps(
        &self,
        session: &DownloadSession,
        maps: &BlockMaps,
    ) -> Result<DownloadOutcome, DownloadError> {
        let start_time = Timestamp::now();
        let expected = ExpectedChecksum::parse(&session.sha512)?;

        ensure!(
            maps.old.version == maps.new.version,
            VersionMismatchSnafu {
                old: maps.old.version.as_str(),
                new: maps.new.version.as_str(),
            }
        );

        let plan = self.planner.build(&maps.old, &maps.new)?;
        debug!(operations = ?plan.operations, "Differential download plan");
        let summary = plan.summary();
        check_accounting(session, maps, &summary)?;

        if session.cancellation.is_cancelled() {
            return Ok(DownloadOutcome::Cancelled);
        }

        let temp_path = temp_path_for(&session.output_path);
        let result = match self
            .reconstruct(session, maps, &plan, &expected, &temp_path)
            .await
        {
            Ok(done) => fs::rename(&temp_path, &session.output_path)
                .await
                .context(FileWriteSnafu {
                    path: &session.output_path,
                })
                .map(|()| done),
            Err(err) => Err(err),
        };

        match result {
            Ok((size, digest)) => {
                info!(output = %session.output_path.display(), size, "Differential download finished");
                Ok(DownloadOutcome::Completed(DownloadResult {
                    path: session.output_path.clone(),
                    size,
                    sha512: STANDARD.encode(digest),
                    summary,
                    duration: start_time.until(Timestamp::now()).unwrap_or_default(),
                }))
            }
            Err(err) => {
                remove_partial(&temp_path).await;
                if err.is_cancelled() {
                    info!(output = %session.output_path.display(), "Differential download cancelled");
                    Ok(DownloadOutcome::Cancelled)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Write the new file into `temp_path` and verify it.
    async fn reconstruct(
        &self,
        session: &DownloadSession,
        maps: &BlockMaps,
        plan: &Plan,
        expected: &ExpectedChecksum,
        temp_path: &Path,
    ) -> Result<(u64, Vec<u8>), DownloadError> {
        let summary = plan.summary();
        let mut sink = ReconstructionSink::open(
            &session.old_file,
            temp_path,
            &self.config,
            session.progress.clone(),
            summary.download_bytes,
        )
        .await?;

        let token = &session.cancellation;
        if self.config.multi_range.enabled && session.multi_range && summary.download_operations > 1
        {
            MultiRangeExecutor::new(&self.http, &self.config)
                .execute(
                    &session.new_url,
                    &session.headers,
                    &plan.operations,
                    &mut sink,
                    token,
                )
                .await?;
        } else {
            SequentialExecutor::new(&self.http, &self.config.sequential)
                .execute(
                    &session.new_url,
                    &session.headers,
                    &plan.operations,
                    &mut sink,
                    token,
                )
                .await?;
        }

        ensure!(!token.is_cancelled(), CancelledSnafu);
        let (size, digest) = sink.finish(maps.trailer.as_deref()).await?;
        expected.verify(&digest)?;
        Ok((size, digest))
    }
}

/// `download + copy + trailer` must equal the size of the new file.
fn check_accounting(
    session: &DownloadSession,
    maps: &BlockMaps,
    summary: &PlanSummary,
) -> Result<(), DownloadError> {
    let trailer = maps.trailer.as_ref().map_or(0, |t| t.len() as u64);
    let new_file = maps.new.primary_file("new")?;
    let new_size = session
        .new_size
        .or(maps.new_size)
        .unwrap_or_else(|| new_file.offset + new_file.total_size() + trailer);

    ensure!(
        summary.download_bytes + summary.copy_bytes + trailer == new_size,
        SizeMismatchSnafu {
            download: summary.download_bytes,
            copy: summary.copy_bytes,
            trailer,
            new_size,
        }
    );

    #[allow(clippy::cast_precision_loss)]
    let percent = if new_size == 0 {
        0.0
    } else {
        summary.download_bytes as f64 * 100.0 / new_size as f64
    };
    info!(
        "Full: {}, To download: {} ({:.0}%)",
        ReadableSize(new_size),
        ReadableSize(summary.download_bytes),
        percent
    );
    Ok(())
}

/// `<output>.download` next to the output file.
fn temp_path_for(output: &Path) -> PathBuf {
    let mut name = output.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(TEMP_SUFFIX);
    output.with_file_name(name)
}

async fn remove_partial(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed partial download"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), %err, "Failed to remove partial download"),
    }
}

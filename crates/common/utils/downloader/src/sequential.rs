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

use reqwest::{Url, header::HeaderMap};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    config::SequentialConfig,
    error::{CancelledSnafu, DownloadError},
    http::{HttpExecutor, cancellable, check_ranges_supported},
    plan::Operation,
    sink::ReconstructionSink,
};

/// Executes a plan one operation at a time: COPY from disk, DOWNLOAD with
/// its own range request.
pub struct SequentialExecutor<'a> {
    http:   &'a HttpExecutor,
    config: &'a SequentialConfig,
}

impl<'a> SequentialExecutor<'a> {
    pub const fn new(http: &'a HttpExecutor, config: &'a SequentialConfig) -> Self {
        Self { http, config }
    }

    pub async fn execute(
        &self,
        url: &Url,
        headers: &HeaderMap,
        operations: &[Operation],
        sink: &mut ReconstructionSink,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let mut url = url.clone();
        let mut parts = 0usize;

        for op in operations {
            if token.is_cancelled() {
                return CancelledSnafu.fail();
            }
            match *op {
                Operation::Copy {
                    start,
                    end,
                    old_start,
                } => sink.copy(old_start, end - start).await?,
                Operation::Download { .. } => {
                    let range = op.range_spec();
                    let (response, resolved) =
                        cancellable(token, self.http.request(&url, headers, Some(&range))).await?;
                    check_ranges_supported(&response)?;
                    if resolved != url {
                        debug!(from = %url, to = %resolved, "Continuing with redirected URL");
                        url = resolved;
                    }
                    sink.write_response(response, op.len(), token).await?;

                    parts += 1;
                    if self.config.yield_every > 0 && parts % self.config.yield_every == 0 {
                        self.pause(token).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn pause(&self, token: &CancellationToken) -> Result<(), DownloadError> {
        tokio::select! {
            () = token.cancelled() => CancelledSnafu.fail(),
            () = tokio::time::sleep(self.config.yield_delay.unsigned_abs()) => Ok(()),
        }
    }
}

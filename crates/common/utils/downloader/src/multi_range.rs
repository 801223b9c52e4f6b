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

use std::ops::Range;

use reqwest::{
    Url,
    header::{CONTENT_TYPE, HeaderMap},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    config::DownloaderConfig,
    error::DownloadError,
    http::{HttpExecutor, cancellable, check_ranges_supported, next_chunk},
    plan::Operation,
    sink::ReconstructionSink,
    splitter::{MultipartSplitter, parse_multipart_boundary},
};

/// Executes a plan with combined `Range` requests, one per batch of
/// DOWNLOAD ranges, demultiplexing each multipart response.
pub struct MultiRangeExecutor<'a> {
    http:   &'a HttpExecutor,
    config: &'a DownloaderConfig,
}

impl<'a> MultiRangeExecutor<'a> {
    pub const fn new(http: &'a HttpExecutor, config: &'a DownloaderConfig) -> Self {
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
        let batches = plan_batches(operations, self.config.multi_range.max_ranges_per_request);
        let count = batches.len();
        for (index, batch) in batches.into_iter().enumerate() {
            let operations = &operations[batch];
            debug!(batch = index + 1, of = count, operations = operations.len(), "Requesting batch");
            self.execute_batch(url, headers, operations, sink, token)
                .await?;
        }
        Ok(())
    }

    async fn execute_batch(
        &self,
        url: &Url,
        headers: &HeaderMap,
        operations: &[Operation],
        sink: &mut ReconstructionSink,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let downloads: Vec<&Operation> = operations.iter().filter(|op| op.is_download()).collect();
        if downloads.len() < 2 {
            return self
                .execute_plain(url, headers, operations, sink, token)
                .await;
        }

        let ranges = downloads
            .iter()
            .map(|op| op.range_spec())
            .collect::<Vec<_>>()
            .join(", ");
        let (mut response, _) =
            cancellable(token, self.http.request(url, headers, Some(&ranges))).await?;
        check_ranges_supported(&response)?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .unwrap_or_default();
        let boundary = parse_multipart_boundary(&content_type)?;

        let mut splitter = MultipartSplitter::new(
            &boundary,
            operations.to_vec(),
            self.config.splitter.max_header_size.as_usize(),
        )?;
        while let Some(chunk) = next_chunk(&mut response, token).await? {
            for segment in splitter.feed(&chunk)? {
                sink.apply(segment).await?;
            }
        }
        splitter.finish()
    }

    /// A batch with a single DOWNLOAD does not need a multipart response.
    async fn execute_plain(
        &self,
        url: &Url,
        headers: &HeaderMap,
        operations: &[Operation],
        sink: &mut ReconstructionSink,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        for op in operations {
            match *op {
                Operation::Copy {
                    start,
                    end,
                    old_start,
                } => sink.copy(old_start, end - start).await?,
                Operation::Download { .. } => {
                    let range = op.range_spec();
                    let (response, _) =
                        cancellable(token, self.http.request(url, headers, Some(&range))).await?;
                    check_ranges_supported(&response)?;
                    sink.write_response(response, op.len(), token).await?;
                }
            }
        }
        Ok(())
    }
}

/// Split `operations` into consecutive batches holding at most `max_ranges`
/// DOWNLOAD operations each. COPY operations belong to the batch of the next
/// DOWNLOAD; trailing COPY operations join the last batch.
pub(crate) fn plan_batches(operations: &[Operation], max_ranges: usize) -> Vec<Range<usize>> {
    let max_ranges = max_ranges.max(1);
    let mut batches = Vec::new();
    let mut start = 0;
    let mut in_batch = 0;
    for (index, op) in operations.iter().enumerate() {
        if op.is_download() {
            in_batch += 1;
            if in_batch == max_ranges {
                batches.push(start..index + 1);
                start = index + 1;
                in_batch = 0;
            }
        }
    }
    if start < operations.len() {
        match batches.last_mut() {
            Some(last) if in_batch == 0 => last.end = operations.len(),
            _ => batches.push(start..operations.len()),
        }
    }
    batches
}

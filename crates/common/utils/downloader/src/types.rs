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

use std::{fmt, path::PathBuf, sync::Arc};

use bon::Builder;
use jiff::Span;
use reqwest::{Url, header::HeaderMap};
use tokio_util::sync::CancellationToken;

use crate::plan::PlanSummary;

/// One differential download: rebuild the file at `new_url` into
/// `output_path`, reusing blocks of `old_file`.
#[derive(Debug, Clone, Builder)]
pub struct DownloadSession {
    /// Installed copy of the previous version
    #[builder(into)]
    pub old_file:     PathBuf,
    /// Location of the new version
    pub new_url:      Url,
    /// Where the reconstructed file is placed on success
    #[builder(into)]
    pub output_path:  PathBuf,
    /// Size of the complete new file, when the caller knows it
    pub new_size:     Option<u64>,
    /// Expected SHA-512 of the new file, hex or base64
    #[builder(into)]
    pub sha512:       String,
    /// Extra headers sent with every request
    #[builder(default)]
    pub headers:      HeaderMap,
    #[builder(default)]
    pub cancellation: CancellationToken,
    /// Allow combining ranges into multipart requests
    #[builder(default = true)]
    pub multi_range:  bool,
    pub progress:     Option<ProgressCallback>,
}

/// Progress of the network part of a download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressInfo {
    /// DOWNLOAD bytes received so far
    pub transferred: u64,
    /// DOWNLOAD bytes the plan needs
    pub total:       u64,
    /// Bytes received since the previous report
    pub delta:       u64,
}

/// Shared progress callback
#[derive(Clone)]
pub struct ProgressCallback(Arc<dyn Fn(ProgressInfo) + Send + Sync>);

impl ProgressCallback {
    pub fn new(f: impl Fn(ProgressInfo) + Send + Sync + 'static) -> Self { Self(Arc::new(f)) }

    pub fn report(&self, info: ProgressInfo) { (self.0)(info); }
}

impl fmt::Debug for ProgressCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressCallback").finish_non_exhaustive()
    }
}

/// Result of a successful download
#[derive(Debug, Clone)]
pub struct DownloadResult {
    /// Path where the file was saved
    pub path:     PathBuf,
    /// Size of the reconstructed file in bytes
    pub size:     u64,
    /// SHA-512 of the file (base64)
    pub sha512:   String,
    /// What the plan copied and downloaded
    pub summary:  PlanSummary,
    /// Total duration of the download operation
    pub duration: Span,
}

/// How a download ended when it did not fail
#[derive(Debug, Clone)]
pub enum DownloadOutcome {
    Completed(DownloadResult),
    /// Cancelled through the session token; nothing was left on disk
    Cancelled,
}

impl DownloadOutcome {
    #[must_use]
    pub const fn is_cancelled(&self) -> bool { matches!(self, Self::Cancelled) }

    /// The result, if the download completed.
    #[must_use]
    pub fn completed(self) -> Option<DownloadResult> {
        match self {
            Self::Completed(result) => Some(result),
            Self::Cancelled => None,
        }
    }
}

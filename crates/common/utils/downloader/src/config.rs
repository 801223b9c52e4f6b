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

use blockdelta_base::readable_size::ReadableSize;
use bon::Builder;
use jiff::SignedDuration;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

/// Settings for combining DOWNLOAD ranges into multipart requests
#[derive(Debug, Clone, PartialEq, Eq, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiRangeConfig {
    /// Use one request per batch of ranges when the plan has more than one
    /// DOWNLOAD operation (default: true)
    #[default = true]
    pub enabled:                bool,
    /// Upper bound of ranges listed in one `Range` header (default: 1000)
    #[default = 1000]
    pub max_ranges_per_request: usize,
}

/// Settings for the one-request-per-operation fallback
#[derive(Debug, Clone, PartialEq, Eq, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct SequentialConfig {
    /// Pause after this many completed DOWNLOAD parts, 0 disables pausing
    /// (default: 100)
    #[default = 100]
    pub yield_every: usize,
    /// Length of the pause (default: 100ms)
    #[default(SignedDuration::from_millis(100))]
    pub yield_delay: SignedDuration,
}

/// Settings for the multipart response splitter
#[derive(Debug, Clone, PartialEq, Eq, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitterConfig {
    /// Largest per-part header block accepted before the response is
    /// treated as malformed (default: 64KiB)
    #[default(ReadableSize::kb(64))]
    pub max_header_size: ReadableSize,
}

/// Settings for the plan builder
#[derive(Debug, Clone, PartialEq, Eq, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanConfig {
    /// Check every appended operation against the previous one and fail on
    /// overlap (default: false)
    pub validate_ranges: bool,
}

/// Configuration for the differential downloader
#[derive(Debug, Clone, PartialEq, Eq, SmartDefault, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Connect and read timeout for HTTP requests (default: 30s)
    #[default(SignedDuration::from_secs(30))]
    #[builder(default = SignedDuration::from_secs(30))]
    pub timeout: SignedDuration,

    /// Custom User-Agent header
    pub user_agent: Option<String>,

    /// Maximum number of redirects followed per request (default: 10)
    #[default = 10]
    #[builder(default = 10)]
    pub max_redirects: usize,

    /// Multi-range request configuration
    #[builder(default)]
    pub multi_range: MultiRangeConfig,

    /// Sequential fallback configuration
    #[builder(default)]
    pub sequential: SequentialConfig,

    /// Multipart splitter configuration
    #[builder(default)]
    pub splitter: SplitterConfig,

    /// Plan builder configuration
    #[builder(default)]
    pub plan: PlanConfig,

    /// Read buffer used when copying spans out of the old file
    /// (default: 512KiB)
    #[default(ReadableSize::kb(512))]
    #[builder(default = ReadableSize::kb(512))]
    pub copy_buffer_size: ReadableSize,

    /// Write buffer in front of the destination file (default: 512KiB)
    #[default(ReadableSize::kb(512))]
    #[builder(default = ReadableSize::kb(512))]
    pub write_buffer_size: ReadableSize,

    /// Limit for whole-response downloads such as external block maps
    /// (default: 64MiB)
    #[default(ReadableSize::mb(64))]
    #[builder(default = ReadableSize::mb(64))]
    pub block_map_size_limit: ReadableSize,
}

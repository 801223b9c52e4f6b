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

//! Differential downloads: rebuild a new artifact from an installed old
//! version by copying unchanged blocks from disk and fetching only the
//! changed ranges over HTTP.

pub mod blockmap;
mod checksum;
mod config;
mod downloader;
mod error;
mod http;
mod multi_range;
pub mod plan;
mod sequential;
mod sink;
pub mod source;
pub mod splitter;
mod types;

pub use blockmap::{BlockMap, BlockMapFile, DEFAULT_FILE_NAME};
pub use checksum::ExpectedChecksum;
pub use config::{DownloaderConfig, MultiRangeConfig, PlanConfig, SequentialConfig, SplitterConfig};
pub use downloader::DifferentialDownloader;
pub use error::{DownloadError, ErrorClass};
pub use http::{HttpExecutor, RangeRead, check_ranges_supported};
pub use plan::{Operation, Plan, PlanBuilder, PlanSummary};
pub use source::{BlockMapSource, BlockMaps, EmbeddedBlockMapSource, ExternalBlockMapSource};
pub use types::{DownloadOutcome, DownloadResult, DownloadSession, ProgressCallback, ProgressInfo};

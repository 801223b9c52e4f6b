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

use std::path::PathBuf;

use snafu::Snafu;
use strum_macros::Display;

/// Broad family of a [`DownloadError`], used by callers to decide between
/// falling back to a full download, retrying, or giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorClass {
    /// Block maps are unusable together (version mismatch, missing file
    /// entry, undecodable document). Never retried.
    Compatibility,
    /// The server cannot take part in a differential download (no range
    /// support, unexpected status or content type).
    ServerCapability,
    /// The reconstructed stream diverged from the plan. Output is discarded.
    StreamIntegrity,
    /// Network trouble the caller may retry with backoff.
    Transient,
    /// Local filesystem failure.
    Io,
    /// Invalid configuration or input supplied by the caller.
    Configuration,
    /// The download was cancelled through its token.
    Cancelled,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DownloadError {
    #[snafu(display("Network error: {source}"))]
    Network { source: reqwest::Error },

    #[snafu(display("Failed to build HTTP client: {source}"))]
    ClientBuild { source: reqwest::Error },

    #[snafu(display("HTTP error {status} for URL: {url}"))]
    Http { status: u16, url: String },

    #[snafu(display("Server doesn't support Accept-Ranges (response code {status})"))]
    RangeNotSupported { status: u16 },

    #[snafu(display("Content-Type \"multipart/byteranges\" is expected, but got {content_type:?}"))]
    UnexpectedContentType { content_type: String },

    #[snafu(display("Redirect limit of {limit} exceeded for URL: {url}"))]
    TooManyRedirects { url: String, limit: usize },

    #[snafu(display("Invalid URL {url:?}: {message}"))]
    InvalidUrl { url: String, message: String },

    #[snafu(display("Response from {url} exceeds the {limit} byte limit"))]
    ResponseTooLarge { url: String, limit: u64 },

    #[snafu(display("Version is different ({old} - {new}), full download is required"))]
    VersionMismatch { old: String, new: String },

    #[snafu(display("No file {name:?} in {which} block map"))]
    MissingFileEntry { name: String, which: &'static str },

    #[snafu(display("Invalid block map: {message}"))]
    InvalidBlockMap { message: String },

    #[snafu(display("Cannot parse block map: {source}"))]
    BlockMapDecode { source: serde_json::Error },

    #[snafu(display("Cannot decompress block map: {source}"))]
    BlockMapInflate { source: std::io::Error },

    #[snafu(display("Block map {url:?} is empty"))]
    EmptyBlockMapDocument { url: String },

    #[snafu(display("Invalid embedded block map trailer: {message}"))]
    InvalidTrailer { message: String },

    #[snafu(display(
        "Old file {} ends before offset {offset} (wanted {len} more bytes)",
        path.display()
    ))]
    OldFileTruncated { path: PathBuf, offset: u64, len: u64 },

    #[snafu(display(
        "Internal error, size mismatch: downloadSize: {download}, copySize: {copy}, trailer: \
         {trailer}, newSize: {new_size}"
    ))]
    SizeMismatch {
        download: u64,
        copy:     u64,
        trailer:  u64,
        new_size: u64,
    },

    #[snafu(display(
        "Operation {index} [{start}, {end}) overlaps previous operation ending at {previous_end} \
         (block {checksum})"
    ))]
    OverlappingOperation {
        index:        usize,
        start:        u64,
        end:          u64,
        previous_end: u64,
        checksum:     String,
    },

    #[snafu(display("Multipart part {part} length mismatch: expected {expected} bytes"))]
    PartLengthMismatch { part: usize, expected: u64 },

    #[snafu(display("Multipart part {part} has range {actual:?}, expected {expected:?}"))]
    PartRangeMismatch {
        part:     usize,
        expected: String,
        actual:   String,
    },

    #[snafu(display("Malformed multipart response: {message}"))]
    MalformedMultipart { message: String },

    #[snafu(display("Multipart response ended after {received} of {expected} parts"))]
    IncompleteMultipart { received: usize, expected: usize },

    #[snafu(display("Received data length {actual} is not equal to expected {expected}"))]
    ResponseLengthMismatch { expected: u64, actual: u64 },

    #[snafu(display("sha512 checksum mismatch, expected {expected}, got {actual}"))]
    ChecksumMismatch { expected: String, actual: String },

    #[snafu(display("Expected checksum {value:?} is neither hex nor base64 sha512"))]
    InvalidChecksum { value: String },

    #[snafu(display("File read error at {}: {source}", path.display()))]
    FileRead {
        path:   PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("File write error at {}: {source}", path.display()))]
    FileWrite {
        path:   PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Download cancelled"))]
    Cancelled,
}

impl DownloadError {
    /// Family this error belongs to.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Network { .. } => ErrorClass::Transient,
            Self::Http { status, .. } if *status >= 500 => ErrorClass::Transient,
            Self::Http { .. }
            | Self::RangeNotSupported { .. }
            | Self::UnexpectedContentType { .. }
            | Self::TooManyRedirects { .. }
            | Self::ResponseTooLarge { .. } => ErrorClass::ServerCapability,
            Self::VersionMismatch { .. }
            | Self::MissingFileEntry { .. }
            | Self::InvalidBlockMap { .. }
            | Self::BlockMapDecode { .. }
            | Self::BlockMapInflate { .. }
            | Self::EmptyBlockMapDocument { .. }
            | Self::InvalidTrailer { .. }
            | Self::OldFileTruncated { .. } => ErrorClass::Compatibility,
            Self::SizeMismatch { .. }
            | Self::OverlappingOperation { .. }
            | Self::PartLengthMismatch { .. }
            | Self::PartRangeMismatch { .. }
            | Self::MalformedMultipart { .. }
            | Self::IncompleteMultipart { .. }
            | Self::ResponseLengthMismatch { .. }
            | Self::ChecksumMismatch { .. } => ErrorClass::StreamIntegrity,
            Self::ClientBuild { .. } | Self::InvalidUrl { .. } | Self::InvalidChecksum { .. } => {
                ErrorClass::Configuration
            }
            Self::FileRead { .. } | Self::FileWrite { .. } => ErrorClass::Io,
            Self::Cancelled => ErrorClass::Cancelled,
        }
    }

    /// Whether a caller should abandon the differential path and download
    /// the whole artifact instead.
    #[must_use]
    pub const fn should_fall_back(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Compatibility | ErrorClass::ServerCapability | ErrorClass::StreamIntegrity
        )
    }

    #[must_use]
    pub const fn is_cancelled(&self) -> bool { matches!(self, Self::Cancelled) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let err = DownloadError::VersionMismatch {
            old: "1".to_string(),
            new: "2".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::Compatibility);
        assert!(err.should_fall_back());

        let err = DownloadError::Http {
            status: 503,
            url:    "http://example.com".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(!err.should_fall_back());

        let err = DownloadError::Http {
            status: 404,
            url:    "http://example.com".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::ServerCapability);

        assert_eq!(DownloadError::Cancelled.class(), ErrorClass::Cancelled);
        assert!(!DownloadError::Cancelled.should_fall_back());
    }

    #[test]
    fn test_checksum_mismatch_reports_both_digests() {
        let err = DownloadError::ChecksumMismatch {
            expected: "abc".to_string(),
            actual:   "def".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("abc"));
        assert!(message.contains("def"));
    }
}

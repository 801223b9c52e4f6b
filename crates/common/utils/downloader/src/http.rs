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

use bytes::{Bytes, BytesMut};
use reqwest::{
    Client, Response, StatusCode, Url,
    header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, HeaderMap, LOCATION, RANGE},
    redirect,
};
use snafu::{OptionExt, ResultExt, ensure};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    config::DownloaderConfig,
    error::{
        CancelledSnafu, ClientBuildSnafu, DownloadError, HttpSnafu, InvalidUrlSnafu, NetworkSnafu,
        RangeNotSupportedSnafu, ResponseLengthMismatchSnafu, ResponseTooLargeSnafu,
        TooManyRedirectsSnafu,
    },
    types::{ProgressCallback, ProgressInfo},
};

/// Bytes of a ranged read plus the full resource length, when the server
/// reported one in `Content-Range`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRead {
    pub data:  Bytes,
    pub total: Option<u64>,
}

/// Thin request layer over `reqwest` that follows redirects itself so the
/// resolved location can be reused.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client:        Client,
    max_redirects: usize,
}

impl HttpExecutor {
    pub fn new(config: &DownloaderConfig) -> Result<Self, DownloadError> {
        let timeout = config.timeout.unsigned_abs();
        let mut builder = Client::builder()
            .redirect(redirect::Policy::none())
            .connect_timeout(timeout)
            .read_timeout(timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.as_str());
        }
        let client = builder.build().context(ClientBuildSnafu)?;
        Ok(Self::from_client(client, config.max_redirects))
    }

    /// Use an existing client. It should not follow redirects on its own.
    #[must_use]
    pub const fn from_client(client: Client, max_redirects: usize) -> Self {
        Self {
            client,
            max_redirects,
        }
    }

    /// GET `url`, optionally restricted to `range` (`a-b, c-d` without the
    /// `bytes=` unit). Returns the response and the URL that produced it.
    pub async fn request(
        &self,
        url: &Url,
        headers: &HeaderMap,
        range: Option<&str>,
    ) -> Result<(Response, Url), DownloadError> {
        let mut current = url.clone();
        for _ in 0..=self.max_redirects {
            let mut request = self.client.get(current.clone()).headers(headers.clone());
            if let Some(range) = range {
                request = request.header(RANGE, format!("bytes={range}"));
            }
            let response = request.send().await.context(NetworkSnafu)?;

            if !is_redirect(response.status()) {
                return Ok((response, current));
            }

            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .context(InvalidUrlSnafu {
                    url:     current.as_str(),
                    message: "redirect without a Location header",
                })?;
            let next = current.join(location).map_err(|e| {
                InvalidUrlSnafu {
                    url:     location,
                    message: e.to_string(),
                }
                .build()
            })?;
            debug!(from = %current, to = %next, status = %response.status(), "Following redirect");
            current = next;
        }

        TooManyRedirectsSnafu {
            url:   url.as_str(),
            limit: self.max_redirects,
        }
        .fail()
    }

    /// Download a whole response into memory, refusing anything above
    /// `limit` bytes.
    pub async fn download_to_bytes(
        &self,
        url: &Url,
        headers: &HeaderMap,
        limit: u64,
        progress: Option<&ProgressCallback>,
    ) -> Result<Bytes, DownloadError> {
        let (mut response, resolved) = self.request(url, headers, None).await?;
        let status = response.status();
        ensure!(
            status.is_success(),
            HttpSnafu {
                status: status.as_u16(),
                url:    resolved.as_str(),
            }
        );

        let declared = content_length(&response);
        ensure!(
            declared.is_none_or(|len| len <= limit),
            ResponseTooLargeSnafu {
                url: resolved.as_str(),
                limit,
            }
        );

        let mut buf = BytesMut::new();
        while let Some(chunk) = response.chunk().await.context(NetworkSnafu)? {
            ensure!(
                buf.len() as u64 + chunk.len() as u64 <= limit,
                ResponseTooLargeSnafu {
                    url: resolved.as_str(),
                    limit,
                }
            );
            buf.extend_from_slice(&chunk);
            if let Some(progress) = progress {
                progress.report(ProgressInfo {
                    transferred: buf.len() as u64,
                    total:       declared.unwrap_or_default(),
                    delta:       chunk.len() as u64,
                });
            }
        }
        Ok(buf.freeze())
    }

    /// Read `[start, end_inclusive]` of `url`.
    pub async fn read_range(
        &self,
        url: &Url,
        headers: &HeaderMap,
        start: u64,
        end_inclusive: u64,
    ) -> Result<RangeRead, DownloadError> {
        let range = format!("{start}-{end_inclusive}");
        self.read_exact_range(url, headers, &range, end_inclusive - start + 1)
            .await
    }

    /// Read the last `len` bytes of `url` with a suffix range.
    pub async fn read_tail(
        &self,
        url: &Url,
        headers: &HeaderMap,
        len: u64,
    ) -> Result<RangeRead, DownloadError> {
        self.read_exact_range(url, headers, &format!("-{len}"), len)
            .await
    }

    async fn read_exact_range(
        &self,
        url: &Url,
        headers: &HeaderMap,
        range: &str,
        expected: u64,
    ) -> Result<RangeRead, DownloadError> {
        let (mut response, _) = self.request(url, headers, Some(range)).await?;
        check_ranges_supported(&response)?;
        let total = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(content_range_total);

        let mut buf = BytesMut::new();
        while let Some(chunk) = response.chunk().await.context(NetworkSnafu)? {
            let actual = buf.len() as u64 + chunk.len() as u64;
            ensure!(
                actual <= expected,
                ResponseLengthMismatchSnafu { expected, actual }
            );
            buf.extend_from_slice(&chunk);
        }
        ensure!(
            buf.len() as u64 == expected,
            ResponseLengthMismatchSnafu {
                expected,
                actual: buf.len() as u64,
            }
        );
        Ok(RangeRead {
            data: buf.freeze(),
            total,
        })
    }
}

const fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

fn content_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Total length from `bytes a-b/total`; `*` yields `None`.
fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/').and_then(|(_, total)| total.trim().parse().ok())
}

/// Fail unless the response can carry partial content.
///
/// A 206 is always accepted. Any other successful status is only accepted
/// when the server advertises `Accept-Ranges` with a unit other than `none`.
pub fn check_ranges_supported(response: &Response) -> Result<(), DownloadError> {
    let status = response.status().as_u16();
    ensure!(
        status < 400,
        HttpSnafu {
            status,
            url: response.url().as_str(),
        }
    );
    if status != StatusCode::PARTIAL_CONTENT.as_u16() {
        let accept_ranges = response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok());
        ensure!(
            accept_ranges.is_some_and(|v| !v.trim().eq_ignore_ascii_case("none")),
            RangeNotSupportedSnafu { status }
        );
    }
    Ok(())
}

/// Run `future` unless `token` fires first.
pub(crate) async fn cancellable<T>(
    token: &CancellationToken,
    future: impl Future<Output = Result<T, DownloadError>>,
) -> Result<T, DownloadError> {
    tokio::select! {
        () = token.cancelled() => CancelledSnafu.fail(),
        result = future => result,
    }
}

/// Next body chunk, or a cancellation error once `token` fires.
pub(crate) async fn next_chunk(
    response: &mut Response,
    token: &CancellationToken,
) -> Result<Option<Bytes>, DownloadError> {
    cancellable(token, async { response.chunk().await.context(NetworkSnafu) }).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_range_total() {
        assert_eq!(content_range_total("bytes 0-3/100"), Some(100));
        assert_eq!(content_range_total("bytes 0-3/*"), None);
        assert_eq!(content_range_total("garbage"), None);
    }

    #[test]
    fn test_redirect_statuses() {
        assert!(is_redirect(StatusCode::FOUND));
        assert!(is_redirect(StatusCode::PERMANENT_REDIRECT));
        assert!(!is_redirect(StatusCode::NOT_MODIFIED));
        assert!(!is_redirect(StatusCode::PARTIAL_CONTENT));
    }
}

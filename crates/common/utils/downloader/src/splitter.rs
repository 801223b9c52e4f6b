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

//! Incremental demultiplexer for `multipart/byteranges` response bodies.
//!
//! [`MultipartSplitter`] knows nothing about I/O. Each call to
//! [`MultipartSplitter::feed`] consumes a whole chunk and returns the
//! [`Segment`]s that must be written next, in new-file order: COPY spans to
//! read from the old file and payload slices borrowed from the chunk.
//!
//! ```text
//! Init --first delimiter--> Header --blank line--> Body --part complete--> Header
//!                                                    \--last part--> Closing --> Done
//! ```

use snafu::ensure;
use tracing::{debug, warn};

use crate::{
    error::{
        DownloadError, IncompleteMultipartSnafu, MalformedMultipartSnafu, PartLengthMismatchSnafu,
        PartRangeMismatchSnafu, UnexpectedContentTypeSnafu,
    },
    plan::Operation,
};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const TRAILING_SAMPLE_LIMIT: usize = 512;

/// Next piece of output produced by the splitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    /// Copy `len` bytes starting at `old_start` in the old file
    Copy { old_start: u64, len: u64 },
    /// Payload of the current DOWNLOAD part
    Data(&'a [u8]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Header,
    Body { remaining: u64 },
    Closing,
    Done,
}

#[derive(Debug)]
pub struct MultipartSplitter {
    /// `\r\n--<boundary>`; the first part omits the leading CRLF
    delimiter:       Vec<u8>,
    operations:      Vec<Operation>,
    /// First operation not yet handed out
    next_op:         usize,
    expected_parts:  usize,
    /// Parts whose body has been fully consumed
    completed_parts: usize,
    current_len:     u64,
    state:           State,
    buf:             Vec<u8>,
    max_header_size: usize,
    trailing:        Vec<u8>,
    trailing_len:    u64,
}

impl MultipartSplitter {
    /// `operations` is the slice of the plan covered by one response. Parts
    /// are expected in the order of its DOWNLOAD operations.
    pub fn new(
        boundary: &str,
        operations: Vec<Operation>,
        max_header_size: usize,
    ) -> Result<Self, DownloadError> {
        let expected_parts = operations.iter().filter(|op| op.is_download()).count();
        ensure!(
            expected_parts > 0,
            MalformedMultipartSnafu {
                message: "no byte ranges requested",
            }
        );

        let mut delimiter = Vec::with_capacity(boundary.len() + 4);
        delimiter.extend_from_slice(b"\r\n--");
        delimiter.extend_from_slice(boundary.as_bytes());

        Ok(Self {
            delimiter,
            operations,
            next_op: 0,
            expected_parts,
            completed_parts: 0,
            current_len: 0,
            state: State::Init,
            buf: Vec::new(),
            max_header_size,
            trailing: Vec::new(),
            trailing_len: 0,
        })
    }

    #[must_use]
    pub const fn expected_parts(&self) -> usize { self.expected_parts }

    #[must_use]
    pub const fn completed_parts(&self) -> usize { self.completed_parts }

    /// Consume one chunk of the response body.
    pub fn feed<'a>(&mut self, mut chunk: &'a [u8]) -> Result<Vec<Segment<'a>>, DownloadError> {
        let mut out = Vec::new();
        while !chunk.is_empty() {
            match self.state {
                State::Init => {
                    let skip = chunk
                        .iter()
                        .take_while(|b| matches!(b, b'\r' | b'\n'))
                        .count();
                    chunk = &chunk[skip..];
                    if !chunk.is_empty() {
                        self.state = State::Header;
                    }
                }
                State::Header => {
                    let consumed = self.read_header(chunk, &mut out)?;
                    chunk = &chunk[consumed..];
                }
                State::Body { remaining } => {
                    let n = usize::try_from(remaining).map_or(chunk.len(), |r| r.min(chunk.len()));
                    let (data, rest) = chunk.split_at(n);
                    out.push(Segment::Data(data));
                    chunk = rest;
                    let remaining = remaining - n as u64;
                    if remaining == 0 {
                        self.complete_part(&mut out);
                    } else {
                        self.state = State::Body { remaining };
                    }
                }
                State::Closing => {
                    let need = self.delimiter.len() - self.buf.len();
                    let take = need.min(chunk.len());
                    self.buf.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];
                    self.check_delimiter()?;
                    if self.buf.len() == self.delimiter.len() {
                        self.buf.clear();
                        self.state = State::Done;
                    }
                }
                State::Done => {
                    let room = TRAILING_SAMPLE_LIMIT.saturating_sub(self.trailing.len());
                    self.trailing
                        .extend_from_slice(&chunk[..room.min(chunk.len())]);
                    self.trailing_len += chunk.len() as u64;
                    chunk = &[];
                }
            }
        }
        Ok(out)
    }

    /// Check the splitter reached a consistent end once the body is
    /// exhausted.
    pub fn finish(&self) -> Result<(), DownloadError> {
        match self.state {
            State::Body { .. } => PartLengthMismatchSnafu {
                part:     self.completed_parts,
                expected: self.current_len,
            }
            .fail(),
            State::Init | State::Header => IncompleteMultipartSnafu {
                received: self.completed_parts,
                expected: self.expected_parts,
            }
            .fail(),
            State::Closing => {
                warn!("Multipart response ended without a closing boundary");
                Ok(())
            }
            State::Done => {
                if self.trailing.trim_ascii() != b"--" {
                    warn!(
                        bytes = self.trailing_len,
                        sample = %String::from_utf8_lossy(&self.trailing),
                        "Discarding unexpected data after the last multipart part"
                    );
                }
                Ok(())
            }
        }
    }

    fn expected_prefix(&self) -> &[u8] {
        if self.completed_parts == 0 {
            &self.delimiter[2..]
        } else {
            &self.delimiter
        }
    }

    /// Validate whatever part of the delimiter has been buffered so far.
    fn check_delimiter(&self) -> Result<(), DownloadError> {
        let prefix = self.expected_prefix();
        let n = self.buf.len().min(prefix.len());
        if self.buf[..n] != prefix[..n] {
            return if self.completed_parts == 0 {
                MalformedMultipartSnafu {
                    message: "body does not start with the boundary delimiter",
                }
                .fail()
            } else {
                PartLengthMismatchSnafu {
                    part:     self.completed_parts - 1,
                    expected: self.current_len,
                }
                .fail()
            };
        }

        let after = &self.buf[n..];
        ensure!(
            !(self.state == State::Header && after.len() >= 2 && after.starts_with(b"--")),
            IncompleteMultipartSnafu {
                received: self.completed_parts,
                expected: self.expected_parts,
            }
        );
        Ok(())
    }

    fn read_header<'a>(
        &mut self,
        chunk: &'a [u8],
        out: &mut Vec<Segment<'a>>,
    ) -> Result<usize, DownloadError> {
        let old_len = self.buf.len();
        self.buf.extend_from_slice(chunk);
        self.check_delimiter()?;

        let search_from = old_len.saturating_sub(HEADER_TERMINATOR.len() - 1);
        let Some(pos) = find(&self.buf[search_from..], HEADER_TERMINATOR) else {
            ensure!(
                self.buf.len() <= self.max_header_size,
                MalformedMultipartSnafu {
                    message: format!(
                        "part header exceeds {} bytes without terminator",
                        self.max_header_size
                    ),
                }
            );
            return Ok(chunk.len());
        };

        let header_end = search_from + pos + HEADER_TERMINATOR.len();
        self.buf.truncate(header_end);
        self.start_part(out)?;
        self.buf.clear();
        Ok(header_end - old_len)
    }

    fn start_part(&mut self, out: &mut Vec<Segment<'_>>) -> Result<(), DownloadError> {
        let index = self.operations[self.next_op..]
            .iter()
            .position(Operation::is_download)
            .map(|i| i + self.next_op)
            .ok_or_else(|| {
                MalformedMultipartSnafu {
                    message: "more parts than requested ranges",
                }
                .build()
            })?;
        let op = self.operations[index];

        let header = String::from_utf8_lossy(&self.buf[self.expected_prefix().len()..]);
        if let Some(actual) = content_range(&header) {
            let expected = op.range_spec();
            ensure!(
                actual == expected,
                PartRangeMismatchSnafu {
                    part: self.completed_parts,
                    expected,
                    actual,
                }
            );
        }

        self.emit_copies(index, out);
        self.next_op = index + 1;
        self.current_len = op.len();
        self.state = State::Body {
            remaining: op.len(),
        };
        debug!(
            part = self.completed_parts,
            start = op.start(),
            end = op.end(),
            "Multipart part started"
        );
        Ok(())
    }

    fn complete_part(&mut self, out: &mut Vec<Segment<'_>>) {
        self.completed_parts += 1;
        if self.completed_parts == self.expected_parts {
            self.emit_copies(self.operations.len(), out);
            self.next_op = self.operations.len();
            self.state = State::Closing;
        } else {
            self.state = State::Header;
        }
    }

    fn emit_copies(&self, until: usize, out: &mut Vec<Segment<'_>>) {
        for op in &self.operations[self.next_op..until] {
            if let Operation::Copy {
                start,
                end,
                old_start,
            } = *op
            {
                out.push(Segment::Copy {
                    old_start,
                    len: end - start,
                });
            }
        }
    }
}

/// `a-b` of a `Content-Range: bytes a-b/total` header, if present.
fn content_range(header: &str) -> Option<String> {
    header.split("\r\n").find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if !name.trim().eq_ignore_ascii_case("content-range") {
            return None;
        }
        let value = value.trim();
        let value = value
            .get(..5)
            .filter(|unit| unit.eq_ignore_ascii_case("bytes"))
            .map_or(value, |_| &value[5..]);
        Some(value.split('/').next().unwrap_or_default().trim().to_string())
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Extract the boundary token of a `multipart/*; boundary=...` content type.
/// Both quoted and unquoted forms are accepted.
pub fn parse_multipart_boundary(content_type: &str) -> Result<String, DownloadError> {
    let lower = content_type.to_ascii_lowercase();
    let boundary = lower
        .trim_start()
        .starts_with("multipart/")
        .then(|| lower.find("boundary="))
        .flatten()
        .and_then(|idx| {
            let rest = &content_type[idx + "boundary=".len()..];
            let token = match rest.strip_prefix('"') {
                Some(quoted) => quoted.split('"').next(),
                None => rest.split(';').next().map(str::trim),
            };
            token.filter(|t| !t.is_empty())
        });

    boundary.map(ToString::to_string).ok_or_else(|| {
        UnexpectedContentTypeSnafu {
            content_type,
        }
        .build()
    })
}

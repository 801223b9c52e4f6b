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

//! Turns an old and a new block map into COPY/DOWNLOAD operations over the
//! new file.

use std::collections::HashMap;

use serde::Serialize;
use snafu::{OptionExt, ensure};
use tracing::{debug, info, warn};

use crate::{
    blockmap::{BlockMap, BlockMapFile},
    config::PlanConfig,
    error::{DownloadError, MissingFileEntrySnafu, OverlappingOperationSnafu},
};

/// One step of a reconstruction plan. Ranges are half-open offsets in the
/// new file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    /// Reuse `[old_start, old_start + len)` of the old file.
    Copy { start: u64, end: u64, old_start: u64 },
    /// Fetch `[start, end)` of the new file from the server.
    Download { start: u64, end: u64 },
}

impl Operation {
    #[must_use]
    pub const fn start(&self) -> u64 {
        match self {
            Self::Copy { start, .. } | Self::Download { start, .. } => *start,
        }
    }

    #[must_use]
    pub const fn end(&self) -> u64 {
        match self {
            Self::Copy { end, .. } | Self::Download { end, .. } => *end,
        }
    }

    #[must_use]
    pub const fn len(&self) -> u64 { self.end() - self.start() }

    #[must_use]
    pub const fn is_empty(&self) -> bool { self.len() == 0 }

    #[must_use]
    pub const fn is_download(&self) -> bool { matches!(self, Self::Download { .. }) }

    /// Inclusive `a-b` form used inside a `Range` header.
    #[must_use]
    pub fn range_spec(&self) -> String { format!("{}-{}", self.start(), self.end() - 1) }
}

/// Byte and operation counts of a plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub download_bytes:      u64,
    pub copy_bytes:          u64,
    pub download_operations: usize,
    pub copy_operations:     usize,
    pub changed_blocks:      usize,
}

/// Ordered operations covering the new file, plus bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    /// Name of the block map file entry the plan was built for
    pub file_name:      String,
    pub operations:     Vec<Operation>,
    /// New-file blocks that had no usable match in the old file
    pub changed_blocks: usize,
}

impl Plan {
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary {
            changed_blocks: self.changed_blocks,
            ..PlanSummary::default()
        };
        for op in &self.operations {
            if op.is_download() {
                summary.download_bytes += op.len();
                summary.download_operations += 1;
            } else {
                summary.copy_bytes += op.len();
                summary.copy_operations += 1;
            }
        }
        summary
    }
}

/// Builds [`Plan`]s from block map pairs
#[derive(Debug, Clone, Default)]
pub struct PlanBuilder {
    config: PlanConfig,
}

impl PlanBuilder {
    #[must_use]
    pub const fn new(config: PlanConfig) -> Self { Self { config } }

    /// Diff `old` against `new` for the first file listed in `new`.
    pub fn build(&self, old: &BlockMap, new: &BlockMap) -> Result<Plan, DownloadError> {
        let new_file = new.primary_file("new")?;
        let old_file = old.file(&new_file.name).context(MissingFileEntrySnafu {
            name:  new_file.name.as_str(),
            which: "old",
        })?;

        let checksum_to_old = index_old_blocks(old_file);
        let mut operations: Vec<Operation> = Vec::new();
        let mut changed_blocks = 0;

        for (index, block) in new_file.blocks().enumerate() {
            if block.size == 0 {
                continue;
            }
            let end = block.offset + u64::from(block.size);
            let old_start = match checksum_to_old.get(block.checksum) {
                Some(&(old_offset, old_size)) if old_size == block.size => Some(old_offset),
                Some(&(_, old_size)) => {
                    warn!(
                        checksum = block.checksum,
                        old_size,
                        new_size = block.size,
                        "Checksum matches, but size differs; downloading block"
                    );
                    None
                }
                None => None,
            };

            match (old_start, operations.last_mut()) {
                (None, Some(Operation::Download { end: last_end, .. }))
                    if *last_end == block.offset =>
                {
                    changed_blocks += 1;
                    *last_end = end;
                }
                (None, _) => {
                    changed_blocks += 1;
                    self.push(
                        &mut operations,
                        Operation::Download {
                            start: block.offset,
                            end,
                        },
                        block.checksum,
                        index,
                    )?;
                }
                (
                    Some(old_offset),
                    Some(Operation::Copy {
                        start,
                        end: last_end,
                        old_start,
                    }),
                ) if *last_end == block.offset
                    && *old_start + (*last_end - *start) == old_offset =>
                {
                    *last_end = end;
                }
                (Some(old_offset), _) => {
                    self.push(
                        &mut operations,
                        Operation::Copy {
                            start: block.offset,
                            end,
                            old_start: old_offset,
                        },
                        block.checksum,
                        index,
                    )?;
                }
            }
        }

        if changed_blocks > 0 {
            info!(file = %new_file.name, changed_blocks, "File has changed blocks");
        }

        Ok(Plan {
            file_name: new_file.name.clone(),
            operations,
            changed_blocks,
        })
    }

    fn push(
        &self,
        operations: &mut Vec<Operation>,
        operation: Operation,
        checksum: &str,
        index: usize,
    ) -> Result<(), DownloadError> {
        if self.config.validate_ranges {
            if let Some(previous) = operations.last() {
                ensure!(
                    operation.start() >= previous.end(),
                    OverlappingOperationSnafu {
                        index,
                        start: operation.start(),
                        end: operation.end(),
                        previous_end: previous.end(),
                        checksum,
                    }
                );
            }
        }
        operations.push(operation);
        Ok(())
    }
}

/// Checksum -> (absolute offset, size) of its first occurrence.
fn index_old_blocks(file: &BlockMapFile) -> HashMap<&str, (u64, u32)> {
    let mut index: HashMap<&str, (u64, u32)> = HashMap::with_capacity(file.checksums.len());
    for block in file.blocks() {
        match index.get(block.checksum) {
            None => {
                index.insert(block.checksum, (block.offset, block.size));
            }
            Some(&(_, existing)) => {
                // Later duplicates are skipped, the first occurrence stays
                // usable.
                debug!(
                    checksum = block.checksum,
                    first_size = existing,
                    this_size = block.size,
                    "Checksum duplicated in block map"
                );
            }
        }
    }
    index
}

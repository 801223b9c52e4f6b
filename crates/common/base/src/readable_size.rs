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

//! Byte sizes that read and print like humans write them (`512KiB`, `64MiB`).

use std::{fmt, str::FromStr};

use derive_more::{Add, From, Sub};
use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{self, Visitor},
};
use snafu::{OptionExt, ResultExt, Snafu};

const UNIT: u64 = 1;
const KIB: u64 = UNIT * 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;
const TIB: u64 = GIB * 1024;
const PIB: u64 = TIB * 1024;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ParseSizeError {
    #[snafu(display("Size string is empty"))]
    Empty,

    #[snafu(display("Invalid size number in {input:?}: {source}"))]
    InvalidNumber {
        input:  String,
        source: std::num::ParseFloatError,
    },

    #[snafu(display("Unknown size unit {unit:?}, expected one of B, KiB, MiB, GiB, TiB, PiB"))]
    UnknownUnit { unit: String },
}

/// A byte count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, From, Add, Sub)]
pub struct ReadableSize(pub u64);

impl ReadableSize {
    #[must_use]
    pub const fn kb(count: u64) -> Self { Self(count * KIB) }

    #[must_use]
    pub const fn mb(count: u64) -> Self { Self(count * MIB) }

    #[must_use]
    pub const fn gb(count: u64) -> Self { Self(count * GIB) }

    #[must_use]
    pub const fn as_bytes(self) -> u64 { self.0 }

    /// Byte count as `usize`, saturating on 32-bit targets.
    #[must_use]
    pub fn as_usize(self) -> usize { usize::try_from(self.0).unwrap_or(usize::MAX) }
}

impl fmt::Display for ReadableSize {
    #[allow(clippy::cast_precision_loss)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = self.0;
        if size == 0 {
            return write!(f, "0B");
        }
        let (divisor, unit) = if size >= PIB {
            (PIB, "PiB")
        } else if size >= TIB {
            (TIB, "TiB")
        } else if size >= GIB {
            (GIB, "GiB")
        } else if size >= MIB {
            (MIB, "MiB")
        } else if size >= KIB {
            (KIB, "KiB")
        } else {
            return write!(f, "{size}B");
        };
        if size % divisor == 0 {
            write!(f, "{}{unit}", size / divisor)
        } else {
            write!(f, "{:.1}{unit}", size as f64 / divisor as f64)
        }
    }
}

impl FromStr for ReadableSize {
    type Err = ParseSizeError;

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        snafu::ensure!(!s.is_empty(), EmptySnafu);

        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (number, unit) = s.split_at(split);
        let number: f64 = number
            .parse()
            .context(InvalidNumberSnafu { input: s })?;

        let unit = unit.trim();
        let multiplier = match unit.to_ascii_uppercase().as_str() {
            "" | "B" => Some(UNIT),
            "K" | "KB" | "KIB" => Some(KIB),
            "M" | "MB" | "MIB" => Some(MIB),
            "G" | "GB" | "GIB" => Some(GIB),
            "T" | "TB" | "TIB" => Some(TIB),
            "P" | "PB" | "PIB" => Some(PIB),
            _ => None,
        }
        .context(UnknownUnitSnafu { unit })?;

        Ok(Self((number * multiplier as f64) as u64))
    }
}

impl Serialize for ReadableSize {
    /// Human form when it parses back to the same size, plain bytes otherwise.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let readable = self.to_string();
        if readable.parse::<Self>().is_ok_and(|parsed| parsed == *self) {
            serializer.serialize_str(&readable)
        } else {
            serializer.serialize_str(&format!("{}B", self.0))
        }
    }
}

impl<'de> Deserialize<'de> for ReadableSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SizeVisitor;

        impl Visitor<'_> for SizeVisitor {
            type Value = ReadableSize;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a byte count or a size string such as \"64MiB\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(ReadableSize(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u64::try_from(v)
                    .map(ReadableSize)
                    .map_err(|_| E::custom("size must not be negative"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(SizeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(ReadableSize(0).to_string(), "0B");
        assert_eq!(ReadableSize(100).to_string(), "100B");
        assert_eq!(ReadableSize::kb(512).to_string(), "512KiB");
        assert_eq!(ReadableSize::mb(64).to_string(), "64MiB");
        assert_eq!(ReadableSize(1536).to_string(), "1.5KiB");
    }

    #[test]
    fn test_parse() {
        assert_eq!("64MiB".parse::<ReadableSize>().unwrap(), ReadableSize::mb(64));
        assert_eq!("1.5 KiB".parse::<ReadableSize>().unwrap(), ReadableSize(1536));
        assert_eq!("42".parse::<ReadableSize>().unwrap(), ReadableSize(42));
        assert_eq!("2gb".parse::<ReadableSize>().unwrap(), ReadableSize::gb(2));
        assert!("12 parsecs".parse::<ReadableSize>().is_err());
        assert!("".parse::<ReadableSize>().is_err());
    }

    #[test]
    fn test_serde() {
        let size: ReadableSize = serde_json::from_str("\"512KiB\"").unwrap();
        assert_eq!(size, ReadableSize::kb(512));
        let size: ReadableSize = serde_json::from_str("4096").unwrap();
        assert_eq!(size, ReadableSize::kb(4));
        assert_eq!(serde_json::to_string(&ReadableSize::mb(1)).unwrap(), "\"1MiB\"");
        assert_eq!(serde_json::to_string(&ReadableSize(1536)).unwrap(), "\"1.5KiB\"");
    }

    #[test]
    fn test_serde_keeps_inexact_sizes() {
        for size in [ReadableSize(1537), ReadableSize(3 * 1024 * 1024 + 1), ReadableSize(u64::from(u32::MAX))] {
            let json = serde_json::to_string(&size).unwrap();
            let back: ReadableSize = serde_json::from_str(&json).unwrap();
            assert_eq!(back, size, "{json}");
        }
        assert_eq!(serde_json::to_string(&ReadableSize(1537)).unwrap(), "\"1537B\"");
    }
}

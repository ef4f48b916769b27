//! Sample formats, access modes and their byte-level encoding
//!
//! - [`SampleFormat`] / [`Access`]: what the configuration asks the device for
//! - [`FormatDescriptor`]: bit width, container width, endianness and
//!   signedness derived once from a [`SampleFormat`] ([`descriptor`])
//! - [`encode`] / [`decode`]: normalized float <-> raw sample bytes ([`encoder`])

pub mod descriptor;
pub mod encoder;

pub use descriptor::{Endianness, FormatDescriptor};
pub use encoder::{decode, encode, EncodedSample};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a format or access name is not recognized
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseFormatError {
    #[error("unknown or unsupported sample format: {0}")]
    UnknownFormat(String),

    #[error("unknown or unsupported access mode: {0}")]
    UnknownAccess(String),
}

/// Integer sample encodings the period writer can produce
///
/// Names follow ALSA's (`S16_LE`, `S24_3BE`, ...). Unsuffixed names such as
/// `S16` are accepted on input and mean the little-endian variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SampleFormat {
    S8,
    U8,
    #[default]
    S16Le,
    S16Be,
    U16Le,
    U16Be,
    /// 24 bits in the low three bytes of a 4-byte container
    S24Le,
    S24Be,
    U24Le,
    U24Be,
    /// 24 bits packed in 3 bytes
    S24PackedLe,
    S24PackedBe,
    U24PackedLe,
    U24PackedBe,
    S32Le,
    S32Be,
    U32Le,
    U32Be,
}

impl SampleFormat {
    /// Every supported format, in ALSA enumeration order
    pub const ALL: [SampleFormat; 18] = [
        SampleFormat::S8,
        SampleFormat::U8,
        SampleFormat::S16Le,
        SampleFormat::S16Be,
        SampleFormat::U16Le,
        SampleFormat::U16Be,
        SampleFormat::S24Le,
        SampleFormat::S24Be,
        SampleFormat::U24Le,
        SampleFormat::U24Be,
        SampleFormat::S32Le,
        SampleFormat::S32Be,
        SampleFormat::U32Le,
        SampleFormat::U32Be,
        SampleFormat::S24PackedLe,
        SampleFormat::S24PackedBe,
        SampleFormat::U24PackedLe,
        SampleFormat::U24PackedBe,
    ];

    /// ALSA name of the format
    pub fn name(self) -> &'static str {
        match self {
            SampleFormat::S8 => "S8",
            SampleFormat::U8 => "U8",
            SampleFormat::S16Le => "S16_LE",
            SampleFormat::S16Be => "S16_BE",
            SampleFormat::U16Le => "U16_LE",
            SampleFormat::U16Be => "U16_BE",
            SampleFormat::S24Le => "S24_LE",
            SampleFormat::S24Be => "S24_BE",
            SampleFormat::U24Le => "U24_LE",
            SampleFormat::U24Be => "U24_BE",
            SampleFormat::S24PackedLe => "S24_3LE",
            SampleFormat::S24PackedBe => "S24_3BE",
            SampleFormat::U24PackedLe => "U24_3LE",
            SampleFormat::U24PackedBe => "U24_3BE",
            SampleFormat::S32Le => "S32_LE",
            SampleFormat::S32Be => "S32_BE",
            SampleFormat::U32Le => "U32_LE",
            SampleFormat::U32Be => "U32_BE",
        }
    }

    /// Significant bits per sample
    pub fn width(self) -> u32 {
        match self {
            SampleFormat::S8 | SampleFormat::U8 => 8,
            SampleFormat::S16Le | SampleFormat::S16Be | SampleFormat::U16Le | SampleFormat::U16Be => {
                16
            }
            SampleFormat::S32Le | SampleFormat::S32Be | SampleFormat::U32Le | SampleFormat::U32Be => {
                32
            }
            _ => 24,
        }
    }

    /// Bits occupied in memory per sample, padding included
    pub fn physical_width(self) -> u32 {
        match self {
            SampleFormat::S24Le | SampleFormat::S24Be | SampleFormat::U24Le | SampleFormat::U24Be => {
                32
            }
            other => other.width(),
        }
    }

    pub fn is_big_endian(self) -> bool {
        matches!(
            self,
            SampleFormat::S16Be
                | SampleFormat::U16Be
                | SampleFormat::S24Be
                | SampleFormat::U24Be
                | SampleFormat::S24PackedBe
                | SampleFormat::U24PackedBe
                | SampleFormat::S32Be
                | SampleFormat::U32Be
        )
    }

    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            SampleFormat::U8
                | SampleFormat::U16Le
                | SampleFormat::U16Be
                | SampleFormat::U24Le
                | SampleFormat::U24Be
                | SampleFormat::U24PackedLe
                | SampleFormat::U24PackedBe
                | SampleFormat::U32Le
                | SampleFormat::U32Be
        )
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SampleFormat {
    type Err = ParseFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let canonical = match upper.as_str() {
            "S16" => "S16_LE",
            "U16" => "U16_LE",
            "S24" => "S24_LE",
            "U24" => "U24_LE",
            "S32" => "S32_LE",
            "U32" => "U32_LE",
            other => other,
        };
        SampleFormat::ALL
            .iter()
            .copied()
            .find(|f| f.name() == canonical)
            .ok_or_else(|| ParseFormatError::UnknownFormat(s.to_string()))
    }
}

impl TryFrom<String> for SampleFormat {
    type Error = ParseFormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SampleFormat> for String {
    fn from(format: SampleFormat) -> Self {
        format.name().to_string()
    }
}

/// Ring buffer access mode requested from the device
///
/// Only memory-mapped modes exist here: the period writer always goes through
/// mmap begin/commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Access {
    /// One buffer, samples of all channels interleaved per frame
    #[default]
    MmapInterleaved,
    /// One contiguous block per channel
    MmapNoninterleaved,
    /// Arbitrary per-channel layout described by the device
    MmapComplex,
}

impl Access {
    pub fn name(self) -> &'static str {
        match self {
            Access::MmapInterleaved => "MMAP_INTERLEAVED",
            Access::MmapNoninterleaved => "MMAP_NONINTERLEAVED",
            Access::MmapComplex => "MMAP_COMPLEX",
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Access {
    type Err = ParseFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MMAP_INTERLEAVED" => Ok(Access::MmapInterleaved),
            "MMAP_NONINTERLEAVED" => Ok(Access::MmapNoninterleaved),
            "MMAP_COMPLEX" => Ok(Access::MmapComplex),
            _ => Err(ParseFormatError::UnknownAccess(s.to_string())),
        }
    }
}

impl TryFrom<String> for Access {
    type Error = ParseFormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Access> for String {
    fn from(access: Access) -> Self {
        access.name().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_names_round_trip() {
        for format in SampleFormat::ALL {
            assert_eq!(format.name().parse::<SampleFormat>().unwrap(), format);
        }
    }

    #[test]
    fn test_unsuffixed_aliases_are_little_endian() {
        assert_eq!("S16".parse::<SampleFormat>().unwrap(), SampleFormat::S16Le);
        assert_eq!("u24".parse::<SampleFormat>().unwrap(), SampleFormat::U24Le);
        assert_eq!("S32".parse::<SampleFormat>().unwrap(), SampleFormat::S32Le);
    }

    #[test]
    fn test_float_formats_rejected() {
        let err = "FLOAT_LE".parse::<SampleFormat>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "unknown or unsupported sample format: FLOAT_LE"
        );
    }

    #[test]
    fn test_widths() {
        assert_eq!(SampleFormat::S16Le.width(), 16);
        assert_eq!(SampleFormat::S16Le.physical_width(), 16);
        assert_eq!(SampleFormat::S24Le.width(), 24);
        assert_eq!(SampleFormat::S24Le.physical_width(), 32);
        assert_eq!(SampleFormat::U24PackedBe.physical_width(), 24);
        assert_eq!(SampleFormat::U8.physical_width(), 8);
    }

    #[test]
    fn test_access_parse() {
        assert_eq!(
            "mmap_noninterleaved".parse::<Access>().unwrap(),
            Access::MmapNoninterleaved
        );
        assert!("RW_INTERLEAVED".parse::<Access>().is_err());
        assert_eq!(Access::default(), Access::MmapInterleaved);
    }

    #[test]
    fn test_serde_uses_alsa_names() {
        let json = serde_json::to_string(&SampleFormat::S24PackedLe).unwrap();
        assert_eq!(json, "\"S24_3LE\"");
        let parsed: SampleFormat = serde_json::from_str("\"U16_BE\"").unwrap();
        assert_eq!(parsed, SampleFormat::U16Be);
        assert!(serde_json::from_str::<SampleFormat>("\"S20_LE\"").is_err());
    }
}

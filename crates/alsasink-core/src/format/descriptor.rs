//! Bit-level description of a sample format
//!
//! Everything the encoder needs is derived once from the requested
//! [`SampleFormat`] and then treated as immutable for the session.

use super::SampleFormat;
use serde::Serialize;

/// Byte order of a serialized sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Endianness {
    Little,
    Big,
}

/// Derived layout of one sample in device memory
///
/// # Example
/// ```
/// use alsasink_core::format::{FormatDescriptor, SampleFormat};
///
/// let fmt = FormatDescriptor::new(SampleFormat::S24Le);
/// assert_eq!(fmt.bits(), 24);
/// assert_eq!(fmt.physical_bytes(), 4);
/// assert_eq!(fmt.maxval(), 8_388_607);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FormatDescriptor {
    /// Format this descriptor was derived from
    format: SampleFormat,
    /// Significant bits per sample
    bits: u32,
    /// Container size in bytes, padding included
    physical_bytes: usize,
    /// Byte order of the significant bytes
    endianness: Endianness,
    /// Whether the raw value is two's complement
    signed: bool,
    /// Largest positive raw value, `2^(bits-1) - 1`
    maxval: i64,
}

impl FormatDescriptor {
    /// Derive the descriptor for a sample format
    pub fn new(format: SampleFormat) -> Self {
        let bits = format.width();
        Self {
            format,
            bits,
            physical_bytes: (format.physical_width() / 8) as usize,
            endianness: if format.is_big_endian() {
                Endianness::Big
            } else {
                Endianness::Little
            },
            signed: !format.is_unsigned(),
            maxval: (1i64 << (bits - 1)) - 1,
        }
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Bytes carrying the value (`bits / 8`)
    pub fn value_bytes(&self) -> usize {
        (self.bits / 8) as usize
    }

    pub fn physical_bytes(&self) -> usize {
        self.physical_bytes
    }

    /// Container size in bits, as ALSA reports it
    pub fn physical_bits(&self) -> u32 {
        self.physical_bytes as u32 * 8
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn is_big_endian(&self) -> bool {
        self.endianness == Endianness::Big
    }

    pub fn is_signed(&self) -> bool {
        self.signed
    }

    pub fn maxval(&self) -> i64 {
        self.maxval
    }
}

impl From<SampleFormat> for FormatDescriptor {
    fn from(format: SampleFormat) -> Self {
        Self::new(format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s16_le() {
        let fmt = FormatDescriptor::new(SampleFormat::S16Le);
        assert_eq!(fmt.bits(), 16);
        assert_eq!(fmt.value_bytes(), 2);
        assert_eq!(fmt.physical_bytes(), 2);
        assert_eq!(fmt.endianness(), Endianness::Little);
        assert!(fmt.is_signed());
        assert_eq!(fmt.maxval(), 32767);
    }

    #[test]
    fn test_padded_container() {
        let fmt = FormatDescriptor::new(SampleFormat::U24Be);
        assert_eq!(fmt.value_bytes(), 3);
        assert_eq!(fmt.physical_bytes(), 4);
        assert_eq!(fmt.physical_bits(), 32);
        assert!(fmt.is_big_endian());
        assert!(!fmt.is_signed());
    }

    #[test]
    fn test_maxval_per_width() {
        assert_eq!(FormatDescriptor::new(SampleFormat::U8).maxval(), 127);
        assert_eq!(
            FormatDescriptor::new(SampleFormat::S24PackedLe).maxval(),
            8_388_607
        );
        assert_eq!(
            FormatDescriptor::new(SampleFormat::S32Be).maxval(),
            i32::MAX as i64
        );
    }

    #[test]
    fn test_physical_never_below_value_width() {
        for format in SampleFormat::ALL {
            let fmt = FormatDescriptor::new(format);
            assert!(fmt.physical_bytes() >= fmt.value_bytes(), "{format}");
        }
    }
}

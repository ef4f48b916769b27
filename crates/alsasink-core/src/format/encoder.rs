//! Normalized float <-> raw sample bytes
//!
//! Values in [-1.0, 1.0] are scaled by the format's `maxval`, rounded, moved
//! into the unsigned domain by flipping the sign bit when the format is
//! unsigned, and serialized in the format's byte order. Padding bytes in wider
//! containers are zero. Big-endian values sit at the end of their container,
//! little-endian values at the start.

use super::FormatDescriptor;

/// Widest container any supported format uses
pub const MAX_PHYSICAL_BYTES: usize = 4;

/// One encoded sample, exactly `physical_bytes` long
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncodedSample {
    bytes: [u8; MAX_PHYSICAL_BYTES],
    len: usize,
}

impl EncodedSample {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Encode a normalized value for the given format
///
/// Out-of-range values are clamped to [-1.0, 1.0]; NaN encodes as silence.
///
/// # Example
/// ```
/// use alsasink_core::format::{encode, FormatDescriptor, SampleFormat};
///
/// let fmt = FormatDescriptor::new(SampleFormat::S16Le);
/// assert_eq!(encode(0.5, &fmt).as_bytes(), &[0x00, 0x40]);
/// assert_eq!(encode(-0.5, &fmt).as_bytes(), &[0x00, 0xC0]);
/// ```
pub fn encode(value: f64, fmt: &FormatDescriptor) -> EncodedSample {
    let value = if value.is_nan() {
        0.0
    } else {
        value.clamp(-1.0, 1.0)
    };

    let mut raw = (value * fmt.maxval() as f64).round() as i64;
    if !fmt.is_signed() {
        raw ^= 1i64 << (fmt.bits() - 1);
    }

    let phys = fmt.physical_bytes();
    let mut bytes = [0u8; MAX_PHYSICAL_BYTES];
    for i in 0..fmt.value_bytes() {
        let byte = ((raw >> (i * 8)) & 0xff) as u8;
        if fmt.is_big_endian() {
            bytes[phys - 1 - i] = byte;
        } else {
            bytes[i] = byte;
        }
    }

    EncodedSample { bytes, len: phys }
}

/// Decode raw sample bytes back into a normalized value
///
/// Inverse of [`encode`] up to quantization: `decode(encode(v))` is within
/// `1 / maxval` of `v` for any `v` in [-1.0, 1.0].
///
/// # Panics
/// Panics if `bytes` is shorter than the format's physical width.
pub fn decode(bytes: &[u8], fmt: &FormatDescriptor) -> f64 {
    let phys = fmt.physical_bytes();
    let bits = fmt.bits();

    let mut raw: u64 = 0;
    for i in 0..fmt.value_bytes() {
        let byte = if fmt.is_big_endian() {
            bytes[phys - 1 - i]
        } else {
            bytes[i]
        };
        raw |= (byte as u64) << (i * 8);
    }
    if !fmt.is_signed() {
        raw ^= 1u64 << (bits - 1);
    }

    // sign-extend from `bits`
    let shift = 64 - bits;
    let value = ((raw << shift) as i64) >> shift;
    value as f64 / fmt.maxval() as f64
}

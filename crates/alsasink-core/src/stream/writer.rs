//! Ring buffer writer
//!
//! Fills exactly one period of the mmap ring with the current input vector.
//! The device may grant fewer frames than asked for (for instance at the end
//! of the ring), so a period can take several acquire/encode/commit rounds.
//!
//! Each granted region is validated before a single byte is written: channel
//! offsets and strides must be whole bytes and every sample must lie inside
//! the mapped segment its channel points at. A layout that fails validation
//! is fatal.

use crate::error::SinkError;
use crate::format::EncodedSample;
use crate::pcm::{Frames, MmapGrant, PcmDevice, PcmError};
use crate::stats::SinkStats;
use crate::stream::negotiate::StreamParams;
use crate::stream::recovery::{Readiness, Recovery};
use serde::Serialize;
use thiserror::Error;

/// Ring layouts the writer refuses to write into
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AlignmentError {
    #[error("channel {channel}: first sample at bit {first} is not byte aligned")]
    MisalignedFirst { channel: usize, first: u32 },

    #[error("channel {channel}: sample step of {step} bits is not byte aligned")]
    MisalignedStride { channel: usize, step: u32 },

    #[error("channel {channel}: stride of {stride} bytes is smaller than the {width}-byte sample")]
    StrideTooSmall {
        channel: usize,
        stride: usize,
        width: usize,
    },

    #[error("channel {channel}: region ends at byte {end}, mapped buffer has {len}")]
    OutOfBounds {
        channel: usize,
        end: usize,
        len: usize,
    },

    #[error("device reported {actual} channel areas, stream has {expected} channels")]
    ChannelCountMismatch { expected: usize, actual: usize },

    #[error("channel {channel}: segment {segment} is not mapped ({mapped} segments)")]
    UnmappedSegment {
        channel: usize,
        segment: usize,
        mapped: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChannelLayout {
    segment: usize,
    /// Byte offset of the first granted frame
    start: usize,
    /// Bytes between consecutive frames
    stride: usize,
}

/// Validated, writable view of one granted ring region
///
/// Lives between one `mmap_begin` and the matching `mmap_commit`.
#[derive(Debug)]
pub struct RingRegion<'a> {
    segments: Vec<&'a mut [u8]>,
    layout: Vec<ChannelLayout>,
    frames: Frames,
    width: usize,
}

impl<'a> RingRegion<'a> {
    /// Validate `grant` against the mapped buffer
    ///
    /// # Arguments
    /// * `segments` - The mapped ring buffer, one slice per allocation
    /// * `grant` - Region returned by `mmap_begin`
    /// * `channels` - Negotiated channel count
    /// * `width` - Physical bytes per sample
    pub fn new(
        segments: Vec<&'a mut [u8]>,
        grant: &MmapGrant,
        channels: usize,
        width: usize,
    ) -> Result<Self, AlignmentError> {
        if grant.areas.len() != channels {
            return Err(AlignmentError::ChannelCountMismatch {
                expected: channels,
                actual: grant.areas.len(),
            });
        }

        let mut layout = Vec::with_capacity(channels);
        for (channel, area) in grant.areas.iter().enumerate() {
            let len = segments
                .get(area.segment)
                .map(|seg| seg.len())
                .ok_or(AlignmentError::UnmappedSegment {
                    channel,
                    segment: area.segment,
                    mapped: segments.len(),
                })?;
            if area.first % 8 != 0 {
                return Err(AlignmentError::MisalignedFirst {
                    channel,
                    first: area.first,
                });
            }
            if area.step % 8 != 0 {
                return Err(AlignmentError::MisalignedStride {
                    channel,
                    step: area.step,
                });
            }
            let stride = area.step as usize / 8;
            if grant.frames > 1 && stride < width {
                return Err(AlignmentError::StrideTooSmall {
                    channel,
                    stride,
                    width,
                });
            }

            let out_of_bounds = || AlignmentError::OutOfBounds {
                channel,
                end: usize::MAX,
                len,
            };
            let start = grant
                .offset
                .checked_mul(stride)
                .and_then(|o| o.checked_add(area.base))
                .and_then(|o| o.checked_add(area.first as usize / 8))
                .ok_or_else(out_of_bounds)?;
            if grant.frames > 0 {
                let end = (grant.frames - 1)
                    .checked_mul(stride)
                    .and_then(|o| o.checked_add(start))
                    .and_then(|o| o.checked_add(width))
                    .ok_or_else(out_of_bounds)?;
                if end > len {
                    return Err(AlignmentError::OutOfBounds { channel, end, len });
                }
            }
            layout.push(ChannelLayout {
                segment: area.segment,
                start,
                stride,
            });
        }

        Ok(Self {
            segments,
            layout,
            frames: grant.frames,
            width,
        })
    }

    pub fn frames(&self) -> Frames {
        self.frames
    }

    pub fn channels(&self) -> usize {
        self.layout.len()
    }

    /// Bytes of one sample, or `None` outside the region
    pub fn sample_mut(&mut self, channel: usize, frame: Frames) -> Option<&mut [u8]> {
        if frame >= self.frames {
            return None;
        }
        let lay = *self.layout.get(channel)?;
        let start = lay.start + frame * lay.stride;
        self.segments
            .get_mut(lay.segment)?
            .get_mut(start..start + self.width)
    }

    /// Write `samples[c]` into every frame of channel `c`
    pub fn fill(&mut self, samples: &[EncodedSample]) {
        debug_assert_eq!(samples.len(), self.layout.len());
        for (channel, sample) in samples.iter().enumerate() {
            let bytes = sample.as_bytes();
            for frame in 0..self.frames {
                // validated in `new`, so every sample is inside its segment
                if let Some(dst) = self.sample_mut(channel, frame) {
                    dst.copy_from_slice(bytes);
                }
            }
        }
    }
}

/// How a single period write ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PeriodOutcome {
    /// The full period was committed
    Written,
    /// No room yet (or the device asked to retry); nothing more this tick
    Deferred,
    /// A short commit, or an xrun or suspend while writing; recovery runs
    /// next tick
    Underrun,
}

/// Result of [`write_period`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodReport {
    pub outcome: PeriodOutcome,
    /// Frames committed, including those of a partially written period
    pub frames: Frames,
}

impl PeriodReport {
    fn new(outcome: PeriodOutcome, frames: Frames) -> Self {
        Self { outcome, frames }
    }
}

/// Write one period of `samples` (one encoded sample per channel)
///
/// Asks the recovery state machine first; if the device cannot take a period
/// right now the call is a no-op that reports [`PeriodOutcome::Deferred`].
pub fn write_period<D: PcmDevice + ?Sized>(
    pcm: &mut D,
    params: &StreamParams,
    samples: &[EncodedSample],
    recovery: &mut Recovery,
    stats: &mut SinkStats,
) -> Result<PeriodReport, SinkError> {
    if recovery.check(pcm, stats)? == Readiness::Retry {
        return Ok(PeriodReport::new(PeriodOutcome::Deferred, 0));
    }

    let channels = params.channels as usize;
    let width = params.format.physical_bytes();
    let mut remaining = params.period_size;
    let mut written: Frames = 0;

    while remaining > 0 {
        let mut grant = match pcm.mmap_begin(remaining) {
            Ok(grant) => grant,
            Err(e) => {
                return absorb(e, "mmap_begin", written, recovery, stats);
            }
        };
        if grant.frames == 0 {
            tracing::debug!("Device granted no frames, {} left in period", remaining);
            return Ok(PeriodReport::new(PeriodOutcome::Deferred, written));
        }
        if grant.frames > remaining {
            tracing::debug!(
                "Device granted {} frames for a request of {}, using {}",
                grant.frames,
                remaining,
                remaining
            );
            grant.frames = remaining;
        }

        {
            let mut region = RingRegion::new(pcm.mapped_mut(), &grant, channels, width)
                .map_err(|e| {
                    tracing::error!("Refusing to write ring region: {}", e);
                    SinkError::Alignment(e)
                })?;
            region.fill(samples);
        }
        tracing::trace!("Filled {} frames at ring offset {}", grant.frames, grant.offset);

        let committed = match pcm.mmap_commit(grant.offset, grant.frames) {
            Ok(committed) => committed,
            Err(e) => {
                return absorb(e, "mmap_commit", written, recovery, stats);
            }
        };
        written += committed;
        if committed != grant.frames {
            tracing::warn!(
                "Short commit ({} of {} frames), treating as underrun",
                committed,
                grant.frames
            );
            recovery.mark_underrun(stats);
            return Ok(PeriodReport::new(PeriodOutcome::Underrun, written));
        }
        remaining -= grant.frames;
    }

    Ok(PeriodReport::new(PeriodOutcome::Written, written))
}

fn absorb(
    err: PcmError,
    op: &'static str,
    written: Frames,
    recovery: &mut Recovery,
    stats: &mut SinkStats,
) -> Result<PeriodReport, SinkError> {
    match err {
        PcmError::Xrun => {
            tracing::warn!("{} failed: {}", op, err);
            recovery.mark_underrun(stats);
        }
        PcmError::Suspended => {
            tracing::warn!("{} failed: {}", op, err);
            recovery.mark_suspended(stats);
        }
        other => {
            tracing::error!("{} failed: {}", op, other);
            return Err(SinkError::device(op, other));
        }
    }
    Ok(PeriodReport::new(PeriodOutcome::Underrun, written))
}

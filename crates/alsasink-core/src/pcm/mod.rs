//! PCM device abstraction
//!
//! [`PcmDevice`] is the seam between the period writer and the hardware. It
//! mirrors the subset of the ALSA PCM API the sink needs: hardware/software
//! parameter negotiation, status and availability, the start/prepare/resume
//! recovery actions, and mmap begin/commit access to the ring buffer.
//!
//! Implementations:
//! - [`alsa::AlsaPcm`]: libasound backend (feature `alsa`, Linux only)
//! - [`sim::SimulatedPcm`]: deterministic in-memory device with fault
//!   injection, used by tests and the CLI's `--simulate` mode

#[cfg(all(feature = "alsa", target_os = "linux"))]
pub mod alsa;
pub mod sim;

use crate::format::{Access, SampleFormat};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Frame counts and ring positions
pub type Frames = usize;

/// Device-level failure kinds
///
/// The recovery state machine only distinguishes the first three; everything
/// else is fatal for the stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PcmError {
    /// The ring buffer ran empty (`-EPIPE`)
    #[error("buffer underrun")]
    Xrun,

    /// The device was suspended by power management (`-ESTRPIPE`)
    #[error("stream suspended")]
    Suspended,

    /// Operation not possible yet, try again (`-EAGAIN`)
    #[error("resource temporarily unavailable")]
    Again,

    /// The device was unplugged or otherwise went away (`-ENODEV`)
    #[error("device disconnected")]
    Disconnected,

    /// Any other error reported by the backend
    #[error("{message} (errno {errno})")]
    Backend { errno: i32, message: String },
}

impl PcmError {
    pub fn backend(errno: i32, message: impl Into<String>) -> Self {
        Self::Backend {
            errno,
            message: message.into(),
        }
    }
}

/// Hardware stream status, read fresh every tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmState {
    Open,
    Setup,
    Prepared,
    Running,
    Xrun,
    Draining,
    Paused,
    Suspended,
    Disconnected,
}

impl fmt::Display for PcmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PcmState::Open => "OPEN",
            PcmState::Setup => "SETUP",
            PcmState::Prepared => "PREPARED",
            PcmState::Running => "RUNNING",
            PcmState::Xrun => "XRUN",
            PcmState::Draining => "DRAINING",
            PcmState::Paused => "PAUSED",
            PcmState::Suspended => "SUSPENDED",
            PcmState::Disconnected => "DISCONNECTED",
        };
        f.write_str(name)
    }
}

/// Layout of one channel inside the mapped ring buffer
///
/// Same meaning as ALSA's `snd_pcm_channel_area_t`, except that the address
/// is a segment index plus byte offset into [`PcmDevice::mapped_mut`] instead
/// of a raw pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelArea {
    /// Mapped segment holding this channel's samples
    pub segment: usize,
    /// Byte offset of the channel's area within its segment
    pub base: usize,
    /// Offset of the first sample, in bits
    pub first: u32,
    /// Distance between consecutive samples, in bits
    pub step: u32,
}

/// Writable run of frames granted by [`PcmDevice::mmap_begin`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmapGrant {
    /// Per-channel layout, one entry per channel
    pub areas: Vec<ChannelArea>,
    /// Ring position of the first granted frame
    pub offset: Frames,
    /// Contiguous frames granted (may be fewer than requested)
    pub frames: Frames,
}

/// Software parameters applied after the hardware configuration is committed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwParams {
    /// Queued frames at which the device starts by itself
    pub start_threshold: Frames,
    /// Free frames needed before a waiter is woken
    pub avail_min: Frames,
    /// Available frames at which the device stops; the boundary means never
    pub stop_threshold: Frames,
    /// Produce a wake-up event at every period boundary
    pub period_event: bool,
}

/// Playback stream operations needed by the sink
///
/// Negotiation methods are called in order by
/// [`negotiate`](crate::stream::negotiate::negotiate) on a freshly opened
/// device. Runtime methods are called once per tick by the recovery state
/// machine and the period writer. There is no close method: implementations
/// release the device in `Drop`, which the owning sink runs exactly once.
pub trait PcmDevice {
    /// Identifier the device was opened with
    fn name(&self) -> &str;

    /// Load the full hardware configuration space
    fn hw_params_any(&mut self) -> Result<(), PcmError>;

    fn set_access(&mut self, access: Access) -> Result<(), PcmError>;

    fn set_format(&mut self, format: SampleFormat) -> Result<(), PcmError>;

    fn set_channels(&mut self, channels: u32) -> Result<(), PcmError>;

    /// Restrict the rate to the one nearest `rate`; returns the chosen rate
    fn set_rate_near(&mut self, rate: u32) -> Result<u32, PcmError>;

    /// Restrict the buffer time (µs) to the nearest supported; returns it
    fn set_buffer_time_near(&mut self, buffer_time_us: u32) -> Result<u32, PcmError>;

    /// Restrict the period time (µs) to the nearest supported; returns it
    fn set_period_time_near(&mut self, period_time_us: u32) -> Result<u32, PcmError>;

    /// Buffer size in frames of the current configuration
    fn buffer_size(&self) -> Result<Frames, PcmError>;

    /// Period size in frames of the current configuration
    fn period_size(&self) -> Result<Frames, PcmError>;

    /// Install the hardware configuration; leaves the device prepared
    fn commit_hw_params(&mut self) -> Result<(), PcmError>;

    /// Ring pointer wrap boundary, used as "never stop" threshold
    fn boundary(&self) -> Result<Frames, PcmError>;

    fn commit_sw_params(&mut self, params: &SwParams) -> Result<(), PcmError>;

    fn state(&self) -> PcmState;

    /// Frames currently free for writing
    fn avail_update(&mut self) -> Result<Frames, PcmError>;

    fn start(&mut self) -> Result<(), PcmError>;

    /// Reset ring pointers so the stream can be started again
    fn prepare(&mut self) -> Result<(), PcmError>;

    /// Resume after suspend; [`PcmError::Again`] while still suspended
    fn resume(&mut self) -> Result<(), PcmError>;

    /// Block until at least avail-min frames are free or the timeout passes
    ///
    /// `None` waits indefinitely. Returns `false` on timeout.
    fn wait(&mut self, timeout: Option<Duration>) -> Result<bool, PcmError>;

    /// Request up to `frames` contiguous writable frames
    fn mmap_begin(&mut self, frames: Frames) -> Result<MmapGrant, PcmError>;

    /// Mapped ring buffer of the last [`mmap_begin`](Self::mmap_begin)
    ///
    /// One slice per disjoint allocation. Interleaved hardware buffers are a
    /// single segment; plugin devices may keep each channel separately.
    fn mapped_mut(&mut self) -> Vec<&mut [u8]>;

    /// Hand `frames` frames at `offset` to the device; returns frames taken
    fn mmap_commit(&mut self, offset: Frames, frames: Frames) -> Result<Frames, PcmError>;
}

impl<D: PcmDevice + ?Sized> PcmDevice for Box<D> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn hw_params_any(&mut self) -> Result<(), PcmError> {
        (**self).hw_params_any()
    }

    fn set_access(&mut self, access: Access) -> Result<(), PcmError> {
        (**self).set_access(access)
    }

    fn set_format(&mut self, format: SampleFormat) -> Result<(), PcmError> {
        (**self).set_format(format)
    }

    fn set_channels(&mut self, channels: u32) -> Result<(), PcmError> {
        (**self).set_channels(channels)
    }

    fn set_rate_near(&mut self, rate: u32) -> Result<u32, PcmError> {
        (**self).set_rate_near(rate)
    }

    fn set_buffer_time_near(&mut self, buffer_time_us: u32) -> Result<u32, PcmError> {
        (**self).set_buffer_time_near(buffer_time_us)
    }

    fn set_period_time_near(&mut self, period_time_us: u32) -> Result<u32, PcmError> {
        (**self).set_period_time_near(period_time_us)
    }

    fn buffer_size(&self) -> Result<Frames, PcmError> {
        (**self).buffer_size()
    }

    fn period_size(&self) -> Result<Frames, PcmError> {
        (**self).period_size()
    }

    fn commit_hw_params(&mut self) -> Result<(), PcmError> {
        (**self).commit_hw_params()
    }

    fn boundary(&self) -> Result<Frames, PcmError> {
        (**self).boundary()
    }

    fn commit_sw_params(&mut self, params: &SwParams) -> Result<(), PcmError> {
        (**self).commit_sw_params(params)
    }

    fn state(&self) -> PcmState {
        (**self).state()
    }

    fn avail_update(&mut self) -> Result<Frames, PcmError> {
        (**self).avail_update()
    }

    fn start(&mut self) -> Result<(), PcmError> {
        (**self).start()
    }

    fn prepare(&mut self) -> Result<(), PcmError> {
        (**self).prepare()
    }

    fn resume(&mut self) -> Result<(), PcmError> {
        (**self).resume()
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<bool, PcmError> {
        (**self).wait(timeout)
    }

    fn mmap_begin(&mut self, frames: Frames) -> Result<MmapGrant, PcmError> {
        (**self).mmap_begin(frames)
    }

    fn mapped_mut(&mut self) -> Vec<&mut [u8]> {
        (**self).mapped_mut()
    }

    fn mmap_commit(&mut self, offset: Frames, frames: Frames) -> Result<Frames, PcmError> {
        (**self).mmap_commit(offset, frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_display() {
        let err = PcmError::backend(-22, "Invalid argument");
        assert_eq!(err.to_string(), "Invalid argument (errno -22)");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(PcmState::Xrun.to_string(), "XRUN");
        assert_eq!(PcmState::Prepared.to_string(), "PREPARED");
    }
}

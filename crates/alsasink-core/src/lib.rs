//! Alsasink Core - Memory-mapped ALSA playback with underrun and suspend recovery
//!
//! This library writes one real-time vector per pipeline tick into a hardware
//! ring buffer, one period at a time. It negotiates the stream configuration
//! against what the device supports, encodes samples for any integer format,
//! and keeps the stream alive across underruns and power-management suspends.
//!
//! The hardware is reached through the [`pcm::PcmDevice`] trait. The `alsa`
//! feature adds the libasound backend; [`pcm::sim::SimulatedPcm`] is always
//! available for tests and dry runs.

pub mod config;
pub mod error;
pub mod format;
pub mod pcm;
pub mod signal;
pub mod stats;
pub mod stream;

pub use config::{ConfigError, SinkConfig};
pub use error::{RecoveryCondition, SinkError};
pub use format::{Access, FormatDescriptor, SampleFormat};
pub use pcm::{PcmDevice, PcmError, PcmState};
pub use signal::ToneGenerator;
pub use stats::SinkStats;
pub use stream::{PcmSink, StreamParams, TickOutcome, TickReport};

#[cfg(all(feature = "alsa", target_os = "linux"))]
pub use pcm::alsa::AlsaPcm;
#[cfg(all(feature = "alsa", target_os = "linux"))]
pub use stream::AlsaSink;

/// Library version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set by build.rs)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Playback device opened when none is configured
pub const DEFAULT_DEVICE: &str = "front";

/// Default sample rate in Hz
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Default channel count
pub const DEFAULT_CHANNELS: u32 = 2;

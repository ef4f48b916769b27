//! Alsasink - periodic memory-mapped ALSA playback sink
//!
//! This library re-exports the period writer, device negotiation, recovery
//! state machine and statistics from `alsasink-core`.

pub use alsasink_core::{config, error, format, pcm, signal, stats, stream};

pub use alsasink_core::{
    Access, ConfigError, FormatDescriptor, PcmDevice, PcmError, PcmSink, PcmState, RecoveryCondition,
    SampleFormat, SinkConfig, SinkError, SinkStats, StreamParams, TickOutcome, TickReport, ToneGenerator,
};
pub use alsasink_core::{BUILD_DATE, DEFAULT_CHANNELS, DEFAULT_DEVICE, DEFAULT_SAMPLE_RATE, VERSION};

#[cfg(all(feature = "alsa", target_os = "linux"))]
pub use alsasink_core::{AlsaPcm, AlsaSink};

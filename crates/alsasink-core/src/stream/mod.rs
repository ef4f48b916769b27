//! Periodic stream writing
//!
//! - [`negotiate`]: pin the device configuration and thresholds
//! - [`recovery`]: per-tick status handling (start, prepare, resume, wait)
//! - [`writer`]: fill one period of the mmap ring
//! - [`sink`]: the session that ties them together

pub mod negotiate;
pub mod recovery;
pub mod sink;
pub mod writer;

pub use negotiate::{negotiate, NegotiationError, NegotiationStage, StreamParams, StreamRequest};
pub use recovery::{Readiness, Recovery, RecoveryPolicy, RecoveryState, WaitPolicy};
pub use sink::{PcmSink, TickOutcome, TickReport};
pub use writer::{write_period, AlignmentError, PeriodOutcome, PeriodReport, RingRegion};

#[cfg(all(feature = "alsa", target_os = "linux"))]
pub use sink::AlsaSink;

//! Sink statistics
//!
//! Counters for ticks, periods and recovery actions, plus a bounded history
//! of timestamped recovery events for the CLI summary.

pub mod store;

pub use store::{Counters, RecoveryEvent, RecoveryEventKind, SinkStats, TickTiming};

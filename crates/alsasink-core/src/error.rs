//! Error types for the sink
//!
//! Only conditions the sink cannot absorb become errors:
//! - negotiation failures at open time ([`NegotiationError`])
//! - ring layouts the writer refuses to touch ([`AlignmentError`])
//! - failed start, or failed prepare while recovering from underrun/suspend
//! - unexpected device errors and misuse (closed sink, wrong input width)
//!
//! Underruns, suspends that resume, and "not enough room yet" are reported
//! through [`TickOutcome`](crate::stream::sink::TickOutcome), never as errors.

use crate::config::ConfigError;
use crate::pcm::PcmError;
use crate::stream::negotiate::NegotiationError;
use crate::stream::writer::AlignmentError;
use std::fmt;
use thiserror::Error;

/// Condition the recovery state machine was handling when it gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryCondition {
    Underrun,
    Suspend,
}

impl fmt::Display for RecoveryCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryCondition::Underrun => f.write_str("underrun"),
            RecoveryCondition::Suspend => f.write_str("suspend"),
        }
    }
}

/// Fatal sink errors; the host should stop using the sink after any of these
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to open playback device {device}: {source}")]
    Open {
        device: String,
        #[source]
        source: PcmError,
    },

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error("unsupported ring buffer layout: {0}")]
    Alignment(#[from] AlignmentError),

    #[error("input vector has {actual} elements, stream has {expected} channels")]
    InputMismatch { expected: usize, actual: usize },

    #[error("failed to start playback: {0}")]
    Start(#[source] PcmError),

    #[error("can't recover from {condition}, prepare failed: {source}")]
    Recovery {
        condition: RecoveryCondition,
        #[source]
        source: PcmError,
    },

    #[error("device error during {op}: {source}")]
    Device {
        op: &'static str,
        #[source]
        source: PcmError,
    },

    #[error("sink is closed")]
    Closed,
}

impl SinkError {
    pub(crate) fn device(op: &'static str, source: PcmError) -> Self {
        Self::Device { op, source }
    }
}

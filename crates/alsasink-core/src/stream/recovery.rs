//! Stream recovery state machine
//!
//! Run at the start of every period write. It reads the hardware status and
//! the free space in the ring, performs whatever recovery action the status
//! calls for, and answers one question: can a period be written now?
//!
//! ```text
//!            prepare ok                 start / device running
//!  Underrun ───────────► Idle ──────────► Starting ─────────► Running
//!     ▲                   ▲                                     │
//!     │ xrun, short       │ resume failed, prepare ok           │
//!     │ commit            │                                     │
//!     └───────────────────┴──── Suspended ◄─────────────────────┘
//!                                 resume ok ──► Running
//! ```
//!
//! Only a failed prepare, a failed start or an unexpected device error is
//! fatal. Everything else ends in [`Readiness::Retry`], which the writer
//! turns into a no-op tick.

use crate::error::{RecoveryCondition, SinkError};
use crate::pcm::{Frames, PcmDevice, PcmError, PcmState};
use crate::stats::{RecoveryEventKind, SinkStats};
use serde::Serialize;
use std::time::Duration;

/// Named states of the recovery state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecoveryState {
    /// Prepared, nothing (or not enough) queued; needs an explicit start
    Idle,
    /// Start issued, device not yet seen running
    Starting,
    /// Device observed running
    Running,
    /// Underrun detected, recovery pending or in progress
    Underrun,
    /// Device suspended, resume in progress
    Suspended,
}

/// How long to block when the ring has less than a period free
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    Bounded(Duration),
    /// Block until the device has room, however long that takes
    Indefinite,
}

impl WaitPolicy {
    pub fn timeout(self) -> Option<Duration> {
        match self {
            WaitPolicy::Bounded(timeout) => Some(timeout),
            WaitPolicy::Indefinite => None,
        }
    }
}

/// Tunables for recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Sleep between resume attempts that report "try again"
    pub resume_retry_interval: Duration,
    /// Resume attempts reporting "try again" before falling back to prepare
    pub max_resume_attempts: u32,
    pub wait: WaitPolicy,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            resume_retry_interval: Duration::from_secs(1),
            max_resume_attempts: 10,
            wait: WaitPolicy::Bounded(Duration::from_millis(100)),
        }
    }
}

/// Answer to "can a period be written now?"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// At least one period of frames is free
    Ready(Frames),
    /// Nothing to do this tick; try again next tick
    Retry,
}

/// Recovery state for one stream
#[derive(Debug, Clone)]
pub struct Recovery {
    state: RecoveryState,
    needs_start: bool,
    policy: RecoveryPolicy,
    period_size: Frames,
}

impl Recovery {
    /// Create the state machine for a freshly prepared stream
    pub fn new(policy: RecoveryPolicy, period_size: Frames) -> Self {
        Self {
            state: RecoveryState::Idle,
            needs_start: true,
            policy,
            period_size,
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    /// Whether the next shortage of room must be answered with a start
    pub fn needs_start(&self) -> bool {
        self.needs_start
    }

    /// Inspect the device and decide whether a period can be written
    pub fn check<D: PcmDevice + ?Sized>(
        &mut self,
        pcm: &mut D,
        stats: &mut SinkStats,
    ) -> Result<Readiness, SinkError> {
        match pcm.state() {
            PcmState::Xrun => {
                tracing::warn!("Detected xrun");
                self.recover_underrun(pcm, stats)?;
            }
            PcmState::Suspended => {
                tracing::warn!("Detected suspend event");
                self.recover_suspend(pcm, stats)?;
            }
            PcmState::Disconnected => {
                tracing::error!("Playback device {} disconnected", pcm.name());
                return Err(SinkError::device("status", PcmError::Disconnected));
            }
            PcmState::Running => {
                if self.state != RecoveryState::Running {
                    tracing::debug!("Stream running (was {:?})", self.state);
                }
                self.state = RecoveryState::Running;
                self.needs_start = false;
            }
            PcmState::Prepared if self.state == RecoveryState::Underrun => {
                // short commit left frames queued on a stopped stream
                self.issue_start(pcm, stats)?;
            }
            _ => {}
        }

        let avail = match pcm.avail_update() {
            Ok(avail) => avail,
            Err(e) => {
                tracing::warn!("Failed to check availability: {}", e);
                self.recover(pcm, e, "avail_update", stats)?;
                self.needs_start = true;
                return Ok(Readiness::Retry);
            }
        };

        if avail >= self.period_size {
            return Ok(Readiness::Ready(avail));
        }

        if self.needs_start {
            self.issue_start(pcm, stats)?;
        } else if let Err(e) = pcm.wait(self.policy.wait.timeout()) {
            tracing::warn!("PCM wait error: {}", e);
            self.recover(pcm, e, "wait", stats)?;
            self.needs_start = true;
        }
        Ok(Readiness::Retry)
    }

    /// Record a software-detected underrun (short commit, xrun while writing)
    ///
    /// The next [`check`](Self::check) restarts or re-prepares the stream.
    pub fn mark_underrun(&mut self, stats: &mut SinkStats) {
        if self.state != RecoveryState::Underrun {
            stats.record(RecoveryEventKind::Underrun);
        }
        self.needs_start = true;
        self.state = RecoveryState::Underrun;
    }

    /// Record a suspend reported by a ring access
    ///
    /// The next [`check`](Self::check) sees the suspended status and resumes
    /// without counting the suspend a second time.
    pub fn mark_suspended(&mut self, stats: &mut SinkStats) {
        if self.state != RecoveryState::Suspended {
            stats.record(RecoveryEventKind::Suspend);
        }
        self.needs_start = true;
        self.state = RecoveryState::Suspended;
    }

    fn issue_start<D: PcmDevice + ?Sized>(
        &mut self,
        pcm: &mut D,
        stats: &mut SinkStats,
    ) -> Result<(), SinkError> {
        pcm.start().map_err(|e| {
            tracing::error!("Start error: {}", e);
            SinkError::Start(e)
        })?;
        stats.record(RecoveryEventKind::Started);
        self.needs_start = false;
        self.state = RecoveryState::Starting;
        Ok(())
    }

    /// Dispatch a device error to the matching recovery path
    fn recover<D: PcmDevice + ?Sized>(
        &mut self,
        pcm: &mut D,
        err: PcmError,
        op: &'static str,
        stats: &mut SinkStats,
    ) -> Result<(), SinkError> {
        match err {
            PcmError::Xrun => self.recover_underrun(pcm, stats),
            PcmError::Suspended => self.recover_suspend(pcm, stats),
            PcmError::Again => Ok(()),
            other => {
                tracing::error!("Unrecoverable device error during {}: {}", op, other);
                Err(SinkError::device(op, other))
            }
        }
    }

    fn recover_underrun<D: PcmDevice + ?Sized>(
        &mut self,
        pcm: &mut D,
        stats: &mut SinkStats,
    ) -> Result<(), SinkError> {
        if self.state != RecoveryState::Underrun {
            stats.record(RecoveryEventKind::Underrun);
        }
        self.state = RecoveryState::Underrun;
        self.prepare(pcm, RecoveryCondition::Underrun, stats)
    }

    fn recover_suspend<D: PcmDevice + ?Sized>(
        &mut self,
        pcm: &mut D,
        stats: &mut SinkStats,
    ) -> Result<(), SinkError> {
        if self.state != RecoveryState::Suspended {
            stats.record(RecoveryEventKind::Suspend);
        }
        self.state = RecoveryState::Suspended;

        let mut retries = 0u32;
        let resumed = loop {
            match pcm.resume() {
                Err(PcmError::Again) if retries < self.policy.max_resume_attempts => {
                    retries += 1;
                    stats.record(RecoveryEventKind::ResumeRetry);
                    // wait until the suspend flag is released
                    std::thread::sleep(self.policy.resume_retry_interval);
                }
                other => break other,
            }
        };

        match resumed {
            Ok(()) => {
                tracing::info!("Resumed after {} retries", retries);
                stats.record(RecoveryEventKind::Resumed);
                if pcm.state() == PcmState::Running {
                    self.state = RecoveryState::Running;
                    self.needs_start = false;
                } else {
                    self.state = RecoveryState::Idle;
                    self.needs_start = true;
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Resume failed after {} retries ({}), preparing", retries, e);
                self.prepare(pcm, RecoveryCondition::Suspend, stats)
            }
        }
    }

    fn prepare<D: PcmDevice + ?Sized>(
        &mut self,
        pcm: &mut D,
        condition: RecoveryCondition,
        stats: &mut SinkStats,
    ) -> Result<(), SinkError> {
        pcm.prepare().map_err(|source| {
            tracing::error!("Can't recover from {}, prepare failed: {}", condition, source);
            SinkError::Recovery { condition, source }
        })?;
        stats.record(RecoveryEventKind::Prepared);
        self.needs_start = true;
        self.state = RecoveryState::Idle;
        Ok(())
    }
}

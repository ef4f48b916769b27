//! Counter and event history storage
//!
//! Keeps running counters and the most recent recovery events, dropping the
//! oldest event once the history is full.

use crate::stream::sink::{TickOutcome, TickReport};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// Maximum number of recovery events to keep
const MAX_EVENT_HISTORY: usize = 256;

/// Kind of recovery action or anomaly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecoveryEventKind {
    /// Hardware xrun or short commit
    Underrun,
    /// Device reported suspended
    Suspend,
    /// Resume answered "try again"
    ResumeRetry,
    /// Resume succeeded
    Resumed,
    /// Stream re-prepared after underrun or failed resume
    Prepared,
    /// Explicit start issued
    Started,
}

/// A single recovery event
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryEvent {
    /// When the event was recorded
    pub timestamp: DateTime<Utc>,
    /// What happened
    pub kind: RecoveryEventKind,
}

/// Running counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Counters {
    /// Calls to `process`
    pub ticks: u64,
    /// Full periods committed
    pub periods_written: u64,
    /// Frames committed, including partial periods
    pub frames_written: u64,
    /// Ticks that wrote nothing because the device had no room
    pub deferred_ticks: u64,
    /// Underruns detected, by hardware status or short commit
    pub underruns: u64,
    /// Suspend events handled
    pub suspends: u64,
    /// Resume attempts that answered "try again"
    pub resume_retries: u64,
    /// Successful resumes
    pub resumes: u64,
    /// Prepares issued by recovery
    pub prepares: u64,
    /// Explicit starts issued
    pub starts: u64,
}

/// Wall time spent inside `process`, in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TickTiming {
    pub last_us: f64,
    pub min_us: f64,
    pub max_us: f64,
    pub avg_us: f64,
}

impl Default for TickTiming {
    fn default() -> Self {
        Self {
            last_us: 0.0,
            min_us: f64::MAX,
            max_us: 0.0,
            avg_us: 0.0,
        }
    }
}

/// Statistics for one sink
#[derive(Debug, Clone, Serialize)]
pub struct SinkStats {
    /// When the sink was opened
    opened_at: DateTime<Utc>,
    counters: Counters,
    timing: TickTiming,
    /// Most recent recovery events, oldest first
    events: VecDeque<RecoveryEvent>,
    #[serde(skip)]
    max_events: usize,
}

impl SinkStats {
    /// Create an empty statistics store
    pub fn new() -> Self {
        Self::with_capacity(MAX_EVENT_HISTORY)
    }

    /// Create a store keeping at most `max_events` recovery events
    pub fn with_capacity(max_events: usize) -> Self {
        Self {
            opened_at: Utc::now(),
            counters: Counters::default(),
            timing: TickTiming::default(),
            events: VecDeque::with_capacity(max_events.min(MAX_EVENT_HISTORY)),
            max_events,
        }
    }

    /// Record a recovery event and bump its counter
    pub fn record(&mut self, kind: RecoveryEventKind) {
        match kind {
            RecoveryEventKind::Underrun => self.counters.underruns += 1,
            RecoveryEventKind::Suspend => self.counters.suspends += 1,
            RecoveryEventKind::ResumeRetry => self.counters.resume_retries += 1,
            RecoveryEventKind::Resumed => self.counters.resumes += 1,
            RecoveryEventKind::Prepared => self.counters.prepares += 1,
            RecoveryEventKind::Started => self.counters.starts += 1,
        }

        if self.max_events == 0 {
            return;
        }
        if self.events.len() >= self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(RecoveryEvent {
            timestamp: Utc::now(),
            kind,
        });
    }

    /// Record the result of one `process` call
    pub fn record_tick(&mut self, report: &TickReport) {
        self.counters.ticks += 1;
        self.counters.periods_written += report.periods_written as u64;
        self.counters.frames_written += report.frames_written as u64;
        if report.outcome == TickOutcome::Deferred && report.frames_written == 0 {
            self.counters.deferred_ticks += 1;
        }

        let us = report.elapsed.as_secs_f64() * 1_000_000.0;
        let n = self.counters.ticks as f64;
        self.timing.last_us = us;
        self.timing.min_us = self.timing.min_us.min(us);
        self.timing.max_us = self.timing.max_us.max(us);
        self.timing.avg_us += (us - self.timing.avg_us) / n;
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn timing(&self) -> &TickTiming {
        &self.timing
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Recovery events, oldest first
    pub fn events(&self) -> impl Iterator<Item = &RecoveryEvent> {
        self.events.iter()
    }

    pub fn last_event(&self) -> Option<&RecoveryEvent> {
        self.events.back()
    }

    /// Events recorded at or after `since`
    pub fn events_since(&self, since: DateTime<Utc>) -> Vec<&RecoveryEvent> {
        self.events.iter().filter(|e| e.timestamp >= since).collect()
    }
}

impl Default for SinkStats {
    fn default() -> Self {
        Self::new()
    }
}

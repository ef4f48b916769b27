//! Playback sink session
//!
//! A [`PcmSink`] owns one negotiated device stream. The host calls
//! [`process`](PcmSink::process) once per pipeline tick with one value per
//! channel; the sink holds that vector across whole periods until the ring
//! buffer is full or the device asks it to back off.

use crate::config::SinkConfig;
use crate::error::SinkError;
use crate::format::{encode, EncodedSample};
use crate::pcm::{Frames, PcmDevice};
use crate::stats::SinkStats;
use crate::stream::negotiate::{negotiate, StreamParams};
use crate::stream::recovery::{Recovery, RecoveryState};
use crate::stream::writer::{self, PeriodOutcome, PeriodReport};
use serde::Serialize;
use std::time::{Duration, Instant};

#[cfg(all(feature = "alsa", target_os = "linux"))]
use crate::pcm::alsa::AlsaPcm;

/// Sink backed by a real ALSA device
#[cfg(all(feature = "alsa", target_os = "linux"))]
pub type AlsaSink = PcmSink<AlsaPcm>;

/// How a tick ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TickOutcome {
    /// Every period of the buffer was written
    Complete,
    /// The device had no room for (some of) the periods; retry next tick
    Deferred,
    /// An underrun interrupted the tick; recovery runs next tick
    Underrun,
}

/// Result of one [`PcmSink::process`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub outcome: TickOutcome,
    /// Full periods committed this tick
    pub periods_written: usize,
    /// Frames committed this tick, including a partial period
    pub frames_written: Frames,
    /// Wall time spent in the tick
    pub elapsed: Duration,
}

/// One open playback stream
///
/// Generic over the device so tests and the CLI's simulate mode can drive
/// the same code path as real hardware.
#[derive(Debug)]
pub struct PcmSink<D: PcmDevice> {
    device: Option<D>,
    params: StreamParams,
    recovery: Recovery,
    /// Current input vector, encoded once per tick
    scratch: Vec<EncodedSample>,
    stats: SinkStats,
}

#[cfg(all(feature = "alsa", target_os = "linux"))]
impl PcmSink<AlsaPcm> {
    /// Open and negotiate the ALSA device named in `config`
    pub fn open(config: &SinkConfig) -> Result<Self, SinkError> {
        config.validate()?;
        tracing::info!("Opening playback device {}", config.device);
        let device = AlsaPcm::open(&config.device).map_err(|source| {
            tracing::error!("Playback open error for {}: {}", config.device, source);
            SinkError::Open {
                device: config.device.clone(),
                source,
            }
        })?;
        Self::with_device(device, config)
    }
}

impl<D: PcmDevice> PcmSink<D> {
    /// Negotiate `config` on an already opened device
    ///
    /// # Arguments
    /// * `device` - Freshly opened device; the sink takes ownership
    /// * `config` - Stream and recovery settings
    pub fn with_device(mut device: D, config: &SinkConfig) -> Result<Self, SinkError> {
        config.validate()?;
        let params = negotiate(&mut device, &config.stream_request())?;
        let recovery = Recovery::new(config.recovery_policy(), params.period_size);
        let scratch = vec![EncodedSample::default(); params.channels as usize];

        Ok(Self {
            device: Some(device),
            params,
            recovery,
            scratch,
            stats: SinkStats::new(),
        })
    }

    /// Check that the upstream vector width matches the channel count
    ///
    /// Called once at pipeline setup; `process` trusts the width afterwards.
    pub fn bind_input(&self, len: usize) -> Result<(), SinkError> {
        if self.device.is_none() {
            return Err(SinkError::Closed);
        }
        let expected = self.params.channels as usize;
        if len != expected {
            tracing::error!("Input has {} elements, stream has {} channels", len, expected);
            return Err(SinkError::InputMismatch {
                expected,
                actual: len,
            });
        }
        Ok(())
    }

    /// Write the input vector into every period the device has room for
    ///
    /// Returns after `periods_per_buffer` periods, or earlier when the device
    /// defers or underruns. Only unrecoverable conditions are errors.
    pub fn process(&mut self, input: &[f64]) -> Result<TickReport, SinkError> {
        let started = Instant::now();
        let device = self.device.as_mut().ok_or(SinkError::Closed)?;
        debug_assert_eq!(input.len(), self.scratch.len());

        for (slot, &value) in self.scratch.iter_mut().zip(input) {
            *slot = encode(value, &self.params.format);
        }

        let mut outcome = TickOutcome::Complete;
        let mut periods_written = 0;
        let mut frames_written = 0;
        for _ in 0..self.params.periods_per_buffer() {
            let period = writer::write_period(
                device,
                &self.params,
                &self.scratch,
                &mut self.recovery,
                &mut self.stats,
            )?;
            frames_written += period.frames;
            match period.outcome {
                PeriodOutcome::Written => periods_written += 1,
                PeriodOutcome::Deferred => {
                    outcome = TickOutcome::Deferred;
                    break;
                }
                PeriodOutcome::Underrun => {
                    outcome = TickOutcome::Underrun;
                    break;
                }
            }
        }

        let report = TickReport {
            outcome,
            periods_written,
            frames_written,
            elapsed: started.elapsed(),
        };
        self.stats.record_tick(&report);
        tracing::debug!(
            "Tick {:?}: {} periods, {} frames in {:?}",
            report.outcome,
            report.periods_written,
            report.frames_written,
            report.elapsed
        );
        Ok(report)
    }

    /// Write a single period of `input`
    pub fn write_period(&mut self, input: &[f64]) -> Result<PeriodReport, SinkError> {
        let device = self.device.as_mut().ok_or(SinkError::Closed)?;
        for (slot, &value) in self.scratch.iter_mut().zip(input) {
            *slot = encode(value, &self.params.format);
        }
        writer::write_period(
            device,
            &self.params,
            &self.scratch,
            &mut self.recovery,
            &mut self.stats,
        )
    }

    /// Release the device; later calls are no-ops
    pub fn close(&mut self) {
        if let Some(device) = self.device.take() {
            tracing::info!(
                "Closing {} after {} ticks",
                device.name(),
                self.stats.counters().ticks
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.device.is_none()
    }

    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    pub fn recovery_state(&self) -> RecoveryState {
        self.recovery.state()
    }

    pub fn needs_start(&self) -> bool {
        self.recovery.needs_start()
    }

    pub fn stats(&self) -> &SinkStats {
        &self.stats
    }

    pub fn device(&self) -> Option<&D> {
        self.device.as_ref()
    }

    pub fn device_mut(&mut self) -> Option<&mut D> {
        self.device.as_mut()
    }
}

impl<D: PcmDevice> Drop for PcmSink<D> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::format::SampleFormat;
    use crate::pcm::sim::{SimCapabilities, SimOp, SimulatedPcm};
    use crate::pcm::PcmState;
    use std::sync::atomic::Ordering;

    fn sink() -> PcmSink<SimulatedPcm> {
        let config = SinkConfig {
            resume_retry_ms: 0,
            ..Default::default()
        };
        PcmSink::with_device(SimulatedPcm::new("front"), &config).unwrap()
    }

    #[test]
    fn test_first_tick_fills_buffer() {
        let mut sink = sink();
        let report = sink.process(&[0.5, -0.5]).unwrap();
        assert_eq!(report.outcome, TickOutcome::Complete);
        assert_eq!(report.periods_written, 4);
        assert_eq!(report.frames_written, sink.params().buffer_size);

        let pcm = sink.device().unwrap();
        assert_eq!(pcm.state(), PcmState::Running);
        assert_eq!(pcm.sample_bytes(0, 1763), &[0x00, 0x40]);
        assert_eq!(pcm.sample_bytes(1, 1763), &[0x00, 0xC0]);
    }

    #[test]
    fn test_full_ring_defers() {
        let mut sink = sink();
        sink.process(&[0.0, 0.0]).unwrap();
        sink.device_mut().unwrap().set_drain_on_wait(false);

        let report = sink.process(&[0.0, 0.0]).unwrap();
        assert_eq!(report.outcome, TickOutcome::Deferred);
        assert_eq!(report.frames_written, 0);
        assert_eq!(sink.stats().counters().deferred_ticks, 1);
        assert_eq!(sink.recovery_state(), RecoveryState::Running);
    }

    #[test]
    fn test_steady_state_writes_what_was_played() {
        let mut sink = sink();
        sink.process(&[0.1, 0.1]).unwrap();
        // wait plays one period, the next tick refills it
        sink.process(&[0.2, 0.2]).unwrap();
        let report = sink.process(&[0.3, 0.3]).unwrap();
        assert_eq!(report.periods_written, 1);
        assert_eq!(report.outcome, TickOutcome::Deferred);
    }

    #[test]
    fn test_bind_input_checks_width() {
        let sink = sink();
        assert!(sink.bind_input(2).is_ok());
        assert!(matches!(
            sink.bind_input(3),
            Err(SinkError::InputMismatch {
                expected: 2,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_underrun_then_restart() {
        let mut sink = sink();
        sink.device_mut().unwrap().truncate_next_commit(100);
        let report = sink.process(&[0.5, 0.5]).unwrap();
        assert_eq!(report.outcome, TickOutcome::Underrun);
        assert_eq!(report.frames_written, 100);
        assert!(sink.needs_start());

        sink.device_mut().unwrap().clear_calls();
        let report = sink.process(&[0.5, 0.5]).unwrap();
        assert!(report.frames_written > 0);
        // the start comes before anything else touches the ring
        let calls = sink.device().unwrap().calls();
        assert_eq!(calls.first(), Some(&SimOp::Start));
        assert_eq!(sink.stats().counters().underruns, 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut sink = sink();
        sink.close();
        sink.close();
        assert!(sink.is_closed());
        assert!(matches!(sink.process(&[0.0, 0.0]), Err(SinkError::Closed)));
        assert!(matches!(sink.bind_input(2), Err(SinkError::Closed)));
    }

    #[test]
    fn test_device_released_exactly_once() {
        let mut sink = sink();
        let released = sink.device().unwrap().release_counter();
        sink.process(&[0.0, 0.0]).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 0);

        sink.close();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        sink.close();
        drop(sink);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases_open_device() {
        let sink = sink();
        let released = sink.device().unwrap().release_counter();
        drop(sink);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_negotiation_releases_device() {
        let caps = SimCapabilities {
            formats: vec![SampleFormat::S32Le],
            ..Default::default()
        };
        let pcm = SimulatedPcm::with_capabilities("front", caps);
        let released = pcm.release_counter();
        assert!(PcmSink::with_device(pcm, &SinkConfig::default()).is_err());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_config_never_touches_device() {
        let config = SinkConfig {
            channels: 0,
            ..Default::default()
        };
        let err = PcmSink::with_device(SimulatedPcm::new("front"), &config).unwrap_err();
        assert!(matches!(err, SinkError::Config(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_single_period_write() {
        let mut sink = sink();
        let report = sink.write_period(&[1.0, -1.0]).unwrap();
        assert_eq!(report.outcome, PeriodOutcome::Written);
        assert_eq!(report.frames, 441);
        assert_eq!(sink.device().unwrap().sample_bytes(0, 0), &[0xFF, 0x7F]);
    }
}

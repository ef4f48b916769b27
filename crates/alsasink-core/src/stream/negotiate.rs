//! Hardware and software parameter negotiation
//!
//! Pins the stream configuration against what the device can actually do, in
//! a fixed order: access, format, channels, rate, buffer time, period time,
//! then an atomic commit. The first stage the device rejects aborts the
//! negotiation. Once the hardware side is committed the software thresholds
//! are installed:
//! - start threshold: as many whole periods as fit in the buffer
//! - avail-min: one period (one buffer with period events enabled)
//! - stop threshold: the ring boundary, so an underrun never stops the
//!   stream by itself and is left to the recovery state machine

use crate::format::{Access, FormatDescriptor, SampleFormat};
use crate::pcm::{Frames, PcmDevice, PcmError, SwParams};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Negotiation step that a device rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NegotiationStage {
    /// Loading the configuration space ("no configurations available")
    Any,
    Access,
    Format,
    Channels,
    Rate,
    BufferTime,
    BufferSize,
    PeriodTime,
    PeriodSize,
}

impl fmt::Display for NegotiationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationStage::Any => "configuration space",
            NegotiationStage::Access => "access type",
            NegotiationStage::Format => "sample format",
            NegotiationStage::Channels => "channel count",
            NegotiationStage::Rate => "rate",
            NegotiationStage::BufferTime => "buffer time",
            NegotiationStage::BufferSize => "buffer size",
            NegotiationStage::PeriodTime => "period time",
            NegotiationStage::PeriodSize => "period size",
        };
        f.write_str(name)
    }
}

/// Errors that abort opening a stream
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("{stage} not available for playback: {source}")]
    Unsupported {
        stage: NegotiationStage,
        #[source]
        source: PcmError,
    },

    #[error("unable to set hw params for playback: {0}")]
    Commit(#[source] PcmError),

    #[error("unable to set sw params for playback: {0}")]
    SoftwareParams(#[source] PcmError),

    #[error("device granted unusable geometry: buffer {buffer_size} frames, period {period_size} frames")]
    InvalidGeometry {
        buffer_size: Frames,
        period_size: Frames,
    },
}

/// What the caller asks the device for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub access: Access,
    pub format: SampleFormat,
    pub channels: u32,
    pub rate: u32,
    /// Ring length in µs; `None` lets the hardware choose
    pub buffer_time_us: Option<u32>,
    /// Period length in µs; `None` lets the hardware choose
    pub period_time_us: Option<u32>,
    /// Wake up at every period boundary instead of relying on avail-min
    pub period_event: bool,
}

impl Default for StreamRequest {
    fn default() -> Self {
        Self {
            access: Access::default(),
            format: SampleFormat::default(),
            channels: crate::DEFAULT_CHANNELS,
            rate: crate::DEFAULT_SAMPLE_RATE,
            buffer_time_us: None,
            period_time_us: None,
            period_event: false,
        }
    }
}

/// Stream configuration as granted by the device
///
/// Immutable once negotiation has completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamParams {
    pub access: Access,
    pub format: FormatDescriptor,
    pub channels: u32,
    /// Rate the caller asked for
    pub requested_rate: u32,
    /// Rate the device granted; authoritative
    pub rate: u32,
    /// Granted ring length in µs, when one was requested
    pub buffer_time_us: Option<u32>,
    /// Granted period length in µs, when one was requested
    pub period_time_us: Option<u32>,
    pub buffer_size: Frames,
    pub period_size: Frames,
    pub start_threshold: Frames,
    pub avail_min: Frames,
    pub stop_threshold: Frames,
    pub period_event: bool,
}

impl StreamParams {
    /// Period writes needed to fill one buffer
    pub fn periods_per_buffer(&self) -> usize {
        self.buffer_size / self.period_size
    }

    /// Bytes occupied by one frame of all channels
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * self.format.physical_bytes()
    }
}

impl fmt::Display for StreamParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}ch {}Hz, buffer {} frames, period {} frames, start at {}, avail-min {}",
            self.access,
            self.format.format(),
            self.channels,
            self.rate,
            self.buffer_size,
            self.period_size,
            self.start_threshold,
            self.avail_min
        )
    }
}

fn unsupported(stage: NegotiationStage) -> impl FnOnce(PcmError) -> NegotiationError {
    move |source| {
        tracing::error!("{} not available for playback: {}", stage, source);
        NegotiationError::Unsupported { stage, source }
    }
}

/// Negotiate `request` with a freshly opened device
///
/// On success the device is prepared with hardware and software parameters
/// installed, and the returned [`StreamParams`] describe what was granted.
pub fn negotiate<D: PcmDevice + ?Sized>(
    pcm: &mut D,
    request: &StreamRequest,
) -> Result<StreamParams, NegotiationError> {
    pcm.hw_params_any()
        .map_err(unsupported(NegotiationStage::Any))?;
    pcm.set_access(request.access)
        .map_err(unsupported(NegotiationStage::Access))?;
    pcm.set_format(request.format)
        .map_err(unsupported(NegotiationStage::Format))?;
    pcm.set_channels(request.channels)
        .map_err(unsupported(NegotiationStage::Channels))?;

    let rate = pcm
        .set_rate_near(request.rate)
        .map_err(unsupported(NegotiationStage::Rate))?;
    if rate != request.rate {
        tracing::warn!(
            "Rate doesn't match (requested {} Hz, got {} Hz)",
            request.rate,
            rate
        );
    }

    let buffer_time_us = match request.buffer_time_us {
        Some(time) => {
            let granted = pcm
                .set_buffer_time_near(time)
                .map_err(unsupported(NegotiationStage::BufferTime))?;
            let size = pcm
                .buffer_size()
                .map_err(unsupported(NegotiationStage::BufferSize))?;
            tracing::trace!("Buffer size set to {} frames ({} us)", size, granted);
            Some(granted)
        }
        None => None,
    };

    let period_time_us = match request.period_time_us {
        Some(time) => {
            let granted = pcm
                .set_period_time_near(time)
                .map_err(unsupported(NegotiationStage::PeriodTime))?;
            let size = pcm
                .period_size()
                .map_err(unsupported(NegotiationStage::PeriodSize))?;
            tracing::trace!("Period size set to {} frames ({} us)", size, granted);
            Some(granted)
        }
        None => None,
    };

    pcm.commit_hw_params().map_err(|e| {
        tracing::error!("Unable to set hw params for playback: {}", e);
        NegotiationError::Commit(e)
    })?;

    // the committed configuration is authoritative
    let buffer_size = pcm.buffer_size().map_err(NegotiationError::Commit)?;
    let period_size = pcm.period_size().map_err(NegotiationError::Commit)?;
    if period_size == 0 || buffer_size < period_size {
        return Err(NegotiationError::InvalidGeometry {
            buffer_size,
            period_size,
        });
    }
    if buffer_size % period_size != 0 {
        tracing::warn!(
            "Buffer size {} is not a multiple of period size {}; the last {} frames stay unused",
            buffer_size,
            period_size,
            buffer_size % period_size
        );
    }

    let boundary = pcm.boundary().map_err(NegotiationError::SoftwareParams)?;
    let sw = SwParams {
        start_threshold: (buffer_size / period_size) * period_size,
        avail_min: if request.period_event {
            buffer_size
        } else {
            period_size
        },
        stop_threshold: boundary,
        period_event: request.period_event,
    };
    pcm.commit_sw_params(&sw).map_err(|e| {
        tracing::error!("Unable to set sw params for playback: {}", e);
        NegotiationError::SoftwareParams(e)
    })?;

    let params = StreamParams {
        access: request.access,
        format: FormatDescriptor::new(request.format),
        channels: request.channels,
        requested_rate: request.rate,
        rate,
        buffer_time_us,
        period_time_us,
        buffer_size,
        period_size,
        start_threshold: sw.start_threshold,
        avail_min: sw.avail_min,
        stop_threshold: sw.stop_threshold,
        period_event: sw.period_event,
    };
    tracing::info!("Negotiated {} on {}", params, pcm.name());
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcm::sim::{SimCapabilities, SimOp, SimulatedPcm};

    fn request() -> StreamRequest {
        StreamRequest::default()
    }

    #[test]
    fn test_defaults_negotiate() {
        let mut pcm = SimulatedPcm::new("front");
        let params = negotiate(&mut pcm, &request()).unwrap();
        assert_eq!(params.channels, 2);
        assert_eq!(params.rate, 44100);
        assert_eq!(params.period_size, 441);
        assert_eq!(params.buffer_size, 1764);
        assert_eq!(params.periods_per_buffer(), 4);
        assert_eq!(params.frame_bytes(), 4);
        assert_eq!(params.buffer_time_us, None);
    }

    #[test]
    fn test_stage_order() {
        let mut pcm = SimulatedPcm::new("front");
        let req = StreamRequest {
            buffer_time_us: Some(100_000),
            period_time_us: Some(25_000),
            ..request()
        };
        negotiate(&mut pcm, &req).unwrap();
        assert_eq!(
            pcm.calls(),
            &[
                SimOp::HwParamsAny,
                SimOp::SetAccess,
                SimOp::SetFormat,
                SimOp::SetChannels,
                SimOp::SetRate,
                SimOp::SetBufferTime,
                SimOp::SetPeriodTime,
                SimOp::CommitHw,
                SimOp::CommitSw,
            ]
        );
    }

    #[test]
    fn test_requested_times_read_back() {
        let mut pcm = SimulatedPcm::new("front");
        let req = StreamRequest {
            rate: 48000,
            buffer_time_us: Some(100_000),
            period_time_us: Some(25_000),
            ..request()
        };
        let params = negotiate(&mut pcm, &req).unwrap();
        assert_eq!(params.buffer_size, 4800);
        assert_eq!(params.period_size, 1200);
        assert_eq!(params.buffer_time_us, Some(100_000));
        assert_eq!(params.period_time_us, Some(25_000));
    }

    #[test]
    fn test_rate_mismatch_is_not_an_error() {
        let mut pcm = SimulatedPcm::new("front");
        let req = StreamRequest {
            rate: 44000,
            ..request()
        };
        let params = negotiate(&mut pcm, &req).unwrap();
        assert_eq!(params.requested_rate, 44000);
        assert_eq!(params.rate, 44100);
    }

    #[test]
    fn test_unsupported_format_aborts() {
        let caps = SimCapabilities {
            formats: vec![SampleFormat::S16Le],
            ..Default::default()
        };
        let mut pcm = SimulatedPcm::with_capabilities("front", caps);
        let req = StreamRequest {
            format: SampleFormat::S24Be,
            ..request()
        };
        let err = negotiate(&mut pcm, &req).unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::Unsupported {
                stage: NegotiationStage::Format,
                ..
            }
        ));
        // nothing after the failing stage was attempted
        assert_eq!(pcm.call_count(SimOp::SetChannels), 0);
        assert_eq!(pcm.call_count(SimOp::CommitHw), 0);
    }

    #[test]
    fn test_unsupported_access_and_channels() {
        let caps = SimCapabilities {
            access: vec![Access::MmapNoninterleaved],
            max_channels: 2,
            ..Default::default()
        };
        let mut pcm = SimulatedPcm::with_capabilities("front", caps.clone());
        let err = negotiate(&mut pcm, &request()).unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::Unsupported {
                stage: NegotiationStage::Access,
                ..
            }
        ));

        let mut pcm = SimulatedPcm::with_capabilities("front", caps);
        let req = StreamRequest {
            access: Access::MmapNoninterleaved,
            channels: 6,
            ..request()
        };
        let err = negotiate(&mut pcm, &req).unwrap_err();
        assert!(err.to_string().starts_with("channel count not available"));
    }

    #[test]
    fn test_commit_failure_is_fatal() {
        let mut pcm = SimulatedPcm::new("front");
        pcm.fail_next(SimOp::CommitHw, PcmError::backend(-16, "Device or resource busy"));
        let err = negotiate(&mut pcm, &request()).unwrap_err();
        assert!(matches!(err, NegotiationError::Commit(_)));
        assert_eq!(pcm.call_count(SimOp::CommitSw), 0);
    }

    #[test]
    fn test_software_thresholds() {
        let mut pcm = SimulatedPcm::new("front");
        let params = negotiate(&mut pcm, &request()).unwrap();
        let sw = pcm.sw_params().unwrap();
        assert_eq!(sw.start_threshold, 1764);
        assert_eq!(sw.avail_min, 441);
        assert!(!sw.period_event);
        // never auto-stop: stop threshold is the boundary, far beyond the buffer
        assert_eq!(sw.stop_threshold, pcm.boundary().unwrap());
        assert!(sw.stop_threshold > params.buffer_size * 1000);
    }

    #[test]
    fn test_start_threshold_uses_whole_periods() {
        let caps = SimCapabilities {
            default_period_size: 400,
            default_buffer_size: 1000,
            ..Default::default()
        };
        let mut pcm = SimulatedPcm::with_capabilities("front", caps);
        let params = negotiate(&mut pcm, &request()).unwrap();
        assert_eq!(params.periods_per_buffer(), 2);
        assert_eq!(params.start_threshold, 800);
    }

    #[test]
    fn test_period_event_uses_buffer_as_avail_min() {
        let mut pcm = SimulatedPcm::new("front");
        let req = StreamRequest {
            period_event: true,
            ..request()
        };
        let params = negotiate(&mut pcm, &req).unwrap();
        assert_eq!(params.avail_min, params.buffer_size);
        assert!(pcm.sw_params().unwrap().period_event);
    }

    #[test]
    fn test_sw_params_failure() {
        let mut pcm = SimulatedPcm::new("front");
        pcm.fail_next(SimOp::CommitSw, PcmError::backend(-22, "Invalid argument"));
        let err = negotiate(&mut pcm, &request()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "unable to set sw params for playback: Invalid argument (errno -22)"
        );
    }
}

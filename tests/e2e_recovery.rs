//! E2E tests for underrun and suspend recovery
//!
//! Drives a sink through scripted device faults and checks that transient
//! conditions are absorbed while unrecoverable ones stop the stream.

use alsasink::pcm::sim::{SimOp, SimulatedPcm};
use alsasink::pcm::ChannelArea;
use alsasink::stream::{AlignmentError, RecoveryState};
use alsasink::{
    PcmDevice, PcmError, PcmSink, PcmState, RecoveryCondition, SinkConfig, SinkError, TickOutcome,
};
use std::time::{Duration, Instant};

fn open_with(config: SinkConfig) -> PcmSink<SimulatedPcm> {
    PcmSink::with_device(SimulatedPcm::new("front"), &config).unwrap()
}

fn open() -> PcmSink<SimulatedPcm> {
    open_with(SinkConfig {
        resume_retry_ms: 0,
        ..Default::default()
    })
}

fn running() -> PcmSink<SimulatedPcm> {
    let mut sink = open();
    sink.process(&[0.0, 0.0]).unwrap();
    assert_eq!(sink.device().unwrap().state(), PcmState::Running);
    sink
}

#[test]
fn test_partial_commit_restarts_before_next_commit() {
    let mut sink = open();
    sink.device_mut().unwrap().truncate_next_commit(10);

    let report = sink.process(&[0.5, 0.5]).unwrap();
    assert_eq!(report.outcome, TickOutcome::Underrun);
    assert!(sink.needs_start());
    assert_eq!(sink.recovery_state(), RecoveryState::Underrun);

    sink.device_mut().unwrap().clear_calls();
    sink.process(&[0.5, 0.5]).unwrap();
    let calls = sink.device().unwrap().calls();
    let start = calls.iter().position(|&op| op == SimOp::Start);
    let commit = calls.iter().position(|&op| op == SimOp::MmapCommit);
    assert!(start.is_some());
    assert!(start < commit);
    assert!(!sink.needs_start());
}

#[test]
fn test_hardware_xrun_is_absorbed() {
    let mut sink = running();
    // the device plays past everything queued
    sink.device_mut().unwrap().play(10_000);
    assert_eq!(sink.device().unwrap().state(), PcmState::Xrun);

    let report = sink.process(&[0.1, 0.1]).unwrap();
    assert_eq!(report.outcome, TickOutcome::Complete);
    assert_eq!(report.frames_written, sink.params().buffer_size);

    let counters = sink.stats().counters();
    assert_eq!(counters.underruns, 1);
    assert_eq!(counters.prepares, 1);
    assert_eq!(sink.device().unwrap().state(), PcmState::Running);
}

#[test]
fn test_resume_retries_sleep_then_prepare() {
    let mut sink = open_with(SinkConfig {
        resume_retry_ms: 20,
        max_resume_attempts: 10,
        ..Default::default()
    });
    sink.process(&[0.0, 0.0]).unwrap();

    let pcm = sink.device_mut().unwrap();
    pcm.suspend();
    for _ in 0..3 {
        pcm.fail_next(SimOp::Resume, PcmError::Again);
    }
    pcm.fail_next(SimOp::Resume, PcmError::backend(-38, "Function not implemented"));

    let started = Instant::now();
    let report = sink.process(&[0.0, 0.0]).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(60));
    assert_eq!(report.outcome, TickOutcome::Complete);

    let counters = sink.stats().counters();
    assert_eq!(counters.suspends, 1);
    assert_eq!(counters.resume_retries, 3);
    assert_eq!(counters.prepares, 1);
    assert_eq!(sink.device().unwrap().call_count(SimOp::Resume), 4);
}

#[test]
fn test_successful_resume_keeps_running() {
    let mut sink = running();
    sink.device_mut().unwrap().suspend();

    sink.process(&[0.0, 0.0]).unwrap();
    assert_eq!(sink.stats().counters().resumes, 1);
    assert_eq!(sink.stats().counters().prepares, 0);
    assert_eq!(sink.recovery_state(), RecoveryState::Running);
}

#[test]
fn test_failed_prepare_after_suspend_is_fatal() {
    let mut sink = running();
    let pcm = sink.device_mut().unwrap();
    pcm.suspend();
    pcm.fail_next(SimOp::Resume, PcmError::backend(-5, "Input/output error"));
    pcm.fail_next(SimOp::Prepare, PcmError::backend(-5, "Input/output error"));

    let err = sink.process(&[0.0, 0.0]).unwrap_err();
    assert!(matches!(
        err,
        SinkError::Recovery {
            condition: RecoveryCondition::Suspend,
            ..
        }
    ));
}

#[test]
fn test_misaligned_stride_is_fatal_without_retry() {
    let mut sink = open();
    sink.device_mut().unwrap().override_areas(vec![
        ChannelArea {
            segment: 0,
            base: 0,
            first: 0,
            step: 20,
        },
        ChannelArea {
            segment: 0,
            base: 0,
            first: 16,
            step: 32,
        },
    ]);

    let err = sink.process(&[0.0, 0.0]).unwrap_err();
    assert!(matches!(
        err,
        SinkError::Alignment(AlignmentError::MisalignedStride { channel: 0, step: 20 })
    ));
    let pcm = sink.device().unwrap();
    assert_eq!(pcm.call_count(SimOp::MmapBegin), 1);
    assert_eq!(pcm.call_count(SimOp::MmapCommit), 0);
    assert_eq!(pcm.total_committed(), 0);
}

#[test]
fn test_disconnect_is_fatal() {
    let mut sink = running();
    sink.device_mut().unwrap().force_state(PcmState::Disconnected);
    let err = sink.process(&[0.0, 0.0]).unwrap_err();
    assert!(matches!(
        err,
        SinkError::Device {
            source: PcmError::Disconnected,
            ..
        }
    ));
}

#[test]
fn test_events_are_timestamped_in_order() {
    let mut sink = running();
    sink.device_mut().unwrap().play(10_000);
    sink.process(&[0.0, 0.0]).unwrap();

    let events: Vec<_> = sink.stats().events().collect();
    assert!(events.len() >= 2);
    assert!(events
        .windows(2)
        .all(|pair| pair[0].timestamp <= pair[1].timestamp));
    assert!(events
        .iter()
        .all(|e| e.timestamp >= sink.stats().opened_at()));
}

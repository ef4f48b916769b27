//! E2E tests for file configuration
//!
//! Tests loading settings from disk, defaults for missing keys, and that the
//! loaded settings reach the negotiated stream.

use alsasink::pcm::sim::{SimCapabilities, SimulatedPcm};
use alsasink::stream::{NegotiationError, NegotiationStage};
use alsasink::{Access, ConfigError, PcmDevice, PcmSink, SampleFormat, SinkConfig, SinkError};
use std::io::Write;

fn write_config(json: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file
}

#[test]
fn test_loaded_config_reaches_stream() {
    let file = write_config(
        r#"{
            "_comment": "bench rig",
            "device": "hw:2,0",
            "access": "MMAP_NONINTERLEAVED",
            "format": "S32_BE",
            "channels": 4,
            "rate": 96000,
            "buffer_time": 50000,
            "period_time": 12500
        }"#,
    );
    let config = SinkConfig::load(file.path()).unwrap();
    assert_eq!(config.unknown_keys().count(), 0);

    let sink = PcmSink::with_device(SimulatedPcm::new(config.device.clone()), &config).unwrap();
    let params = sink.params();
    assert_eq!(params.access, Access::MmapNoninterleaved);
    assert_eq!(params.format.format(), SampleFormat::S32Be);
    assert_eq!(params.channels, 4);
    assert_eq!(params.rate, 96000);
    assert_eq!(params.buffer_size, 4800);
    assert_eq!(params.period_size, 1200);
    assert_eq!(sink.device().unwrap().name(), "hw:2,0");
}

#[test]
fn test_missing_keys_use_defaults() {
    let file = write_config(r#"{"channels": 1}"#);
    let config = SinkConfig::load(file.path()).unwrap();
    assert_eq!(config.channels, 1);
    assert_eq!(config.device, alsasink::DEFAULT_DEVICE);
    assert_eq!(config.rate, alsasink::DEFAULT_SAMPLE_RATE);
    assert_eq!(config.format, SampleFormat::S16Le);
    assert_eq!(config.resume_retry_ms, 1000);
}

#[test]
fn test_unknown_keys_are_kept() {
    let file = write_config(r#"{"latency_ms": 5, "_note": "ignored"}"#);
    let config = SinkConfig::load(file.path()).unwrap();
    assert_eq!(config.unknown_keys().collect::<Vec<_>>(), vec!["latency_ms"]);
    assert_eq!(config.unknown.len(), 2);
}

#[test]
fn test_malformed_file_is_parse_error() {
    let file = write_config(r#"{"channels": "two"}"#);
    assert!(matches!(
        SinkConfig::load(file.path()),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn test_unsupported_format_fails_negotiation() {
    let config = SinkConfig {
        format: SampleFormat::U24PackedBe,
        ..Default::default()
    };
    let caps = SimCapabilities {
        formats: vec![SampleFormat::S16Le, SampleFormat::S32Le],
        ..Default::default()
    };
    let err = PcmSink::with_device(SimulatedPcm::with_capabilities("front", caps), &config)
        .unwrap_err();
    assert!(matches!(
        err,
        SinkError::Negotiation(NegotiationError::Unsupported {
            stage: NegotiationStage::Format,
            ..
        })
    ));
}

#[test]
fn test_save_then_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("alsasink.json");
    let config = SinkConfig {
        device: "plughw:0".to_string(),
        rate: 48000,
        wait_timeout_ms: None,
        ..Default::default()
    };
    config.save(&path).unwrap();

    let loaded = SinkConfig::load(&path).unwrap();
    assert_eq!(loaded, config);
    let sink = PcmSink::with_device(SimulatedPcm::new(loaded.device.clone()), &loaded).unwrap();
    assert_eq!(sink.params().rate, 48000);
}

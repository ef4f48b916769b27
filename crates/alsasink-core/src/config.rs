//! Sink configuration
//!
//! A flat JSON object; every key is optional:
//!
//! ```json
//! {
//!     "device": "front",
//!     "access": "MMAP_INTERLEAVED",
//!     "format": "S16_LE",
//!     "channels": 2,
//!     "rate": 44100,
//!     "buffer_time": 100000,
//!     "period_time": 25000,
//!     "period_event": false,
//!     "resume_retry_ms": 1000,
//!     "max_resume_attempts": 10,
//!     "wait_timeout_ms": 100
//! }
//! ```
//!
//! Times are in microseconds except where the key says otherwise. A
//! `wait_timeout_ms` of `null` blocks indefinitely while waiting for room.
//! Keys starting with `_` are comments; any other unknown key is kept and
//! reported with a warning.

use crate::format::{Access, SampleFormat};
use crate::stream::negotiate::StreamRequest;
use crate::stream::recovery::{RecoveryPolicy, WaitPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{0}")]
    Invalid(String),
}

fn default_device() -> String {
    crate::DEFAULT_DEVICE.to_string()
}

fn default_channels() -> u32 {
    crate::DEFAULT_CHANNELS
}

fn default_rate() -> u32 {
    crate::DEFAULT_SAMPLE_RATE
}

fn default_resume_retry_ms() -> u64 {
    1000
}

fn default_max_resume_attempts() -> u32 {
    10
}

fn default_wait_timeout_ms() -> Option<u64> {
    Some(100)
}

/// Playback sink configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
    /// ALSA device identifier
    #[serde(default = "default_device")]
    pub device: String,
    /// Ring buffer access mode
    #[serde(default)]
    pub access: Access,
    /// Sample encoding
    #[serde(default)]
    pub format: SampleFormat,
    /// Channel count; each input vector has this many elements
    #[serde(default = "default_channels")]
    pub channels: u32,
    /// Requested sample rate in Hz
    #[serde(default = "default_rate")]
    pub rate: u32,
    /// Ring length in µs (unset = hardware chooses)
    #[serde(default)]
    pub buffer_time: Option<u32>,
    /// Period length in µs (unset = hardware chooses)
    #[serde(default)]
    pub period_time: Option<u32>,
    /// Wake up at every period boundary
    #[serde(default)]
    pub period_event: bool,
    /// Sleep between resume attempts, in milliseconds
    #[serde(default = "default_resume_retry_ms")]
    pub resume_retry_ms: u64,
    /// Resume attempts before falling back to prepare
    #[serde(default = "default_max_resume_attempts")]
    pub max_resume_attempts: u32,
    /// Bound on the wait for room, in milliseconds (`None` = indefinite)
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: Option<u64>,
    /// Keys this version does not know about
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            access: Access::default(),
            format: SampleFormat::default(),
            channels: default_channels(),
            rate: default_rate(),
            buffer_time: None,
            period_time: None,
            period_event: false,
            resume_retry_ms: default_resume_retry_ms(),
            max_resume_attempts: default_max_resume_attempts(),
            wait_timeout_ms: default_wait_timeout_ms(),
            unknown: BTreeMap::new(),
        }
    }
}

impl SinkConfig {
    /// Parse a configuration from JSON text
    ///
    /// Unknown keys are reported with a warning, then kept.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        for key in config.unknown_keys() {
            tracing::warn!(key = %key, "Unknown configuration key");
        }
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&contents)?;
        tracing::info!(path = %path.display(), "Loaded config from disk");
        Ok(config)
    }

    /// Load a configuration file, falling back to defaults on any error
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Save config to disk, creating parent directories if needed
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "Config saved to disk");
        Ok(())
    }

    /// Unknown keys, excluding `_` comment keys
    pub fn unknown_keys(&self) -> impl Iterator<Item = &str> {
        self.unknown
            .keys()
            .map(String::as_str)
            .filter(|k| !k.starts_with('_'))
    }

    /// Reject values no device could ever accept
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.is_empty() {
            return Err(ConfigError::Invalid("device name is empty".into()));
        }
        if self.channels == 0 {
            return Err(ConfigError::Invalid("channels must be at least 1".into()));
        }
        if self.rate == 0 {
            return Err(ConfigError::Invalid("rate must be positive".into()));
        }
        if self.buffer_time == Some(0) {
            return Err(ConfigError::Invalid("buffer_time must be positive".into()));
        }
        if self.period_time == Some(0) {
            return Err(ConfigError::Invalid("period_time must be positive".into()));
        }
        if let (Some(buffer), Some(period)) = (self.buffer_time, self.period_time) {
            if period > buffer {
                return Err(ConfigError::Invalid(format!(
                    "period_time {} exceeds buffer_time {}",
                    period, buffer
                )));
            }
        }
        Ok(())
    }

    /// What to ask the device for
    pub fn stream_request(&self) -> StreamRequest {
        StreamRequest {
            access: self.access,
            format: self.format,
            channels: self.channels,
            rate: self.rate,
            buffer_time_us: self.buffer_time,
            period_time_us: self.period_time,
            period_event: self.period_event,
        }
    }

    pub fn recovery_policy(&self) -> RecoveryPolicy {
        RecoveryPolicy {
            resume_retry_interval: Duration::from_millis(self.resume_retry_ms),
            max_resume_attempts: self.max_resume_attempts,
            wait: match self.wait_timeout_ms {
                Some(ms) => WaitPolicy::Bounded(Duration::from_millis(ms)),
                None => WaitPolicy::Indefinite,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SinkConfig::default();
        assert_eq!(config.device, "front");
        assert_eq!(config.access, Access::MmapInterleaved);
        assert_eq!(config.format, SampleFormat::S16Le);
        assert_eq!(config.channels, 2);
        assert_eq!(config.rate, 44100);
        assert_eq!(config.buffer_time, None);
        assert_eq!(config.wait_timeout_ms, Some(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config = SinkConfig::from_json("{}").unwrap();
        assert_eq!(config, SinkConfig::default());
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let config =
            SinkConfig::from_json(r#"{"device": "hw:1,0", "format": "S24_3LE", "channels": 6}"#)
                .unwrap();
        assert_eq!(config.device, "hw:1,0");
        assert_eq!(config.format, SampleFormat::S24PackedLe);
        assert_eq!(config.channels, 6);
        assert_eq!(config.rate, 44100);
        assert_eq!(config.max_resume_attempts, 10);
    }

    #[test]
    fn test_null_wait_timeout_is_indefinite() {
        let config = SinkConfig::from_json(r#"{"wait_timeout_ms": null}"#).unwrap();
        assert_eq!(config.wait_timeout_ms, None);
        assert_eq!(config.recovery_policy().wait, WaitPolicy::Indefinite);
    }

    #[test]
    fn test_unknown_keys_skip_comments() {
        let config =
            SinkConfig::from_json(r#"{"_note": "lab rig", "latency": 5, "rate": 48000}"#).unwrap();
        assert_eq!(config.rate, 48000);
        assert_eq!(config.unknown_keys().collect::<Vec<_>>(), vec!["latency"]);
    }

    #[test]
    fn test_float_format_rejected() {
        let err = SinkConfig::from_json(r#"{"format": "FLOAT_LE"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validate_rejects_zeroes() {
        let cases = [
            SinkConfig {
                channels: 0,
                ..Default::default()
            },
            SinkConfig {
                rate: 0,
                ..Default::default()
            },
            SinkConfig {
                buffer_time: Some(0),
                ..Default::default()
            },
            SinkConfig {
                buffer_time: Some(10_000),
                period_time: Some(20_000),
                ..Default::default()
            },
        ];
        for config in cases {
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn test_request_and_policy() {
        let config = SinkConfig {
            buffer_time: Some(100_000),
            period_time: Some(25_000),
            resume_retry_ms: 5,
            max_resume_attempts: 3,
            wait_timeout_ms: Some(20),
            ..Default::default()
        };
        let request = config.stream_request();
        assert_eq!(request.buffer_time_us, Some(100_000));
        assert_eq!(request.period_time_us, Some(25_000));
        let policy = config.recovery_policy();
        assert_eq!(policy.resume_retry_interval, Duration::from_millis(5));
        assert_eq!(policy.max_resume_attempts, 3);
        assert_eq!(policy.wait.timeout(), Some(Duration::from_millis(20)));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sink.json");

        let config = SinkConfig {
            device: "hw:0".to_string(),
            format: SampleFormat::U24Be,
            period_time: Some(10_000),
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = SinkConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert!(matches!(SinkConfig::load(&path), Err(ConfigError::Io { .. })));
        assert_eq!(SinkConfig::load_or_default(&path), SinkConfig::default());
    }
}

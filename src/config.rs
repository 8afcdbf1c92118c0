//! Configuration record consumed from an external YAML loader (SPEC_FULL.md §6).
//! Core modules never read the filesystem themselves; only [`Config::load`] does.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::rtsp_url::RtspUrl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_retry_max")]
    pub max: u32,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_retry_factor")]
    pub factor: f64,
}

impl RetryPolicy {
    /// Delay before attempt `n` (0-indexed, n=0 is the first retry after the
    /// initial failed attempt): `min(initial * factor^n, max_delay)`.
    pub fn delay_for_attempt(&self, n: u32) -> Duration {
        let scaled = (self.initial_delay_ms as f64) * self.factor.powi(n as i32);
        let capped = scaled.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max: default_retry_max(),
            initial_delay_ms: default_retry_initial_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
            factor: default_retry_factor(),
        }
    }
}

fn default_retry_max() -> u32 {
    3
}
fn default_retry_initial_delay_ms() -> u64 {
    500
}
fn default_retry_max_delay_ms() -> u64 {
    10_000
}
fn default_retry_factor() -> f64 {
    2.0
}

fn default_output_dir() -> String {
    "./frames".to_string()
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_log_level() -> LogLevel {
    LogLevel::Info
}
fn default_save_jpeg() -> bool {
    false
}
fn default_continuous_decoder() -> bool {
    true
}
fn default_transport() -> Transport {
    Transport::Udp
}
fn default_retry_policy() -> RetryPolicy {
    RetryPolicy::default()
}

/// Raw, directly-deserializable shape of the YAML document. Every field is
/// optional so an empty document is valid; [`Config::load`] fills defaults
/// and validates afterward.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    rtsp_url: Option<String>,
    #[serde(default)]
    output_dir: Option<String>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    log_level: Option<LogLevel>,
    #[serde(default)]
    save_jpeg: Option<bool>,
    #[serde(default)]
    continuous_decoder: Option<bool>,
    #[serde(default)]
    transport: Option<Transport>,
    #[serde(default)]
    retry: Option<RawRetry>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRetry {
    max: Option<u32>,
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    factor: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub rtsp_url: String,
    pub output_dir: String,
    pub timeout: Duration,
    pub log_level: LogLevel,
    pub save_jpeg: bool,
    pub continuous_decoder: bool,
    pub transport: Transport,
    pub retry: RetryPolicy,
}

impl Config {
    /// Loads and validates a config from a YAML file. A missing file is not
    /// an error — defaults apply, but `rtsp_url_override` must then supply
    /// the stream URL (e.g. from a CLI flag).
    pub fn load(path: &Path, rtsp_url_override: Option<&str>) -> Result<Self> {
        let raw: RawConfig = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| Error::ConfigInvalid(format!("cannot read {}: {e}", path.display())))?;
            serde_yaml::from_str(&text)
                .map_err(|e| Error::ConfigInvalid(format!("cannot parse {}: {e}", path.display())))?
        } else {
            RawConfig::default()
        };

        Self::from_raw(raw, rtsp_url_override)
    }

    fn from_raw(raw: RawConfig, rtsp_url_override: Option<&str>) -> Result<Self> {
        let rtsp_url = rtsp_url_override
            .map(str::to_string)
            .or(raw.rtsp_url)
            .ok_or_else(|| Error::ConfigInvalid("rtsp_url is required".to_string()))?;

        // Validate early so a bad URL fails before any I/O (ConfigInvalid, not ProtocolError).
        RtspUrl::parse(&rtsp_url)?;

        let raw_retry = raw.retry.unwrap_or_default();
        let retry = RetryPolicy {
            max: raw_retry.max.unwrap_or_else(default_retry_max),
            initial_delay_ms: raw_retry.initial_delay_ms.unwrap_or_else(default_retry_initial_delay_ms),
            max_delay_ms: raw_retry.max_delay_ms.unwrap_or_else(default_retry_max_delay_ms),
            factor: raw_retry.factor.unwrap_or_else(default_retry_factor),
        };

        Ok(Config {
            rtsp_url,
            output_dir: raw.output_dir.unwrap_or_else(default_output_dir),
            timeout: Duration::from_secs(raw.timeout.unwrap_or_else(default_timeout_secs)),
            log_level: raw.log_level.unwrap_or_else(default_log_level),
            save_jpeg: raw.save_jpeg.unwrap_or_else(default_save_jpeg),
            continuous_decoder: raw.continuous_decoder.unwrap_or_else(default_continuous_decoder),
            transport: raw.transport.unwrap_or_else(default_transport),
            retry,
        })
    }

    /// Builds a `Config` directly from YAML text, skipping the filesystem —
    /// used by tests and by [`Config::load`] internally.
    pub fn from_yaml_str(yaml: &str, rtsp_url_override: Option<&str>) -> Result<Self> {
        let raw: RawConfig =
            serde_yaml::from_str(yaml).map_err(|e| Error::ConfigInvalid(format!("cannot parse config: {e}")))?;
        Self::from_raw(raw, rtsp_url_override)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults_with_url_override() {
        let cfg = Config::from_yaml_str("", Some("rtsp://127.0.0.1/stream")).unwrap();
        assert_eq!(cfg.rtsp_url, "rtsp://127.0.0.1/stream");
        assert_eq!(cfg.output_dir, "./frames");
        assert_eq!(cfg.timeout, Duration::from_secs(10));
        assert!(matches!(cfg.log_level, LogLevel::Info));
        assert!(!cfg.save_jpeg);
        assert!(cfg.continuous_decoder);
        assert!(matches!(cfg.transport, Transport::Udp));
        assert_eq!(cfg.retry.max, 3);
    }

    #[test]
    fn missing_url_is_config_invalid() {
        let err = Config::from_yaml_str("", None).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn parses_full_document() {
        let yaml = r#"
rtsp_url: "rtsp://admin:pw@cam.local/stream"
output_dir: "/tmp/out"
timeout: 5
log_level: debug
save_jpeg: true
continuous_decoder: false
transport: tcp
retry:
  max: 5
  initial_delay_ms: 100
  max_delay_ms: 2000
  factor: 2.0
"#;
        let cfg = Config::from_yaml_str(yaml, None).unwrap();
        assert_eq!(cfg.rtsp_url, "rtsp://admin:pw@cam.local/stream");
        assert_eq!(cfg.output_dir, "/tmp/out");
        assert_eq!(cfg.timeout, Duration::from_secs(5));
        assert!(matches!(cfg.log_level, LogLevel::Debug));
        assert!(cfg.save_jpeg);
        assert!(!cfg.continuous_decoder);
        assert!(matches!(cfg.transport, Transport::Tcp));
        assert_eq!(cfg.retry.max, 5);
        assert_eq!(cfg.retry.initial_delay_ms, 100);
    }

    #[test]
    fn retry_delay_caps_at_max() {
        let retry = RetryPolicy {
            max: 3,
            initial_delay_ms: 100,
            max_delay_ms: 2000,
            factor: 2.0,
        };
        assert_eq!(retry.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(retry.delay_for_attempt(10), Duration::from_millis(2000));
    }
}

//! Configuration management
//!
//! Settings are read once from a TOML file at startup and turned into the
//! constructor arguments of the session types. Every field has a default, so
//! a partial (or missing) file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::capture::CaptureConfig;
use crate::constants::*;
use crate::error::{Error, Result};
use crate::network::outbound::OutboundPolicy;
use crate::network::state::ReconnectPolicy;
use crate::network::transport::{validate_url, TransportConfig};
use crate::session::coordinator::CoordinatorConfig;
use crate::session::pipeline::OverrunPolicy;

/// Complete application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub relay: RelayConfig,
}

/// Capture and playback settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub frame_duration_ms: u32,
    /// Length of the microphone's looping buffer
    pub capture_buffer_seconds: u32,
    pub playback_buffer_seconds: f32,
    /// Input device name; the system default when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_device: Option<String>,
    pub overrun_policy: OverrunPolicy,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_duration_ms: DEFAULT_FRAME_DURATION_MS,
            capture_buffer_seconds: DEFAULT_CAPTURE_BUFFER_SECS,
            playback_buffer_seconds: DEFAULT_PLAYBACK_BUFFER_SECS,
            input_device: None,
            overrun_policy: OverrunPolicy::default(),
        }
    }
}

/// Backend connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub auto_reconnect: bool,
    pub reconnect_interval_secs: f64,
    /// Backoff cap; set equal to the interval for a fixed retry delay
    pub max_reconnect_interval_secs: f64,
    pub connect_timeout_secs: u64,
    pub channel_depth: usize,
    pub outbound: OutboundPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_RELAY_URL.to_string(),
            api_key: None,
            auto_reconnect: true,
            reconnect_interval_secs: DEFAULT_RECONNECT_INTERVAL_SECS as f64,
            max_reconnect_interval_secs: DEFAULT_MAX_RECONNECT_INTERVAL_SECS as f64,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            channel_depth: DEFAULT_OUTBOUND_CHANNEL_DEPTH,
            outbound: OutboundPolicy::default(),
        }
    }
}

impl RelayConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let interval = Duration::from_secs_f64(self.reconnect_interval_secs.max(0.0));
        ReconnectPolicy {
            enabled: self.auto_reconnect,
            interval,
            max_interval: Duration::from_secs_f64(self.max_reconnect_interval_secs.max(0.0)).max(interval),
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            url: self.url.clone(),
            api_key: self.api_key.clone(),
            reconnect: self.reconnect_policy(),
            outbound: self.outbound,
            channel_depth: self.channel_depth,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }
}

impl AppConfig {
    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Load `path`, or the default location when `None`. A missing file
    /// yields the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match default_config_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    /// Write as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let audio = &self.audio;
        if audio.sample_rate == 0 {
            return Err(Error::Config("audio.sample_rate must be positive".into()));
        }
        if audio.frame_duration_ms == 0 {
            return Err(Error::Config("audio.frame_duration_ms must be positive".into()));
        }
        if audio.capture_buffer_seconds == 0 {
            return Err(Error::Config("audio.capture_buffer_seconds must be positive".into()));
        }
        if !audio.playback_buffer_seconds.is_finite() || audio.playback_buffer_seconds <= 0.0 {
            return Err(Error::Config("audio.playback_buffer_seconds must be positive".into()));
        }
        // Each tick must fit in the capture loop
        if audio.frame_duration_ms as u64 >= audio.capture_buffer_seconds as u64 * 1000 {
            return Err(Error::Config(
                "audio.frame_duration_ms must be shorter than the capture buffer".into(),
            ));
        }

        let relay = &self.relay;
        validate_url(&relay.url).map_err(|e| Error::Config(e.to_string()))?;
        if !relay.reconnect_interval_secs.is_finite() || relay.reconnect_interval_secs <= 0.0 {
            return Err(Error::Config("relay.reconnect_interval_secs must be positive".into()));
        }
        if relay.channel_depth == 0 {
            return Err(Error::Config("relay.channel_depth must be positive".into()));
        }
        Ok(())
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            sample_rate: self.audio.sample_rate,
            frame_duration_ms: self.audio.frame_duration_ms,
            buffer_seconds: self.audio.capture_buffer_seconds,
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            capture: self.capture_config(),
            input_device: self.audio.input_device.clone(),
            playback_buffer_seconds: self.audio.playback_buffer_seconds,
            overrun: self.audio.overrun_policy,
            transport: self.relay.transport_config(),
        }
    }
}

/// Platform config file location, e.g. `~/.config/voice-relay/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "voice-relay").map(|dirs| dirs.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.audio.sample_rate, 24000);
        assert_eq!(config.capture_config().samples_per_frame(), 1200);
        assert_eq!(config.relay.outbound, OutboundPolicy::Drop);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: AppConfig = toml::from_str(
            r#"
            [audio]
            sample_rate = 16000
            overrun_policy = "signal"

            [relay]
            url = "wss://relay.example.com/ws/audio"
            outbound = { mode = "queue_and_flush", max_frames = 20 }
            "#,
        )
        .unwrap();

        assert_eq!(parsed.audio.sample_rate, 16000);
        assert_eq!(parsed.audio.frame_duration_ms, DEFAULT_FRAME_DURATION_MS);
        assert_eq!(parsed.audio.overrun_policy, OverrunPolicy::Signal);
        assert_eq!(parsed.relay.outbound, OutboundPolicy::QueueAndFlush { max_frames: 20 });
        assert!(parsed.relay.auto_reconnect);
        parsed.validate().unwrap();
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.audio.input_device = Some("USB Headset".into());
        config.relay.api_key = Some("secret".into());
        config.relay.max_reconnect_interval_secs = 30.0;
        config.save(&path).unwrap();

        assert_eq!(AppConfig::load(&path).unwrap(), config);
        assert_eq!(AppConfig::load_or_default(Some(path.as_path())).unwrap(), config);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = AppConfig::load_or_default(Some(path.as_path())).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[audio\nsample_rate = ").unwrap();
        assert!(matches!(AppConfig::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.audio.sample_rate = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.relay.url = "http://127.0.0.1:8000/ws/audio".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.frame_duration_ms = 10_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reconnect_policy_conversion() {
        let mut relay = RelayConfig::default();
        relay.reconnect_interval_secs = 2.5;
        relay.max_reconnect_interval_secs = 1.0;
        let policy = relay.reconnect_policy();
        assert_eq!(policy.interval, Duration::from_millis(2500));
        // The cap never undercuts the base interval
        assert_eq!(policy.max_interval, policy.interval);
    }
}

//! Host-side configuration
//!
//! Loaded from a TOML file in the platform config directory. Every section
//! and field has a default, so a partial file (or none at all) is valid.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::audio::assembler::{MAX_GAIN, NEUTRAL_GAIN};
use crate::audio::capture::CaptureConfig;
use crate::audio::vad::VadConfig;
use crate::constants::{
    DEFAULT_FRAME_DURATION_MS, DEFAULT_QUEUE_CAPACITY, DEFAULT_SAMPLE_RATE, MAX_READ_TIMEOUT_MS,
};
use crate::error::{Error, Result};
use crate::protocol::{AudioCodec, AudioFormat, MAX_PAYLOAD_SIZE};

const CONFIG_FILE: &str = "companion.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub gateway: GatewayConfig,
    pub audio: AudioConfig,
    pub vad: VadConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub id: String,
    pub name: String,
    pub firmware_version: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: "cardputer-001".to_string(),
            name: "Cardputer".to_string(),
            firmware_version: "1.0.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// `host:port` of the gateway
    pub address: String,
    pub api_key: Option<String>,
    pub reconnect_interval_ms: u64,
    pub ping_interval_ms: u64,
    pub connection_timeout_ms: u64,
    pub auth_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8765".to_string(),
            api_key: None,
            reconnect_interval_ms: 5_000,
            ping_interval_ms: 30_000,
            connection_timeout_ms: 10_000,
            auth_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Substring of the input device name; empty picks the default device
    pub input_device: String,
    pub sample_rate: u32,
    pub frame_duration_ms: u32,
    /// 64 leaves samples unchanged
    pub mic_gain: u8,
    pub codec: AudioCodec,
    pub queue_capacity: usize,
    pub read_timeout_ms: u64,
    pub max_consecutive_errors: u32,
    pub max_voice_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: String::new(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_duration_ms: DEFAULT_FRAME_DURATION_MS,
            mic_gain: NEUTRAL_GAIN,
            codec: AudioCodec::Pcm,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            read_timeout_ms: MAX_READ_TIMEOUT_MS,
            max_consecutive_errors: 5,
            max_voice_ms: 30_000,
        }
    }
}

impl AppConfig {
    /// Read and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// `companion.toml` in the platform config directory
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "openclaw", "companion")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load from the default path, falling back to defaults when the file
    /// does not exist. A file that exists but is invalid is an error.
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                info!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.device.id.trim().is_empty() {
            return Err(Error::Config("device.id must not be empty".into()));
        }
        if self.device.name.trim().is_empty() {
            return Err(Error::Config("device.name must not be empty".into()));
        }
        if self.gateway.address.trim().is_empty() {
            return Err(Error::Config("gateway.address must not be empty".into()));
        }
        if self.gateway.connection_timeout_ms == 0 {
            return Err(Error::Config(
                "gateway.connection_timeout_ms must be at least 1".into(),
            ));
        }
        if !(8_000..=48_000).contains(&self.audio.sample_rate) {
            return Err(Error::Config(format!(
                "audio.sample_rate {} outside 8000..=48000",
                self.audio.sample_rate
            )));
        }
        if !(20..=120).contains(&self.audio.frame_duration_ms) {
            return Err(Error::Config(format!(
                "audio.frame_duration_ms {} outside 20..=120",
                self.audio.frame_duration_ms
            )));
        }
        if self.audio.mic_gain > MAX_GAIN {
            return Err(Error::Config(format!(
                "audio.mic_gain {} above {}",
                self.audio.mic_gain, MAX_GAIN
            )));
        }
        let frame_bytes = self.audio_format().frame_bytes();
        if frame_bytes > MAX_PAYLOAD_SIZE {
            return Err(Error::Config(format!(
                "one audio frame is {} bytes, above the {} byte payload limit",
                frame_bytes, MAX_PAYLOAD_SIZE
            )));
        }
        if self.audio.read_timeout_ms == 0 || self.audio.read_timeout_ms > MAX_READ_TIMEOUT_MS {
            return Err(Error::Config(format!(
                "audio.read_timeout_ms {} outside 1..={}",
                self.audio.read_timeout_ms, MAX_READ_TIMEOUT_MS
            )));
        }
        if self.audio.max_consecutive_errors == 0 {
            return Err(Error::Config(
                "audio.max_consecutive_errors must be at least 1".into(),
            ));
        }
        if self.audio.queue_capacity == 0 {
            return Err(Error::Config("audio.queue_capacity must be at least 1".into()));
        }
        Ok(())
    }

    pub fn audio_format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.audio.sample_rate,
            channels: 1,
            bits_per_sample: 16,
            codec: self.audio.codec,
            frame_duration_ms: self.audio.frame_duration_ms,
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            sample_rate: self.audio.sample_rate,
            frame_duration_ms: self.audio.frame_duration_ms,
            gain: self.audio.mic_gain,
            vad: self.vad,
            read_timeout: std::time::Duration::from_millis(self.audio.read_timeout_ms),
            ..CaptureConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.device.id, "cardputer-001");
        assert_eq!(config.gateway.ping_interval_ms, 30_000);
        assert_eq!(config.audio.sample_rate, 16_000);
        assert_eq!(config.audio.mic_gain, 64);
        assert_eq!(config.vad.threshold, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [gateway]
            address = "10.0.0.5:9000"
            api_key = "secret"

            [vad]
            threshold = 800
            "#,
        )
        .unwrap();

        assert_eq!(config.gateway.address, "10.0.0.5:9000");
        assert_eq!(config.gateway.api_key.as_deref(), Some("secret"));
        assert_eq!(config.gateway.auth_timeout_ms, 10_000);
        assert_eq!(config.vad.threshold, 800);
        assert_eq!(config.vad.silence_ms, 500);
        assert_eq!(config.audio.codec, AudioCodec::Pcm);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let mut config = AppConfig::default();
        config.device.name = "Desk unit".into();
        config.audio.codec = AudioCodec::Opus;
        config.save(&path).unwrap();

        assert_eq!(AppConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = AppConfig::default();
        config.audio.sample_rate = 4_000;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = AppConfig::default();
        config.audio.mic_gain = 101;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.sample_rate = 48_000;
        config.audio.frame_duration_ms = 120;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.device.id = " ".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.max_consecutive_errors = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = AppConfig::default();
        config.gateway.connection_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[audio]\nsample_rate = \"fast\"\n").unwrap();
        assert!(matches!(AppConfig::load(&path), Err(Error::Config(_))));
    }
}

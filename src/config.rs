//! # Configuration Management
//!
//! Loads daemon configuration from multiple sources, highest priority last:
//!
//! 1. Built-in defaults (the `Default` impl below)
//! 2. A TOML file (`--config <path>`, or `aurisd.toml` next to the binary)
//! 3. Environment variables with the `AURISD_` prefix, `__` as the section
//!    separator (e.g. `AURISD_SERVER__PORT=9100`,
//!    `AURISD_CLOUD__URL=ws://cloud:8888/ws/robot`)
//! 4. Bare `HOST` / `PORT`, honoured for deployment platforms that set them
//!
//! `validate()` runs once at startup; a configuration it rejects aborts the
//! process before any component starts.

use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::cloud::CloudConfig;
use crate::doa::tracker::{ConfidenceConfig, TrackerConfig};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub cloud: CloudSettings,
    pub motion: MotionSettings,
    pub camera: CameraConfig,
    pub capture: CaptureSettings,
    pub logging: LoggingConfig,
}

/// HTTP server binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// DOA tracking parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Tracker poll rate, 1–100 Hz.
    pub poll_hz: u32,
    /// How long the speaking flag stays latched after the last detection.
    pub speaking_latch_ms: u64,
    /// EMA smoothing factor in [0, 1]; higher follows the raw angle faster.
    pub ema_alpha: f64,
    /// Rolling result history length.
    pub history_size: usize,
    /// Speech energy observed from a speaker at one meter; calibrates the
    /// distance estimate.
    pub reference_energy: f64,
    pub confidence: ConfidenceSettings,
}

/// Additive confidence scoring weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceSettings {
    pub base: f64,
    pub speaking_bonus: f64,
    pub stability_bonus: f64,
}

/// Connection to the remote control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSettings {
    pub enabled: bool,
    pub url: String,
    pub reconnect_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub ping_interval_ms: u64,
    pub write_timeout_ms: u64,
}

/// Connection to the vendor robot daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionSettings {
    pub base_url: String,
    pub timeout_ms: u64,
    /// Max motor commands per second; 0 disables the limit.
    pub rate_limit_hz: u32,
}

/// Camera/frame-forwarding parameters, applied to whatever frame producer
/// the orchestrator is given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub enabled: bool,
    pub framerate: u32,
    pub width: u32,
    pub height: u32,
    pub quality: u32,
}

/// Microphone capture for the cloud `mic` stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    pub enabled: bool,
    pub sample_rate: u32,
    pub channels: u8,
    pub chunk_ms: u64,
    pub playback_cmd: String,
    pub capture_cmd: String,
}

/// Log level and output format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// debug, info, warn, error
    pub level: String,
    /// json, text
    pub format: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 9000,
            },
            audio: AudioConfig {
                poll_hz: 20,
                speaking_latch_ms: 500,
                ema_alpha: 0.3,
                history_size: 100,
                reference_energy: 1.0,
                confidence: ConfidenceSettings {
                    base: 0.3,
                    speaking_bonus: 0.4,
                    stability_bonus: 0.2,
                },
            },
            cloud: CloudSettings {
                enabled: true,
                url: "ws://localhost:8888/ws/robot".to_string(),
                reconnect_backoff_ms: 1_000,
                max_backoff_ms: 30_000,
                ping_interval_ms: 10_000,
                write_timeout_ms: 5_000,
            },
            motion: MotionSettings {
                base_url: "http://localhost:8000".to_string(),
                timeout_ms: 2_000,
                rate_limit_hz: 30,
            },
            camera: CameraConfig {
                enabled: true,
                framerate: 10,
                width: 640,
                height: 480,
                quality: 80,
            },
            capture: CaptureSettings {
                enabled: false,
                sample_rate: 16_000,
                channels: 1,
                chunk_ms: 100,
                playback_cmd: "aplay".to_string(),
                capture_cmd: "arecord".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "json".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration, layering file and environment over the defaults.
    /// A missing config file is fine; the defaults cover everything.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?);

        settings = match path {
            Some(path) => settings.add_source(config::File::from(path).required(false)),
            None => settings.add_source(config::File::with_name("aurisd").required(false)),
        };

        settings = settings.add_source(
            config::Environment::with_prefix("AURISD")
                .prefix_separator("_")
                .separator("__"),
        );

        // Deployment platforms commonly inject these without a prefix.
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations no component could run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server.port cannot be 0");
        }

        if !(1..=100).contains(&self.audio.poll_hz) {
            anyhow::bail!(
                "audio.poll_hz must be between 1 and 100, got {}",
                self.audio.poll_hz
            );
        }

        if !(0.0..=1.0).contains(&self.audio.ema_alpha) {
            anyhow::bail!(
                "audio.ema_alpha must be between 0 and 1, got {}",
                self.audio.ema_alpha
            );
        }

        if self.cloud.enabled && self.cloud.url.is_empty() {
            anyhow::bail!("cloud.url is required when cloud is enabled");
        }

        if self.camera.enabled && !(1..=60).contains(&self.camera.framerate) {
            anyhow::bail!(
                "camera.framerate must be between 1 and 60, got {}",
                self.camera.framerate
            );
        }

        Ok(())
    }

    /// Tracker parameters derived from the audio section.
    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            poll_interval: Duration::from_millis(1000 / self.audio.poll_hz as u64),
            speaking_latch: Duration::from_millis(self.audio.speaking_latch_ms),
            ema_alpha: self.audio.ema_alpha,
            history_size: self.audio.history_size,
            reference_energy: self.audio.reference_energy,
            confidence: ConfidenceConfig {
                base: self.audio.confidence.base,
                speaking_bonus: self.audio.confidence.speaking_bonus,
                stability_bonus: self.audio.confidence.stability_bonus,
            },
        }
    }

    /// Cloud client parameters derived from the cloud section.
    pub fn cloud_config(&self) -> CloudConfig {
        CloudConfig {
            url: self.cloud.url.clone(),
            reconnect_backoff: Duration::from_millis(self.cloud.reconnect_backoff_ms),
            max_backoff: Duration::from_millis(self.cloud.max_backoff_ms),
            ping_interval: Duration::from_millis(self.cloud.ping_interval_ms),
            write_timeout: Duration::from_millis(self.cloud.write_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.audio.poll_hz, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_port() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_poll_rate() {
        let mut config = AppConfig::default();
        config.audio.poll_hz = 0;
        assert!(config.validate().is_err());
        config.audio.poll_hz = 101;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_alpha() {
        let mut config = AppConfig::default();
        config.audio.ema_alpha = 1.5;
        assert!(config.validate().is_err());
        config.audio.ema_alpha = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_requires_cloud_url_when_enabled() {
        let mut config = AppConfig::default();
        config.cloud.url = String::new();
        assert!(config.validate().is_err());
        config.cloud.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tracker_config_conversion() {
        let config = AppConfig::default();
        let tracker = config.tracker_config();
        assert_eq!(tracker.poll_interval, Duration::from_millis(50));
        assert_eq!(tracker.speaking_latch, Duration::from_millis(500));
        assert!((tracker.ema_alpha - 0.3).abs() < 1e-9);
        assert_eq!(tracker.history_size, 100);
    }

    #[test]
    fn test_cloud_config_conversion() {
        let config = AppConfig::default();
        let cloud = config.cloud_config();
        assert_eq!(cloud.reconnect_backoff, Duration::from_secs(1));
        assert_eq!(cloud.max_backoff, Duration::from_secs(30));
        assert_eq!(cloud.write_timeout, Duration::from_secs(5));
    }
}

//! HTTP client for the vendor robot daemon.
//!
//! Motor and emotion commands arriving from the cloud are relayed here.
//! Everything is best-effort: commands above the configured rate are
//! silently skipped, and failures are counted but never fatal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::MotionError;
use crate::protocol::HeadTarget;

#[derive(Debug, Clone)]
pub struct MotionConfig {
    /// Base URL of the daemon, e.g. `http://localhost:8000`.
    pub base_url: String,
    pub timeout: Duration,
    /// Max motor commands per second; 0 disables the limit.
    pub rate_limit_hz: u32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            timeout: Duration::from_secs(2),
            rate_limit_hz: 30,
        }
    }
}

/// Body of the set-target call, in the daemon's expected shape.
#[derive(Debug, Serialize)]
struct FullBodyTarget {
    target_head_pose: HeadTarget,
    target_antennas: [f64; 2],
    target_body_yaw: f64,
}

#[derive(Debug, Serialize)]
struct EmotionRequest {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration: Option<f64>,
}

/// Command counters, for telemetry.
#[derive(Debug, Clone, Serialize)]
pub struct MotionStats {
    pub commands_sent: u64,
    pub command_errors: u64,
    pub emotions_sent: u64,
    pub emotion_errors: u64,
}

/// Rate-limited client for the robot daemon's HTTP API.
pub struct MotionClient {
    cfg: MotionConfig,
    http: reqwest::Client,

    last_command_at: Mutex<Option<Instant>>,
    min_interval: Duration,

    commands_sent: AtomicU64,
    command_errors: AtomicU64,
    emotions_sent: AtomicU64,
    emotion_errors: AtomicU64,
}

impl MotionClient {
    pub fn new(cfg: MotionConfig) -> Self {
        let min_interval = if cfg.rate_limit_hz > 0 {
            Duration::from_secs(1) / cfg.rate_limit_hz
        } else {
            Duration::ZERO
        };

        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .unwrap_or_default();

        Self {
            cfg,
            http,
            last_command_at: Mutex::new(None),
            min_interval,
            commands_sent: AtomicU64::new(0),
            command_errors: AtomicU64::new(0),
            emotions_sent: AtomicU64::new(0),
            emotion_errors: AtomicU64::new(0),
        }
    }

    /// True when this command should be skipped to hold the rate limit.
    fn rate_limited(&self) -> bool {
        if self.min_interval.is_zero() {
            return false;
        }

        let mut last = self.last_command_at.lock().unwrap();
        let now = Instant::now();
        if let Some(at) = *last {
            if now.duration_since(at) < self.min_interval {
                return true;
            }
        }
        *last = Some(now);
        false
    }

    /// Send a full-body movement target. Commands above the rate limit are
    /// dropped without error.
    pub async fn set_target(
        &self,
        head: HeadTarget,
        antennas: [f64; 2],
        body_yaw: f64,
    ) -> Result<(), MotionError> {
        if self.rate_limited() {
            return Ok(());
        }

        let target = FullBodyTarget {
            target_head_pose: head,
            target_antennas: antennas,
            target_body_yaw: body_yaw,
        };

        let url = format!("{}/api/move/set_target", self.cfg.base_url);
        let response = match self.http.post(&url).json(&target).send().await {
            Ok(response) => response,
            Err(e) => {
                self.command_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        if !response.status().is_success() {
            self.command_errors.fetch_add(1, Ordering::Relaxed);
            return Err(status_error(response).await);
        }

        self.commands_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Trigger an emotion animation.
    pub async fn play_emotion(&self, name: &str, duration: Option<f64>) -> Result<(), MotionError> {
        let emotion = EmotionRequest {
            name: name.to_string(),
            duration,
        };

        let url = format!("{}/api/emotion/play", self.cfg.base_url);
        let response = match self.http.post(&url).json(&emotion).send().await {
            Ok(response) => response,
            Err(e) => {
                self.emotion_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        if !response.status().is_success() {
            self.emotion_errors.fetch_add(1, Ordering::Relaxed);
            return Err(status_error(response).await);
        }

        self.emotions_sent.fetch_add(1, Ordering::Relaxed);
        debug!(name, "emotion played");
        Ok(())
    }

    /// Fetch the daemon's status document.
    pub async fn status(&self) -> Result<serde_json::Value, MotionError> {
        let url = format!("{}/api/daemon/status", self.cfg.base_url);
        let response = self.http.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        Ok(response.json().await?)
    }

    /// Quick reachability probe.
    pub async fn is_healthy(&self) -> bool {
        tokio::time::timeout(Duration::from_secs(1), self.status())
            .await
            .map(|status| status.is_ok())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> MotionStats {
        MotionStats {
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            command_errors: self.command_errors.load(Ordering::Relaxed),
            emotions_sent: self.emotions_sent.load(Ordering::Relaxed),
            emotion_errors: self.emotion_errors.load(Ordering::Relaxed),
        }
    }
}

async fn status_error(response: reqwest::Response) -> MotionError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    info!(status, "motion daemon rejected request");
    MotionError::Status { status, body }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with_rate(rate_limit_hz: u32) -> MotionClient {
        MotionClient::new(MotionConfig {
            rate_limit_hz,
            ..Default::default()
        })
    }

    #[test]
    fn test_default_config() {
        let cfg = MotionConfig::default();
        assert_eq!(cfg.timeout, Duration::from_secs(2));
        assert_eq!(cfg.rate_limit_hz, 30);
    }

    #[test]
    fn test_rate_limiter_skips_bursts() {
        let client = client_with_rate(30);

        assert!(!client.rate_limited(), "first command always passes");
        assert!(client.rate_limited(), "immediate follow-up is skipped");

        std::thread::sleep(Duration::from_millis(40));
        assert!(!client.rate_limited(), "passes again after the interval");
    }

    #[test]
    fn test_rate_limiter_disabled_at_zero() {
        let client = client_with_rate(0);
        for _ in 0..10 {
            assert!(!client.rate_limited());
        }
    }

    #[tokio::test]
    async fn test_set_target_skipped_by_rate_limit_is_ok() {
        // Unreachable daemon, but the second command inside the interval is
        // skipped before any request goes out.
        let client = MotionClient::new(MotionConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            timeout: Duration::from_millis(100),
            rate_limit_hz: 1,
        });

        let head = HeadTarget::default();
        assert!(client.set_target(head.clone(), [0.0, 0.0], 0.0).await.is_err());
        assert!(client.set_target(head, [0.0, 0.0], 0.0).await.is_ok());
        assert_eq!(client.stats().command_errors, 1);
        assert_eq!(client.stats().commands_sent, 0);
    }

    #[tokio::test]
    async fn test_unreachable_daemon_counts_errors() {
        let client = MotionClient::new(MotionConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            timeout: Duration::from_millis(100),
            rate_limit_hz: 0,
        });

        assert!(client.play_emotion("happy", Some(1.0)).await.is_err());
        assert!(!client.is_healthy().await);

        let stats = client.stats();
        assert_eq!(stats.emotion_errors, 1);
        assert_eq!(stats.emotions_sent, 0);
    }
}

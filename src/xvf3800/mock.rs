//! Deterministic DOA source for tests and hardware-free development.

use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::doa::{self, DoaSource, Reading};
use crate::error::SourceError;

struct MockState {
    raw_angle: f64,
    speaking: bool,
    healthy: bool,
    failing: bool,
    closed: bool,
    calls: u64,
}

/// Mock DOA source with settable angle, speech flag, health and failure
/// injection. `with_wave` oscillates the bearing ±45° around front instead.
pub struct MockSource {
    inner: Mutex<MockState>,
    wave: bool,
    started: Instant,
}

impl MockSource {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockState {
                raw_angle: std::f64::consts::FRAC_PI_2, // front, sensor frame
                speaking: false,
                healthy: true,
                failing: false,
                closed: false,
                calls: 0,
            }),
            wave: false,
            started: Instant::now(),
        }
    }

    /// A mock that simulates a speaker slowly moving left and right.
    pub fn with_wave() -> Self {
        let mut source = Self::new();
        source.wave = true;
        source
    }

    /// Set the bearing in the sensor frame.
    pub fn set_raw_angle(&self, raw_angle: f64) {
        self.inner.lock().unwrap().raw_angle = raw_angle;
    }

    pub fn set_speaking(&self, speaking: bool) {
        self.inner.lock().unwrap().speaking = speaking;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.inner.lock().unwrap().healthy = healthy;
    }

    /// Make every subsequent read fail with a transient error.
    pub fn set_failing(&self, failing: bool) {
        self.inner.lock().unwrap().failing = failing;
    }

    /// Number of `get_doa` calls observed so far.
    pub fn calls(&self) -> u64 {
        self.inner.lock().unwrap().calls
    }
}

impl Default for MockSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DoaSource for MockSource {
    async fn get_doa(&self, _cancel: &CancellationToken) -> Result<Reading, SourceError> {
        let mut state = self.inner.lock().unwrap();
        state.calls += 1;

        if state.closed {
            return Err(SourceError::Closed);
        }

        if state.failing {
            return Err(SourceError::Transient("injected mock failure".into()));
        }

        let raw_angle = if self.wave {
            let elapsed = self.started.elapsed().as_secs_f64();
            std::f64::consts::FRAC_PI_2 + elapsed.sin() * std::f64::consts::FRAC_PI_4
        } else {
            state.raw_angle
        };

        Ok(Reading {
            angle: doa::to_normalized(raw_angle),
            raw_angle,
            speaking: state.speaking,
            timestamp: Utc::now(),
            latency_ms: 1,
            ..Default::default()
        })
    }

    fn healthy(&self) -> bool {
        self.inner.lock().unwrap().healthy
    }

    fn name(&self) -> &'static str {
        "mock"
    }

    async fn close(&self) -> Result<(), SourceError> {
        self.inner.lock().unwrap().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::{FRAC_PI_2, FRAC_PI_4, PI};

    #[tokio::test]
    async fn test_reading_obeys_frame_conversion() {
        let source = MockSource::new();
        let cancel = CancellationToken::new();

        for raw in [0.0, FRAC_PI_4, FRAC_PI_2, PI] {
            source.set_raw_angle(raw);
            let reading = source.get_doa(&cancel).await.unwrap();
            assert!((reading.angle - (FRAC_PI_2 - reading.raw_angle)).abs() < 1e-6);
            assert!((reading.raw_angle - raw).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn test_speaking_and_health_flags() {
        let source = MockSource::new();
        let cancel = CancellationToken::new();

        assert!(source.healthy());
        assert!(!source.get_doa(&cancel).await.unwrap().speaking);

        source.set_speaking(true);
        assert!(source.get_doa(&cancel).await.unwrap().speaking);

        source.set_healthy(false);
        assert!(!source.healthy());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let source = MockSource::new();
        let cancel = CancellationToken::new();

        source.set_failing(true);
        assert!(matches!(
            source.get_doa(&cancel).await,
            Err(SourceError::Transient(_))
        ));

        source.set_failing(false);
        assert!(source.get_doa(&cancel).await.is_ok());
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_wave_stays_within_quarter_turn_of_front() {
        let source = MockSource::with_wave();
        let cancel = CancellationToken::new();

        let reading = source.get_doa(&cancel).await.unwrap();
        assert!(reading.raw_angle >= FRAC_PI_2 - FRAC_PI_4 - 1e-6);
        assert!(reading.raw_angle <= FRAC_PI_2 + FRAC_PI_4 + 1e-6);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let source = MockSource::new();
        let cancel = CancellationToken::new();

        assert!(source.close().await.is_ok());
        assert!(source.close().await.is_ok());
        assert!(matches!(
            source.get_doa(&cancel).await,
            Err(SourceError::Closed)
        ));
    }
}

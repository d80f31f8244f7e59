//! Polling tracker that turns raw DOA readings into a smoothed signal.
//!
//! One task calls [`Tracker::run`]; everything else reads through `latest()`
//! / `stats()` or attaches a bounded subscription. The poll cycle updates
//! latch, smoothed angle, confidence and history in a single critical
//! section, so observers never see a partially updated result. Fan-out is
//! non-blocking: a slow subscriber loses updates, never stalls the poller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DoaResult, DoaSource};
use crate::error::SourceError;

/// Capacity of each subscriber channel.
const SUBSCRIBER_BUFFER: usize = 10;

/// Number of trailing smoothed angles inspected for stability.
const STABILITY_WINDOW: usize = 5;

/// Variance below which the bearing counts as stable.
const STABILITY_VARIANCE_MAX: f64 = 0.01;

/// Tracker tuning knobs.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub poll_interval: Duration,
    pub speaking_latch: Duration,
    /// EMA smoothing factor in [0, 1]; higher follows the raw angle faster.
    pub ema_alpha: f64,
    pub history_size: usize,
    /// Calibration constant for the energy-based distance estimate.
    pub reference_energy: f64,
    pub confidence: ConfidenceConfig,
}

/// Additive confidence scoring weights.
#[derive(Debug, Clone)]
pub struct ConfidenceConfig {
    pub base: f64,
    pub speaking_bonus: f64,
    pub stability_bonus: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50), // 20 Hz
            speaking_latch: Duration::from_millis(500),
            ema_alpha: 0.3,
            history_size: 100,
            reference_energy: 1.0,
            confidence: ConfidenceConfig {
                base: 0.3,
                speaking_bonus: 0.4,
                stability_bonus: 0.2,
            },
        }
    }
}

/// Snapshot of tracker counters and current signal, for `/api/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerStats {
    pub poll_count: u64,
    pub error_count: u64,
    pub avg_latency_ms: f64,
    pub history_size: usize,
    pub subscriber_count: usize,
    pub source_healthy: bool,
    pub speaking_latched: bool,
    pub current_angle: f64,
    pub current_confidence: f64,
}

/// A bounded subscription to tracker updates.
///
/// The receiver holds only this detach token and the channel end; the
/// tracker owns the sending side. Pass `id` to [`Tracker::unsubscribe`] when
/// done (also implied by `stop()`).
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<DoaResult>,
}

struct TrackerState {
    latest: DoaResult,
    history: Vec<DoaResult>,
    last_speech_at: Option<Instant>,
}

/// Periodic DOA poller with smoothing, latching and fan-out.
pub struct Tracker {
    source: Arc<dyn DoaSource>,
    cfg: TrackerConfig,

    inner: RwLock<TrackerState>,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<DoaResult>>>,
    next_subscriber_id: AtomicU64,

    poll_count: AtomicU64,
    error_count: AtomicU64,
    total_latency_ms: AtomicU64,

    cancel: CancellationToken,
}

impl Tracker {
    pub fn new(source: Arc<dyn DoaSource>, cfg: TrackerConfig) -> Self {
        let history = Vec::with_capacity(cfg.history_size);
        Self {
            source,
            cfg,
            inner: RwLock::new(TrackerState {
                latest: DoaResult::default(),
                history,
                last_speech_at: None,
            }),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
            poll_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }
    }

    /// Run the poll loop until `cancel` (or [`Tracker::stop`]) fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.cfg.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            poll_interval_ms = self.cfg.poll_interval.as_millis() as u64,
            ema_alpha = self.cfg.ema_alpha,
            speaking_latch_ms = self.cfg.speaking_latch.as_millis() as u64,
            source = self.source.name(),
            "tracker started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll(&cancel).await {
                        warn!(error = %e, "poll failed");
                    }
                }
            }
        }

        info!(
            polls = self.poll_count.load(Ordering::Relaxed),
            errors = self.error_count.load(Ordering::Relaxed),
            "tracker stopped"
        );
    }

    /// One poll cycle. Source errors bump the counter and leave all state
    /// untouched; they never propagate past the run loop.
    async fn poll(&self, cancel: &CancellationToken) -> Result<(), SourceError> {
        let start = Instant::now();

        let mut reading = match self.source.get_doa(cancel).await {
            Ok(reading) => reading,
            Err(e) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        // The outer poll latency wins over whatever the source measured.
        let latency_ms = start.elapsed().as_millis() as i64;
        reading.latency_ms = latency_ms;

        self.poll_count.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms as u64, Ordering::Relaxed);

        let result = {
            let mut state = self.inner.write().unwrap();
            let now = Instant::now();

            let speaking_latched = if reading.speaking {
                state.last_speech_at = Some(now);
                true
            } else {
                state
                    .last_speech_at
                    .map(|at| now.duration_since(at) < self.cfg.speaking_latch)
                    .unwrap_or(false)
            };

            let smoothed_angle = if state.history.is_empty() {
                reading.angle
            } else {
                self.cfg.ema_alpha * reading.angle
                    + (1.0 - self.cfg.ema_alpha) * state.latest.smoothed_angle
            };

            let confidence = self.score_confidence(&state, speaking_latched, smoothed_angle);
            let (est_x, est_y) = reading.estimated_position(self.cfg.reference_energy);

            let result = DoaResult {
                reading,
                smoothed_angle,
                confidence,
                speaking_latched,
                est_x,
                est_y,
            };

            state.latest = result.clone();
            state.history.push(result.clone());
            if state.history.len() > self.cfg.history_size {
                // Shift from the front; the history stays contiguous.
                state.history.remove(0);
            }

            result
        };

        self.notify_subscribers(&result);

        if result.speaking_latched && self.poll_count.load(Ordering::Relaxed) % 10 == 0 {
            debug!(
                angle = result.smoothed_angle,
                confidence = result.confidence,
                latency_ms,
                total_energy = result.reading.total_energy,
                "doa poll"
            );
        }

        Ok(())
    }

    /// Base score, plus a bonus while speech is latched, plus a bonus when
    /// the last few smoothed angles sit close to the current one.
    fn score_confidence(&self, state: &TrackerState, speaking: bool, angle: f64) -> f64 {
        let mut confidence = self.cfg.confidence.base;

        if speaking {
            confidence += self.cfg.confidence.speaking_bonus;
        }

        if state.history.len() >= STABILITY_WINDOW {
            let window = &state.history[state.history.len() - STABILITY_WINDOW..];
            let variance = window
                .iter()
                .map(|r| {
                    let diff = r.smoothed_angle - angle;
                    diff * diff
                })
                .sum::<f64>()
                / STABILITY_WINDOW as f64;

            if variance < STABILITY_VARIANCE_MAX {
                confidence += self.cfg.confidence.stability_bonus;
            }
        }

        confidence.clamp(0.0, 1.0)
    }

    fn notify_subscribers(&self, result: &DoaResult) {
        let subscribers = self.subscribers.lock().unwrap();
        for tx in subscribers.values() {
            // Drop the update if the subscriber is behind.
            let _ = tx.try_send(result.clone());
        }
    }

    /// Most recent result; zero-valued until the first successful poll.
    pub fn latest(&self) -> DoaResult {
        self.inner.read().unwrap().latest.clone()
    }

    /// Current target bearing, if confidence clears the base threshold.
    pub fn target(&self) -> (f64, f64, bool) {
        let state = self.inner.read().unwrap();
        if state.latest.confidence < self.cfg.confidence.base {
            return (0.0, 0.0, false);
        }
        (state.latest.smoothed_angle, state.latest.confidence, true)
    }

    /// Attach a bounded subscription to per-poll updates.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().unwrap().insert(id, tx);
        Subscription { id, rx }
    }

    /// Detach a subscription, closing its channel. Idempotent.
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().unwrap().remove(&id);
    }

    pub fn stats(&self) -> TrackerStats {
        let poll_count = self.poll_count.load(Ordering::Relaxed);
        let avg_latency_ms = if poll_count > 0 {
            self.total_latency_ms.load(Ordering::Relaxed) as f64 / poll_count as f64
        } else {
            0.0
        };

        let state = self.inner.read().unwrap();
        TrackerStats {
            poll_count,
            error_count: self.error_count.load(Ordering::Relaxed),
            avg_latency_ms,
            history_size: state.history.len(),
            subscriber_count: self.subscribers.lock().unwrap().len(),
            source_healthy: self.source.healthy(),
            speaking_latched: state.latest.speaking_latched,
            current_angle: state.latest.smoothed_angle,
            current_confidence: state.latest.confidence,
        }
    }

    /// Cancel the run loop and close every remaining subscriber channel.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.subscribers.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xvf3800::MockSource;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn test_config() -> TrackerConfig {
        TrackerConfig {
            poll_interval: Duration::from_millis(10),
            speaking_latch: Duration::from_millis(100),
            ema_alpha: 0.3,
            history_size: 10,
            ..Default::default()
        }
    }

    fn tracker_with(source: Arc<MockSource>, cfg: TrackerConfig) -> Arc<Tracker> {
        Arc::new(Tracker::new(source, cfg))
    }

    #[tokio::test]
    async fn test_basic_polling() {
        let source = Arc::new(MockSource::new());
        source.set_raw_angle(FRAC_PI_2);

        let tracker = tracker_with(source, test_config());
        let cancel = CancellationToken::new();

        let runner = tracker.clone();
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move { runner.run(run_cancel).await });

        tokio::time::sleep(Duration::from_millis(60)).await;

        let result = tracker.latest();
        assert!(result.reading.timestamp > chrono::DateTime::UNIX_EPOCH);
        assert!(tracker.stats().poll_count >= 3);

        tracker.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_speaking_latch_window() {
        let source = Arc::new(MockSource::new());
        source.set_raw_angle(FRAC_PI_2);

        let mut cfg = test_config();
        cfg.speaking_latch = Duration::from_millis(50);
        let tracker = tracker_with(source.clone(), cfg);

        let runner = tracker.clone();
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move { runner.run(run_cancel).await });

        source.set_speaking(true);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(tracker.latest().speaking_latched, "latch should assert while speaking");

        source.set_speaking(false);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(tracker.latest().speaking_latched, "latch should hold inside the window");

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(!tracker.latest().speaking_latched, "latch should expire");

        tracker.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_ema_two_cycle_law() {
        let source = Arc::new(MockSource::new());
        let mut cfg = test_config();
        cfg.ema_alpha = 0.5;
        let tracker = tracker_with(source.clone(), cfg);
        let cancel = CancellationToken::new();

        // Raw 0 maps to +π/2; the first poll seeds the EMA directly.
        source.set_raw_angle(0.0);
        tracker.poll(&cancel).await.unwrap();
        assert!((tracker.latest().smoothed_angle - FRAC_PI_2).abs() < 1e-9);

        // Raw π maps to −π/2; with α = 0.5 the smoothed angle lands on 0.
        source.set_raw_angle(PI);
        tracker.poll(&cancel).await.unwrap();
        assert!((tracker.latest().smoothed_angle - 0.0).abs() < 1e-9);

        // Further polls converge geometrically toward −π/2.
        let mut prev = tracker.latest().smoothed_angle;
        for _ in 0..20 {
            tracker.poll(&cancel).await.unwrap();
            let cur = tracker.latest().smoothed_angle;
            assert!(cur <= prev, "smoothed angle should descend toward −π/2");
            prev = cur;
        }
        assert!((prev - (-FRAC_PI_2)).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_ema_alpha_boundaries() {
        let cancel = CancellationToken::new();

        // α = 0 freezes the smoothed angle at its seed.
        let source = Arc::new(MockSource::new());
        let mut cfg = test_config();
        cfg.ema_alpha = 0.0;
        let tracker = tracker_with(source.clone(), cfg);
        source.set_raw_angle(0.0);
        tracker.poll(&cancel).await.unwrap();
        source.set_raw_angle(PI);
        for _ in 0..5 {
            tracker.poll(&cancel).await.unwrap();
        }
        assert!((tracker.latest().smoothed_angle - FRAC_PI_2).abs() < 1e-9);

        // α = 1 tracks the raw angle exactly.
        let source = Arc::new(MockSource::new());
        let mut cfg = test_config();
        cfg.ema_alpha = 1.0;
        let tracker = tracker_with(source.clone(), cfg);
        source.set_raw_angle(0.0);
        tracker.poll(&cancel).await.unwrap();
        source.set_raw_angle(PI);
        tracker.poll(&cancel).await.unwrap();
        assert!((tracker.latest().smoothed_angle - (-FRAC_PI_2)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_confidence_bonuses() {
        let source = Arc::new(MockSource::new());
        source.set_raw_angle(FRAC_PI_2);
        let tracker = tracker_with(source.clone(), test_config());
        let cancel = CancellationToken::new();

        // A steady angle earns base + stability once the window fills.
        for _ in 0..6 {
            tracker.poll(&cancel).await.unwrap();
        }
        let silent = tracker.latest().confidence;
        assert!((silent - 0.5).abs() < 1e-9, "expected base + stability, got {silent}");

        // Speech adds its bonus on top.
        source.set_speaking(true);
        tracker.poll(&cancel).await.unwrap();
        let speaking = tracker.latest().confidence;
        assert!((speaking - 0.9).abs() < 1e-9, "expected all bonuses, got {speaking}");
        assert!(speaking <= 1.0);
    }

    #[tokio::test]
    async fn test_confidence_stays_in_unit_interval() {
        let source = Arc::new(MockSource::new());
        source.set_speaking(true);
        let mut cfg = test_config();
        cfg.confidence = ConfidenceConfig {
            base: 0.9,
            speaking_bonus: 0.9,
            stability_bonus: 0.9,
        };
        let tracker = tracker_with(source, cfg);
        let cancel = CancellationToken::new();

        for _ in 0..8 {
            tracker.poll(&cancel).await.unwrap();
            let confidence = tracker.latest().confidence;
            assert!((0.0..=1.0).contains(&confidence));
        }
        assert!((tracker.latest().confidence - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_zero_history_never_earns_stability() {
        let source = Arc::new(MockSource::new());
        source.set_raw_angle(FRAC_PI_2);
        let mut cfg = test_config();
        cfg.history_size = 0;
        let tracker = tracker_with(source, cfg);
        let cancel = CancellationToken::new();

        for _ in 0..10 {
            tracker.poll(&cancel).await.unwrap();
        }
        let stats = tracker.stats();
        assert_eq!(stats.history_size, 0);
        assert!((tracker.latest().confidence - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_history_eviction() {
        let source = Arc::new(MockSource::new());
        let tracker = tracker_with(source, test_config());
        let cancel = CancellationToken::new();

        for _ in 0..15 {
            tracker.poll(&cancel).await.unwrap();
        }
        assert_eq!(tracker.stats().history_size, 10);
    }

    #[tokio::test]
    async fn test_source_errors_do_not_touch_state() {
        let source = Arc::new(MockSource::new());
        source.set_raw_angle(FRAC_PI_2);
        let tracker = tracker_with(source.clone(), test_config());
        let cancel = CancellationToken::new();

        tracker.poll(&cancel).await.unwrap();
        let before = tracker.latest();

        source.set_failing(true);
        assert!(tracker.poll(&cancel).await.is_err());
        assert_eq!(tracker.latest(), before);

        let stats = tracker.stats();
        assert_eq!(stats.poll_count, 1);
        assert_eq!(stats.error_count, 1);

        // Recovery resumes normal updates.
        source.set_failing(false);
        tracker.poll(&cancel).await.unwrap();
        assert_eq!(tracker.stats().poll_count, 2);
    }

    #[tokio::test]
    async fn test_subscription_receives_updates() {
        let source = Arc::new(MockSource::new());
        source.set_raw_angle(FRAC_PI_2);
        let tracker = tracker_with(source, test_config());
        let cancel = CancellationToken::new();

        let mut sub = tracker.subscribe();
        assert_eq!(tracker.stats().subscriber_count, 1);

        tracker.poll(&cancel).await.unwrap();
        let update = sub.rx.try_recv().expect("subscriber should have an update");
        assert!(update.reading.timestamp > chrono::DateTime::UNIX_EPOCH);

        tracker.unsubscribe(sub.id);
        tracker.unsubscribe(sub.id); // idempotent
        assert_eq!(tracker.stats().subscriber_count, 0);
    }

    #[tokio::test]
    async fn test_full_subscriber_never_blocks_polling() {
        let source = Arc::new(MockSource::new());
        let tracker = tracker_with(source, test_config());
        let cancel = CancellationToken::new();

        // Never drained: the channel fills after SUBSCRIBER_BUFFER updates.
        let _sub = tracker.subscribe();

        let start = Instant::now();
        for _ in 0..50 {
            tracker.poll(&cancel).await.unwrap();
        }
        // 50 polls with a saturated subscriber must not take anywhere near
        // 50 poll intervals.
        assert!(start.elapsed() < Duration::from_millis(200));
        assert_eq!(tracker.stats().poll_count, 50);
    }

    #[tokio::test]
    async fn test_target_requires_confidence() {
        let source = Arc::new(MockSource::new());
        source.set_raw_angle(FRAC_PI_2);
        let tracker = tracker_with(source.clone(), test_config());
        let cancel = CancellationToken::new();

        let (_, _, ok) = tracker.target();
        assert!(!ok, "no target before the first poll");

        source.set_speaking(true);
        for _ in 0..3 {
            tracker.poll(&cancel).await.unwrap();
        }
        let (angle, confidence, ok) = tracker.target();
        assert!(ok);
        assert!(confidence >= 0.5);
        assert!(angle.abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_stop_closes_subscribers() {
        let source = Arc::new(MockSource::new());
        let tracker = tracker_with(source, test_config());

        let mut sub = tracker.subscribe();
        tracker.stop();

        assert_eq!(tracker.stats().subscriber_count, 0);
        assert!(matches!(
            sub.rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_default_config() {
        let cfg = TrackerConfig::default();
        assert_eq!(cfg.poll_interval, Duration::from_millis(50));
        assert_eq!(cfg.speaking_latch, Duration::from_millis(500));
        assert!((cfg.ema_alpha - 0.3).abs() < 1e-9);
        assert_eq!(cfg.history_size, 100);
    }
}

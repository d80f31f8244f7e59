//! Shared application state handed to every HTTP request handler.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use crate::cloud::CloudClient;
use crate::config::AppConfig;
use crate::doa::tracker::Tracker;
use crate::websocket::Hub;

/// Coarse HTTP counters, maintained by the request middleware and surfaced
/// through `/metrics`.
#[derive(Debug, Default)]
pub struct HttpMetrics {
    pub requests: AtomicU64,
    pub errors: AtomicU64,
}

/// Everything a handler needs, cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    /// Effective configuration, frozen at startup.
    pub config: AppConfig,
    pub tracker: Arc<Tracker>,
    pub hub: Arc<Hub>,
    /// Present when the cloud link is enabled.
    pub cloud: Option<Arc<CloudClient>>,
    pub metrics: Arc<HttpMetrics>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        tracker: Arc<Tracker>,
        hub: Arc<Hub>,
        cloud: Option<Arc<CloudClient>>,
    ) -> Self {
        Self {
            config,
            tracker,
            hub,
            cloud,
            metrics: Arc::new(HttpMetrics::default()),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

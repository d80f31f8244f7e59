//! Frame producer abstraction and the bridge forwarding frames to the cloud.
//!
//! The capture path itself (WebRTC against the vendor process) lives outside
//! this daemon; whatever produces frames implements [`FrameProducer`] and the
//! orchestrator connects it to the cloud link through [`FrameBridge`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cloud::CloudClient;
use crate::error::SendError;
use crate::protocol::CameraSettings;

/// One captured, already-encoded video frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Encoded image bytes (JPEG).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: DateTime<Utc>,
    /// Sequential capture id.
    pub frame_id: u64,
}

/// A source of video frames that drives a registered callback at its own
/// cadence.
pub trait FrameProducer: Send + Sync {
    /// Register the frame consumer. One callback at a time; registering
    /// again replaces it.
    fn on_frame(&self, callback: Box<dyn Fn(Frame) + Send + Sync>);

    /// Begin producing frames until `cancel` fires.
    fn start(&self, cancel: &CancellationToken);

    /// Stop producing frames. Idempotent.
    fn stop(&self);

    /// Most recently produced frame, if any.
    fn last_frame(&self) -> Option<Frame>;

    /// Apply remote camera settings. Producers that cannot reconfigure
    /// themselves ignore this.
    fn apply_settings(&self, _settings: &CameraSettings) {}
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameBridgeStats {
    pub frames_forwarded: u64,
    pub frames_dropped: u64,
}

/// Connects a [`FrameProducer`] to [`CloudClient::send_frame`].
///
/// Frames that cannot be delivered (link down, write failure) are dropped
/// and counted; the producer is never back-pressured.
pub struct FrameBridge {
    cloud: Arc<CloudClient>,
    frames_forwarded: AtomicU64,
    frames_dropped: AtomicU64,
}

impl FrameBridge {
    pub fn new(cloud: Arc<CloudClient>) -> Arc<Self> {
        Arc::new(Self {
            cloud,
            frames_forwarded: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        })
    }

    /// Register this bridge as the producer's frame consumer.
    pub fn attach(self: &Arc<Self>, producer: &dyn FrameProducer) {
        let bridge = self.clone();
        producer.on_frame(Box::new(move |frame| {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.forward(frame).await });
        }));
    }

    async fn forward(&self, frame: Frame) {
        let sent = self
            .cloud
            .send_frame(frame.width, frame.height, &frame.data, frame.frame_id)
            .await;

        match sent {
            Ok(()) => {
                self.frames_forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(SendError::NotConnected) => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, frame_id = frame.frame_id, "frame forward failed");
            }
        }
    }

    pub fn stats(&self) -> FrameBridgeStats {
        FrameBridgeStats {
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::CloudConfig;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Producer that replays a fixed list of frames on demand.
    struct ScriptedProducer {
        callback: Mutex<Option<Box<dyn Fn(Frame) + Send + Sync>>>,
        last: Mutex<Option<Frame>>,
    }

    impl ScriptedProducer {
        fn new() -> Self {
            Self {
                callback: Mutex::new(None),
                last: Mutex::new(None),
            }
        }

        fn emit(&self, frame_id: u64) {
            let frame = Frame {
                data: vec![0xFF, 0xD8, 0xFF],
                width: 640,
                height: 480,
                timestamp: Utc::now(),
                frame_id,
            };
            *self.last.lock().unwrap() = Some(frame.clone());
            if let Some(callback) = self.callback.lock().unwrap().as_ref() {
                callback(frame);
            }
        }
    }

    impl FrameProducer for ScriptedProducer {
        fn on_frame(&self, callback: Box<dyn Fn(Frame) + Send + Sync>) {
            *self.callback.lock().unwrap() = Some(callback);
        }

        fn start(&self, _cancel: &CancellationToken) {}

        fn stop(&self) {}

        fn last_frame(&self) -> Option<Frame> {
            self.last.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn test_frames_drop_when_disconnected() {
        let cloud = Arc::new(CloudClient::new(CloudConfig::default()));
        let bridge = FrameBridge::new(cloud);

        let producer = ScriptedProducer::new();
        bridge.attach(&producer);

        producer.emit(1);
        producer.emit(2);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = bridge.stats();
        assert_eq!(stats.frames_forwarded, 0);
        assert_eq!(stats.frames_dropped, 2);
        assert_eq!(producer.last_frame().unwrap().frame_id, 2);
    }

    #[tokio::test]
    async fn test_reattach_replaces_callback() {
        let cloud = Arc::new(CloudClient::new(CloudConfig::default()));
        let bridge = FrameBridge::new(cloud.clone());
        let other = FrameBridge::new(cloud);

        let producer = ScriptedProducer::new();
        bridge.attach(&producer);
        other.attach(&producer);

        producer.emit(1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(bridge.stats().frames_dropped, 0);
        assert_eq!(other.stats().frames_dropped, 1);
    }
}

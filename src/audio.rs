//! Audio capture and playback through the ALSA command-line tools.
//!
//! The embedded host already ships `arecord`/`aplay`, so the bridge shells
//! out instead of linking an audio stack: capture pulls fixed-duration PCM16
//! chunks and hands them to a callback (the orchestrator forwards them to the
//! cloud as `mic` messages); playback pipes TTS audio from inbound `speak`
//! messages into the speaker.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AudioError;

const PLAYBACK_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub sample_rate: u32,
    pub channels: u8,
    /// Duration of each captured chunk.
    pub chunk_duration: Duration,
    pub playback_cmd: String,
    pub capture_cmd: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            chunk_duration: Duration::from_millis(100),
            playback_cmd: "aplay".to_string(),
            capture_cmd: "arecord".to_string(),
        }
    }
}

/// One chunk of captured PCM16 audio.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u8,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeStats {
    pub chunks_captured: u64,
    pub chunks_played: u64,
    pub capture_errors: u64,
    pub playback_errors: u64,
    pub capturing: bool,
}

type ChunkCallback = Arc<dyn Fn(AudioChunk) + Send + Sync>;

/// Bidirectional audio bridge over `arecord`/`aplay`.
pub struct AudioBridge {
    cfg: BridgeConfig,

    capturing: AtomicBool,
    capture_cancel: Mutex<Option<CancellationToken>>,
    on_chunk: Mutex<Option<ChunkCallback>>,

    chunks_captured: AtomicU64,
    chunks_played: AtomicU64,
    capture_errors: AtomicU64,
    playback_errors: AtomicU64,
}

impl AudioBridge {
    pub fn new(cfg: BridgeConfig) -> Self {
        Self {
            cfg,
            capturing: AtomicBool::new(false),
            capture_cancel: Mutex::new(None),
            on_chunk: Mutex::new(None),
            chunks_captured: AtomicU64::new(0),
            chunks_played: AtomicU64::new(0),
            capture_errors: AtomicU64::new(0),
            playback_errors: AtomicU64::new(0),
        }
    }

    /// Register the consumer for captured chunks.
    pub fn on_audio_chunk(&self, callback: impl Fn(AudioChunk) + Send + Sync + 'static) {
        *self.on_chunk.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Start the capture loop. No-op when already capturing.
    pub fn start_capture(self: &Arc<Self>, parent: &CancellationToken) {
        if self.capturing.swap(true, Ordering::SeqCst) {
            return;
        }

        let cancel = parent.child_token();
        *self.capture_cancel.lock().unwrap() = Some(cancel.clone());

        info!(
            sample_rate = self.cfg.sample_rate,
            channels = self.cfg.channels,
            "starting audio capture"
        );

        let bridge = self.clone();
        tokio::spawn(async move { bridge.capture_loop(cancel).await });
    }

    /// Stop the capture loop. Idempotent.
    pub fn stop_capture(&self) {
        if !self.capturing.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(cancel) = self.capture_cancel.lock().unwrap().take() {
            cancel.cancel();
        }
        info!("audio capture stopped");
    }

    async fn capture_loop(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let chunk = match self.capture_chunk().await {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.capture_errors.fetch_add(1, Ordering::Relaxed);
                    debug!(error = %e, "capture error");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_millis(100)) => continue,
                    }
                }
            };

            self.chunks_captured.fetch_add(1, Ordering::Relaxed);

            let callback = self.on_chunk.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(chunk);
            }
        }
    }

    /// Capture one chunk by running the capture command for the chunk
    /// duration, reading raw PCM from its stdout.
    async fn capture_chunk(&self) -> Result<AudioChunk, AudioError> {
        let seconds = self.cfg.chunk_duration.as_millis() as f64 / 1000.0;

        let output = Command::new(&self.cfg.capture_cmd)
            .args([
                "-f",
                "S16_LE",
                "-r",
                &self.cfg.sample_rate.to_string(),
                "-c",
                &self.cfg.channels.to_string(),
                "-d",
                &format!("{seconds:.3}"),
                "-t",
                "raw",
                "-q",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Err(AudioError::Command(format!(
                "capture command exited with {}",
                output.status
            )));
        }

        Ok(AudioChunk {
            data: output.stdout,
            sample_rate: self.cfg.sample_rate,
            channels: self.cfg.channels,
            timestamp: Utc::now(),
        })
    }

    /// Play raw PCM through the playback command, waiting for completion.
    pub async fn play(&self, data: &[u8], sample_rate: u32) -> Result<(), AudioError> {
        let mut child = Command::new(&self.cfg.playback_cmd)
            .args([
                "-f",
                "S16_LE",
                "-r",
                &sample_rate.to_string(),
                "-c",
                "1",
                "-t",
                "raw",
                "-q",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                self.playback_errors.fetch_add(1, Ordering::Relaxed);
                AudioError::Io(e)
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(data).await {
                self.playback_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
            drop(stdin);
        }

        let status = child.wait().await.map_err(|e| {
            self.playback_errors.fetch_add(1, Ordering::Relaxed);
            AudioError::Io(e)
        })?;

        if !status.success() {
            self.playback_errors.fetch_add(1, Ordering::Relaxed);
            return Err(AudioError::Command(format!(
                "playback command exited with {status}"
            )));
        }

        self.chunks_played.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Fire-and-forget playback with a deadline, for the inbound speak path.
    pub fn play_async(self: &Arc<Self>, data: Vec<u8>, sample_rate: u32) {
        let bridge = self.clone();
        tokio::spawn(async move {
            let play = tokio::time::timeout(PLAYBACK_DEADLINE, bridge.play(&data, sample_rate));
            match play.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "async playback error"),
                Err(_) => warn!("async playback timed out"),
            }
        });
    }

    /// Whether both audio commands resolve on PATH.
    pub fn is_available(&self) -> bool {
        command_on_path(&self.cfg.playback_cmd) && command_on_path(&self.cfg.capture_cmd)
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            chunks_captured: self.chunks_captured.load(Ordering::Relaxed),
            chunks_played: self.chunks_played.load(Ordering::Relaxed),
            capture_errors: self.capture_errors.load(Ordering::Relaxed),
            playback_errors: self.playback_errors.load(Ordering::Relaxed),
            capturing: self.capturing.load(Ordering::Relaxed),
        }
    }
}

fn command_on_path(cmd: &str) -> bool {
    if cmd.contains('/') {
        return std::path::Path::new(cmd).is_file();
    }

    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(cmd).is_file())
        })
        .unwrap_or(false)
}

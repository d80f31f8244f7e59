//! WebSocket client for the remote control plane.
//!
//! One state machine per client: dial with a bounded handshake, run a read
//! task and a keepalive ping task per session, and on any failure fall back
//! to exponential-backoff redial. Only cancellation exits the machine.
//!
//! Inbound messages dispatch to typed callbacks. Callbacks run inline on the
//! read task and are snapshotted under the lock before invocation, so they
//! can be hot-swapped without holding anything during the call. Handlers
//! must not block; long work belongs on a task of its own.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SendError;
use crate::protocol::{
    self, ConfigUpdate, EmotionCommand, Message, MessageType, MotorCommand, SpeakData,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const PING_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// WebSocket URL of the control plane, e.g. `ws://cloud.example.com/ws/robot`.
    pub url: String,
    /// Initial reconnect delay.
    pub reconnect_backoff: Duration,
    /// Reconnect delay ceiling.
    pub max_backoff: Duration,
    /// Keepalive ping cadence.
    pub ping_interval: Duration,
    /// Deadline for every outbound frame.
    pub write_timeout: Duration,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/ws/robot".to_string(),
            reconnect_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            ping_interval: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
        }
    }
}

type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

#[derive(Clone, Default)]
struct Callbacks {
    motor: Option<Callback<MotorCommand>>,
    emotion: Option<Callback<EmotionCommand>>,
    speak: Option<Callback<SpeakData>>,
    config: Option<Callback<ConfigUpdate>>,
}

/// Counters and connection status, for `/metrics` and tests.
#[derive(Debug, Clone, Serialize)]
pub struct CloudStats {
    pub connected: bool,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub reconnects: u64,
}

/// Auto-reconnecting WebSocket client. At most one underlying connection is
/// live at a time; all writes are serialized behind one lock.
pub struct CloudClient {
    cfg: CloudConfig,

    writer: Mutex<Option<WsSink>>,
    connected: AtomicBool,
    /// Cancelling this token tears down the current session only; the
    /// connection loop then redials. Replaced per connection.
    session: std::sync::Mutex<Option<CancellationToken>>,

    callbacks: std::sync::Mutex<Callbacks>,

    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    reconnects: AtomicU64,

    cancel: CancellationToken,
}

impl CloudClient {
    pub fn new(cfg: CloudConfig) -> Self {
        Self {
            cfg,
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            session: std::sync::Mutex::new(None),
            callbacks: std::sync::Mutex::new(Callbacks::default()),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }
    }

    pub fn on_motor_command(&self, callback: impl Fn(MotorCommand) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().motor = Some(Arc::new(callback));
    }

    pub fn on_emotion_command(&self, callback: impl Fn(EmotionCommand) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().emotion = Some(Arc::new(callback));
    }

    pub fn on_speak_data(&self, callback: impl Fn(SpeakData) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().speak = Some(Arc::new(callback));
    }

    pub fn on_config_update(&self, callback: impl Fn(ConfigUpdate) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().config = Some(Arc::new(callback));
    }

    /// Start the connection state machine under `parent`'s lifetime.
    /// Returns immediately; dialing and redialing happen in the background.
    pub fn connect(self: &Arc<Self>, parent: &CancellationToken) {
        // Parent cancellation folds into the client's own token.
        let parent = parent.clone();
        let linked = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => linked.cancel(),
                _ = linked.cancelled() => {}
            }
        });

        let client = self.clone();
        tokio::spawn(async move { client.connection_loop().await });
    }

    async fn connection_loop(self: Arc<Self>) {
        let mut backoff = self.cfg.reconnect_backoff;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            info!(url = %self.cfg.url, "connecting to cloud");

            let dial = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(self.cfg.url.as_str()));
            let stream = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = dial => match result {
                    Ok(Ok((stream, _))) => stream,
                    Ok(Err(e)) => {
                        if !self.retry_delay(&mut backoff, &e.to_string()).await {
                            break;
                        }
                        continue;
                    }
                    Err(_) => {
                        if !self.retry_delay(&mut backoff, "handshake timed out").await {
                            break;
                        }
                        continue;
                    }
                },
            };

            let (sink, source) = stream.split();
            *self.writer.lock().await = Some(sink);
            self.connected.store(true, Ordering::Relaxed);
            backoff = self.cfg.reconnect_backoff;

            let session = self.cancel.child_token();
            *self.session.lock().unwrap() = Some(session.clone());

            info!("connected to cloud");

            let pinger = self.clone();
            let ping_session = session.clone();
            tokio::spawn(async move { pinger.ping_loop(ping_session).await });

            self.read_loop(source, &session).await;

            // Draining: close the session, then either exit or back off and redial.
            session.cancel();
            self.drop_connection().await;

            if self.cancel.is_cancelled() {
                break;
            }
            if !self.retry_delay(&mut backoff, "connection lost").await {
                break;
            }
        }

        self.drop_connection().await;
        debug!("cloud connection loop exited");
    }

    /// Wait out the current backoff (interruptible), then double it up to the
    /// cap. Returns false when cancellation fired instead.
    async fn retry_delay(&self, backoff: &mut Duration, error: &str) -> bool {
        warn!(
            error,
            retry_in_ms = backoff.as_millis() as u64,
            "cloud connection failed"
        );
        self.reconnects.fetch_add(1, Ordering::Relaxed);

        let slept = tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(*backoff) => true,
        };

        *backoff = (*backoff * 2).min(self.cfg.max_backoff);
        slept
    }

    /// Keepalive pings over protocol control frames. A failed ping ends this
    /// task; the read side notices the broken connection and drives redial.
    async fn ping_loop(self: Arc<Self>, session: CancellationToken) {
        let mut ticker = tokio::time::interval(self.cfg.ping_interval);
        ticker.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                _ = session.cancelled() => return,
                _ = ticker.tick() => {
                    let mut writer = self.writer.lock().await;
                    let Some(sink) = writer.as_mut() else { return };

                    let write = tokio::time::timeout(
                        PING_WRITE_TIMEOUT,
                        sink.send(WsMessage::Ping(Vec::new())),
                    )
                    .await;

                    match write {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            debug!(error = %e, "ping failed");
                            return;
                        }
                        Err(_) => {
                            debug!("ping write timed out");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn read_loop(&self, mut source: WsSource, session: &CancellationToken) {
        loop {
            tokio::select! {
                _ = session.cancelled() => return,
                frame = source.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        self.messages_received.fetch_add(1, Ordering::Relaxed);
                        self.handle_message(text.as_bytes()).await;
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        self.messages_received.fetch_add(1, Ordering::Relaxed);
                        self.handle_message(&data).await;
                    }
                    // Protocol-level ping/pong is handled by tungstenite.
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Close(_))) => {
                        info!("cloud closed the connection");
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "cloud read error");
                        return;
                    }
                    None => {
                        warn!("cloud connection ended");
                        return;
                    }
                }
            }
        }
    }

    /// Parse and dispatch one inbound message. Parse and payload errors drop
    /// the message; they never tear down the connection.
    async fn handle_message(&self, data: &[u8]) {
        let msg = match Message::parse(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "dropping malformed cloud message");
                return;
            }
        };

        let callbacks = self.callbacks.lock().unwrap().clone();

        match msg.kind {
            MessageType::Motor => {
                if let Some(cb) = callbacks.motor {
                    match msg.motor_command() {
                        Ok(cmd) => cb(cmd),
                        Err(e) => warn!(error = %e, "bad motor payload"),
                    }
                }
            }
            MessageType::Emotion => {
                if let Some(cb) = callbacks.emotion {
                    match msg.emotion_command() {
                        Ok(cmd) => cb(cmd),
                        Err(e) => warn!(error = %e, "bad emotion payload"),
                    }
                }
            }
            MessageType::Speak => {
                if let Some(cb) = callbacks.speak {
                    match msg.speak_data() {
                        Ok(data) => cb(data),
                        Err(e) => warn!(error = %e, "bad speak payload"),
                    }
                }
            }
            MessageType::Config => {
                if let Some(cb) = callbacks.config {
                    match msg.config_update() {
                        Ok(update) => cb(update),
                        Err(e) => warn!(error = %e, "bad config payload"),
                    }
                }
            }
            MessageType::Ping => {
                if let Err(e) = self.send(Message::empty(MessageType::Pong)).await {
                    debug!(error = %e, "pong send failed");
                }
            }
            _ => {}
        }
    }

    /// Serialize and write one message under the write lock with the
    /// configured deadline. A failed or timed-out write drains the current
    /// session so the state machine can redial.
    pub async fn send(&self, msg: Message) -> Result<(), SendError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(SendError::NotConnected);
        }

        let json = msg.to_json()?;

        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(SendError::NotConnected)?;

        let write = tokio::time::timeout(self.cfg.write_timeout, sink.send(WsMessage::Text(json)));
        match write.await {
            Ok(Ok(())) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(Err(e)) => {
                drop(writer);
                self.drain_session().await;
                warn!(error = %e, "cloud send error");
                Err(SendError::Write(e.to_string()))
            }
            Err(_) => {
                drop(writer);
                self.drain_session().await;
                Err(SendError::Write(format!(
                    "write timed out after {:?}",
                    self.cfg.write_timeout
                )))
            }
        }
    }

    /// Send one video frame upstream.
    pub async fn send_frame(
        &self,
        width: u32,
        height: u32,
        jpeg: &[u8],
        frame_id: u64,
    ) -> Result<(), SendError> {
        let msg = protocol::new_frame_message(width, height, jpeg, frame_id)
            .map_err(SendError::Encode)?;
        self.send(msg).await
    }

    /// Send the current DOA signal upstream.
    pub async fn send_doa(
        &self,
        angle: f64,
        smoothed_angle: f64,
        speaking: bool,
        speaking_latched: bool,
        confidence: f64,
    ) -> Result<(), SendError> {
        let msg =
            protocol::new_doa_message(angle, smoothed_angle, speaking, speaking_latched, confidence)
                .map_err(SendError::Encode)?;
        self.send(msg).await
    }

    /// Send one chunk of captured microphone audio upstream.
    pub async fn send_mic(
        &self,
        sample_rate: u32,
        channels: u8,
        pcm: &[u8],
    ) -> Result<(), SendError> {
        let msg =
            protocol::new_mic_message(sample_rate, channels, pcm).map_err(SendError::Encode)?;
        self.send(msg).await
    }

    /// Tear down the current session without cancelling the client, so the
    /// connection loop redials.
    async fn drain_session(&self) {
        if let Some(session) = self.session.lock().unwrap().take() {
            session.cancel();
        }
        self.drop_connection().await;
    }

    async fn drop_connection(&self) {
        self.connected.store(false, Ordering::Relaxed);
        let mut writer = self.writer.lock().await;
        if let Some(mut sink) = writer.take() {
            let _ = sink.close().await;
        }
    }

    /// Shut the client down. Idempotent; subsequent sends return
    /// [`SendError::NotConnected`].
    pub async fn close(&self) {
        self.cancel.cancel();
        self.drop_connection().await;
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> CloudStats {
        CloudStats {
            connected: self.connected.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

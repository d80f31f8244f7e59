//! Local WebSocket hub for the DOA stream.
//!
//! The hub periodically pushes the latest tracker result to every attached
//! observer and fires an extra `vad` message on each latched-speech edge.
//! Each observer socket is an independent actor; the broadcast loop never
//! blocks on a slow one (actor mailboxes absorb or the socket is dropped).
//!
//! Observers may send commands back on the socket: `ping` gets a `pong`,
//! `get_stats` a tracker snapshot. Anything else is ignored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actix::prelude::*;
use actix_web_actors::ws;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::doa::tracker::Tracker;

/// Broadcast cadence: 10 Hz.
const BROADCAST_INTERVAL: Duration = Duration::from_millis(100);

/// Hub → session event: either pre-serialized text to forward, or an order
/// to close the socket.
#[derive(Message)]
#[rtype(result = "()")]
enum HubEvent {
    Text(String),
    Close,
}

/// Envelope for every hub → observer message.
#[derive(Serialize)]
struct HubMessage<T: Serialize> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: T,
}

/// Broadcast hub over a fluctuating set of observer sessions.
pub struct Hub {
    tracker: Arc<Tracker>,
    clients: Mutex<HashMap<u64, Recipient<HubEvent>>>,
    next_client_id: AtomicU64,
    cancel: CancellationToken,
}

impl Hub {
    pub fn new(tracker: Arc<Tracker>) -> Self {
        Self {
            tracker,
            clients: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Run the broadcast loop until `cancel` (or [`Hub::close`]) fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(BROADCAST_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_speaking = false;

        info!("websocket hub started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let result = self.tracker.latest();

                    self.broadcast("doa", &result);

                    if result.speaking_latched != last_speaking {
                        self.broadcast(
                            "vad",
                            &json!({
                                "speaking": result.speaking_latched,
                                "angle": result.smoothed_angle,
                            }),
                        );
                        last_speaking = result.speaking_latched;

                        debug!(
                            speaking = result.speaking_latched,
                            angle = result.smoothed_angle,
                            "vad state change"
                        );
                    }
                }
            }
        }

        info!("websocket hub stopped");
    }

    fn broadcast<T: Serialize>(&self, kind: &'static str, data: &T) {
        let text = match serde_json::to_string(&HubMessage { kind, data }) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "hub broadcast marshal error");
                return;
            }
        };

        let clients = self.clients.lock().unwrap();
        for recipient in clients.values() {
            recipient.do_send(HubEvent::Text(text.clone()));
        }
    }

    fn register(&self, recipient: Recipient<HubEvent>) -> u64 {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        self.clients.lock().unwrap().insert(id, recipient);
        id
    }

    fn deregister(&self, id: u64) {
        self.clients.lock().unwrap().remove(&id);
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// Stop broadcasting, close every attached observer and clear the set.
    pub fn close(&self) {
        self.cancel.cancel();

        let mut clients = self.clients.lock().unwrap();
        for recipient in clients.values() {
            recipient.do_send(HubEvent::Close);
        }
        clients.clear();
    }

    fn stats_json(&self) -> serde_json::Value {
        json!(self.tracker.stats())
    }
}

/// One observer socket. Registers itself with the hub on start and
/// deregisters on stop; inbound text frames are treated as commands.
pub struct DoaStreamSession {
    hub: Arc<Hub>,
    id: u64,
}

impl DoaStreamSession {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub, id: 0 }
    }

    fn handle_command(&self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        #[derive(serde::Deserialize)]
        struct Command {
            #[serde(rename = "type")]
            kind: String,
        }

        let Ok(cmd) = serde_json::from_str::<Command>(text) else {
            return;
        };

        match cmd.kind.as_str() {
            "ping" => {
                let reply = HubMessage {
                    kind: "pong",
                    data: Utc::now().timestamp(),
                };
                if let Ok(text) = serde_json::to_string(&reply) {
                    ctx.text(text);
                }
            }
            "get_stats" => {
                let reply = HubMessage {
                    kind: "stats",
                    data: self.hub.stats_json(),
                };
                if let Ok(text) = serde_json::to_string(&reply) {
                    ctx.text(text);
                }
            }
            // Unknown commands are silently ignored.
            _ => {}
        }
    }
}

impl Actor for DoaStreamSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.id = self.hub.register(ctx.address().recipient());
        info!(clients = self.hub.client_count(), "websocket client connected");
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.hub.deregister(self.id);
        info!(clients = self.hub.client_count(), "websocket client disconnected");
    }
}

impl Handler<HubEvent> for DoaStreamSession {
    type Result = ();

    fn handle(&mut self, msg: HubEvent, ctx: &mut Self::Context) {
        match msg {
            HubEvent::Text(text) => ctx.text(text),
            HubEvent::Close => {
                ctx.close(None);
                ctx.stop();
            }
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for DoaStreamSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => self.handle_command(&text, ctx),
            Ok(ws::Message::Ping(payload)) => ctx.pong(&payload),
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "websocket protocol error");
                ctx.stop();
            }
        }
    }
}

//! # aurisd — shadow daemon for the robot's microphone array
//!
//! Co-resident with the vendor robot process, aurisd turns raw
//! direction-of-arrival data from the USB-attached XVF3800 DSP into a
//! smoothed, confidence-scored spatial signal, serves it locally over
//! HTTP + WebSocket, and bridges it — along with video frames, microphone
//! audio and remote motor/emotion commands — to the cloud control plane.
//!
//! Component wiring, leaves first:
//!
//! ```text
//! UsbSource → Tracker → { Hub (local WS), CloudClient (outbound) }
//! CloudClient inbound → MotionClient / AudioBridge
//! ```
//!
//! Everything long-lived runs under one cancellation scope and shuts down
//! in reverse order: server, hub, cloud, tracker, source.

mod audio;
mod camera;
mod cloud;
mod config;
mod doa;
mod error;
mod middleware;
mod motion;
mod protocol;
mod server;
mod state;
mod websocket;
mod xvf3800;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::audio::{AudioBridge, BridgeConfig};
use crate::cloud::CloudClient;
use crate::config::{AppConfig, LoggingConfig};
use crate::doa::tracker::Tracker;
use crate::doa::DoaSource;
use crate::error::SendError;
use crate::motion::{MotionClient, MotionConfig};
use crate::state::AppState;
use crate::websocket::Hub;
use crate::xvf3800::{MockSource, UsbSourceConfig};

#[derive(Parser, Debug)]
#[command(name = "aurisd", version, about = "Shadow daemon for the robot microphone array")]
struct Args {
    /// Config file path
    #[arg(long, default_value = "/etc/aurisd/config.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Use the mock DOA source (no hardware required)
    #[arg(long)]
    mock: bool,
}

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let mut cfg = AppConfig::load(Some(&args.config))?;
    if args.debug {
        cfg.logging.level = "debug".to_string();
    }

    init_tracing(&cfg.logging);
    cfg.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        port = cfg.server.port,
        "starting aurisd"
    );

    // One cancellation scope owns every long-lived task.
    let root = CancellationToken::new();

    // DOA source and tracker.
    let source: Arc<dyn DoaSource> = if args.mock {
        info!("using mock DOA source");
        Arc::new(MockSource::with_wave())
    } else {
        xvf3800::new_source_with_fallback(UsbSourceConfig::default())
    };

    info!(
        source = source.name(),
        healthy = source.healthy(),
        "DOA source ready"
    );

    let tracker = Arc::new(Tracker::new(source.clone(), cfg.tracker_config()));
    {
        let tracker = tracker.clone();
        let cancel = root.clone();
        tokio::spawn(async move { tracker.run(cancel).await });
    }

    // Local broadcast hub.
    let hub = Arc::new(Hub::new(tracker.clone()));
    {
        let hub = hub.clone();
        let cancel = root.clone();
        tokio::spawn(async move { hub.run(cancel).await });
    }

    // Cloud link with its collaborators.
    let mut audio_bridge: Option<Arc<AudioBridge>> = None;
    let cloud = if cfg.cloud.enabled {
        let client = Arc::new(CloudClient::new(cfg.cloud_config()));
        let bridge = wire_cloud(&cfg, &client, &tracker, &root);
        audio_bridge = bridge;
        Some(client)
    } else {
        info!("cloud link disabled");
        None
    };

    // HTTP server.
    let app_state = AppState::new(cfg.clone(), tracker.clone(), hub.clone(), cloud.clone());
    let bind_addr = format!("{}:{}", cfg.server.host, cfg.server.port);

    let http_server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::RequestLogging)
            .configure(server::configure)
    })
    .bind(&bind_addr)?
    .run();

    info!(addr = %bind_addr, "HTTP server listening");

    let server_handle = http_server.handle();
    let server_task = tokio::spawn(http_server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "server error"),
                Err(e) => error!(error = %e, "server task error"),
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received, stopping...");
        }
    }

    // Reverse-order teardown: server, hub, cloud, tracker, source.
    server_handle.stop(true).await;
    hub.close();
    if let Some(cloud) = &cloud {
        cloud.close().await;
    }
    if let Some(bridge) = &audio_bridge {
        bridge.stop_capture();
    }
    tracker.stop();
    root.cancel();
    if let Err(e) = source.close().await {
        warn!(error = %e, "source close error");
    }

    info!("aurisd stopped");
    Ok(())
}

/// Connect the cloud client to its collaborators: inbound commands to the
/// motion daemon and the speaker, the tracker's update stream and captured
/// microphone audio outbound. Returns the audio bridge when capture is on.
fn wire_cloud(
    cfg: &AppConfig,
    client: &Arc<CloudClient>,
    tracker: &Arc<Tracker>,
    root: &CancellationToken,
) -> Option<Arc<AudioBridge>> {
    let motion = Arc::new(MotionClient::new(MotionConfig {
        base_url: cfg.motion.base_url.clone(),
        timeout: Duration::from_millis(cfg.motion.timeout_ms),
        rate_limit_hz: cfg.motion.rate_limit_hz,
    }));

    let bridge = Arc::new(AudioBridge::new(BridgeConfig {
        sample_rate: cfg.capture.sample_rate,
        channels: cfg.capture.channels,
        chunk_duration: Duration::from_millis(cfg.capture.chunk_ms),
        playback_cmd: cfg.capture.playback_cmd.clone(),
        capture_cmd: cfg.capture.capture_cmd.clone(),
    }));

    // Inbound motor commands → motion daemon. Callbacks must not block the
    // read task, so each relay runs on its own task.
    let motor_motion = motion.clone();
    client.on_motor_command(move |cmd| {
        let motion = motor_motion.clone();
        tokio::spawn(async move {
            if let Err(e) = motion.set_target(cmd.head, cmd.antennas, cmd.body_yaw).await {
                debug!(error = %e, "motor command relay failed");
            }
        });
    });

    let emotion_motion = motion.clone();
    client.on_emotion_command(move |cmd| {
        let motion = emotion_motion.clone();
        tokio::spawn(async move {
            if let Err(e) = motion.play_emotion(&cmd.name, cmd.duration).await {
                debug!(error = %e, "emotion relay failed");
            }
        });
    });

    // Inbound TTS audio → speaker.
    let speak_bridge = bridge.clone();
    client.on_speak_data(move |data| match data.decode_audio() {
        Ok(pcm) => speak_bridge.play_async(pcm, data.sample_rate),
        Err(e) => warn!(error = %e, "undecodable speak payload"),
    });

    // Remote config updates. With no frame producer wired in, camera
    // settings are only recorded.
    client.on_config_update(move |update| {
        if let Some(camera) = update.camera {
            info!(?camera, "camera settings update received");
        }
    });

    client.connect(root);

    // Tracker updates → cloud, at poll cadence.
    {
        let client = client.clone();
        let cancel = root.clone();
        let mut sub = tracker.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    update = sub.rx.recv() => {
                        let Some(result) = update else { return };
                        let sent = client
                            .send_doa(
                                result.reading.angle,
                                result.smoothed_angle,
                                result.reading.speaking,
                                result.speaking_latched,
                                result.confidence,
                            )
                            .await;
                        match sent {
                            Ok(()) | Err(SendError::NotConnected) => {}
                            Err(e) => debug!(error = %e, "doa forward failed"),
                        }
                    }
                }
            }
        });
    }

    // Captured microphone audio → cloud.
    if cfg.capture.enabled {
        if bridge.is_available() {
            let mic_client = client.clone();
            bridge.on_audio_chunk(move |chunk| {
                let client = mic_client.clone();
                tokio::spawn(async move {
                    let sent = client
                        .send_mic(chunk.sample_rate, chunk.channels, &chunk.data)
                        .await;
                    match sent {
                        Ok(()) | Err(SendError::NotConnected) => {}
                        Err(e) => debug!(error = %e, "mic forward failed"),
                    }
                });
            });
            bridge.start_capture(root);
            return Some(bridge);
        }
        warn!("audio capture enabled but ALSA tools are missing, capture disabled");
    }

    None
}

fn init_tracing(cfg: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("aurisd={},actix_web=info", cfg.level))
    });

    let registry = tracing_subscriber::registry().with(filter);

    if cfg.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Resolves when SIGTERM or SIGINT arrives.
async fn shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}

//! HTTP surface of the daemon.
//!
//! Routes:
//! - `GET /health`               service health
//! - `GET /api/audio/doa`        latest tracker result
//! - `GET /api/audio/doa/stream` WebSocket upgrade to the hub
//! - `GET /api/stats`            tracker statistics
//! - `GET /api/config`           effective configuration (read-only)
//! - `GET /metrics`              Prometheus text metrics

use actix_web::http::header;
use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde_json::json;

use crate::state::AppState;
use crate::websocket::DoaStreamSession;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics))
        .service(
            web::scope("/api")
                .route("/audio/doa", web::get().to(doa))
                .route("/audio/doa/stream", web::get().to(doa_stream))
                .route("/config", web::get().to(config_view))
                .route("/stats", web::get().to(stats)),
        );
}

async fn health(state: web::Data<AppState>) -> HttpResponse {
    let tracker_stats = state.tracker.stats();

    let status = if tracker_stats.source_healthy {
        "ok"
    } else {
        "degraded"
    };

    HttpResponse::Ok().json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.uptime_seconds(),
        "source_healthy": tracker_stats.source_healthy,
    }))
}

async fn doa(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.tracker.latest())
}

async fn stats(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.tracker.stats())
}

async fn config_view(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(&state.config)
}

/// Upgrade to the hub's DOA stream. Plain HTTP requests get a 426 telling
/// the caller what this endpoint is.
async fn doa_stream(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let is_upgrade = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if !is_upgrade {
        return Ok(HttpResponse::build(StatusCode::UPGRADE_REQUIRED).json(json!({
            "error": "WebSocket upgrade required",
            "message": "Connect via WebSocket to receive the DOA stream",
        })));
    }

    ws::start(DoaStreamSession::new(state.hub.clone()), &req, stream)
}

async fn metrics(state: web::Data<AppState>) -> HttpResponse {
    let tracker = state.tracker.stats();
    let requests = state
        .metrics
        .requests
        .load(std::sync::atomic::Ordering::Relaxed);
    let errors = state
        .metrics
        .errors
        .load(std::sync::atomic::Ordering::Relaxed);

    let mut body = format!(
        "# HELP aurisd_doa_angle_radians Current smoothed DOA angle in radians\n\
         # TYPE aurisd_doa_angle_radians gauge\n\
         aurisd_doa_angle_radians {}\n\
         \n\
         # HELP aurisd_speaking Latched speaking state (1=speaking, 0=silent)\n\
         # TYPE aurisd_speaking gauge\n\
         aurisd_speaking {}\n\
         \n\
         # HELP aurisd_doa_confidence DOA confidence score\n\
         # TYPE aurisd_doa_confidence gauge\n\
         aurisd_doa_confidence {}\n\
         \n\
         # HELP aurisd_poll_count Total DOA polls\n\
         # TYPE aurisd_poll_count counter\n\
         aurisd_poll_count {}\n\
         \n\
         # HELP aurisd_poll_errors Total DOA poll errors\n\
         # TYPE aurisd_poll_errors counter\n\
         aurisd_poll_errors {}\n\
         \n\
         # HELP aurisd_avg_latency_ms Average poll latency in milliseconds\n\
         # TYPE aurisd_avg_latency_ms gauge\n\
         aurisd_avg_latency_ms {}\n\
         \n\
         # HELP aurisd_source_healthy DOA source health (1=healthy, 0=unhealthy)\n\
         # TYPE aurisd_source_healthy gauge\n\
         aurisd_source_healthy {}\n\
         \n\
         # HELP aurisd_uptime_seconds Daemon uptime in seconds\n\
         # TYPE aurisd_uptime_seconds gauge\n\
         aurisd_uptime_seconds {}\n\
         \n\
         # HELP aurisd_websocket_clients Current WebSocket client count\n\
         # TYPE aurisd_websocket_clients gauge\n\
         aurisd_websocket_clients {}\n\
         \n\
         # HELP aurisd_http_requests_total Total HTTP requests served\n\
         # TYPE aurisd_http_requests_total counter\n\
         aurisd_http_requests_total {}\n\
         \n\
         # HELP aurisd_http_errors_total Total HTTP error responses\n\
         # TYPE aurisd_http_errors_total counter\n\
         aurisd_http_errors_total {}\n",
        tracker.current_angle,
        tracker.speaking_latched as u8,
        tracker.current_confidence,
        tracker.poll_count,
        tracker.error_count,
        tracker.avg_latency_ms,
        tracker.source_healthy as u8,
        state.uptime_seconds(),
        state.hub.client_count(),
        requests,
        errors,
    );

    if let Some(cloud) = &state.cloud {
        let cloud_stats = cloud.stats();
        body.push_str(&format!(
            "\n\
             # HELP aurisd_cloud_connected Cloud link state (1=connected)\n\
             # TYPE aurisd_cloud_connected gauge\n\
             aurisd_cloud_connected {}\n\
             \n\
             # HELP aurisd_cloud_messages_sent_total Messages sent to the cloud\n\
             # TYPE aurisd_cloud_messages_sent_total counter\n\
             aurisd_cloud_messages_sent_total {}\n\
             \n\
             # HELP aurisd_cloud_messages_received_total Messages received from the cloud\n\
             # TYPE aurisd_cloud_messages_received_total counter\n\
             aurisd_cloud_messages_received_total {}\n\
             \n\
             # HELP aurisd_cloud_reconnects_total Cloud reconnect attempts\n\
             # TYPE aurisd_cloud_reconnects_total counter\n\
             aurisd_cloud_reconnects_total {}\n",
            cloud_stats.connected as u8,
            cloud_stats.messages_sent,
            cloud_stats.messages_received,
            cloud_stats.reconnects,
        ));
    }

    HttpResponse::Ok()
        .content_type("text/plain; charset=utf-8")
        .body(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::doa::tracker::{Tracker, TrackerConfig};
    use crate::state::AppState;
    use crate::websocket::Hub;
    use crate::xvf3800::MockSource;
    use actix_web::{test, App};
    use std::sync::Arc;

    fn test_state(source: Arc<MockSource>) -> AppState {
        let tracker = Arc::new(Tracker::new(source, TrackerConfig::default()));
        let hub = Arc::new(Hub::new(tracker.clone()));
        AppState::new(AppConfig::default(), tracker, hub, None)
    }

    macro_rules! test_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state))
                    .configure(configure),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_health_reports_ok() {
        let app = test_app!(test_state(Arc::new(MockSource::new())));

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "ok");
        assert_eq!(body["source_healthy"], true);
        assert!(body["version"].is_string());
        assert!(body["uptime_seconds"].is_u64());
    }

    #[actix_web::test]
    async fn test_health_degrades_with_source() {
        let source = Arc::new(MockSource::new());
        source.set_healthy(false);
        let app = test_app!(test_state(source));

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "degraded");
        assert_eq!(body["source_healthy"], false);
    }

    #[actix_web::test]
    async fn test_doa_returns_latest_result() {
        let app = test_app!(test_state(Arc::new(MockSource::new())));

        let req = test::TestRequest::get().uri("/api/audio/doa").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert!(body["angle"].is_number());
        assert!(body["smoothed_angle"].is_number());
        assert!(body["confidence"].is_number());
        assert!(body["speaking_latched"].is_boolean());
    }

    #[actix_web::test]
    async fn test_stats_endpoint() {
        let app = test_app!(test_state(Arc::new(MockSource::new())));

        let req = test::TestRequest::get().uri("/api/stats").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["poll_count"], 0);
        assert_eq!(body["source_healthy"], true);
        assert_eq!(body["subscriber_count"], 0);
    }

    #[actix_web::test]
    async fn test_config_endpoint_is_effective_config() {
        let app = test_app!(test_state(Arc::new(MockSource::new())));

        let req = test::TestRequest::get().uri("/api/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["server"]["port"], 9000);
        assert_eq!(body["audio"]["poll_hz"], 20);
    }

    #[actix_web::test]
    async fn test_metrics_text_format() {
        let app = test_app!(test_state(Arc::new(MockSource::new())));

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        assert!(resp
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/plain"));

        let body = test::read_body(resp).await;
        let text = std::str::from_utf8(&body).unwrap();
        assert!(text.contains("# HELP aurisd_doa_angle_radians"));
        assert!(text.contains("# TYPE aurisd_poll_count counter"));
        assert!(text.contains("aurisd_source_healthy 1"));
    }

    #[actix_web::test]
    async fn test_stream_endpoint_requires_upgrade() {
        let app = test_app!(test_state(Arc::new(MockSource::new())));

        let req = test::TestRequest::get()
            .uri("/api/audio/doa/stream")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UPGRADE_REQUIRED);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert!(body["error"].is_string());
        assert!(body["message"].is_string());
    }
}

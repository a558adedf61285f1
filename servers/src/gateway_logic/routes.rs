//! # Gateway Routes
//!
//! The HTTP surface of the gateway. Everything here is a thin adapter: the
//! handlers translate axum extractors into calls on [`IngestionServices`] and
//! the websocket handlers hand the upgraded socket to the library's session
//! drivers through [`super::ws::split_text`].
//!
//! ## Endpoints:
//! - `GET /health`: plain "OK" for simple uptime checkers.
//! - `GET /health/live`: liveness report, 503 when a check fails.
//! - `GET /health/ready`: readiness report, 503 while degraded.
//! - `GET /status`: breaker, subscriber and activity snapshot.
//! - `GET /ws/device`: device ingestion websocket.
//! - `GET /ws/dashboard`: dashboard subscription websocket.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{ConnectInfo, Request, State, WebSocketUpgrade},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use tower_http::cors::{Any, CorsLayer};

use lib_fusion::core::{ActivityKind, HealthReport};
use lib_fusion::{IngestionServices, run_dashboard_session, run_device_session};

use super::ws::split_text;

type SharedServices = Arc<IngestionServices>;

pub fn router(services: SharedServices) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .route("/status", get(status_handler))
        .route("/ws/device", get(device_ws_handler))
        .route("/ws/dashboard", get(dashboard_ws_handler))
        .layer(middleware::from_fn_with_state(Arc::clone(&services), track_http_request))
        .layer(cors)
        .with_state(services)
}

/// Counts the request as in-flight HTTP activity until its response is built.
async fn track_http_request(State(services): State<SharedServices>, req: Request, next: Next) -> Response {
    let _slot = services.shutdown.track(ActivityKind::HttpRequest);
    next.run(req).await
}

async fn health_handler() -> &'static str {
    "OK"
}

fn report_response(report: HealthReport) -> Response {
    let code = if report.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report)).into_response()
}

async fn liveness_handler(State(services): State<SharedServices>) -> Response {
    report_response(services.liveness().await)
}

async fn readiness_handler(State(services): State<SharedServices>) -> Response {
    report_response(services.readiness().await)
}

async fn status_handler(State(services): State<SharedServices>) -> impl IntoResponse {
    Json(services.status())
}

fn refuse_during_shutdown() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response()
}

/// # Device WebSocket Upgrade
///
/// Refuses new devices once shutdown has begun; otherwise upgrades and runs
/// the ingestion session on the socket.
async fn device_ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(services): State<SharedServices>,
) -> Response {
    if services.shutdown.is_shutting_down() {
        return refuse_during_shutdown();
    }
    ws.on_upgrade(move |socket| async move {
        tracing::info!(peer = %addr, "device connected");
        let (inbound, outbound) = split_text(socket);
        run_device_session(services, inbound, outbound).await;
        tracing::info!(peer = %addr, "device disconnected");
    })
}

async fn dashboard_ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(services): State<SharedServices>,
) -> Response {
    if services.shutdown.is_shutting_down() {
        return refuse_during_shutdown();
    }
    ws.on_upgrade(move |socket| async move {
        tracing::info!(peer = %addr, "dashboard connected");
        let (inbound, outbound) = split_text(socket);
        run_dashboard_session(services, inbound, outbound).await;
        tracing::info!(peer = %addr, "dashboard disconnected");
    })
}

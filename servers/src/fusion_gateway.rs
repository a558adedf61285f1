//! # Fusion Sensor Gateway
//!
//! The ingestion server. Devices stream fusion samples over `/ws/device`,
//! dashboards watch them live over `/ws/dashboard`, and probes hit the
//! `/health*` and `/status` endpoints.
//!
//! ## Core Responsibilities:
//! - **Storage:** PostgreSQL when `DATABASE_URL` is set, otherwise an
//!   in-memory store that is lost on restart.
//! - **Metrics:** A Redis hash when `REDIS_URL` is set, otherwise the log.
//! - **Load Reporting:** A maintenance task feeds the websocket load into the
//!   adaptive rate limiter and prunes idle rate-limit windows.
//! - **Lifecycle:** On `CTRL+C` or `SIGTERM` the shutdown coordinator stops
//!   the listener, drains in-flight work and closes the store pool.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum_server::tls_rustls::RustlsConfig;

use lib_fusion::connections::{PgSampleStore, RedisMetricsSink};
use lib_fusion::core::{ActivityKind, MetricsSink, TracingMetricsSink};
use lib_fusion::{IngestionServices, MemoryStore, SampleStore};

mod gateway_logic;
use gateway_logic::{config, logger, routes, signals};

const DB_POOL_SIZE: u32 = 10;
const METRICS_KEY: &str = "fusion_gateway:metrics";
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Rustls 0.23+ requires an explicit crypto provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = config::load_config()?;
    let _log_guard = logger::setup_logging(&config.log_dir(), config.log_level())?;
    tracing::info!(port = config.port(), "fusion gateway booting");

    // --- Storage ---
    let mut pg_store: Option<Arc<PgSampleStore>> = None;
    let store: Arc<dyn SampleStore> = match &config.database_url {
        Some(url) => {
            let pg = Arc::new(PgSampleStore::connect(url, DB_POOL_SIZE).await?);
            pg.ensure_schema().await?;
            tracing::info!("using PostgreSQL sample store");
            pg_store = Some(Arc::clone(&pg));
            pg
        }
        None => {
            tracing::warn!("DATABASE_URL not set, samples are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    // --- Metrics ---
    let metrics: Arc<dyn MetricsSink> = match &config.redis_url {
        Some(url) => match connect_metrics(url).await {
            Ok(sink) => {
                tracing::info!(key = METRICS_KEY, "publishing metrics to Redis");
                Arc::new(sink)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Redis unavailable, metrics go to the log");
                Arc::new(TracingMetricsSink)
            }
        },
        None => Arc::new(TracingMetricsSink),
    };

    let services = IngestionServices::with_metrics(store, metrics, config.services_config());
    let coordinator = Arc::clone(&services.shutdown);

    spawn_maintenance(Arc::clone(&services), config.max_connections());

    // --- Shutdown wiring ---
    let handle = axum_server::Handle::new();
    let drain_timeout = config.services_config().shutdown.drain_timeout;

    let listener_handle = handle.clone();
    coordinator.register_hook("stop_accepting", move || async move {
        listener_handle.graceful_shutdown(Some(drain_timeout));
        Ok(())
    });

    if let Some(pg) = pg_store {
        coordinator.register_cleanup("close_store_pool", move || async move {
            pg.close().await;
            Ok(())
        });
    }

    let signal_coordinator = Arc::clone(&coordinator);
    tokio::spawn(async move {
        signals::shutdown_signal().await;
        if let Some(report) = signal_coordinator.shutdown().await {
            tracing::info!(
                drained = report.drained,
                remaining_http = report.remaining_http_requests,
                remaining_ws = report.remaining_websocket_connections,
                hook_failures = report.hook_failures.len(),
                elapsed_ms = report.elapsed_ms,
                "shutdown sequence finished"
            );
            for (name, outcome) in &report.cleanups {
                tracing::info!(cleanup = %name, outcome = ?outcome, "cleanup result");
            }
        }
    });

    // --- Serve ---
    let app = routes::router(Arc::clone(&services));
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port()));
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    match config.tls_paths() {
        Some((cert_path, key_path)) => {
            tracing::info!(cert = %cert_path.display(), "loading TLS certificates");
            let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
                .await
                .map_err(|e| anyhow::anyhow!("TLS Configuration Error: {}", e))?;
            tracing::info!("gateway live at https://{}", addr);
            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(make_service)
                .await?;
        }
        None => {
            tracing::info!("gateway live at http://{}", addr);
            axum_server::bind(addr).handle(handle).serve(make_service).await?;
        }
    }

    coordinator.wait_complete().await;
    tracing::info!("Shutdown complete.");
    Ok(())
}

/// # Maintenance Task
///
/// ## Logic:
/// 1.  Every tick, reports `active websockets / max_connections` as the
///     system load for the adaptive rate limit.
/// 2.  Drops rate-limit windows that have gone idle.
/// 3.  Stops when shutdown begins.
fn spawn_maintenance(services: Arc<IngestionServices>, max_connections: usize) {
    let token = services.shutdown.token();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let active = services.shutdown.active(ActivityKind::WebsocketConnection);
                    services.limiter.report_load(active as f64 / max_connections as f64);
                    let pruned = services.limiter.prune_idle();
                    if pruned > 0 {
                        tracing::debug!(pruned, "pruned idle rate-limit windows");
                    }
                }
            }
        }
    });
}

/// Connects the Redis metrics sink and checks it answers before using it.
async fn connect_metrics(url: &str) -> Result<RedisMetricsSink> {
    let sink = RedisMetricsSink::connect(url, METRICS_KEY).await?;
    sink.ping().await?;
    Ok(sink)
}

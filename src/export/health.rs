use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus self-telemetry for the collector core.
///
/// All metrics use the "traceloom" namespace. These describe the
/// collector's own health; the product metrics it aggregates flow through
/// the storage seam instead.
#[derive(Debug)]
pub struct CollectorMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Records told to a worker group, by role.
    pub records_received: CounterVec,
    /// Records rejected or lost on tell, by role.
    pub records_dropped: CounterVec,
    /// Inbound remote messages dropped as undecodable or unroutable.
    pub remote_dropped: Counter,
    /// Persistence cycle ticks executed.
    pub persistence_ticks: Counter,
    /// Per-worker prepare failures and failed batch writes.
    pub persistence_errors: Counter,
    /// End-to-end duration of one persistence tick.
    pub batch_write_duration: Histogram,
    /// Requests per submitted batch.
    pub batch_size: Histogram,
}

impl CollectorMetrics {
    /// Creates the metrics set and registers it with a fresh registry.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let records_received = CounterVec::new(
            Opts::new("records_received_total", "Records told to a worker group.")
                .namespace("traceloom"),
            &["role"],
        )?;
        let records_dropped = CounterVec::new(
            Opts::new(
                "records_dropped_total",
                "Records rejected or lost on tell.",
            )
            .namespace("traceloom"),
            &["role"],
        )?;
        let remote_dropped = Counter::with_opts(
            Opts::new(
                "remote_messages_dropped_total",
                "Inbound remote messages dropped as undecodable or unroutable.",
            )
            .namespace("traceloom"),
        )?;
        let persistence_ticks = Counter::with_opts(
            Opts::new(
                "persistence_ticks_total",
                "Persistence cycle ticks executed.",
            )
            .namespace("traceloom"),
        )?;
        let persistence_errors = Counter::with_opts(
            Opts::new(
                "persistence_errors_total",
                "Per-worker prepare failures and failed batch writes.",
            )
            .namespace("traceloom"),
        )?;
        let batch_write_duration = Histogram::with_opts(
            HistogramOpts::new(
                "batch_write_duration_seconds",
                "End-to-end duration of one persistence tick.",
            )
            .namespace("traceloom")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let batch_size = Histogram::with_opts(
            HistogramOpts::new("batch_size", "Requests per submitted batch.")
                .namespace("traceloom")
                .buckets(vec![10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 10000.0]),
        )?;

        registry.register(Box::new(records_received.clone()))?;
        registry.register(Box::new(records_dropped.clone()))?;
        registry.register(Box::new(remote_dropped.clone()))?;
        registry.register(Box::new(persistence_ticks.clone()))?;
        registry.register(Box::new(persistence_errors.clone()))?;
        registry.register(Box::new(batch_write_duration.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            records_received,
            records_dropped,
            remote_dropped,
            persistence_ticks,
            persistence_errors,
            batch_write_duration,
            batch_size,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9618"
        } else {
            &self.addr
        };

        // ":port" shorthand binds all interfaces.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "profagg";

/// Prometheus metrics for ingest, aggregation and storage.
///
/// Every metric lives in a private [`Registry`] owned by this struct. The
/// struct is shared as an `Arc` with the components that record into it.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Ingest ===
    /// Currently open agent connections.
    pub connections_active: Gauge,
    /// Agent connections accepted.
    pub connections_total: Counter,
    /// Bytes read from agent connections.
    pub bytes_received: Counter,
    /// Chunks decoded with a valid checksum.
    pub chunks_decoded: Counter,
    /// Encoded chunk size in bytes.
    pub chunk_size_bytes: Histogram,
    /// Fatal decode or protocol errors by error_type.
    pub decode_errors: CounterVec,
    /// Streams that ended with the end-of-stream marker.
    pub streams_completed: Counter,
    /// Streams cut short by an error or disconnect.
    pub streams_aborted: Counter,

    // === Aggregation ===
    /// Open windows across all process groups.
    pub windows_open: Gauge,
    /// Windows finalized by work_type.
    pub windows_finalized: CounterVec,
    /// Windows discarded before finalization.
    pub windows_abandoned: Counter,
    /// Finalized windows skipped because they hold no samples.
    pub windows_empty: Counter,

    // === Storage ===
    /// Windows persisted by work_type.
    pub windows_persisted: CounterVec,
    /// Storage failures by error_type and kind (server/client).
    pub store_errors: CounterVec,
    /// Time to persist one window including its summary merge.
    pub store_duration: HistogramVec,

    // === Coordination ===
    /// Whether this node holds leadership (1=yes, 0=no).
    pub is_leader: Gauge,
}

fn counter(name: &str, help: &str) -> prometheus::Result<Counter> {
    Counter::with_opts(Opts::new(name, help).namespace(NAMESPACE))
}

fn gauge(name: &str, help: &str) -> prometheus::Result<Gauge> {
    Gauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> prometheus::Result<CounterVec> {
    CounterVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let connections_active = gauge("connections_active", "Currently open agent connections.")?;
        let connections_total = counter("connections_total", "Agent connections accepted.")?;
        let bytes_received = counter(
            "bytes_received_total",
            "Bytes read from agent connections.",
        )?;
        let chunks_decoded = counter(
            "chunks_decoded_total",
            "Recording chunks decoded with a valid checksum.",
        )?;
        let chunk_size_bytes = Histogram::with_opts(
            HistogramOpts::new("chunk_size_bytes", "Encoded recording chunk size.")
                .namespace(NAMESPACE)
                .buckets(vec![
                    256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262_144.0, 1_048_576.0,
                ]),
        )?;
        let decode_errors = counter_vec(
            "decode_errors_total",
            "Fatal decode or protocol errors by error_type.",
            &["error_type"],
        )?;
        let streams_completed = counter(
            "streams_completed_total",
            "Recording streams that ended with the end-of-stream marker.",
        )?;
        let streams_aborted = counter(
            "streams_aborted_total",
            "Recording streams cut short by an error or disconnect.",
        )?;

        let windows_open = gauge("windows_open", "Open aggregation windows.")?;
        let windows_finalized = counter_vec(
            "windows_finalized_total",
            "Aggregation windows finalized by work_type.",
            &["work_type"],
        )?;
        let windows_abandoned = counter(
            "windows_abandoned_total",
            "Aggregation windows discarded before finalization.",
        )?;
        let windows_empty = counter(
            "windows_empty_total",
            "Finalized windows skipped because they hold no samples.",
        )?;

        let windows_persisted = counter_vec(
            "windows_persisted_total",
            "Aggregation windows persisted by work_type.",
            &["work_type"],
        )?;
        let store_errors = counter_vec(
            "store_errors_total",
            "Storage failures by error_type and kind.",
            &["error_type", "kind"],
        )?;
        let store_duration = HistogramVec::new(
            HistogramOpts::new(
                "store_duration_seconds",
                "Time to persist one window including its summary merge.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["backend"],
        )?;

        let is_leader = gauge(
            "is_leader",
            "Whether this node holds leadership (1=yes, 0=no).",
        )?;

        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(bytes_received.clone()))?;
        registry.register(Box::new(chunks_decoded.clone()))?;
        registry.register(Box::new(chunk_size_bytes.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;
        registry.register(Box::new(streams_completed.clone()))?;
        registry.register(Box::new(streams_aborted.clone()))?;
        registry.register(Box::new(windows_open.clone()))?;
        registry.register(Box::new(windows_finalized.clone()))?;
        registry.register(Box::new(windows_abandoned.clone()))?;
        registry.register(Box::new(windows_empty.clone()))?;
        registry.register(Box::new(windows_persisted.clone()))?;
        registry.register(Box::new(store_errors.clone()))?;
        registry.register(Box::new(store_duration.clone()))?;
        registry.register(Box::new(is_leader.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            connections_active,
            connections_total,
            bytes_received,
            chunks_decoded,
            chunk_size_bytes,
            decode_errors,
            streams_completed,
            streams_aborted,
            windows_open,
            windows_finalized,
            windows_abandoned,
            windows_empty,
            windows_persisted,
            store_errors,
            store_duration,
            is_leader,
        })
    }

    /// Current metrics in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let bind_addr = normalize_addr(&self.addr);

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });
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

/// Expand the ":port" shorthand to all interfaces. Empty means ":9090".
pub(crate) fn normalize_addr(addr: &str) -> String {
    let addr = if addr.is_empty() { ":9090" } else { addr };
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
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

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_addr() {
        assert_eq!(normalize_addr(""), "0.0.0.0:9090");
        assert_eq!(normalize_addr(":9191"), "0.0.0.0:9191");
        assert_eq!(normalize_addr("127.0.0.1:1"), "127.0.0.1:1");
    }

    #[test]
    fn test_metrics_are_namespaced_and_private() {
        let a = HealthMetrics::new(":0").unwrap();
        let b = HealthMetrics::new(":0").unwrap();
        a.chunks_decoded.inc();
        a.decode_errors
            .with_label_values(&["checksum_mismatch"])
            .inc();

        let text = a.render().unwrap();
        assert!(text.contains("profagg_chunks_decoded_total 1"));
        assert!(text.contains("error_type=\"checksum_mismatch\""));
        assert!(b.render().unwrap().contains("profagg_chunks_decoded_total 0"));
    }

    #[tokio::test]
    async fn test_server_starts_and_stops() {
        let health = HealthMetrics::new("127.0.0.1:0").unwrap();
        health.start().await.unwrap();
        health.stop().await.unwrap();
    }
}

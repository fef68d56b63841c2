use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "hazardwatch";

/// Prometheus metrics for pipeline health.
///
/// Per-consumer series carry a `consumer` label ("ingestion" or "feedback").
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Consumers ===
    /// Messages received by consumer.
    pub messages_received: CounterVec,
    /// Messages whose body failed to decode, by consumer.
    pub message_decode_errors: CounterVec,
    /// Messages delivered after the processor closed, by consumer.
    pub messages_after_close: CounterVec,
    /// Batches processed by consumer.
    pub batches_processed: CounterVec,
    /// Batch processing duration by consumer.
    pub batch_duration: HistogramVec,
    /// Failed checkpoint attempts by consumer.
    pub checkpoint_errors: CounterVec,
    /// Partitions currently open by consumer.
    pub partitions_open: GaugeVec,
    /// Messages rejected at intake because the partition queue was full.
    pub intake_rejected: CounterVec,

    // === Aggregate store ===
    /// Conditional writes rejected because the dataset changed.
    pub merge_conflicts: Counter,
    /// Batches whose merge failed after all retries.
    pub merge_failures: Counter,
    /// Batches written to the dead-letter area.
    pub dead_lettered_batches: Counter,
    /// Locations in the aggregate dataset as of the last read or write.
    pub locations_tracked: Gauge,

    // === Feedback ===
    /// Feedback payloads delivered to devices.
    pub feedback_sent: Counter,
    /// Feedback payloads that failed to send.
    pub feedback_send_errors: Counter,

    // === Rules ===
    /// Failures regenerating the enabled-rules projection.
    pub rule_projection_errors: Counter,
}

fn counter(name: &str, help: &str) -> Result<Counter> {
    Ok(Counter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?)
}

fn consumer_counter(name: &str, help: &str) -> Result<CounterVec> {
    Ok(CounterVec::new(
        Opts::new(name, help).namespace(NAMESPACE),
        &["consumer"],
    )?)
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let messages_received =
            consumer_counter("messages_received_total", "Total messages received.")?;
        let message_decode_errors = consumer_counter(
            "message_decode_errors_total",
            "Total messages whose body failed to decode.",
        )?;
        let messages_after_close = consumer_counter(
            "messages_after_close_total",
            "Total messages delivered after the processor closed.",
        )?;
        let batches_processed =
            consumer_counter("batches_processed_total", "Total batches processed.")?;
        let batch_duration = HistogramVec::new(
            HistogramOpts::new(
                "batch_duration_seconds",
                "Time to process one batch of messages.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["consumer"],
        )?;
        let checkpoint_errors = consumer_counter(
            "checkpoint_errors_total",
            "Total failed checkpoint attempts.",
        )?;
        let partitions_open = GaugeVec::new(
            Opts::new("partitions_open", "Number of partitions currently open.")
                .namespace(NAMESPACE),
            &["consumer"],
        )?;
        let intake_rejected = consumer_counter(
            "intake_rejected_total",
            "Total messages rejected because the partition queue was full.",
        )?;

        let merge_conflicts = counter(
            "merge_conflicts_total",
            "Total aggregate writes rejected because the dataset changed.",
        )?;
        let merge_failures = counter(
            "merge_failures_total",
            "Total batches whose merge failed after all retries.",
        )?;
        let dead_lettered_batches = counter(
            "dead_lettered_batches_total",
            "Total batches written to the dead-letter area.",
        )?;
        let locations_tracked = Gauge::with_opts(
            Opts::new(
                "locations_tracked",
                "Number of locations in the aggregate dataset.",
            )
            .namespace(NAMESPACE),
        )?;

        let feedback_sent = counter(
            "feedback_sent_total",
            "Total feedback payloads delivered to devices.",
        )?;
        let feedback_send_errors = counter(
            "feedback_send_errors_total",
            "Total feedback payloads that failed to send.",
        )?;

        let rule_projection_errors = counter(
            "rule_projection_errors_total",
            "Total failures regenerating the enabled-rules projection.",
        )?;

        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(message_decode_errors.clone()))?;
        registry.register(Box::new(messages_after_close.clone()))?;
        registry.register(Box::new(batches_processed.clone()))?;
        registry.register(Box::new(batch_duration.clone()))?;
        registry.register(Box::new(checkpoint_errors.clone()))?;
        registry.register(Box::new(partitions_open.clone()))?;
        registry.register(Box::new(intake_rejected.clone()))?;
        registry.register(Box::new(merge_conflicts.clone()))?;
        registry.register(Box::new(merge_failures.clone()))?;
        registry.register(Box::new(dead_lettered_batches.clone()))?;
        registry.register(Box::new(locations_tracked.clone()))?;
        registry.register(Box::new(feedback_sent.clone()))?;
        registry.register(Box::new(feedback_send_errors.clone()))?;
        registry.register(Box::new(rule_projection_errors.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            messages_received,
            message_decode_errors,
            messages_after_close,
            batches_processed,
            batch_duration,
            checkpoint_errors,
            partitions_open,
            intake_rejected,
            merge_conflicts,
            merge_failures,
            dead_lettered_batches,
            locations_tracked,
            feedback_sent,
            feedback_send_errors,
            rule_projection_errors,
        })
    }

    /// Render all registered metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let bind_addr = bind_address(&self.addr, ":9090");

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

/// Resolve a listen address, expanding the ":port" shorthand to all interfaces.
pub fn bind_address(addr: &str, fallback: &str) -> String {
    let addr = if addr.is_empty() { fallback } else { addr };

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

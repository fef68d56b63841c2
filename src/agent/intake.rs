//! HTTP intake: accepts raw device events and feeds the partition pumps.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::consumer::EventMessage;
use crate::export::health::{bind_address, HealthMetrics};

/// Which stream an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Telemetry,
    Positions,
}

impl Stream {
    /// Consumer label of the stream.
    pub fn consumer(&self) -> &'static str {
        match self {
            Self::Telemetry => "ingestion",
            Self::Positions => "feedback",
        }
    }
}

/// Why an event was not enqueued.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntakeRejection {
    #[error("unknown partition {partition}")]
    UnknownPartition { partition: String },

    #[error("empty event body")]
    EmptyBody,

    #[error("partition {partition} queue is full")]
    Full { partition: String },

    #[error("partition {partition} is not consuming")]
    Closed { partition: String },
}

impl IntakeRejection {
    fn status(&self) -> StatusCode {
        match self {
            Self::UnknownPartition { .. } => StatusCode::NOT_FOUND,
            Self::EmptyBody => StatusCode::BAD_REQUEST,
            Self::Full { .. } | Self::Closed { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Sender side of one partition, numbering events in arrival order.
pub struct PartitionFeed {
    partition: String,
    tx: mpsc::Sender<EventMessage>,
    next_offset: parking_lot::Mutex<u64>,
}

impl PartitionFeed {
    pub fn new(partition: impl Into<String>, tx: mpsc::Sender<EventMessage>) -> Self {
        Self {
            partition: partition.into(),
            tx,
            next_offset: parking_lot::Mutex::new(0),
        }
    }

    /// Enqueue one event without waiting. Returns the offset assigned.
    pub fn offer(&self, body: Vec<u8>) -> Result<String, IntakeRejection> {
        // Held across try_send so offsets follow queue order.
        let mut next = self.next_offset.lock();
        let offset = next.to_string();

        match self.tx.try_send(EventMessage::new(offset.clone(), body)) {
            Ok(()) => {
                *next += 1;
                Ok(offset)
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(IntakeRejection::Full {
                partition: self.partition.clone(),
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(IntakeRejection::Closed {
                partition: self.partition.clone(),
            }),
        }
    }
}

/// All partition feeds of both streams.
#[derive(Default)]
pub struct IntakeFeeds {
    telemetry: HashMap<String, PartitionFeed>,
    positions: HashMap<String, PartitionFeed>,
}

impl IntakeFeeds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, stream: Stream, feed: PartitionFeed) {
        let feeds = match stream {
            Stream::Telemetry => &mut self.telemetry,
            Stream::Positions => &mut self.positions,
        };
        feeds.insert(feed.partition.clone(), feed);
    }

    /// Route one event to its partition.
    pub fn offer(
        &self,
        stream: Stream,
        partition: &str,
        body: Vec<u8>,
    ) -> Result<String, IntakeRejection> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(IntakeRejection::EmptyBody);
        }

        let feeds = match stream {
            Stream::Telemetry => &self.telemetry,
            Stream::Positions => &self.positions,
        };
        let feed = feeds
            .get(partition)
            .ok_or_else(|| IntakeRejection::UnknownPartition {
                partition: partition.to_string(),
            })?;
        feed.offer(body)
    }
}

#[derive(Serialize)]
struct Accepted {
    partition: String,
    offset: String,
}

struct AppState {
    feeds: IntakeFeeds,
    health: Option<Arc<HealthMetrics>>,
}

/// Intake HTTP server.
pub struct IntakeServer {
    addr: String,
    state: Arc<AppState>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

impl IntakeServer {
    pub fn new(addr: &str, feeds: IntakeFeeds, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            addr: addr.to_string(),
            state: Arc::new(AppState { feeds, health }),
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Bind and serve in the background. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = bind_address(&self.addr, ":8080");

        let app = Router::new()
            .route("/ingest/telemetry/:partition", post(telemetry_handler))
            .route("/ingest/positions/:partition", post(positions_handler))
            .with_state(Arc::clone(&self.state));

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "intake server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "intake server error");
            }
        });

        Ok(local_addr)
    }

    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

async fn telemetry_handler(
    State(state): State<Arc<AppState>>,
    Path(partition): Path<String>,
    body: Bytes,
) -> Response {
    enqueue(&state, Stream::Telemetry, partition, body)
}

async fn positions_handler(
    State(state): State<Arc<AppState>>,
    Path(partition): Path<String>,
    body: Bytes,
) -> Response {
    enqueue(&state, Stream::Positions, partition, body)
}

fn enqueue(state: &AppState, stream: Stream, partition: String, body: Bytes) -> Response {
    match state.feeds.offer(stream, &partition, body.to_vec()) {
        Ok(offset) => {
            debug!(consumer = stream.consumer(), partition = %partition, offset = %offset, "event accepted");
            (StatusCode::ACCEPTED, Json(Accepted { partition, offset })).into_response()
        }
        Err(rejection) => {
            if let (IntakeRejection::Full { .. }, Some(health)) = (&rejection, &state.health) {
                health
                    .intake_rejected
                    .with_label_values(&[stream.consumer()])
                    .inc();
            }
            warn!(
                consumer = stream.consumer(),
                partition = %partition,
                reason = %rejection,
                "event rejected",
            );
            (rejection.status(), rejection.to_string()).into_response()
        }
    }
}

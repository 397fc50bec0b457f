//! Event-stream endpoints.
//!
//! Every connection gets its own worker task with a bounded delivery queue.
//! The worker forwards bus events into the queue, emits a ping every 30
//! seconds, and on overflow sends a final `resync` and closes so the
//! subscriber re-enters catch-up. Dropping the response body stops the
//! worker and releases its bus subscription.

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::header::{self, HeaderName};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Duration, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use ctxmesh_types::{ContextEvent, ContextId, StreamEvent};

use crate::error::ApiError;
use crate::state::AppState;

/// Keep-alive cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Bound of each subscriber's delivery queue.
const SUBSCRIBER_QUEUE: usize = 64;

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    #[serde(rename = "serverType")]
    server_type: Option<String>,
    #[serde(rename = "nodeId")]
    node_id: Option<String>,
}

/// `GET /contexts/stream` - every context mutation on this node.
pub async fn all_contexts_stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    info!(
        server_type = query.server_type.as_deref().unwrap_or("unknown"),
        node_id = query.node_id.as_deref().unwrap_or("unknown"),
        "stream subscriber attached"
    );
    sse_response(subscribe(&state, None))
}

/// `GET /contexts/{id}/stream` - one context, closing after its delete.
pub async fn per_context_stream(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = ContextId::new(raw_id)?;
    debug!(context_id = %id, "per-context stream subscriber attached");
    Ok(sse_response(subscribe(&state, Some(id))))
}

/// Spawn the delivery worker for one subscriber.
fn subscribe(state: &AppState, filter: Option<ContextId>) -> mpsc::Receiver<StreamEvent> {
    let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
    let mut bus_rx = state.bus.subscribe();
    let metrics = state.metrics.clone();
    metrics.stream_subscribers.inc();

    tokio::spawn(async move {
        let _ = tx.send(StreamEvent::connected()).await;
        let mut ping = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);

        loop {
            tokio::select! {
                _ = tx.closed() => break,
                _ = ping.tick() => {
                    if tx.send(StreamEvent::ping()).await.is_err() {
                        break;
                    }
                }
                received = bus_rx.recv() => match received {
                    Ok(event) => {
                        if let Some(wanted) = &filter {
                            if event.context_id() != wanted {
                                continue;
                            }
                        }
                        let closes_stream =
                            filter.is_some() && matches!(event, ContextEvent::Deleted { .. });
                        metrics.stream_events_total.inc();
                        if tx.send(StreamEvent::from_context_event(event)).await.is_err() {
                            break;
                        }
                        if closes_stream {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "stream subscriber overflowed; requesting resync");
                        let _ = tx.send(StreamEvent::resync()).await;
                        break;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        metrics.stream_subscribers.dec();
        debug!("stream subscriber released");
    });

    rx
}

/// Wrap a delivery queue into the event-stream response.
fn sse_response(rx: mpsc::Receiver<StreamEvent>) -> impl IntoResponse {
    let stream = ReceiverStream::new(rx).filter_map(|event| match serde_json::to_string(&event) {
        Ok(json) => Some(Ok::<_, Infallible>(Event::default().data(json))),
        Err(err) => {
            warn!(error = %err, "dropping unserializable stream event");
            None
        }
    });

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(stream),
    )
}

//! The backpressure-propagating pipeline between the converter and the
//! client socket.
//!
//! The producer task feeds framed events into a small bounded channel; the
//! HTTP body stream drains it only as fast as the client socket accepts
//! writes. When the channel is full the producer blocks in `send`, which
//! stops reads from the backend. Backpressure propagates end-to-end with no
//! unbounded buffering in between. A prior design that read greedily into an
//! unbounded queue truncated streams mid-flight; don't reintroduce one.

use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::chunk::{BackendChunk, BackendErrorKind, ChunkStream};
use crate::error::ProxyError;
use crate::messages::anthropic::StopReason;
use crate::sse;
use crate::stream::StreamConverter;

/// Frames buffered between producer and socket. With frames well under the
/// 64 KiB buffer bound, this keeps total in-flight memory far below it.
const CHANNEL_FRAMES: usize = 8;

/// Deadlines and cadence for one streamed request.
#[derive(Debug, Clone, Copy)]
pub struct StreamTimeouts {
    /// Budget for the backend's first byte (open + first chunk).
    pub first_byte: Duration,
    /// Total budget for the whole request.
    pub total: Duration,
    /// Heartbeat cadence before the first real event.
    pub keepalive: Duration,
}

impl StreamTimeouts {
    /// Timeouts from the server configuration.
    pub fn from_config(config: &config::ServerConfig) -> Self {
        Self {
            first_byte: config.first_byte_timeout,
            total: config.request_timeout,
            keepalive: Duration::from_secs(10),
        }
    }
}

/// Spawn the producer task and return the frame receiver feeding the
/// response body. `open` resolves to the backend chunk stream; it is awaited
/// inside the pipeline so heartbeats cover the pre-stream wait.
pub fn spawn<F>(
    open: F,
    converter: StreamConverter,
    cancel: CancellationToken,
    timeouts: StreamTimeouts,
) -> mpsc::Receiver<Bytes>
where
    F: Future<Output = Result<ChunkStream, ProxyError>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_FRAMES);
    tokio::spawn(produce(open, converter, tx, cancel, timeouts));
    rx
}

/// Build the SSE response around a frame receiver. `guard` is dropped when
/// the body finishes; the concurrency permit rides here so the slot frees
/// only once the stream is done.
pub fn sse_response<G>(rx: mpsc::Receiver<Bytes>, guard: G) -> Response
where
    G: Send + 'static,
{
    let stream = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        rx.recv().await.map(|frame| (Ok::<_, Infallible>(frame), (rx, guard)))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|error| {
            log::error!("failed to build SSE response: {error}");
            axum::response::IntoResponse::into_response(StatusCode::INTERNAL_SERVER_ERROR)
        })
}

async fn produce<F>(
    open: F,
    mut converter: StreamConverter,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    timeouts: StreamTimeouts,
) where
    F: Future<Output = Result<ChunkStream, ProxyError>> + Send + 'static,
{
    let started = Instant::now();
    let total_deadline = started + timeouts.total;
    let first_byte_deadline = started + timeouts.first_byte;

    let mut keepalive = tokio::time::interval(timeouts.keepalive);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    keepalive.tick().await; // the first tick completes immediately

    tokio::pin!(open);

    // Wait for the backend to open, heartbeating so intermediate hops don't
    // reap the idle connection.
    let mut chunks = loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tx.closed() => {
                cancel.cancel();
                return;
            }
            _ = keepalive.tick() => {
                if tx.send(sse::heartbeat()).await.is_err() {
                    cancel.cancel();
                    return;
                }
            }
            _ = tokio::time::sleep_until(first_byte_deadline.min(total_deadline)) => {
                emit_all(&tx, &cancel, converter.on_chunk(timeout_chunk("no response from backend"))).await;
                return;
            }
            result = &mut open => match result {
                Ok(stream) => break stream,
                Err(error) => {
                    // Headers are already on the wire; the error degrades to
                    // an SSE error event.
                    let events = converter.on_chunk(BackendChunk::Error {
                        kind: open_error_kind(&error),
                        message: error.client_message(),
                    });
                    emit_all(&tx, &cancel, events).await;
                    return;
                }
            },
        }
    };

    if !emit_all(&tx, &cancel, vec![converter.open_event()]).await {
        return;
    }

    let mut first_chunk_seen = false;

    while !converter.finished() {
        let read_deadline = if first_chunk_seen {
            total_deadline
        } else {
            first_byte_deadline.min(total_deadline)
        };

        let chunk = tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tx.closed() => {
                // Client disconnect: cancellation must reach the backend so
                // the upstream socket closes.
                cancel.cancel();
                return;
            }
            _ = tokio::time::sleep_until(read_deadline) => {
                let message = if first_chunk_seen {
                    "total request timeout exceeded"
                } else {
                    "no first byte from backend"
                };
                emit_all(&tx, &cancel, converter.on_chunk(timeout_chunk(message))).await;
                return;
            }
            chunk = chunks.next() => chunk,
        };

        let Some(chunk) = chunk else {
            // Backend closed without a finish chunk; end the message cleanly.
            let events = converter.on_chunk(BackendChunk::Finish {
                reason: StopReason::EndTurn,
                usage: None,
            });
            emit_all(&tx, &cancel, events).await;
            return;
        };

        first_chunk_seen = true;

        if !emit_all(&tx, &cancel, converter.on_chunk(chunk)).await {
            // Client went away: cancel so the backend socket closes too.
            return;
        }
    }
}

/// Send framed events, blocking on a full channel (that block is the
/// backpressure). Returns false and cancels on client disconnect.
async fn emit_all(tx: &mpsc::Sender<Bytes>, cancel: &CancellationToken, events: Vec<crate::messages::anthropic::StreamEvent>) -> bool {
    for event in &events {
        if tx.send(sse::frame_event(event)).await.is_err() {
            cancel.cancel();
            return false;
        }
    }
    true
}

fn timeout_chunk(message: &str) -> BackendChunk {
    BackendChunk::Error {
        kind: BackendErrorKind::Timeout,
        message: message.to_string(),
    }
}

fn open_error_kind(error: &ProxyError) -> BackendErrorKind {
    match error {
        ProxyError::BackendTimeout(_) => BackendErrorKind::Timeout,
        ProxyError::BackendUnreachable(_) | ProxyError::NoHealthyNodes => BackendErrorKind::Unreachable,
        ProxyError::Canceled => BackendErrorKind::Canceled,
        _ => BackendErrorKind::Protocol,
    }
}

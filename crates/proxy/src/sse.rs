//! SSE framing for the client-facing stream.
//!
//! Every event is framed fully (`event: <type>\ndata: <json>\n\n`) before it
//! is handed to the write side; partial frames never reach the socket.

use bytes::Bytes;

use crate::messages::anthropic::StreamEvent;

/// Comment-line keepalive, harmless to SSE parsers. Sent while waiting for
/// the backend's first byte so intermediate HTTP hops don't reap the
/// connection as idle.
pub const HEARTBEAT: &str = ": heartbeat\n\n";

/// Frame one event as SSE bytes: `event:` line, minified JSON `data:` line,
/// blank-line terminator.
pub fn frame_event(event: &StreamEvent) -> Bytes {
    let data = serde_json::to_string(event).unwrap_or_else(|error| {
        log::error!("failed to serialize stream event: {error}");
        r#"{"type":"error","error":{"type":"api_error","message":"serialization failed"}}"#.to_string()
    });

    Bytes::from(format!("event: {}\ndata: {data}\n\n", event.event_name()))
}

/// The heartbeat comment as bytes.
pub fn heartbeat() -> Bytes {
    Bytes::from_static(HEARTBEAT.as_bytes())
}

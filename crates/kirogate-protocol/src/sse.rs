use bytes::Bytes;
use serde::Serialize;

use crate::anthropic::StreamEvent;

/// Render a `data: {...}` frame (OpenAI-style, no event name).
pub fn data_frame<T: Serialize>(value: &T) -> Option<Bytes> {
    let payload = serde_json::to_vec(value).ok()?;
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(b"data: ");
    out.extend_from_slice(&payload);
    out.extend_from_slice(b"\n\n");
    Some(Bytes::from(out))
}

/// Render an `event: name\ndata: {...}` frame for an Anthropic stream event.
pub fn event_frame(event: &StreamEvent) -> Option<Bytes> {
    let payload = serde_json::to_vec(event).ok()?;
    let name = event.name();
    let mut out = Vec::with_capacity(payload.len() + name.len() + 16);
    out.extend_from_slice(b"event: ");
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b"\n");
    out.extend_from_slice(b"data: ");
    out.extend_from_slice(&payload);
    out.extend_from_slice(b"\n\n");
    Some(Bytes::from(out))
}

/// The terminal line of an OpenAI chunked stream.
pub fn done_frame() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

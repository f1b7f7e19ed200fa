use bytes::{Buf, BytesMut};
use serde_json::Value;
use tracing::{debug, warn};

/// Parse errors tolerated per connection before the stream is abandoned.
const MAX_PARSE_ERRORS: u32 = 10;

/// Upper bound on a single frame; anything larger is treated as corruption.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Prelude (12 bytes) plus trailing message CRC (4 bytes).
const FRAME_OVERHEAD: usize = 16;

/// A logical event extracted from the upstream assistant stream.
#[derive(Debug, Clone, PartialEq)]
pub enum AssistantEvent {
    TextDelta(String),
    ToolUseStart { id: String, name: String },
    ToolUseArgsDelta(String),
    ToolUseEnd,
    Usage { input: Option<u32>, output: Option<u32> },
    Stop(StopKind),
    UpstreamError { code: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    EndTurn,
    MaxTokens,
    ToolUse,
}

/// Incremental decoder for the upstream's length-prefixed binary framing.
///
/// Each record carries a 12-byte prelude (total length, header-block length,
/// prelude CRC), a header block whose `:event-type` entry names the event,
/// a JSON payload and a trailing CRC. CRCs are parsed but not verified; a
/// frame that fails to parse counts against the per-connection error budget.
#[derive(Debug)]
pub struct EventStreamDecoder {
    buf: BytesMut,
    parse_errors: u32,
    tool_open: bool,
    tool_used: bool,
    terminated: bool,
}

impl Default for EventStreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            parse_errors: 0,
            tool_open: false,
            tool_used: false,
            terminated: false,
        }
    }

    /// True once the decoder has emitted a terminal event; further input is
    /// ignored.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Whether any tool invocation completed on this stream.
    pub fn tool_was_used(&self) -> bool {
        self.tool_used
    }

    /// Feed a chunk of upstream bytes, returning all events that became
    /// decodable.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<AssistantEvent> {
        if self.terminated {
            return Vec::new();
        }
        self.buf.extend_from_slice(chunk);

        let mut events = Vec::new();
        loop {
            match self.try_frame() {
                FrameStep::NeedMore => break,
                FrameStep::Skipped => {
                    self.parse_errors += 1;
                    if self.parse_errors > MAX_PARSE_ERRORS {
                        warn!(
                            parse_errors = self.parse_errors,
                            "event stream exceeded parse error budget"
                        );
                        events.push(AssistantEvent::UpstreamError {
                            code: "malformed_stream".to_string(),
                            message: "too many malformed event stream records".to_string(),
                        });
                        self.terminated = true;
                        break;
                    }
                }
                FrameStep::Decoded(mut frame_events) => {
                    let fatal = frame_events
                        .iter()
                        .any(|event| matches!(event, AssistantEvent::UpstreamError { .. }));
                    events.append(&mut frame_events);
                    if fatal {
                        self.terminated = true;
                        break;
                    }
                }
            }
        }
        events
    }

    /// Close out the stream. Any residual buffered bytes are dropped; a
    /// partial trailing frame is normal when the upstream closes cleanly.
    pub fn finish(&mut self) -> Vec<AssistantEvent> {
        if !self.buf.is_empty() {
            debug!(residual = self.buf.len(), "discarding partial trailing frame");
            self.buf.clear();
        }
        Vec::new()
    }

    fn try_frame(&mut self) -> FrameStep {
        if self.buf.len() < 12 {
            return FrameStep::NeedMore;
        }

        let total_len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
            as usize;
        let headers_len =
            u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;

        if total_len < FRAME_OVERHEAD
            || total_len > MAX_FRAME_LEN
            || headers_len > total_len - FRAME_OVERHEAD
        {
            // Implausible prelude: resync one byte forward.
            self.buf.advance(1);
            return FrameStep::Skipped;
        }
        if self.buf.len() < total_len {
            return FrameStep::NeedMore;
        }

        let mut frame = self.buf.split_to(total_len);
        frame.advance(12);
        let headers = frame.split_to(headers_len);
        let payload_len = total_len - FRAME_OVERHEAD - headers_len;
        let payload = frame.split_to(payload_len);

        let event_type = match parse_event_type(&headers) {
            Ok(value) => value,
            Err(()) => return FrameStep::Skipped,
        };

        let Ok(text) = std::str::from_utf8(&payload) else {
            // Non-UTF-8 body terminates the stream immediately.
            return FrameStep::Decoded(vec![AssistantEvent::UpstreamError {
                code: "invalid_utf8".to_string(),
                message: "upstream payload is not valid UTF-8".to_string(),
            }]);
        };

        let body: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                debug!(%err, event_type = %event_type.as_deref().unwrap_or("?"), "skipping unparseable payload");
                return FrameStep::Skipped;
            }
        };

        FrameStep::Decoded(self.classify(event_type.as_deref(), &body))
    }

    fn classify(&mut self, event_type: Option<&str>, body: &Value) -> Vec<AssistantEvent> {
        let discriminator = event_type
            .map(|name| name.to_string())
            .or_else(|| discriminator_from_body(body))
            .unwrap_or_default();

        match discriminator.as_str() {
            "assistantResponseEvent" => {
                let payload = body.get("assistantResponseEvent").unwrap_or(body);
                let content = field_str(payload, "content");
                if content.is_empty() {
                    Vec::new()
                } else {
                    vec![AssistantEvent::TextDelta(content)]
                }
            }
            "toolUseEvent" => self.classify_tool_use(body),
            "messageMetadataEvent" => classify_usage(body)
                .map(|event| vec![event])
                .unwrap_or_default(),
            other => classify_error(other, body),
        }
    }

    fn classify_tool_use(&mut self, body: &Value) -> Vec<AssistantEvent> {
        let payload = body.get("toolUseEvent").unwrap_or(body);
        let mut events = Vec::new();

        if !self.tool_open {
            let id = field_str(payload, "toolUseId");
            let name = field_str(payload, "name");
            if id.is_empty() && name.is_empty() {
                return events;
            }
            self.tool_open = true;
            events.push(AssistantEvent::ToolUseStart { id, name });
        }

        let input = field_str(payload, "input");
        if !input.is_empty() {
            events.push(AssistantEvent::ToolUseArgsDelta(input));
        }

        if payload
            .get("stop")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            self.tool_open = false;
            self.tool_used = true;
            events.push(AssistantEvent::ToolUseEnd);
        }
        events
    }
}

#[derive(Debug)]
enum FrameStep {
    NeedMore,
    Skipped,
    Decoded(Vec<AssistantEvent>),
}

/// Walk the frame's header block looking for the `:event-type` entry.
///
/// Header entries are `name_len u8, name, value_type u8, value`; only string
/// values (type 7) are of interest, other value types are skipped by size.
fn parse_event_type(headers: &[u8]) -> Result<Option<String>, ()> {
    let mut cursor = 0usize;
    let mut event_type = None;

    while cursor < headers.len() {
        let name_len = headers[cursor] as usize;
        cursor += 1;
        if cursor + name_len > headers.len() {
            return Err(());
        }
        let name = std::str::from_utf8(&headers[cursor..cursor + name_len]).map_err(|_| ())?;
        cursor += name_len;

        if cursor >= headers.len() {
            return Err(());
        }
        let value_type = headers[cursor];
        cursor += 1;

        match value_type {
            // bool true / bool false carry no value bytes
            0 | 1 => {}
            2 => cursor += 1,
            3 => cursor += 2,
            4 => cursor += 4,
            5 | 8 => cursor += 8,
            6 | 7 => {
                if cursor + 2 > headers.len() {
                    return Err(());
                }
                let len =
                    u16::from_be_bytes([headers[cursor], headers[cursor + 1]]) as usize;
                cursor += 2;
                if cursor + len > headers.len() {
                    return Err(());
                }
                if value_type == 7 && name == ":event-type" {
                    event_type = Some(
                        std::str::from_utf8(&headers[cursor..cursor + len])
                            .map_err(|_| ())?
                            .to_string(),
                    );
                }
                cursor += len;
            }
            9 => cursor += 16,
            _ => return Err(()),
        }
        if cursor > headers.len() {
            return Err(());
        }
    }
    Ok(event_type)
}

fn discriminator_from_body(body: &Value) -> Option<String> {
    let object = body.as_object()?;
    if object.len() == 1 {
        return object.keys().next().cloned();
    }
    None
}

fn field_str(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn classify_usage(body: &Value) -> Option<AssistantEvent> {
    let payload = body.get("messageMetadataEvent").unwrap_or(body);
    let usage = payload.get("usage").unwrap_or(payload);
    let input = usage
        .get("inputTokens")
        .and_then(Value::as_u64)
        .map(|value| value as u32);
    let output = usage
        .get("outputTokens")
        .and_then(Value::as_u64)
        .map(|value| value as u32);
    if input.is_none() && output.is_none() {
        return None;
    }
    Some(AssistantEvent::Usage { input, output })
}

fn classify_error(discriminator: &str, body: &Value) -> Vec<AssistantEvent> {
    let looks_like_error = discriminator.to_ascii_lowercase().contains("exception")
        || body.get("message").is_some() && body.get("__type").is_some();
    if !looks_like_error {
        return Vec::new();
    }

    let message = body
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if message.contains("CONTENT_LENGTH_EXCEEDS_THRESHOLD") {
        return vec![AssistantEvent::Stop(StopKind::MaxTokens)];
    }
    vec![AssistantEvent::UpstreamError {
        code: if discriminator.is_empty() {
            "unknown".to_string()
        } else {
            discriminator.to_string()
        },
        message,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a well-formed frame with a `:event-type` string header.
    fn frame(event_type: &str, payload: &str) -> Vec<u8> {
        let mut headers = Vec::new();
        let name = b":event-type";
        headers.push(name.len() as u8);
        headers.extend_from_slice(name);
        headers.push(7u8);
        headers.extend_from_slice(&(event_type.len() as u16).to_be_bytes());
        headers.extend_from_slice(event_type.as_bytes());

        let total = 12 + headers.len() + payload.len() + 4;
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&(total as u32).to_be_bytes());
        out.extend_from_slice(&(headers.len() as u32).to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&headers);
        out.extend_from_slice(payload.as_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out
    }

    #[test]
    fn decodes_text_delta() {
        let mut decoder = EventStreamDecoder::new();
        let events = decoder.push(&frame("assistantResponseEvent", r#"{"content":"hello"}"#));
        assert_eq!(events, vec![AssistantEvent::TextDelta("hello".to_string())]);
    }

    #[test]
    fn decodes_split_frames() {
        let mut decoder = EventStreamDecoder::new();
        let bytes = frame("assistantResponseEvent", r#"{"content":"ab"}"#);
        let (left, right) = bytes.split_at(7);
        assert!(decoder.push(left).is_empty());
        let events = decoder.push(right);
        assert_eq!(events, vec![AssistantEvent::TextDelta("ab".to_string())]);
    }

    #[test]
    fn tool_use_lifecycle() {
        let mut decoder = EventStreamDecoder::new();
        let mut events = decoder.push(&frame(
            "toolUseEvent",
            r#"{"toolUseId":"t1","name":"get_weather","input":"{\"ci"}"#,
        ));
        events.extend(decoder.push(&frame(
            "toolUseEvent",
            r#"{"toolUseId":"t1","name":"get_weather","input":"ty\":1}","stop":true}"#,
        )));
        assert_eq!(
            events,
            vec![
                AssistantEvent::ToolUseStart {
                    id: "t1".to_string(),
                    name: "get_weather".to_string()
                },
                AssistantEvent::ToolUseArgsDelta("{\"ci".to_string()),
                AssistantEvent::ToolUseArgsDelta("ty\":1}".to_string()),
                AssistantEvent::ToolUseEnd,
            ]
        );
        assert!(decoder.tool_was_used());
    }

    #[test]
    fn usage_metadata() {
        let mut decoder = EventStreamDecoder::new();
        let events = decoder.push(&frame(
            "messageMetadataEvent",
            r#"{"usage":{"inputTokens":12,"outputTokens":34}}"#,
        ));
        assert_eq!(
            events,
            vec![AssistantEvent::Usage {
                input: Some(12),
                output: Some(34)
            }]
        );
    }

    #[test]
    fn content_length_exceeded_maps_to_max_tokens() {
        let mut decoder = EventStreamDecoder::new();
        let events = decoder.push(&frame(
            "internalServerException",
            r#"{"message":"CONTENT_LENGTH_EXCEEDS_THRESHOLD: reduce input"}"#,
        ));
        assert_eq!(events, vec![AssistantEvent::Stop(StopKind::MaxTokens)]);
    }

    #[test]
    fn exception_event_surfaces_error() {
        let mut decoder = EventStreamDecoder::new();
        let events = decoder.push(&frame(
            "throttlingException",
            r#"{"message":"slow down"}"#,
        ));
        assert_eq!(
            events,
            vec![AssistantEvent::UpstreamError {
                code: "throttlingException".to_string(),
                message: "slow down".to_string(),
            }]
        );
        assert!(decoder.is_terminated());
    }

    #[test]
    fn garbage_within_budget_is_skipped() {
        let mut decoder = EventStreamDecoder::new();
        let mut bytes = vec![0xFFu8; 5];
        bytes.extend_from_slice(&frame("assistantResponseEvent", r#"{"content":"ok"}"#));
        let events = decoder.push(&bytes);
        assert_eq!(events, vec![AssistantEvent::TextDelta("ok".to_string())]);
        assert!(!decoder.is_terminated());
    }

    #[test]
    fn garbage_beyond_budget_terminates() {
        let mut decoder = EventStreamDecoder::new();
        let events = decoder.push(&[0xFFu8; 64]);
        assert_eq!(
            events,
            vec![AssistantEvent::UpstreamError {
                code: "malformed_stream".to_string(),
                message: "too many malformed event stream records".to_string(),
            }]
        );
        assert!(decoder.is_terminated());
    }

    #[test]
    fn non_utf8_payload_terminates() {
        let mut headers = Vec::new();
        let name = b":event-type";
        headers.push(name.len() as u8);
        headers.extend_from_slice(name);
        headers.push(7u8);
        let event_type = b"assistantResponseEvent";
        headers.extend_from_slice(&(event_type.len() as u16).to_be_bytes());
        headers.extend_from_slice(event_type);

        let payload = [0xC3u8, 0x28]; // invalid UTF-8 sequence
        let total = 12 + headers.len() + payload.len() + 4;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(total as u32).to_be_bytes());
        bytes.extend_from_slice(&(headers.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&headers);
        bytes.extend_from_slice(&payload);
        bytes.extend_from_slice(&0u32.to_be_bytes());

        let mut decoder = EventStreamDecoder::new();
        let events = decoder.push(&bytes);
        assert_eq!(
            events,
            vec![AssistantEvent::UpstreamError {
                code: "invalid_utf8".to_string(),
                message: "upstream payload is not valid UTF-8".to_string(),
            }]
        );
        assert!(decoder.is_terminated());
    }
}

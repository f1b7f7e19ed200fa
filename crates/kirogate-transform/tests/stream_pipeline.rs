//! End-to-end pipeline: binary upstream frames through the decoder, the
//! thinking extractor and the Anthropic renderer.

use std::convert::Infallible;

use bytes::Bytes;
use tokio::sync::mpsc;

use kirogate_transform::decoder::EventStreamDecoder;
use kirogate_transform::emitter::{AnthropicSender, StreamBridge};

/// Build one upstream frame with a `:event-type` header and a JSON payload.
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

fn text_frame(content: &str) -> Vec<u8> {
    frame(
        "assistantResponseEvent",
        &serde_json::json!({ "content": content }).to_string(),
    )
}

/// Run raw upstream bytes through decoder + bridge + Anthropic renderer,
/// splitting the byte stream into the given chunk sizes.
fn render(stream: &[u8], chunk_size: usize, thinking: bool) -> Vec<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Result<Bytes, Infallible>>();
    let mut sender = AnthropicSender::new(tx, "msg_t".to_string(), "claude-sonnet-4-5".to_string());
    let mut bridge = StreamBridge::new(&mut sender, thinking);
    bridge.begin(None).unwrap();

    let mut decoder = EventStreamDecoder::new();
    for chunk in stream.chunks(chunk_size.max(1)) {
        for event in decoder.push(chunk) {
            bridge.handle(event).unwrap();
        }
    }
    decoder.finish();
    bridge.finish(decoder.tool_was_used()).unwrap();
    drop(bridge);
    drop(sender);

    let mut frames = Vec::new();
    while let Ok(Ok(frame)) = rx.try_recv() {
        frames.push(String::from_utf8_lossy(&frame).to_string());
    }
    frames
}

fn frames_of_kind<'a>(frames: &'a [String], event: &str) -> Vec<&'a String> {
    frames
        .iter()
        .filter(|frame| frame.starts_with(&format!("event: {event}\n")))
        .collect()
}

fn concat_deltas(frames: &[String], delta_kind: &str) -> String {
    let mut out = String::new();
    for frame in frames_of_kind(frames, "content_block_delta") {
        let data = frame.split("data: ").nth(1).unwrap();
        let value: serde_json::Value = serde_json::from_str(data.trim()).unwrap();
        if value["delta"]["type"] == delta_kind {
            let field = if delta_kind == "thinking_delta" {
                "thinking"
            } else {
                "text"
            };
            out.push_str(value["delta"][field].as_str().unwrap());
        }
    }
    out
}

#[test]
fn thinking_chunking_produces_indexed_blocks() {
    // The tag itself arrives split across three text deltas.
    let mut stream = Vec::new();
    stream.extend_from_slice(&text_frame("<think"));
    stream.extend_from_slice(&text_frame("ing>abc</thin"));
    stream.extend_from_slice(&text_frame("king>\n\nhello"));

    let frames = render(&stream, stream.len(), true);

    let starts = frames_of_kind(&frames, "content_block_start");
    assert_eq!(starts.len(), 2);
    let first: serde_json::Value =
        serde_json::from_str(starts[0].split("data: ").nth(1).unwrap().trim()).unwrap();
    assert_eq!(first["index"], 0);
    assert_eq!(first["content_block"]["type"], "thinking");
    let second: serde_json::Value =
        serde_json::from_str(starts[1].split("data: ").nth(1).unwrap().trim()).unwrap();
    assert_eq!(second["index"], 1);
    assert_eq!(second["content_block"]["type"], "text");

    assert_eq!(concat_deltas(&frames, "thinking_delta"), "abc");
    assert_eq!(concat_deltas(&frames, "text_delta"), "hello");

    let stops = frames_of_kind(&frames, "content_block_stop");
    assert_eq!(stops.len(), 2);
    assert_eq!(frames_of_kind(&frames, "message_stop").len(), 1);
}

#[test]
fn thinking_output_is_stable_under_any_byte_split() {
    // Multi-byte content: splits land mid-codepoint at the framing layer.
    let mut stream = Vec::new();
    stream.extend_from_slice(&text_frame("<thinking>héllo wörld</thinking>\n\n"));
    stream.extend_from_slice(&text_frame("日本語の答え"));

    for chunk_size in 1..=stream.len() {
        let frames = render(&stream, chunk_size, true);
        assert_eq!(
            concat_deltas(&frames, "thinking_delta"),
            "héllo wörld",
            "chunk size {chunk_size}"
        );
        assert_eq!(
            concat_deltas(&frames, "text_delta"),
            "日本語の答え",
            "chunk size {chunk_size}"
        );
    }
}

#[test]
fn code_fenced_tag_never_enters_thinking() {
    let input = "```\n<thinking>\n```\n\nhi";
    let stream = text_frame(input);
    let frames = render(&stream, stream.len(), true);

    assert!(frames_of_kind(&frames, "content_block_start")
        .iter()
        .all(|frame| !frame.contains(r#""type":"thinking""#)));
    assert_eq!(concat_deltas(&frames, "thinking_delta"), "");
    assert_eq!(concat_deltas(&frames, "text_delta"), input);
}

#[test]
fn disabled_thinking_passes_tags_through_as_text() {
    let input = "<thinking>x</thinking>\n\ny";
    let stream = text_frame(input);
    let frames = render(&stream, stream.len(), false);

    let starts = frames_of_kind(&frames, "content_block_start");
    assert_eq!(starts.len(), 1);
    let start: serde_json::Value =
        serde_json::from_str(starts[0].split("data: ").nth(1).unwrap().trim()).unwrap();
    assert_eq!(start["index"], 0);
    assert_eq!(start["content_block"]["type"], "text");
    assert_eq!(concat_deltas(&frames, "text_delta"), input);
}

#[test]
fn tool_use_stream_maps_to_tool_use_stop_reason() {
    let mut stream = Vec::new();
    stream.extend_from_slice(&text_frame("checking"));
    stream.extend_from_slice(&frame(
        "toolUseEvent",
        r#"{"toolUseId":"t1","name":"lookup","input":"{\"q\":\"x\"}","stop":true}"#,
    ));

    let frames = render(&stream, 7, false);

    let starts = frames_of_kind(&frames, "content_block_start");
    let tool_start = starts
        .iter()
        .find(|frame| frame.contains(r#""type":"tool_use""#))
        .expect("tool_use block start");
    let value: serde_json::Value =
        serde_json::from_str(tool_start.split("data: ").nth(1).unwrap().trim()).unwrap();
    assert_eq!(value["index"], 1);
    assert_eq!(value["content_block"]["name"], "lookup");

    let deltas = frames_of_kind(&frames, "message_delta");
    assert_eq!(deltas.len(), 1);
    assert!(deltas[0].contains(r#""stop_reason":"tool_use""#));
}

#[test]
fn upstream_exception_renders_error_event() {
    let stream = frame("throttlingException", r#"{"message":"slow down"}"#);
    let frames = render(&stream, stream.len(), false);

    let errors = frames_of_kind(&frames, "error");
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains(r#""type":"overloaded_error""#));
    assert!(errors[0].contains("slow down"));
    // No message_stop after a terminal error.
    assert!(frames_of_kind(&frames, "message_stop").is_empty());
}

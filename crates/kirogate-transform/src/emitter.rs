use std::convert::Infallible;
use std::error::Error;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use kirogate_protocol::anthropic::{
    BlockDelta, ContentBlock, ErrorDetail, MessageDelta, StopReason, StreamEvent, StreamMessage,
    StreamUsage,
};
use kirogate_protocol::openai::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, FinishReason, ToolCallDelta,
    ToolCallFunctionDelta, Usage,
};
use kirogate_protocol::sse;

use crate::decoder::{AssistantEvent, StopKind};
use crate::thinking::ThinkingExtractor;

/// Downstream emission failed, usually because the client went away.
#[derive(Debug)]
pub struct EmitError;

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "downstream writer closed")
    }
}

impl Error for EmitError {}

/// Format-agnostic events produced by the [`StreamBridge`]; the two senders
/// render them as Anthropic block events or OpenAI chat chunks.
#[derive(Debug, Clone, PartialEq)]
pub enum DownstreamEvent {
    MessageStart {
        input_tokens: Option<u32>,
    },
    ThinkingStart {
        index: u32,
    },
    ThinkingDelta {
        index: u32,
        text: String,
    },
    TextStart {
        index: u32,
    },
    TextDelta {
        index: u32,
        text: String,
    },
    ToolStart {
        index: u32,
        id: String,
        name: String,
    },
    ToolArgsDelta {
        index: u32,
        fragment: String,
    },
    BlockStop {
        index: u32,
    },
    Finish {
        stop: StopKind,
        usage: (Option<u32>, Option<u32>),
    },
}

/// Capability interface over the two downstream formats. Every event is
/// written and flushed synchronously; renderer choice never leaks upstream.
pub trait EventSender: Send {
    fn send_event(&mut self, event: DownstreamEvent) -> Result<(), EmitError>;
    fn send_error(&mut self, message: &str) -> Result<(), EmitError>;
}

pub fn map_stop_reason(stop: StopKind) -> StopReason {
    match stop {
        StopKind::EndTurn => StopReason::EndTurn,
        StopKind::MaxTokens => StopReason::MaxTokens,
        StopKind::ToolUse => StopReason::ToolUse,
    }
}

pub fn map_finish_reason(stop: StopKind) -> FinishReason {
    match stop {
        StopKind::EndTurn => FinishReason::Stop,
        StopKind::MaxTokens => FinishReason::Length,
        StopKind::ToolUse => FinishReason::ToolCalls,
    }
}

fn now_epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or_default()
}

type FrameSender = UnboundedSender<Result<Bytes, Infallible>>;

fn send_frame(tx: &FrameSender, frame: Bytes) -> Result<(), EmitError> {
    tx.send(Ok(frame)).map_err(|_| EmitError)
}

/// Anthropic SSE renderer: `message_start`, per-block start/delta/stop,
/// `message_delta` with the stop reason, `message_stop`.
pub struct AnthropicSender {
    tx: FrameSender,
    message_id: String,
    model: String,
}

impl AnthropicSender {
    pub fn new(tx: FrameSender, message_id: String, model: String) -> Self {
        Self {
            tx,
            message_id,
            model,
        }
    }

    fn send(&mut self, event: &StreamEvent) -> Result<(), EmitError> {
        let frame = sse::event_frame(event).ok_or(EmitError)?;
        send_frame(&self.tx, frame)
    }
}

impl EventSender for AnthropicSender {
    fn send_event(&mut self, event: DownstreamEvent) -> Result<(), EmitError> {
        let event = match event {
            DownstreamEvent::MessageStart { input_tokens } => StreamEvent::MessageStart {
                message: StreamMessage {
                    id: self.message_id.clone(),
                    kind: "message".to_string(),
                    role: "assistant".to_string(),
                    model: self.model.clone(),
                    content: Vec::new(),
                    stop_reason: None,
                    stop_sequence: None,
                    usage: StreamUsage {
                        input_tokens,
                        output_tokens: None,
                    },
                },
            },
            DownstreamEvent::ThinkingStart { index } => StreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlock::Thinking {
                    thinking: String::new(),
                },
            },
            DownstreamEvent::ThinkingDelta { index, text } => StreamEvent::ContentBlockDelta {
                index,
                delta: BlockDelta::ThinkingDelta { thinking: text },
            },
            DownstreamEvent::TextStart { index } => StreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlock::Text {
                    text: String::new(),
                },
            },
            DownstreamEvent::TextDelta { index, text } => StreamEvent::ContentBlockDelta {
                index,
                delta: BlockDelta::TextDelta { text },
            },
            DownstreamEvent::ToolStart { index, id, name } => StreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlock::ToolUse {
                    id,
                    name,
                    input: Value::Object(Default::default()),
                },
            },
            DownstreamEvent::ToolArgsDelta { index, fragment } => StreamEvent::ContentBlockDelta {
                index,
                delta: BlockDelta::InputJsonDelta {
                    partial_json: fragment,
                },
            },
            DownstreamEvent::BlockStop { index } => StreamEvent::ContentBlockStop { index },
            DownstreamEvent::Finish { stop, usage } => {
                self.send(&StreamEvent::MessageDelta {
                    delta: MessageDelta {
                        stop_reason: Some(map_stop_reason(stop)),
                        stop_sequence: None,
                    },
                    usage: StreamUsage {
                        input_tokens: usage.0,
                        output_tokens: usage.1,
                    },
                })?;
                StreamEvent::MessageStop
            }
        };
        self.send(&event)
    }

    fn send_error(&mut self, message: &str) -> Result<(), EmitError> {
        self.send(&StreamEvent::Error {
            error: ErrorDetail {
                kind: "overloaded_error".to_string(),
                message: message.to_string(),
            },
        })
    }
}

/// OpenAI chunked-chat renderer. Thinking content is concatenated and
/// surfaced as one delimited leading content chunk so plain OpenAI clients
/// still see every visible byte.
pub struct OpenAiSender {
    tx: FrameSender,
    id: String,
    created: i64,
    model: String,
    role_sent: bool,
    thinking_buf: String,
    thinking_index: Option<u32>,
    tool_slot: i32,
}

impl OpenAiSender {
    pub fn new(tx: FrameSender, id: String, model: String) -> Self {
        Self {
            tx,
            id,
            created: now_epoch_seconds(),
            model,
            role_sent: false,
            thinking_buf: String::new(),
            thinking_index: None,
            tool_slot: -1,
        }
    }

    fn chunk(&mut self, delta: ChunkDelta) -> Result<(), EmitError> {
        let mut delta = delta;
        if !self.role_sent {
            delta.role = Some("assistant".to_string());
            self.role_sent = true;
        }
        let chunk = ChatCompletionChunk::new(&self.id, self.created, &self.model, delta);
        let frame = sse::data_frame(&chunk).ok_or(EmitError)?;
        send_frame(&self.tx, frame)
    }

    fn finish_chunk(
        &mut self,
        finish: FinishReason,
        usage: (Option<u32>, Option<u32>),
    ) -> Result<(), EmitError> {
        let mut chunk =
            ChatCompletionChunk::new(&self.id, self.created, &self.model, ChunkDelta::default());
        chunk.choices = vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta::default(),
            finish_reason: Some(finish),
        }];
        if usage.0.is_some() || usage.1.is_some() {
            let prompt = usage.0.unwrap_or(0);
            let completion = usage.1.unwrap_or(0);
            chunk.usage = Some(Usage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: prompt + completion,
            });
        }
        let frame = sse::data_frame(&chunk).ok_or(EmitError)?;
        send_frame(&self.tx, frame)?;
        send_frame(&self.tx, sse::done_frame())
    }
}

impl EventSender for OpenAiSender {
    fn send_event(&mut self, event: DownstreamEvent) -> Result<(), EmitError> {
        match event {
            DownstreamEvent::MessageStart { .. } => Ok(()),
            DownstreamEvent::ThinkingStart { index } => {
                self.thinking_index = Some(index);
                Ok(())
            }
            DownstreamEvent::ThinkingDelta { text, .. } => {
                self.thinking_buf.push_str(&text);
                Ok(())
            }
            DownstreamEvent::TextStart { .. } => Ok(()),
            DownstreamEvent::TextDelta { text, .. } => self.chunk(ChunkDelta {
                content: Some(text),
                ..Default::default()
            }),
            DownstreamEvent::ToolStart { id, name, .. } => {
                self.tool_slot += 1;
                self.chunk(ChunkDelta {
                    tool_calls: Some(vec![ToolCallDelta {
                        index: self.tool_slot as u32,
                        id: Some(id),
                        kind: Some("function".to_string()),
                        function: Some(ToolCallFunctionDelta {
                            name: Some(name),
                            arguments: Some(String::new()),
                        }),
                    }]),
                    ..Default::default()
                })
            }
            DownstreamEvent::ToolArgsDelta { fragment, .. } => self.chunk(ChunkDelta {
                tool_calls: Some(vec![ToolCallDelta {
                    index: self.tool_slot.max(0) as u32,
                    id: None,
                    kind: None,
                    function: Some(ToolCallFunctionDelta {
                        name: None,
                        arguments: Some(fragment),
                    }),
                }]),
                ..Default::default()
            }),
            DownstreamEvent::BlockStop { index } => {
                if self.thinking_index == Some(index) {
                    self.thinking_index = None;
                    if !self.thinking_buf.is_empty() {
                        let reasoning = std::mem::take(&mut self.thinking_buf);
                        return self.chunk(ChunkDelta {
                            content: Some(format!("<thinking>\n{reasoning}\n</thinking>\n\n")),
                            ..Default::default()
                        });
                    }
                }
                Ok(())
            }
            DownstreamEvent::Finish { stop, usage } => {
                // A stream that ended while still thinking: surface what we
                // have before the terminal chunk.
                if !self.thinking_buf.is_empty() {
                    let reasoning = std::mem::take(&mut self.thinking_buf);
                    self.chunk(ChunkDelta {
                        content: Some(format!("<thinking>\n{reasoning}\n</thinking>\n\n")),
                        ..Default::default()
                    })?;
                }
                self.finish_chunk(map_finish_reason(stop), usage)
            }
        }
    }

    fn send_error(&mut self, message: &str) -> Result<(), EmitError> {
        let payload = serde_json::json!({
            "error": {
                "message": message,
                "type": "server_error",
                "code": "internal_error",
            }
        });
        let frame = sse::data_frame(&payload).ok_or(EmitError)?;
        send_frame(&self.tx, frame)
    }
}

/// Collects the logical stream into whole content blocks for the
/// non-streaming response variants.
#[derive(Debug, Default)]
pub struct Accumulator {
    pub thinking: String,
    pub text: String,
    pub tools: Vec<(String, String, String)>,
    pub stop: Option<StopKind>,
    pub usage: (Option<u32>, Option<u32>),
    pub error: Option<String>,
    open_tool: Option<(String, String, String)>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content_blocks(&self) -> Vec<ContentBlock> {
        let mut blocks = Vec::new();
        if !self.thinking.is_empty() {
            blocks.push(ContentBlock::Thinking {
                thinking: self.thinking.clone(),
            });
        }
        if !self.text.is_empty() {
            blocks.push(ContentBlock::Text {
                text: self.text.clone(),
            });
        }
        for (id, name, args) in &self.tools {
            let input = serde_json::from_str(args).unwrap_or(Value::Object(Default::default()));
            blocks.push(ContentBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input,
            });
        }
        blocks
    }
}

impl EventSender for Accumulator {
    fn send_event(&mut self, event: DownstreamEvent) -> Result<(), EmitError> {
        match event {
            DownstreamEvent::ThinkingDelta { text, .. } => self.thinking.push_str(&text),
            DownstreamEvent::TextDelta { text, .. } => self.text.push_str(&text),
            DownstreamEvent::ToolStart { id, name, .. } => {
                self.open_tool = Some((id, name, String::new()));
            }
            DownstreamEvent::ToolArgsDelta { fragment, .. } => {
                if let Some((_, _, args)) = self.open_tool.as_mut() {
                    args.push_str(&fragment);
                }
            }
            DownstreamEvent::BlockStop { .. } => {
                if let Some(tool) = self.open_tool.take() {
                    self.tools.push(tool);
                }
            }
            DownstreamEvent::Finish { stop, usage } => {
                self.stop = Some(stop);
                self.usage = usage;
            }
            DownstreamEvent::MessageStart { .. }
            | DownstreamEvent::ThinkingStart { .. }
            | DownstreamEvent::TextStart { .. } => {}
        }
        Ok(())
    }

    fn send_error(&mut self, message: &str) -> Result<(), EmitError> {
        self.error = Some(message.to_string());
        Ok(())
    }
}

/// Drives decoded [`AssistantEvent`]s through the thinking extractor and the
/// chosen sender, owning block lifecycle and index allocation.
pub struct StreamBridge<'a> {
    sender: &'a mut dyn EventSender,
    extractor: ThinkingExtractor,
    thinking_open: bool,
    text_open: bool,
    tool_index: Option<u32>,
    tool_seen: bool,
    usage: (Option<u32>, Option<u32>),
    stop: Option<StopKind>,
    finished: bool,
}

impl<'a> StreamBridge<'a> {
    pub fn new(sender: &'a mut dyn EventSender, thinking_enabled: bool) -> Self {
        Self {
            sender,
            extractor: ThinkingExtractor::new(thinking_enabled),
            thinking_open: false,
            text_open: false,
            tool_index: None,
            tool_seen: false,
            usage: (None, None),
            stop: None,
            finished: false,
        }
    }

    pub fn begin(&mut self, input_tokens: Option<u32>) -> Result<(), EmitError> {
        self.usage.0 = input_tokens;
        self.sender
            .send_event(DownstreamEvent::MessageStart { input_tokens })
    }

    pub fn handle(&mut self, event: AssistantEvent) -> Result<(), EmitError> {
        if self.finished {
            return Ok(());
        }
        match event {
            AssistantEvent::TextDelta(text) => {
                let outcome = self.extractor.process_chunk(&text);
                self.emit_outcome(outcome)
            }
            AssistantEvent::ToolUseStart { id, name } => {
                self.close_text()?;
                let index = self.extractor.allocate_block_index();
                self.tool_index = Some(index);
                self.tool_seen = true;
                self.sender
                    .send_event(DownstreamEvent::ToolStart { index, id, name })
            }
            AssistantEvent::ToolUseArgsDelta(fragment) => {
                let Some(index) = self.tool_index else {
                    return Ok(());
                };
                self.sender
                    .send_event(DownstreamEvent::ToolArgsDelta { index, fragment })
            }
            AssistantEvent::ToolUseEnd => {
                let Some(index) = self.tool_index.take() else {
                    return Ok(());
                };
                self.sender.send_event(DownstreamEvent::BlockStop { index })
            }
            AssistantEvent::Usage { input, output } => {
                if input.is_some() {
                    self.usage.0 = input;
                }
                if output.is_some() {
                    self.usage.1 = output;
                }
                Ok(())
            }
            AssistantEvent::Stop(kind) => {
                self.stop = Some(kind);
                Ok(())
            }
            AssistantEvent::UpstreamError { code, message } => {
                debug!(%code, "rendering upstream error downstream");
                self.finished = true;
                self.sender.send_error(&message)
            }
        }
    }

    fn emit_outcome(
        &mut self,
        outcome: crate::thinking::ChunkOutcome,
    ) -> Result<(), EmitError> {
        if !outcome.thinking.is_empty() || outcome.thinking_started {
            self.open_thinking()?;
        }
        if !outcome.thinking.is_empty() {
            let index = self.extractor.thinking_block_index().unwrap_or(0);
            self.sender.send_event(DownstreamEvent::ThinkingDelta {
                index,
                text: outcome.thinking,
            })?;
        }
        if outcome.thinking_ended {
            self.close_thinking()?;
        }
        if !outcome.text.is_empty() {
            self.open_text()?;
            let index = self.extractor.text_block_index();
            self.sender.send_event(DownstreamEvent::TextDelta {
                index,
                text: outcome.text,
            })?;
        }
        Ok(())
    }

    fn open_thinking(&mut self) -> Result<(), EmitError> {
        if self.thinking_open {
            return Ok(());
        }
        let Some(index) = self.extractor.thinking_block_index() else {
            return Ok(());
        };
        self.thinking_open = true;
        self.sender
            .send_event(DownstreamEvent::ThinkingStart { index })
    }

    fn close_thinking(&mut self) -> Result<(), EmitError> {
        if !self.thinking_open {
            return Ok(());
        }
        self.thinking_open = false;
        let index = self.extractor.thinking_block_index().unwrap_or(0);
        self.sender.send_event(DownstreamEvent::BlockStop { index })
    }

    fn open_text(&mut self) -> Result<(), EmitError> {
        if self.text_open {
            return Ok(());
        }
        self.text_open = true;
        let index = self.extractor.text_block_index();
        self.sender.send_event(DownstreamEvent::TextStart { index })
    }

    fn close_text(&mut self) -> Result<(), EmitError> {
        if !self.text_open {
            return Ok(());
        }
        self.text_open = false;
        let index = self.extractor.text_block_index();
        self.sender.send_event(DownstreamEvent::BlockStop { index })
    }

    /// Flush residual extractor state, close open blocks and emit the
    /// terminal events. `tool_was_used` lets the decoder's view override the
    /// default stop reason.
    pub fn finish(&mut self, tool_was_used: bool) -> Result<(), EmitError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let outcome = self.extractor.flush();
        if !outcome.is_empty() {
            self.emit_outcome(outcome)?;
        }
        self.close_thinking()?;
        self.close_text()?;
        if let Some(index) = self.tool_index.take() {
            self.sender.send_event(DownstreamEvent::BlockStop { index })?;
        }

        let stop = self.stop.unwrap_or({
            if tool_was_used || self.tool_seen {
                StopKind::ToolUse
            } else {
                StopKind::EndTurn
            }
        });
        self.sender.send_event(DownstreamEvent::Finish {
            stop,
            usage: self.usage,
        })
    }
}

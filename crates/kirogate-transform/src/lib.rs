//! Upstream stream handling: event-stream decoding, thinking extraction and
//! downstream SSE rendering.
//!
//! The decoder turns the upstream's length-prefixed binary records into
//! [`AssistantEvent`]s; the extractor separates hidden reasoning from visible
//! text; the emitters render one logical stream as either Anthropic block
//! events or OpenAI chat chunks.

pub mod decoder;
pub mod emitter;
pub mod thinking;

pub use decoder::{AssistantEvent, EventStreamDecoder, StopKind};
pub use emitter::{
    Accumulator, AnthropicSender, DownstreamEvent, EmitError, EventSender, OpenAiSender,
    StreamBridge, map_finish_reason, map_stop_reason,
};
pub use thinking::{ChunkOutcome, ThinkingExtractor};

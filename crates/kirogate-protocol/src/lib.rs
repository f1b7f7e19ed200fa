//! Wire types for the two public surfaces of the gateway.
//!
//! This crate intentionally does **not** depend on axum or any HTTP client.
//! It holds the Anthropic messages types, the OpenAI chat-completions types,
//! and the SSE byte-framing helpers shared by both renderers.

pub mod anthropic;
pub mod openai;
pub mod sse;

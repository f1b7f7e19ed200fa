//! Per-request pipeline: credential resolution, governed dispatch, stream
//! decode and downstream rendering.

use std::sync::Arc;

use axum::body::Body;
use axum::response::Response;
use futures_util::StreamExt;
use http::{HeaderValue, StatusCode, header};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use kirogate_auth::{AuthError, Fingerprint, TokenInfo, is_suspension_signal};
use kirogate_protocol::anthropic::{MessagesRequest, MessagesResponse, StreamUsage};
use kirogate_protocol::openai::{
    ChatCompletionResponse, ChoiceMessage, CompletionChoice, ToolCall, ToolCallFunction, Usage,
};
use kirogate_transform::decoder::{AssistantEvent, EventStreamDecoder, StopKind};
use kirogate_transform::emitter::{
    Accumulator, AnthropicSender, EventSender, OpenAiSender, StreamBridge, map_finish_reason,
    map_stop_reason,
};

use crate::auth::Identity;
use crate::convert;
use crate::error::GatewayError;
use crate::state::AppState;
use crate::upstream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Anthropic,
    OpenAi,
}

/// A resolved credential: the pool key is absent in multi-tenant mode.
struct Resolved {
    key: Option<String>,
    token: TokenInfo,
    fingerprint: Arc<Fingerprint>,
}

async fn resolve(state: &AppState, identity: &Identity) -> Result<Resolved, GatewayError> {
    match identity {
        Identity::Pool => {
            let (key, token, fingerprint) =
                state.manager.acquire().await.map_err(|err| match err {
                    AuthError::NoTokenAvailable => GatewayError::no_token_available(),
                    other => GatewayError {
                        status: StatusCode::SERVICE_UNAVAILABLE,
                        code: "no_token_available",
                        message: other.to_string(),
                    },
                })?;
            Ok(Resolved {
                key: Some(key),
                token,
                fingerprint,
            })
        }
        Identity::UserToken(refresh_token) => {
            let token = state
                .user_tokens
                .get_or_refresh(refresh_token, &state.refresher)
                .await
                .map_err(|err| GatewayError {
                    status: StatusCode::UNAUTHORIZED,
                    code: "unauthorized",
                    message: format!("user token invalid: {err}"),
                })?;
            // Multi-tenant traffic still presents a consistent fingerprint,
            // keyed by the user's secret prefix.
            let fingerprint_key: String = refresh_token.chars().take(20).collect();
            let fingerprint = state.manager.fingerprints().get(&fingerprint_key);
            Ok(Resolved {
                key: None,
                token,
                fingerprint,
            })
        }
    }
}

/// Classify a non-success upstream status, signaling the governor for the
/// pool-backed path.
async fn map_upstream_failure(
    state: &AppState,
    key: Option<&str>,
    status: StatusCode,
    body: &str,
) -> UpstreamFailure {
    if status == StatusCode::FORBIDDEN {
        if is_suspension_signal(body) {
            if let Some(key) = key {
                state.manager.mark_suspended(key, body);
            }
            return UpstreamFailure::Suspended;
        }
        if let Some(key) = key {
            state.manager.mark_failed(key).await;
        }
        return UpstreamFailure::Unauthorized;
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        if let Some(key) = key {
            state.manager.mark_failed(key).await;
        }
        return UpstreamFailure::RateLimited;
    }
    if is_suspension_signal(body) {
        if let Some(key) = key {
            state.manager.mark_suspended(key, body);
        }
        return UpstreamFailure::Suspended;
    }
    if body.contains("CONTENT_LENGTH_EXCEEDS_THRESHOLD") {
        return UpstreamFailure::Truncated;
    }
    UpstreamFailure::Other(status, body.to_string())
}

enum UpstreamFailure {
    Unauthorized,
    RateLimited,
    Suspended,
    /// Graceful termination: the client sees a well-formed response with
    /// `max_tokens`.
    Truncated,
    Other(StatusCode, String),
}

impl UpstreamFailure {
    fn to_error(&self) -> GatewayError {
        match self {
            UpstreamFailure::Unauthorized => GatewayError::upstream_unauthorized(),
            UpstreamFailure::RateLimited => GatewayError::upstream_rate_limited(),
            UpstreamFailure::Suspended => GatewayError::upstream_suspended(),
            UpstreamFailure::Truncated => GatewayError::upstream_transport("truncated"),
            UpstreamFailure::Other(status, body) => GatewayError::upstream_transport(format!(
                "upstream error {status}: {body}"
            )),
        }
    }
}

/// Streaming entry point shared by both POST surfaces.
pub async fn run_streaming(
    state: Arc<AppState>,
    identity: Identity,
    request: MessagesRequest,
    format: OutputFormat,
) -> Result<Response, GatewayError> {
    let resolved = resolve(&state, &identity).await?;
    let body = convert::build_upstream_body(&request, resolved.token.profile_arn.as_deref())?;
    let payload = serde_json::to_vec(&body)
        .map_err(|err| GatewayError::upstream_transport(err.to_string()))?;

    let resp = upstream::dispatch(
        &state.client,
        &resolved.token.access_token,
        &resolved.fingerprint,
        payload,
        true,
    )
    .await?;

    let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let thinking_enabled = request.thinking_enabled();
    let model = request.model.clone();

    if !status.is_success() {
        let body_text = resp
            .bytes()
            .await
            .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
            .unwrap_or_default();
        let failure = map_upstream_failure(&state, resolved.key.as_deref(), status, &body_text).await;
        if matches!(failure, UpstreamFailure::Truncated) {
            info!("upstream content length exceeded, terminating with max_tokens");
            return Ok(truncated_stream_response(&model, format, thinking_enabled));
        }
        return Err(failure.to_error());
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let mut sender: Box<dyn EventSender> = match format {
        OutputFormat::Anthropic => Box::new(AnthropicSender::new(
            tx,
            format!("msg_{}", Uuid::new_v4().simple()),
            model,
        )),
        OutputFormat::OpenAi => Box::new(OpenAiSender::new(
            tx,
            format!("chatcmpl-{}", Uuid::new_v4().simple()),
            model,
        )),
    };

    let deadline = state.request_deadline;
    let manager = state.manager.clone();
    let key = resolved.key.clone();
    tokio::spawn(async move {
        let pump = pump_into(resp, sender.as_mut(), thinking_enabled);
        match tokio::time::timeout(deadline, pump).await {
            Ok(PumpOutcome::Clean { tool_used: _ }) => {
                if let Some(key) = key.as_deref() {
                    manager.mark_success(key);
                }
            }
            Ok(PumpOutcome::UpstreamError { message }) => {
                if is_suspension_signal(&message) {
                    if let Some(key) = key.as_deref() {
                        manager.mark_suspended(key, &message);
                    }
                }
                // Transport and protocol errors mid-stream do not count
                // against the credential.
            }
            Ok(PumpOutcome::ClientGone) => {}
            Err(_) => {
                warn!("upstream stream exceeded the request deadline");
            }
        }
        // Dropping the sender closes the downstream body cleanly.
    });

    Ok(sse_response(
        Body::from_stream(UnboundedReceiverStream::new(rx)),
    ))
}

enum PumpOutcome {
    Clean { tool_used: bool },
    UpstreamError { message: String },
    ClientGone,
}

/// Read the upstream byte stream to completion, pushing decoded events
/// through the bridge.
async fn pump_into(
    resp: wreq::Response,
    sender: &mut dyn EventSender,
    thinking_enabled: bool,
) -> PumpOutcome {
    let mut bridge = StreamBridge::new(sender, thinking_enabled);
    if bridge.begin(None).is_err() {
        return PumpOutcome::ClientGone;
    }

    let mut decoder = EventStreamDecoder::new();
    let mut upstream_error: Option<String> = None;
    let mut stream = resp.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!(%err, "upstream stream read failed");
                let message = format!("upstream stream error: {err}");
                let _ = bridge.handle(AssistantEvent::UpstreamError {
                    code: "stream_error".to_string(),
                    message: message.clone(),
                });
                return PumpOutcome::UpstreamError { message };
            }
        };
        for event in decoder.push(&chunk) {
            if let AssistantEvent::UpstreamError { message, .. } = &event {
                upstream_error = Some(message.clone());
            }
            if bridge.handle(event).is_err() {
                return PumpOutcome::ClientGone;
            }
        }
        if decoder.is_terminated() {
            break;
        }
    }

    decoder.finish();
    if let Some(message) = upstream_error {
        return PumpOutcome::UpstreamError { message };
    }
    let tool_used = decoder.tool_was_used();
    if bridge.finish(tool_used).is_err() {
        return PumpOutcome::ClientGone;
    }
    PumpOutcome::Clean { tool_used }
}

/// Non-streaming entry point: the upstream stream is decoded and folded
/// into one JSON response body.
pub async fn run_non_streaming(
    state: Arc<AppState>,
    identity: Identity,
    request: MessagesRequest,
    format: OutputFormat,
) -> Result<Response, GatewayError> {
    let resolved = resolve(&state, &identity).await?;
    let body = convert::build_upstream_body(&request, resolved.token.profile_arn.as_deref())?;
    let payload = serde_json::to_vec(&body)
        .map_err(|err| GatewayError::upstream_transport(err.to_string()))?;

    let resp = upstream::dispatch(
        &state.client,
        &resolved.token.access_token,
        &resolved.fingerprint,
        payload,
        false,
    )
    .await?;

    let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let thinking_enabled = request.thinking_enabled();
    let model = request.model.clone();

    if !status.is_success() {
        let body_text = resp
            .bytes()
            .await
            .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
            .unwrap_or_default();
        let failure = map_upstream_failure(&state, resolved.key.as_deref(), status, &body_text).await;
        if matches!(failure, UpstreamFailure::Truncated) {
            let mut acc = Accumulator::new();
            acc.stop = Some(StopKind::MaxTokens);
            return Ok(complete_response(&model, format, &acc));
        }
        return Err(failure.to_error());
    }

    let mut acc = Accumulator::new();
    let outcome = tokio::time::timeout(
        state.request_deadline,
        pump_into(resp, &mut acc, thinking_enabled),
    )
    .await
    .map_err(|_| GatewayError::upstream_transport("upstream response exceeded deadline"))?;

    match outcome {
        PumpOutcome::Clean { .. } => {
            if let Some(key) = resolved.key.as_deref() {
                state.manager.mark_success(key);
            }
        }
        PumpOutcome::UpstreamError { message } => {
            if is_suspension_signal(&message) {
                if let Some(key) = resolved.key.as_deref() {
                    state.manager.mark_suspended(key, &message);
                }
                return Err(GatewayError::upstream_suspended());
            }
            return Err(GatewayError::upstream_transport(message));
        }
        PumpOutcome::ClientGone => {}
    }

    Ok(complete_response(&model, format, &acc))
}

fn sse_response(body: Body) -> Response {
    let mut resp = Response::new(body);
    let headers = resp.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    resp
}

/// A well-formed, empty stream terminating in `max_tokens`, used when the
/// upstream rejects the request for exceeding its content threshold.
fn truncated_stream_response(model: &str, format: OutputFormat, thinking: bool) -> Response {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut sender: Box<dyn EventSender> = match format {
        OutputFormat::Anthropic => Box::new(AnthropicSender::new(
            tx,
            format!("msg_{}", Uuid::new_v4().simple()),
            model.to_string(),
        )),
        OutputFormat::OpenAi => Box::new(OpenAiSender::new(
            tx,
            format!("chatcmpl-{}", Uuid::new_v4().simple()),
            model.to_string(),
        )),
    };
    {
        let mut bridge = StreamBridge::new(sender.as_mut(), thinking);
        let _ = bridge.begin(None);
        let _ = bridge.handle(AssistantEvent::Stop(StopKind::MaxTokens));
        let _ = bridge.finish(false);
    }
    drop(sender);
    sse_response(Body::from_stream(UnboundedReceiverStream::new(rx)))
}

fn complete_response(model: &str, format: OutputFormat, acc: &Accumulator) -> Response {
    let stop = acc.stop.unwrap_or(StopKind::EndTurn);
    let (input_tokens, output_tokens) = acc.usage;

    let payload = match format {
        OutputFormat::Anthropic => {
            let message = MessagesResponse {
                id: format!("msg_{}", Uuid::new_v4().simple()),
                kind: "message".to_string(),
                role: "assistant".to_string(),
                model: model.to_string(),
                content: acc.content_blocks(),
                stop_reason: Some(map_stop_reason(stop)),
                stop_sequence: None,
                usage: StreamUsage {
                    input_tokens,
                    output_tokens,
                },
            };
            serde_json::to_vec(&message)
        }
        OutputFormat::OpenAi => {
            let mut content = String::new();
            if !acc.thinking.is_empty() {
                content.push_str(&format!("<thinking>\n{}\n</thinking>\n\n", acc.thinking));
            }
            content.push_str(&acc.text);
            let tool_calls: Vec<ToolCall> = acc
                .tools
                .iter()
                .map(|(id, name, args)| ToolCall {
                    id: id.clone(),
                    kind: "function".to_string(),
                    function: ToolCallFunction {
                        name: name.clone(),
                        arguments: args.clone(),
                    },
                })
                .collect();
            let prompt = input_tokens.unwrap_or(0);
            let completion = output_tokens.unwrap_or(0);
            let response = ChatCompletionResponse {
                id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
                object: "chat.completion".to_string(),
                created: epoch_seconds(),
                model: model.to_string(),
                choices: vec![CompletionChoice {
                    index: 0,
                    message: ChoiceMessage {
                        role: "assistant".to_string(),
                        content: (!content.is_empty()).then_some(content),
                        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                    },
                    finish_reason: Some(map_finish_reason(stop)),
                }],
                usage: Usage {
                    prompt_tokens: prompt,
                    completion_tokens: completion,
                    total_tokens: prompt + completion,
                },
            };
            serde_json::to_vec(&response)
        }
    };

    let bytes = payload.unwrap_or_default();
    let mut resp = Response::new(Body::from(bytes));
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    resp
}

fn epoch_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or_default()
}

//! axum handlers for the two public surfaces plus the operational
//! endpoints.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use http::HeaderMap;
use serde_json::json;
use tracing::info;

use kirogate_protocol::anthropic::MessagesRequest;
use kirogate_protocol::openai::ChatCompletionRequest;

use crate::auth::Identity;
use crate::convert;
use crate::error::GatewayError;
use crate::orchestrator::{OutputFormat, run_non_streaming, run_streaming};
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/messages", post(messages))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(models))
        .route("/v1/anti-ban/status", get(anti_ban_status))
        .route("/health", get(health))
        .with_state(state)
}

async fn messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let identity = match state.client_auth.authenticate(&headers) {
        Ok(identity) => identity,
        Err(err) => return err.into_response(),
    };

    let mut request: MessagesRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return GatewayError::invalid_request(format!("invalid request body: {err}"))
                .into_response();
        }
    };
    convert::override_thinking_from_model(&mut request);

    info!(
        model = %request.model,
        stream = request.stream,
        message_count = request.messages.len(),
        thinking = request.thinking_enabled(),
        "anthropic messages request"
    );
    dispatch(state, identity, request, OutputFormat::Anthropic).await
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let identity = match state.client_auth.authenticate(&headers) {
        Ok(identity) => identity,
        Err(err) => return err.into_response(),
    };

    let chat: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return GatewayError::invalid_request(format!("invalid request body: {err}"))
                .into_response();
        }
    };

    info!(
        model = %chat.model,
        stream = chat.stream,
        message_count = chat.messages.len(),
        "openai chat request"
    );
    let request = convert::chat_to_messages(chat);
    dispatch(state, identity, request, OutputFormat::OpenAi).await
}

async fn dispatch(
    state: Arc<AppState>,
    identity: Identity,
    request: MessagesRequest,
    format: OutputFormat,
) -> Response {
    let result = if request.stream {
        run_streaming(state, identity, request, format).await
    } else {
        run_non_streaming(state, identity, request, format).await
    };
    match result {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn models() -> Response {
    let data: Vec<_> = [
        ("claude-sonnet-4-5-20250929", "Claude Sonnet 4.5"),
        ("claude-sonnet-4-5-20250929-thinking", "Claude Sonnet 4.5 (Thinking)"),
        ("claude-haiku-4-5-20251001", "Claude Haiku 4.5"),
        ("claude-haiku-4-5-20251001-thinking", "Claude Haiku 4.5 (Thinking)"),
    ]
    .iter()
    .map(|(id, name)| {
        json!({
            "id": id,
            "object": "model",
            "owned_by": "anthropic",
            "display_name": name,
        })
    })
    .collect();

    json_response(json!({"object": "list", "data": data}))
}

async fn health() -> Response {
    json_response(json!({"status": "ok"}))
}

/// Governor and fingerprint snapshot, behind the same bearer secret as the
/// proxy surfaces.
async fn anti_ban_status(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(err) = state.client_auth.authenticate(&headers) {
        return err.into_response();
    }

    let governor = state.manager.governor();
    let config = governor.config();
    json_response(json!({
        "status": "active",
        "rate_limiter": governor.stats(),
        "fingerprints": state.manager.fingerprints().stats(),
        "config": {
            "min_token_interval_ms": config.min_token_interval.as_millis() as u64,
            "max_token_interval_ms": config.max_token_interval.as_millis() as u64,
            "global_min_interval_ms": config.global_min_interval.as_millis() as u64,
            "max_consecutive_use": config.max_consecutive_use,
            "daily_max_requests": config.daily_max_requests,
            "jitter_percent": config.jitter_percent,
            "suspended_cooldown_secs": config.suspended_cooldown.as_secs(),
        },
        "features": {
            "fingerprint_randomization": true,
            "rate_limiting": true,
            "smart_token_rotation": true,
            "cooldown_on_error": true,
        },
    }))
}

fn json_response(value: serde_json::Value) -> Response {
    let mut resp = Response::new(Body::from(value.to_string()));
    resp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    resp
}

//! Shared upstream HTTP client and outbound request composition.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use tracing::debug;
use uuid::Uuid;

use kirogate_auth::Fingerprint;

use crate::error::GatewayError;

pub const UPSTREAM_URL: &str =
    "https://codewhisperer.us-east-1.amazonaws.com/generateAssistantResponse";

static CLIENT_CACHE: OnceLock<Mutex<HashMap<Option<String>, wreq::Client>>> = OnceLock::new();

/// One client per proxy configuration, cached process-wide.
pub fn shared_client(proxy: Option<&str>) -> Result<wreq::Client, GatewayError> {
    let key = proxy
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    let cache = CLIENT_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache
        .lock()
        .map_err(|_| GatewayError::upstream_transport("http client cache lock failed"))?;
    if let Some(client) = guard.get(&key) {
        return Ok(client.clone());
    }

    let mut builder = wreq::Client::builder();
    if let Some(proxy_url) = key.as_deref() {
        builder = builder.proxy(
            wreq::Proxy::all(proxy_url)
                .map_err(|err| GatewayError::upstream_transport(err.to_string()))?,
        );
    }
    let client = builder
        .build()
        .map_err(|err| GatewayError::upstream_transport(err.to_string()))?;
    guard.insert(key, client.clone());
    Ok(client)
}

/// Proxy override for all upstream traffic.
pub fn proxy_from_env() -> Option<String> {
    std::env::var("PROXY_URL").ok().filter(|value| !value.is_empty())
}

/// Compose and send the upstream call: bearer access token, the
/// credential's fingerprint headers, and the fixed agent headers.
pub async fn dispatch(
    client: &wreq::Client,
    access_token: &str,
    fingerprint: &Fingerprint,
    body: Vec<u8>,
    streaming: bool,
) -> Result<wreq::Response, GatewayError> {
    let accept = if streaming { "text/event-stream" } else { "*/*" };
    let mut request = client
        .post(UPSTREAM_URL)
        .header("Authorization", format!("Bearer {access_token}"))
        .header("Content-Type", "application/json")
        .header("Accept", accept)
        .header("x-amzn-kiro-agent-mode", "vibe")
        .header("x-amzn-codewhisperer-optout", "true")
        .header("amz-sdk-invocation-id", Uuid::new_v4().to_string())
        .header("amz-sdk-request", "attempt=1; max=3");

    for (name, value) in fingerprint.headers() {
        request = request.header(name, value);
    }
    debug!(
        os = %fingerprint.os_type,
        locale = %fingerprint.locale,
        sdk = %fingerprint.sdk_version,
        streaming,
        "dispatching upstream request"
    );

    request
        .body(body)
        .send()
        .await
        .map_err(|err| GatewayError::upstream_transport(format!("upstream request: {err}")))
}

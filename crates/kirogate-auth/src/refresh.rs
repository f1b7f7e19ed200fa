//! Refresh-secret redemption against the upstream identity services.

use std::time::{Duration, SystemTime};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::credential::{AuthKind, Credential};
use crate::error::{AuthError, AuthResult};

const SOCIAL_REFRESH_URL: &str = "https://prod.us-east-1.auth.desktop.kiro.dev/refreshToken";
const IDC_REFRESH_URL: &str = "https://oidc.us-east-1.amazonaws.com/token";

/// A minted upstream access token.
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub access_token: String,
    /// The refresh secret currently in force; may differ from the stored
    /// credential after a social-flow rotation.
    pub refresh_token: String,
    pub expires_at: SystemTime,
    pub profile_arn: Option<String>,
}

impl TokenInfo {
    pub fn is_expired(&self) -> bool {
        SystemTime::now() >= self.expires_at
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Lifetime in seconds.
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    profile_arn: Option<String>,
}

const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(55 * 60);

/// Redeems refresh credentials. One shared client, proxy-aware.
#[derive(Debug, Clone)]
pub struct TokenRefresher {
    client: wreq::Client,
    social_url: String,
    idc_url: String,
}

impl TokenRefresher {
    pub fn new(client: wreq::Client) -> Self {
        Self {
            client,
            social_url: SOCIAL_REFRESH_URL.to_string(),
            idc_url: IDC_REFRESH_URL.to_string(),
        }
    }

    /// Endpoint override used by tests.
    pub fn with_endpoints(client: wreq::Client, social_url: String, idc_url: String) -> Self {
        Self {
            client,
            social_url,
            idc_url,
        }
    }

    pub async fn refresh(&self, credential: &Credential) -> AuthResult<TokenInfo> {
        match credential.auth_kind {
            AuthKind::Social => self.refresh_social(&credential.refresh_token).await,
            AuthKind::Idc => self.refresh_idc(credential).await,
        }
    }

    /// Social flow: the identity service may rotate the refresh secret.
    pub async fn refresh_social(&self, refresh_token: &str) -> AuthResult<TokenInfo> {
        let payload = serde_json::json!({ "refreshToken": refresh_token });
        let parsed = self.post_refresh(&self.social_url, &payload).await?;
        Ok(build_token_info(parsed, refresh_token))
    }

    async fn refresh_idc(&self, credential: &Credential) -> AuthResult<TokenInfo> {
        let payload = serde_json::json!({
            "clientId": credential.client_id,
            "clientSecret": credential.client_secret,
            "refreshToken": credential.refresh_token,
            "grantType": "refresh_token",
        });
        let parsed = self.post_refresh(&self.idc_url, &payload).await?;
        Ok(build_token_info(parsed, &credential.refresh_token))
    }

    async fn post_refresh(
        &self,
        url: &str,
        payload: &serde_json::Value,
    ) -> AuthResult<RefreshResponse> {
        let body = serde_json::to_vec(payload)
            .map_err(|err| AuthError::RefreshTransport(err.to_string()))?;
        let resp = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("accept", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|err| AuthError::RefreshTransport(err.to_string()))?;

        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|err| AuthError::RefreshTransport(err.to_string()))?;

        if !status.is_success() {
            let text = String::from_utf8_lossy(&bytes).to_string();
            if status.is_client_error() {
                warn!(%status, "refresh secret rejected by identity service");
                return Err(AuthError::RefreshRejected(format!("{status}: {text}")));
            }
            return Err(AuthError::RefreshTransport(format!("{status}: {text}")));
        }

        let parsed: RefreshResponse = serde_json::from_slice(&bytes)
            .map_err(|err| AuthError::RefreshTransport(format!("decode refresh: {err}")))?;
        if parsed.access_token.is_empty() {
            return Err(AuthError::RefreshTransport(
                "refresh response missing accessToken".to_string(),
            ));
        }
        debug!(expires_in = ?parsed.expires_in, "refresh succeeded");
        Ok(parsed)
    }
}

fn build_token_info(parsed: RefreshResponse, fallback_refresh: &str) -> TokenInfo {
    let lifetime = parsed
        .expires_in
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TOKEN_LIFETIME);
    TokenInfo {
        access_token: parsed.access_token,
        refresh_token: parsed
            .refresh_token
            .filter(|token| !token.is_empty())
            .unwrap_or_else(|| fallback_refresh.to_string()),
        expires_at: SystemTime::now() + lifetime,
        profile_arn: parsed.profile_arn,
    }
}

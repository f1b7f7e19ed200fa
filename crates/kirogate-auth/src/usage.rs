//! Quota probe against the upstream usage-limits endpoint.

use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};
use crate::fingerprint::Fingerprint;
use crate::governor::is_suspension_signal;
use crate::refresh::TokenInfo;

const USAGE_LIMITS_URL: &str =
    "https://codewhisperer.us-east-1.amazonaws.com/getUsageLimits?isEmailRequired=true&origin=AI_EDITOR&resourceType=AGENTIC_REQUEST";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreeTrialInfo {
    #[serde(default)]
    pub free_trial_status: String,
    #[serde(default)]
    pub usage_limit_with_precision: f64,
    #[serde(default)]
    pub current_usage_with_precision: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageBreakdown {
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub usage_limit_with_precision: f64,
    #[serde(default)]
    pub current_usage_with_precision: f64,
    #[serde(default)]
    pub free_trial_info: Option<FreeTrialInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub subscription_title: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLimits {
    #[serde(default)]
    pub usage_breakdown_list: Vec<UsageBreakdown>,
    #[serde(default)]
    pub subscription_info: SubscriptionInfo,
    #[serde(default)]
    pub user_info: UserInfo,
}

/// Available credit: the CREDIT breakdown's base allowance plus an ACTIVE
/// free trial, clamped at zero.
pub fn available_credit(limits: &UsageLimits) -> f64 {
    for breakdown in &limits.usage_breakdown_list {
        if breakdown.resource_type != "CREDIT" {
            continue;
        }
        let mut total = 0.0;
        if let Some(trial) = &breakdown.free_trial_info {
            if trial.free_trial_status == "ACTIVE" {
                total += trial.usage_limit_with_precision - trial.current_usage_with_precision;
            }
        }
        total += breakdown.usage_limit_with_precision - breakdown.current_usage_with_precision;
        return total.max(0.0);
    }
    0.0
}

/// Outcome of one probe, carrying a possible explicit suspension signal.
#[derive(Debug)]
pub enum ProbeOutcome {
    Limits(Box<UsageLimits>),
    Suspended(String),
}

#[derive(Debug, Clone)]
pub struct UsageChecker {
    client: wreq::Client,
    url: String,
}

impl UsageChecker {
    pub fn new(client: wreq::Client) -> Self {
        Self {
            client,
            url: USAGE_LIMITS_URL.to_string(),
        }
    }

    pub fn with_url(client: wreq::Client, url: String) -> Self {
        Self { client, url }
    }

    /// Probe the quota endpoint with the credential's own fingerprint so the
    /// traffic pattern stays consistent with dispatch calls.
    pub async fn check(
        &self,
        token: &TokenInfo,
        fingerprint: &Fingerprint,
    ) -> AuthResult<ProbeOutcome> {
        let mut request = self
            .client
            .get(&self.url)
            .header("Authorization", format!("Bearer {}", token.access_token))
            .header("amz-sdk-invocation-id", Uuid::new_v4().to_string())
            .header("amz-sdk-request", "attempt=1; max=1");
        for (name, value) in fingerprint.headers() {
            request = request.header(name, value);
        }

        let resp = request
            .send()
            .await
            .map_err(|err| AuthError::UsageProbe(err.to_string()))?;
        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|err| AuthError::UsageProbe(err.to_string()))?;

        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes).to_string();
            if is_suspension_signal(&body) {
                warn!(%status, "usage probe reports credential suspension");
                return Ok(ProbeOutcome::Suspended(body));
            }
            return Err(AuthError::UsageProbe(format!("{status}: {body}")));
        }

        let limits: UsageLimits = serde_json::from_slice(&bytes)
            .map_err(|err| AuthError::UsageProbe(format!("decode usage limits: {err}")))?;
        debug!(
            available = available_credit(&limits),
            subscription = %limits.subscription_info.kind,
            "usage limits refreshed"
        );
        Ok(ProbeOutcome::Limits(Box::new(limits)))
    }
}

//! Access token cache and the manager tying rotation, governance and
//! refresh together.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::credential::{Credential, CredentialSet, key_for_index};
use crate::error::{AuthError, AuthResult};
use crate::fingerprint::{Fingerprint, FingerprintRegistry};
use crate::governor::RateGovernor;
use crate::persist;
use crate::refresh::{TokenInfo, TokenRefresher};
use crate::rotator::Rotator;
use crate::store::TokenStore;
use crate::usage::{ProbeOutcome, UsageChecker, UsageLimits, available_credit};

/// One cached access token plus its last-known quota view.
#[derive(Debug, Clone)]
pub struct CachedToken {
    pub token: TokenInfo,
    pub usage: Option<UsageLimits>,
    pub cached_at: Instant,
    pub last_used: Option<Instant>,
    pub available: f64,
}

impl CachedToken {
    pub fn is_usable(&self) -> bool {
        !self.token.is_expired() && self.available > 0.0
    }
}

#[derive(Debug)]
struct Inner {
    credentials: CredentialSet,
    tokens: HashMap<String, CachedToken>,
    rotator: Rotator,
    last_refresh: Option<Instant>,
}

/// Process-wide credential manager. One tokio mutex guards the token map,
/// the credential list and the rotator index; refresh network calls happen
/// outside the lock and results are installed back under it.
pub struct TokenManager {
    inner: Mutex<Inner>,
    governor: Arc<RateGovernor>,
    fingerprints: Arc<FingerprintRegistry>,
    refresher: TokenRefresher,
    usage: UsageChecker,
    store: Option<Arc<TokenStore>>,
    ttl: Duration,
}

impl TokenManager {
    pub fn new(
        credentials: CredentialSet,
        governor: Arc<RateGovernor>,
        fingerprints: Arc<FingerprintRegistry>,
        refresher: TokenRefresher,
        usage: UsageChecker,
        store: Option<Arc<TokenStore>>,
        ttl: Duration,
    ) -> Self {
        let keys = credentials.served_keys();
        info!(
            credential_count = credentials.credentials.len(),
            served_count = keys.len(),
            "token manager initialized (strict round-robin)"
        );
        Self {
            inner: Mutex::new(Inner {
                credentials,
                tokens: HashMap::new(),
                rotator: Rotator::new(keys),
                last_refresh: None,
            }),
            governor,
            fingerprints,
            refresher,
            usage,
            store,
            ttl,
        }
    }

    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }

    pub fn fingerprints(&self) -> &Arc<FingerprintRegistry> {
        &self.fingerprints
    }

    pub async fn credential_count(&self) -> usize {
        self.inner.lock().await.credentials.credentials.len()
    }

    /// Resolve the next usable credential: refresh stale cache entries,
    /// sweep the rotation order, honor spacing, stamp usage.
    ///
    /// Returns the credential key, the access token and the credential's
    /// sticky fingerprint.
    pub async fn acquire(&self) -> AuthResult<(String, TokenInfo, Arc<Fingerprint>)> {
        let refresh_error = self.refresh_cache_if_stale().await;

        let selected = {
            let mut inner = self.inner.lock().await;
            let Inner {
                tokens, rotator, ..
            } = &mut *inner;
            let governor = &self.governor;
            let ttl = self.ttl;

            let base_skip = |key: &str| {
                if governor.is_in_cooldown(key) {
                    return true;
                }
                if governor.is_daily_limit_exceeded(key) {
                    debug!(
                        token_key = key,
                        remaining = ?governor.daily_remaining(key),
                        "daily cap reached, skipping"
                    );
                    return true;
                }
                match tokens.get(key) {
                    Some(cached) => cached.cached_at.elapsed() > ttl || !cached.is_usable(),
                    None => true,
                }
            };

            // Strict round-robin with spacing preference: take the first key
            // in sweep order that is already clear of its per-key interval;
            // when every eligible key is still inside its window, take the
            // one that frees up soonest.
            let order = rotator.sweep_order();
            let chosen = order
                .iter()
                .find(|key| !base_skip(key) && governor.pending_spacing(key).is_zero())
                .or_else(|| {
                    order
                        .iter()
                        .filter(|key| !base_skip(key))
                        .min_by_key(|key| governor.pending_spacing(key))
                })
                .cloned();
            if let Some(key) = chosen.as_deref() {
                rotator.focus(key);
            } else {
                warn!(total = order.len(), "no credential selectable after full sweep");
            }
            chosen
        };

        let Some(key) = selected else {
            // Prefer a concrete refresh rejection over the generic verdict.
            return Err(refresh_error.unwrap_or(AuthError::NoTokenAvailable));
        };

        // Spacing wait happens without holding the manager lock.
        self.governor.wait_for_key(&key).await;
        self.governor.record_request(&key);
        if self.governor.should_rotate(&key) {
            self.governor.reset_consecutive(&key);
            let mut inner = self.inner.lock().await;
            inner.rotator.advance();
            info!(
                token_key = %key,
                next_index = inner.rotator.current_index(),
                "rotation pressure: advancing to next credential"
            );
        }

        let fingerprint = self.fingerprints.get(&key);

        let mut inner = self.inner.lock().await;
        let Some(cached) = inner.tokens.get_mut(&key) else {
            return Err(AuthError::NoTokenAvailable);
        };
        cached.last_used = Some(Instant::now());
        if cached.available > 0.0 {
            // Local estimate between quota probes.
            cached.available -= 1.0;
        }
        Ok((key, cached.token.clone(), fingerprint))
    }

    /// Report a failed upstream call: backoff cooldown plus rotor advance.
    pub async fn mark_failed(&self, token_key: &str) {
        self.governor.mark_failed(token_key);
        let mut inner = self.inner.lock().await;
        inner.rotator.advance();
        warn!(
            token_key,
            next_index = inner.rotator.current_index(),
            "credential failed, rotating"
        );
    }

    pub fn mark_success(&self, token_key: &str) {
        self.governor.record_success(token_key);
    }

    pub fn mark_suspended(&self, token_key: &str, reason: &str) {
        self.governor.mark_suspended(token_key, reason);
    }

    /// Refresh every credential whose cache entry is past the TTL. Network
    /// calls run outside the manager lock; results install back under it.
    /// Returns the first refresh rejection seen, for error preference.
    async fn refresh_cache_if_stale(&self) -> Option<AuthError> {
        let work: Vec<(usize, String, Credential)> = {
            let inner = self.inner.lock().await;
            let stale = match inner.last_refresh {
                Some(at) => at.elapsed() > self.ttl,
                None => true,
            };
            if !stale {
                return None;
            }
            inner
                .credentials
                .credentials
                .iter()
                .enumerate()
                .filter(|(_, credential)| !credential.disabled)
                .map(|(index, credential)| (index, key_for_index(index), credential.clone()))
                .collect()
        };
        if work.is_empty() {
            let mut inner = self.inner.lock().await;
            inner.last_refresh = Some(Instant::now());
            return None;
        }

        let mut refreshed = Vec::new();
        let mut first_rejection = None;
        for (index, key, credential) in work {
            match self.refresh_single(&key, &credential).await {
                Ok(cached) => refreshed.push((index, key, cached)),
                Err(err) => {
                    warn!(token_key = %key, %err, "credential refresh failed");
                    if matches!(err, AuthError::RefreshRejected(_)) && first_rejection.is_none() {
                        first_rejection = Some(err);
                    }
                }
            }
        }

        let mut rotated = false;
        {
            let mut inner = self.inner.lock().await;
            for (index, key, cached) in refreshed {
                if let Some(credential) = inner.credentials.credentials.get_mut(index) {
                    let new_secret = &cached.token.refresh_token;
                    if !new_secret.is_empty() && *new_secret != credential.refresh_token {
                        debug!(token_key = %key, "refresh secret rotated by identity service");
                        credential.refresh_token = new_secret.clone();
                        rotated = true;
                    }
                }
                inner.tokens.insert(key, cached);
            }
            inner.last_refresh = Some(Instant::now());
            if rotated {
                self.spawn_write_back(&inner.credentials);
            }
        }

        first_rejection
    }

    async fn refresh_single(&self, key: &str, credential: &Credential) -> AuthResult<CachedToken> {
        let token = self.refresher.refresh(credential).await?;

        // Quota probe reuses the credential's fingerprint; probe failure is
        // non-fatal and leaves the previous availability estimate in place.
        let fingerprint = self.fingerprints.get(key);
        let (usage, available) = match self.usage.check(&token, &fingerprint).await {
            Ok(ProbeOutcome::Limits(limits)) => {
                let available = available_credit(&limits);
                (Some(*limits), available)
            }
            Ok(ProbeOutcome::Suspended(body)) => {
                self.governor.mark_suspended(key, &body);
                (None, 0.0)
            }
            Err(err) => {
                warn!(token_key = key, %err, "usage probe failed");
                (None, 1.0)
            }
        };

        Ok(CachedToken {
            token,
            usage,
            cached_at: Instant::now(),
            last_used: None,
            available,
        })
    }

    fn spawn_write_back(&self, credentials: &CredentialSet) {
        let store = self.store.clone();
        let file_path: Option<PathBuf> = credentials.file_path.clone();
        let multi_format = credentials.multi_format;
        let snapshot = credentials.credentials.clone();
        tokio::task::spawn_blocking(move || {
            persist::write_back(
                store.as_deref(),
                file_path.as_deref(),
                multi_format,
                &snapshot,
            );
        });
    }

    /// Seed a cache entry directly; selection tests use this to avoid the
    /// network refresh path.
    #[cfg(test)]
    pub(crate) async fn seed(&self, key: &str, cached: CachedToken) {
        let mut inner = self.inner.lock().await;
        inner.tokens.insert(key.to_string(), cached);
        inner.last_refresh = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{AuthKind, CredentialSource};
    use crate::governor::GovernorConfig;
    use std::time::SystemTime;

    fn fast_governor() -> Arc<RateGovernor> {
        Arc::new(RateGovernor::new(GovernorConfig {
            min_token_interval: Duration::from_millis(10),
            max_token_interval: Duration::from_millis(10),
            global_min_interval: Duration::from_millis(5),
            max_consecutive_use: 10,
            cooldown_duration: Duration::from_millis(100),
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(400),
            backoff_multiplier: 2.0,
            daily_max_requests: 0,
            jitter_percent: 0,
            suspended_cooldown: Duration::from_millis(200),
        }))
    }

    fn credential(refresh: &str) -> Credential {
        Credential {
            auth_kind: AuthKind::Social,
            refresh_token: refresh.to_string(),
            client_id: None,
            client_secret: None,
            disabled: false,
            source: CredentialSource::Env,
            source_id: None,
        }
    }

    fn cached(access: &str) -> CachedToken {
        CachedToken {
            token: TokenInfo {
                access_token: access.to_string(),
                refresh_token: format!("rt-{access}"),
                expires_at: SystemTime::now() + Duration::from_secs(3600),
                profile_arn: None,
            },
            usage: None,
            cached_at: Instant::now(),
            last_used: None,
            available: 100.0,
        }
    }

    fn manager(count: usize) -> TokenManager {
        let set = CredentialSet {
            credentials: (0..count).map(|i| credential(&format!("rt-{i}"))).collect(),
            file_path: None,
            multi_format: false,
        };
        let client = wreq::Client::new();
        TokenManager::new(
            set,
            fast_governor(),
            Arc::new(FingerprintRegistry::new()),
            TokenRefresher::new(client.clone()),
            UsageChecker::new(client),
            None,
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn round_robin_alternates_across_keys() {
        let manager = manager(2);
        manager.seed("token_0", cached("a")).await;
        manager.seed("token_1", cached("b")).await;

        // Spacing preference yields strict alternation for back-to-back
        // requests: the just-used key is still inside its interval.
        let mut order = Vec::new();
        for _ in 0..4 {
            let (key, ..) = manager.acquire().await.unwrap();
            order.push(key);
        }
        assert_eq!(order, vec!["token_0", "token_1", "token_0", "token_1"]);
    }

    #[tokio::test]
    async fn failure_advances_to_next_key() {
        let manager = manager(2);
        manager.seed("token_0", cached("a")).await;
        manager.seed("token_1", cached("b")).await;

        manager.mark_failed("token_0").await;
        let (key, ..) = manager.acquire().await.unwrap();
        assert_eq!(key, "token_1");
    }

    #[tokio::test]
    async fn cooldown_skips_failed_credential_until_expiry() {
        let manager = manager(2);
        manager.seed("token_0", cached("a")).await;
        manager.seed("token_1", cached("b")).await;

        manager.mark_failed("token_0").await;
        for _ in 0..3 {
            let (key, ..) = manager.acquire().await.unwrap();
            assert_eq!(key, "token_1");
        }

        // Backoff for one failure tops out at 120ms with the fast config;
        // once it expires the alternation includes token_0 again.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!manager.governor().is_in_cooldown("token_0"));
        let (first, ..) = manager.acquire().await.unwrap();
        let (second, ..) = manager.acquire().await.unwrap();
        assert!([first, second].contains(&"token_0".to_string()));
    }

    #[tokio::test]
    async fn suspended_credential_is_never_selected() {
        let manager = manager(2);
        manager.seed("token_0", cached("a")).await;
        manager.seed("token_1", cached("b")).await;

        manager.mark_suspended("token_0", "TEMPORARILY_SUSPENDED");
        for _ in 0..10 {
            let (key, ..) = manager.acquire().await.unwrap();
            assert_eq!(key, "token_1");
        }
    }

    #[tokio::test]
    async fn exhausted_credit_is_unusable() {
        let manager = manager(1);
        let mut token = cached("a");
        token.available = 0.0;
        manager.seed("token_0", token).await;

        let err = manager.acquire().await.unwrap_err();
        assert!(matches!(err, AuthError::NoTokenAvailable));
    }

    #[tokio::test]
    async fn expired_token_is_unusable() {
        let manager = manager(1);
        let mut token = cached("a");
        token.token.expires_at = SystemTime::now() - Duration::from_secs(1);
        manager.seed("token_0", token).await;

        let err = manager.acquire().await.unwrap_err();
        assert!(matches!(err, AuthError::NoTokenAvailable));
    }

    #[tokio::test]
    async fn acquire_decrements_available_estimate() {
        let manager = manager(1);
        manager.seed("token_0", cached("a")).await;
        manager.acquire().await.unwrap();
        let inner = manager.inner.lock().await;
        let cached = inner.tokens.get("token_0").unwrap();
        assert_eq!(cached.available, 99.0);
        assert!(cached.last_used.is_some());
    }

    #[tokio::test]
    async fn fingerprint_is_stable_across_acquires() {
        let manager = manager(1);
        manager.seed("token_0", cached("a")).await;
        let (_, _, first) = manager.acquire().await.unwrap();
        let (_, _, second) = manager.acquire().await.unwrap();
        assert_eq!(first.product_hash, second.product_hash);
    }
}

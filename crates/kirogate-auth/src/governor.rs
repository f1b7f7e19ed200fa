//! Per-credential and global request pacing, failure backoff, daily caps and
//! long-duration suspension.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::tuning::Tuning;

#[derive(Debug, Clone)]
pub struct GovernorConfig {
    pub min_token_interval: Duration,
    pub max_token_interval: Duration,
    pub global_min_interval: Duration,
    pub max_consecutive_use: u32,
    pub cooldown_duration: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub backoff_multiplier: f64,
    pub daily_max_requests: u32,
    pub jitter_percent: u32,
    pub suspended_cooldown: Duration,
}

impl From<&Tuning> for GovernorConfig {
    fn from(tuning: &Tuning) -> Self {
        Self {
            min_token_interval: tuning.min_token_interval,
            max_token_interval: tuning.max_token_interval,
            global_min_interval: tuning.global_min_interval,
            max_consecutive_use: tuning.max_consecutive_use,
            cooldown_duration: tuning.cooldown_duration,
            backoff_base: tuning.backoff_base,
            backoff_max: tuning.backoff_max,
            backoff_multiplier: tuning.backoff_multiplier,
            daily_max_requests: tuning.daily_max_requests,
            jitter_percent: tuning.jitter_percent,
            suspended_cooldown: tuning.suspended_cooldown,
        }
    }
}

#[derive(Debug, Default)]
struct TokenState {
    last_request: Option<Instant>,
    request_count: u32,
    cooldown_end: Option<Instant>,
    fail_count: u32,
    daily_requests: u32,
    daily_reset: Option<SystemTime>,
    suspended: bool,
    suspended_at: Option<SystemTime>,
    suspend_reason: String,
}

#[derive(Debug, Default)]
struct Inner {
    states: HashMap<String, TokenState>,
    global_last_request: Option<Instant>,
}

/// Snapshot row exposed by [`RateGovernor::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct TokenStateSnapshot {
    pub token_key: String,
    pub consecutive_count: u32,
    pub fail_count: u32,
    pub daily_requests: u32,
    pub daily_remaining: i64,
    pub in_cooldown: bool,
    pub cooldown_remaining_secs: f64,
    pub is_suspended: bool,
    pub suspended_secs_ago: Option<f64>,
    pub suspend_reason: String,
}

/// Owns all [`TokenState`]s behind one mutex; predicates take the lock,
/// inspect, lazily clear expired cooldowns and release.
#[derive(Debug)]
pub struct RateGovernor {
    inner: Mutex<Inner>,
    config: GovernorConfig,
}

impl RateGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            config,
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Sleep until `token_key` may issue its next upstream call; the wait is
    /// the larger of the remaining global floor and the sampled per-key
    /// interval. Returns the time actually waited.
    pub async fn wait_for_key(&self, token_key: &str) -> Duration {
        let wait = {
            let mut inner = self.inner.lock().expect("governor lock poisoned");
            let now = Instant::now();
            let mut total = Duration::ZERO;

            if let Some(global_last) = inner.global_last_request {
                let elapsed = now.saturating_duration_since(global_last);
                if elapsed < self.config.global_min_interval {
                    total = self.config.global_min_interval - elapsed;
                }
            }

            let required = self.sampled_interval();
            let state = state_mut(&mut inner.states, token_key);
            if let Some(last) = state.last_request {
                let elapsed = now.saturating_duration_since(last);
                if elapsed < required {
                    let per_key = required - elapsed;
                    if per_key > total {
                        total = per_key;
                    }
                }
            }
            total
        };

        if wait > Duration::ZERO {
            debug!(token_key, wait_ms = wait.as_millis() as u64, "rate limit wait");
            tokio::time::sleep(wait).await;
        }
        wait
    }

    /// Remaining deterministic per-key spacing for selection purposes: the
    /// minimum interval is the floor every candidate must clear, while the
    /// sampled, jittered interval governs the actual wait.
    pub fn pending_spacing(&self, token_key: &str) -> Duration {
        let inner = self.inner.lock().expect("governor lock poisoned");
        let Some(state) = inner.states.get(token_key) else {
            return Duration::ZERO;
        };
        let Some(last) = state.last_request else {
            return Duration::ZERO;
        };
        self.config
            .min_token_interval
            .saturating_sub(last.elapsed())
    }

    /// Record an issued request: stamps global and per-key last-request and
    /// bumps the consecutive and daily counters.
    pub fn record_request(&self, token_key: &str) {
        let mut inner = self.inner.lock().expect("governor lock poisoned");
        let now = Instant::now();
        inner.global_last_request = Some(now);
        let state = state_mut(&mut inner.states, token_key);
        state.last_request = Some(now);
        state.request_count += 1;
        state.daily_requests += 1;
    }

    /// True once the consecutive-use cap is reached; the caller advances the
    /// rotator and resets the counter.
    pub fn should_rotate(&self, token_key: &str) -> bool {
        let mut inner = self.inner.lock().expect("governor lock poisoned");
        let cap = self.config.max_consecutive_use;
        state_mut(&mut inner.states, token_key).request_count >= cap
    }

    pub fn reset_consecutive(&self, token_key: &str) {
        let mut inner = self.inner.lock().expect("governor lock poisoned");
        state_mut(&mut inner.states, token_key).request_count = 0;
    }

    /// Report a failed request: exponential backoff cooldown.
    pub fn mark_failed(&self, token_key: &str) {
        let mut inner = self.inner.lock().expect("governor lock poisoned");
        let backoff = {
            let state = state_mut(&mut inner.states, token_key);
            state.fail_count += 1;
            state.request_count = 0;
            let backoff = self.backoff_for(state.fail_count);
            state.cooldown_end = Some(Instant::now() + backoff);
            backoff
        };
        info!(
            token_key,
            cooldown_secs = backoff.as_secs(),
            "credential entered backoff cooldown"
        );
    }

    /// Long-duration suspension in response to an explicit upstream signal.
    pub fn mark_suspended(&self, token_key: &str, reason: &str) {
        let mut inner = self.inner.lock().expect("governor lock poisoned");
        let cooldown = self.config.suspended_cooldown;
        let state = state_mut(&mut inner.states, token_key);
        state.suspended = true;
        state.suspended_at = Some(SystemTime::now());
        state.suspend_reason = reason.to_string();
        state.cooldown_end = Some(Instant::now() + cooldown);
        state.request_count = 0;
        error!(
            token_key,
            reason,
            cooldown_secs = cooldown.as_secs(),
            "credential suspended by upstream"
        );
    }

    /// Scan an upstream error body for the suspension markers and mark the
    /// credential when found.
    pub fn check_and_mark_suspended(&self, token_key: &str, error_body: &str) -> bool {
        if is_suspension_signal(error_body) {
            self.mark_suspended(token_key, error_body);
            return true;
        }
        false
    }

    /// Cooldown check with lazy clearing: once the end passes, both the
    /// failure counter and the suspension flag reset.
    pub fn is_in_cooldown(&self, token_key: &str) -> bool {
        let mut inner = self.inner.lock().expect("governor lock poisoned");
        let Some(state) = inner.states.get_mut(token_key) else {
            return false;
        };

        let now = Instant::now();
        if let Some(end) = state.cooldown_end {
            if now < end {
                if state.suspended {
                    debug!(token_key, reason = %state.suspend_reason, "skipping suspended credential");
                }
                return true;
            }
        }

        if state.fail_count > 0 {
            state.fail_count = 0;
            debug!(token_key, "cooldown expired, failure counter reset");
        }
        if state.suspended {
            state.suspended = false;
            state.suspend_reason.clear();
            info!(token_key, "suspension cooldown expired, credential usable again");
        }
        false
    }

    pub fn is_suspended(&self, token_key: &str) -> bool {
        let mut inner = self.inner.lock().expect("governor lock poisoned");
        let Some(state) = inner.states.get_mut(token_key) else {
            return false;
        };
        if !state.suspended {
            return false;
        }
        if let Some(end) = state.cooldown_end {
            if Instant::now() < end {
                return true;
            }
        }
        state.suspended = false;
        state.suspend_reason.clear();
        false
    }

    pub fn is_daily_limit_exceeded(&self, token_key: &str) -> bool {
        if self.config.daily_max_requests == 0 {
            return false;
        }
        let mut inner = self.inner.lock().expect("governor lock poisoned");
        let cap = self.config.daily_max_requests;
        let state = state_mut(&mut inner.states, token_key);
        state.daily_requests >= cap
    }

    /// Remaining daily budget; `None` when the cap is disabled.
    pub fn daily_remaining(&self, token_key: &str) -> Option<u32> {
        if self.config.daily_max_requests == 0 {
            return None;
        }
        let mut inner = self.inner.lock().expect("governor lock poisoned");
        let cap = self.config.daily_max_requests;
        let state = state_mut(&mut inner.states, token_key);
        Some(cap.saturating_sub(state.daily_requests))
    }

    /// Report a successful request: failure counter resets.
    pub fn record_success(&self, token_key: &str) {
        let mut inner = self.inner.lock().expect("governor lock poisoned");
        let state = state_mut(&mut inner.states, token_key);
        if state.fail_count > 0 {
            state.fail_count = 0;
            debug!(token_key, "request succeeded, failure counter reset");
        }
    }

    pub fn stats(&self) -> Vec<TokenStateSnapshot> {
        let inner = self.inner.lock().expect("governor lock poisoned");
        let now = Instant::now();
        let mut rows: Vec<TokenStateSnapshot> = inner
            .states
            .iter()
            .map(|(key, state)| {
                let cooldown_remaining = state
                    .cooldown_end
                    .filter(|end| *end > now)
                    .map(|end| end - now)
                    .unwrap_or(Duration::ZERO);
                TokenStateSnapshot {
                    token_key: key.clone(),
                    consecutive_count: state.request_count,
                    fail_count: state.fail_count,
                    daily_requests: state.daily_requests,
                    daily_remaining: if self.config.daily_max_requests == 0 {
                        -1
                    } else {
                        self.config.daily_max_requests as i64 - state.daily_requests as i64
                    },
                    in_cooldown: cooldown_remaining > Duration::ZERO,
                    cooldown_remaining_secs: cooldown_remaining.as_secs_f64(),
                    is_suspended: state.suspended,
                    suspended_secs_ago: state.suspended_at.and_then(|at| {
                        SystemTime::now()
                            .duration_since(at)
                            .ok()
                            .map(|elapsed| elapsed.as_secs_f64())
                    }),
                    suspend_reason: state.suspend_reason.clone(),
                }
            })
            .collect();
        rows.sort_by(|a, b| a.token_key.cmp(&b.token_key));
        rows
    }

    /// `base · multiplier^(n−1) · (1 + U[0, 0.2])`, clamped to the maximum.
    fn backoff_for(&self, fail_count: u32) -> Duration {
        if fail_count == 0 {
            return self.config.cooldown_duration;
        }
        let exponent = (fail_count - 1) as f64;
        let multiplier = self.config.backoff_multiplier.powf(exponent);
        let mut backoff = self.config.backoff_base.as_secs_f64() * multiplier;
        backoff *= 1.0 + rand::rng().random::<f64>() * 0.2;
        let max = self.config.backoff_max.as_secs_f64();
        if backoff > max {
            backoff = max;
        }
        Duration::from_secs_f64(backoff)
    }

    /// Uniform sample from `[min, max]`, stretched by up to `jitter_percent`
    /// percent.
    fn sampled_interval(&self) -> Duration {
        let min = self.config.min_token_interval;
        let max = self.config.max_token_interval;
        let mut rng = rand::rng();
        let base = if max > min {
            min + Duration::from_secs_f64(rng.random::<f64>() * (max - min).as_secs_f64())
        } else {
            min
        };
        if self.config.jitter_percent == 0 {
            return base;
        }
        let jitter_range = base.as_secs_f64() * self.config.jitter_percent as f64 / 100.0;
        base + Duration::from_secs_f64(rng.random::<f64>() * jitter_range)
    }
}

/// Get-or-create with the lazy daily reset applied on every access.
fn state_mut<'a>(
    states: &'a mut HashMap<String, TokenState>,
    token_key: &str,
) -> &'a mut TokenState {
    let state = states.entry(token_key.to_string()).or_default();
    let now = SystemTime::now();
    let reset = state.daily_reset.get_or_insert_with(|| next_midnight(now));
    if now >= *reset {
        state.daily_requests = 0;
        *reset = next_midnight(now);
        debug!(token_key, "daily request counter reset");
    }
    state
}

/// The next 24-hour truncation boundary after `now`.
fn next_midnight(now: SystemTime) -> SystemTime {
    const DAY: u64 = 24 * 60 * 60;
    let secs = now
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0);
    UNIX_EPOCH + Duration::from_secs((secs / DAY + 1) * DAY)
}

pub fn is_suspension_signal(body: &str) -> bool {
    body.contains("TEMPORARILY_SUSPENDED") || body.contains("temporarily is suspended")
}

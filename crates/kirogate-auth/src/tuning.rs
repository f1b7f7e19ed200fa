//! Behavior knobs read from the environment once at startup.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Tuning {
    pub token_cache_ttl: Duration,
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
    pub request_deadline: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            token_cache_ttl: Duration::from_secs(5 * 60),
            min_token_interval: Duration::from_secs(10),
            max_token_interval: Duration::from_secs(30),
            global_min_interval: Duration::from_secs(5),
            max_consecutive_use: 10,
            cooldown_duration: Duration::from_secs(5 * 60),
            backoff_base: Duration::from_secs(2 * 60),
            backoff_max: Duration::from_secs(60 * 60),
            backoff_multiplier: 2.0,
            daily_max_requests: 500,
            jitter_percent: 30,
            suspended_cooldown: Duration::from_secs(24 * 60 * 60),
            request_deadline: Duration::from_secs(5 * 60),
        }
    }
}

impl Tuning {
    /// Read every knob from the environment, falling back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            token_cache_ttl: env_duration("TOKEN_CACHE_TTL", defaults.token_cache_ttl),
            min_token_interval: env_duration(
                "RATE_LIMIT_MIN_INTERVAL",
                defaults.min_token_interval,
            ),
            max_token_interval: env_duration(
                "RATE_LIMIT_MAX_INTERVAL",
                defaults.max_token_interval,
            ),
            global_min_interval: env_duration(
                "RATE_LIMIT_GLOBAL_MIN_INTERVAL",
                defaults.global_min_interval,
            ),
            max_consecutive_use: env_u32("RATE_LIMIT_MAX_CONSECUTIVE", defaults.max_consecutive_use),
            cooldown_duration: env_duration("RATE_LIMIT_COOLDOWN", defaults.cooldown_duration),
            backoff_base: env_duration("RATE_LIMIT_BACKOFF_BASE", defaults.backoff_base),
            backoff_max: env_duration("RATE_LIMIT_BACKOFF_MAX", defaults.backoff_max),
            backoff_multiplier: env_f64(
                "RATE_LIMIT_BACKOFF_MULTIPLIER",
                defaults.backoff_multiplier,
            ),
            daily_max_requests: env_u32("RATE_LIMIT_DAILY_MAX", defaults.daily_max_requests),
            jitter_percent: env_u32("RATE_LIMIT_JITTER_PERCENT", defaults.jitter_percent),
            suspended_cooldown: env_duration(
                "SUSPENDED_TOKEN_COOLDOWN",
                defaults.suspended_cooldown,
            ),
            request_deadline: env_duration("REQUEST_DEADLINE", defaults.request_deadline),
        }
    }
}

/// Parse a Go-style duration string: `300ms`, `10s`, `2m`, `1h`, or a bare
/// number of seconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let split = value.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    let (number, unit) = value.split_at(split);
    let number: f64 = number.parse().ok()?;
    let millis = match unit {
        "ms" => number,
        "s" => number * 1_000.0,
        "m" => number * 60_000.0,
        "h" => number * 3_600_000.0,
        _ => return None,
    };
    if millis < 0.0 {
        return None;
    }
    Some(Duration::from_millis(millis as u64))
}

fn env_duration(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .as_deref()
        .and_then(parse_duration)
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unit_suffixes() {
        assert_eq!(parse_duration("10s"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn bare_number_is_seconds() {
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("fast"), None);
        assert_eq!(parse_duration("10d"), None);
    }

    #[test]
    fn defaults_match_documented_values() {
        let tuning = Tuning::default();
        assert_eq!(tuning.global_min_interval, Duration::from_secs(5));
        assert_eq!(tuning.min_token_interval, Duration::from_secs(10));
        assert_eq!(tuning.max_token_interval, Duration::from_secs(30));
        assert_eq!(tuning.max_consecutive_use, 10);
        assert_eq!(tuning.daily_max_requests, 500);
        assert_eq!(tuning.jitter_percent, 30);
        assert_eq!(tuning.suspended_cooldown, Duration::from_secs(86_400));
    }
}

//! Per-credential client fingerprints.
//!
//! A fingerprint is generated once per credential key and reused for every
//! outbound call made with that credential, quota probes included, so the
//! credential's traffic pattern stays self-consistent.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rand::Rng;

const SDK_VERSIONS: &[&str] = &[
    "1.0.20", "1.0.21", "1.0.22", "1.0.23", "1.0.24", "1.0.25", "1.0.26", "1.0.27",
];

const NODE_VERSIONS: &[&str] = &[
    "18.17.0", "18.18.0", "18.19.0", "18.20.0", "20.10.0", "20.11.0", "20.12.0", "20.14.0",
    "20.15.0", "20.16.0", "20.17.0", "20.18.0", "22.0.0", "22.1.0", "22.2.0",
];

const PRODUCT_VERSIONS: &[&str] = &[
    "0.3.0", "0.3.1", "0.3.2", "0.3.3", "0.4.0", "0.5.0", "0.6.0", "0.7.0", "0.8.0",
];

const ACCEPT_ENCODINGS: &[&str] = &[
    "gzip, deflate, br",
    "br, gzip, deflate",
    "gzip, deflate, br, zstd",
    "gzip, deflate",
    "br, gzip",
];

const SCREEN_RESOLUTIONS: &[&str] = &[
    "1920x1080",
    "2560x1440",
    "3840x2160",
    "1366x768",
    "1440x900",
    "1680x1050",
    "2560x1600",
    "3440x1440",
    "1920x1200",
    "2880x1800",
];

const CACHE_CONTROL_VALUES: &[&str] = &["no-cache", "no-store", "max-age=0", "no-cache, no-store"];

const COLOR_DEPTHS: &[u32] = &[24, 32, 30];
const DEVICE_MEMORIES: &[u32] = &[4, 8, 16, 32, 64];
const CPU_CORES: &[u32] = &[4, 6, 8, 10, 12, 16, 24, 32];

struct OsProfile {
    os_type: &'static str,
    versions: &'static [&'static str],
    locales: &'static [&'static str],
    timezones: &'static [&'static str],
    platform: &'static str,
}

const OS_PROFILES: &[OsProfile] = &[
    OsProfile {
        os_type: "darwin",
        versions: &[
            "23.0.0", "23.1.0", "23.5.0", "24.0.0", "24.1.0", "24.5.0", "24.6.0", "25.0.0",
        ],
        locales: &[
            "en-US", "en-GB", "zh-CN", "zh-TW", "ja-JP", "ko-KR", "de-DE", "fr-FR",
        ],
        timezones: &[
            "America/Los_Angeles",
            "America/New_York",
            "Europe/London",
            "Asia/Shanghai",
            "Asia/Tokyo",
        ],
        platform: "MacIntel",
    },
    OsProfile {
        os_type: "windows",
        versions: &[
            "10.0.19041",
            "10.0.19042",
            "10.0.19043",
            "10.0.22000",
            "10.0.22621",
            "10.0.22631",
        ],
        locales: &["en-US", "en-GB", "zh-CN", "zh-TW", "ja-JP", "ko-KR", "de-DE"],
        timezones: &[
            "America/Los_Angeles",
            "America/New_York",
            "America/Chicago",
            "Europe/London",
            "Asia/Shanghai",
        ],
        platform: "Win32",
    },
    OsProfile {
        os_type: "linux",
        versions: &[
            "5.15.0", "5.19.0", "6.1.0", "6.2.0", "6.5.0", "6.6.0", "6.8.0",
        ],
        locales: &["en-US", "en-GB", "zh-CN", "de-DE", "ru-RU"],
        timezones: &["UTC", "America/New_York", "Europe/Berlin", "Asia/Shanghai"],
        platform: "Linux x86_64",
    },
];

fn accept_language_pool(locale: &str) -> &'static [&'static str] {
    match locale {
        "en-US" => &[
            "en-US,en;q=0.9",
            "en-US,en;q=0.9,zh-CN;q=0.8",
            "en-US,en;q=0.8",
        ],
        "en-GB" => &["en-GB,en;q=0.9,en-US;q=0.8", "en-GB,en;q=0.9"],
        "zh-CN" => &[
            "zh-CN,zh;q=0.9,en;q=0.8",
            "zh-CN,zh;q=0.9,en-US;q=0.8,en;q=0.7",
        ],
        "zh-TW" => &[
            "zh-TW,zh;q=0.9,en;q=0.8",
            "zh-TW,zh-CN;q=0.9,zh;q=0.8,en;q=0.7",
        ],
        "ja-JP" => &["ja-JP,ja;q=0.9,en;q=0.8", "ja-JP,ja;q=0.9,en-US;q=0.8"],
        "ko-KR" => &["ko-KR,ko;q=0.9,en;q=0.8", "ko-KR,ko;q=0.9,en-US;q=0.8"],
        "de-DE" => &["de-DE,de;q=0.9,en;q=0.8", "de-DE,de;q=0.9,en-US;q=0.8"],
        "fr-FR" => &["fr-FR,fr;q=0.9,en;q=0.8", "fr-FR,fr;q=0.9,en-US;q=0.8"],
        "ru-RU" => &["ru-RU,ru;q=0.9,en;q=0.8", "ru-RU,ru;q=0.9,en;q=0.8,en-US;q=0.7"],
        _ => &["en-US,en;q=0.9"],
    }
}

fn timezone_offset_minutes(timezone: &str) -> Option<i32> {
    Some(match timezone {
        "America/Los_Angeles" => -480,
        "America/New_York" => -300,
        "America/Chicago" => -360,
        "Europe/London" => 0,
        "Europe/Berlin" => 60,
        "Asia/Shanghai" => 480,
        "Asia/Tokyo" => 540,
        "UTC" => 0,
        _ => return None,
    })
}

const HEADER_ORDER_TEMPLATES: &[&[&str]] = &[
    &[
        "Host",
        "Connection",
        "Content-Type",
        "Authorization",
        "Accept",
        "Accept-Language",
        "Accept-Encoding",
        "User-Agent",
    ],
    &[
        "Host",
        "User-Agent",
        "Accept",
        "Accept-Language",
        "Accept-Encoding",
        "Connection",
        "Content-Type",
        "Authorization",
    ],
    &[
        "Authorization",
        "Content-Type",
        "Accept",
        "Accept-Encoding",
        "Accept-Language",
        "User-Agent",
        "Host",
        "Connection",
    ],
    &[
        "Content-Type",
        "Authorization",
        "User-Agent",
        "Accept",
        "Accept-Language",
        "Accept-Encoding",
        "Host",
        "Connection",
    ],
    &[
        "User-Agent",
        "Accept",
        "Accept-Language",
        "Accept-Encoding",
        "Authorization",
        "Content-Type",
        "Host",
        "Connection",
    ],
];

/// Immutable browser-like identity bound to one credential.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub sdk_version: String,
    pub os_type: String,
    pub os_version: String,
    pub node_version: String,
    pub product_version: String,
    pub product_hash: String,
    pub accept_language: String,
    pub accept_encoding: String,
    pub sec_fetch_mode: String,
    pub sec_fetch_site: String,
    pub sec_fetch_dest: String,
    pub timezone: String,
    pub timezone_offset: i32,
    pub locale: String,
    pub screen_resolution: String,
    pub color_depth: u32,
    pub platform: String,
    pub device_memory: u32,
    pub hardware_concurrency: u32,
    pub do_not_track: Option<String>,
    pub cache_control: String,
    pub connection: String,
    pub header_order: &'static [&'static str],
}

impl Fingerprint {
    fn generate() -> Self {
        let mut rng = rand::rng();

        let profile = &OS_PROFILES[rng.random_range(0..OS_PROFILES.len())];
        let locale = profile.locales[rng.random_range(0..profile.locales.len())];
        let timezone = profile.timezones[rng.random_range(0..profile.timezones.len())];
        let languages = accept_language_pool(locale);

        let timezone_offset = timezone_offset_minutes(timezone)
            .unwrap_or_else(|| (rng.random_range(0..24i32) - 12) * 60);

        let mut hash = String::with_capacity(64);
        for _ in 0..64 {
            let nibble = rng.random_range(0..16u32);
            hash.push(char::from_digit(nibble, 16).unwrap_or('0'));
        }

        let do_not_track = if rng.random::<f64>() < 0.7 {
            None
        } else if rng.random::<f64>() < 0.5 {
            Some("1".to_string())
        } else {
            Some("0".to_string())
        };

        let connection = if rng.random::<f64>() < 0.8 {
            "keep-alive"
        } else {
            "close"
        };

        Fingerprint {
            sdk_version: SDK_VERSIONS[rng.random_range(0..SDK_VERSIONS.len())].to_string(),
            os_type: profile.os_type.to_string(),
            os_version: profile.versions[rng.random_range(0..profile.versions.len())].to_string(),
            node_version: NODE_VERSIONS[rng.random_range(0..NODE_VERSIONS.len())].to_string(),
            product_version: PRODUCT_VERSIONS[rng.random_range(0..PRODUCT_VERSIONS.len())]
                .to_string(),
            product_hash: hash,
            accept_language: languages[rng.random_range(0..languages.len())].to_string(),
            accept_encoding: ACCEPT_ENCODINGS[rng.random_range(0..ACCEPT_ENCODINGS.len())]
                .to_string(),
            sec_fetch_mode: "cors".to_string(),
            sec_fetch_site: "cross-site".to_string(),
            sec_fetch_dest: "empty".to_string(),
            timezone: timezone.to_string(),
            timezone_offset,
            locale: locale.to_string(),
            screen_resolution: SCREEN_RESOLUTIONS[rng.random_range(0..SCREEN_RESOLUTIONS.len())]
                .to_string(),
            color_depth: COLOR_DEPTHS[rng.random_range(0..COLOR_DEPTHS.len())],
            platform: profile.platform.to_string(),
            device_memory: DEVICE_MEMORIES[rng.random_range(0..DEVICE_MEMORIES.len())],
            hardware_concurrency: CPU_CORES[rng.random_range(0..CPU_CORES.len())],
            do_not_track,
            cache_control: CACHE_CONTROL_VALUES[rng.random_range(0..CACHE_CONTROL_VALUES.len())]
                .to_string(),
            connection: connection.to_string(),
            header_order: HEADER_ORDER_TEMPLATES[rng.random_range(0..HEADER_ORDER_TEMPLATES.len())],
        }
    }

    /// The AWS SDK user agent string carrying the product identity.
    pub fn user_agent(&self) -> String {
        format!(
            "aws-sdk-js/{} ua/2.1 os/{}#{} lang/js md/nodejs#{} api/codewhispererstreaming#{} m/E KiroIDE-{}-{}",
            self.sdk_version,
            self.os_type,
            self.os_version,
            self.node_version,
            self.sdk_version,
            self.product_version,
            self.product_hash,
        )
    }

    pub fn amz_user_agent(&self) -> String {
        format!(
            "aws-sdk-js/{} KiroIDE-{}-{}",
            self.sdk_version, self.product_version, self.product_hash,
        )
    }

    /// The header set this fingerprint contributes to an outbound request.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("User-Agent", self.user_agent()),
            ("x-amz-user-agent", self.amz_user_agent()),
            ("Accept-Language", self.accept_language.clone()),
            ("Accept-Encoding", self.accept_encoding.clone()),
            ("Connection", self.connection.clone()),
            ("sec-fetch-mode", self.sec_fetch_mode.clone()),
            ("sec-fetch-site", self.sec_fetch_site.clone()),
            ("sec-fetch-dest", self.sec_fetch_dest.clone()),
            ("Cache-Control", self.cache_control.clone()),
        ];
        if let Some(dnt) = &self.do_not_track {
            headers.push(("DNT", dnt.clone()));
        }
        headers
    }
}

/// Generate-once registry keyed by credential key.
#[derive(Debug, Default)]
pub struct FingerprintRegistry {
    fingerprints: RwLock<HashMap<String, Arc<Fingerprint>>>,
}

impl FingerprintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, token_key: &str) -> Arc<Fingerprint> {
        if let Some(fingerprint) = self
            .fingerprints
            .read()
            .expect("fingerprint lock poisoned")
            .get(token_key)
        {
            return fingerprint.clone();
        }

        let mut guard = self
            .fingerprints
            .write()
            .expect("fingerprint lock poisoned");
        // Double check: another request may have generated it meanwhile.
        if let Some(fingerprint) = guard.get(token_key) {
            return fingerprint.clone();
        }
        let fingerprint = Arc::new(Fingerprint::generate());
        guard.insert(token_key.to_string(), fingerprint.clone());
        fingerprint
    }

    pub fn len(&self) -> usize {
        self.fingerprints
            .read()
            .expect("fingerprint lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Distribution snapshot for the status endpoint.
    pub fn stats(&self) -> serde_json::Value {
        let guard = self.fingerprints.read().expect("fingerprint lock poisoned");
        let mut os_counts: HashMap<&str, u32> = HashMap::new();
        let mut locale_counts: HashMap<&str, u32> = HashMap::new();
        for fingerprint in guard.values() {
            *os_counts.entry(fingerprint.os_type.as_str()).or_default() += 1;
            *locale_counts.entry(fingerprint.locale.as_str()).or_default() += 1;
        }
        serde_json::json!({
            "total_fingerprints": guard.len(),
            "os_distribution": os_counts,
            "locale_distribution": locale_counts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_sticky_per_key() {
        let registry = FingerprintRegistry::new();
        let a = registry.get("token_0");
        let b = registry.get("token_0");
        assert_eq!(a.product_hash, b.product_hash);
        assert_eq!(a.user_agent(), b.user_agent());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn distinct_keys_get_distinct_entries() {
        let registry = FingerprintRegistry::new();
        registry.get("token_0");
        registry.get("token_1");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn generated_fields_stay_coherent() {
        for _ in 0..64 {
            let fingerprint = Fingerprint::generate();

            let profile = OS_PROFILES
                .iter()
                .find(|profile| profile.os_type == fingerprint.os_type)
                .expect("os profile");
            assert!(profile.locales.contains(&fingerprint.locale.as_str()));
            assert!(profile.timezones.contains(&fingerprint.timezone.as_str()));
            assert!(profile.versions.contains(&fingerprint.os_version.as_str()));
            assert_eq!(fingerprint.platform, profile.platform);

            // Accept-Language must lead with the chosen locale tag.
            assert!(
                fingerprint.accept_language.starts_with(&fingerprint.locale),
                "{} does not start with {}",
                fingerprint.accept_language,
                fingerprint.locale
            );

            assert_eq!(fingerprint.product_hash.len(), 64);
            assert!(fingerprint
                .product_hash
                .bytes()
                .all(|b| b.is_ascii_hexdigit()));
            assert!(COLOR_DEPTHS.contains(&fingerprint.color_depth));
            assert!(DEVICE_MEMORIES.contains(&fingerprint.device_memory));
            assert!(CPU_CORES.contains(&fingerprint.hardware_concurrency));
            assert!(fingerprint.connection == "keep-alive" || fingerprint.connection == "close");
            assert_eq!(fingerprint.header_order.len(), 8);
        }
    }

    #[test]
    fn user_agent_carries_sdk_and_product() {
        let fingerprint = Fingerprint::generate();
        let ua = fingerprint.user_agent();
        assert!(ua.starts_with(&format!("aws-sdk-js/{}", fingerprint.sdk_version)));
        assert!(ua.contains(&fingerprint.product_hash));
        assert!(fingerprint.amz_user_agent().contains("KiroIDE-"));
    }

    #[test]
    fn headers_include_dnt_only_when_set() {
        let mut saw_with = false;
        let mut saw_without = false;
        for _ in 0..256 {
            let fingerprint = Fingerprint::generate();
            let has_dnt = fingerprint
                .headers()
                .iter()
                .any(|(name, _)| *name == "DNT");
            assert_eq!(has_dnt, fingerprint.do_not_track.is_some());
            saw_with |= has_dnt;
            saw_without |= !has_dnt;
        }
        assert!(saw_with && saw_without);
    }
}

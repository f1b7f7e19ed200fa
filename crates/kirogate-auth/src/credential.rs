use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AuthError, AuthResult};
use crate::store::TokenStore;

pub const AUTH_TOKEN_ENV: &str = "KIRO_AUTH_TOKEN";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthKind {
    #[default]
    #[serde(rename = "Social")]
    Social,
    #[serde(rename = "IdC")]
    Idc,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CredentialSource {
    #[default]
    Env,
    File,
    Store,
}

impl CredentialSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialSource::Env => "env",
            CredentialSource::File => "file",
            CredentialSource::Store => "store",
        }
    }
}

/// One refresh-capable credential. The serialized shape matches the
/// credential file format; source bookkeeping stays in memory only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(rename = "auth", default)]
    pub auth_kind: AuthKind,
    #[serde(rename = "refreshToken", default)]
    pub refresh_token: String,
    #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(
        rename = "clientSecret",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
    #[serde(skip)]
    pub source: CredentialSource,
    #[serde(skip)]
    pub source_id: Option<String>,
}

impl Credential {
    fn is_valid(&self) -> bool {
        if self.refresh_token.trim().is_empty() {
            return false;
        }
        if self.auth_kind == AuthKind::Idc {
            let has_client = self
                .client_id
                .as_deref()
                .is_some_and(|value| !value.is_empty())
                && self
                    .client_secret
                    .as_deref()
                    .is_some_and(|value| !value.is_empty());
            if !has_client {
                return false;
            }
        }
        true
    }
}

/// Stable credential key derived from the merged list index.
pub fn key_for_index(index: usize) -> String {
    format!("token_{index}")
}

/// The merged, ordered credential list plus the metadata needed for file
/// write-back.
#[derive(Debug, Clone, Default)]
pub struct CredentialSet {
    pub credentials: Vec<Credential>,
    pub file_path: Option<PathBuf>,
    /// True when the file source was a JSON array (the only persistable
    /// file shape).
    pub multi_format: bool,
}

impl CredentialSet {
    /// Load from the managed store (when present) followed by the
    /// `KIRO_AUTH_TOKEN` environment variable (JSON string or file path).
    pub fn load(store: Option<&TokenStore>) -> AuthResult<Self> {
        let env_value = std::env::var(AUTH_TOKEN_ENV).ok().filter(|v| !v.is_empty());
        Self::from_parts(store, env_value.as_deref())
    }

    pub fn from_parts(store: Option<&TokenStore>, env_value: Option<&str>) -> AuthResult<Self> {
        let mut set = CredentialSet::default();

        if let Some(store) = store {
            let store_tokens = store.get_enabled_tokens();
            if !store_tokens.is_empty() {
                info!(count = store_tokens.len(), "loaded credentials from managed store");
            }
            for token in store_tokens {
                set.credentials.push(Credential {
                    auth_kind: token.auth_kind,
                    refresh_token: token.refresh_token,
                    client_id: token.client_id,
                    client_secret: token.client_secret,
                    disabled: token.disabled,
                    source: CredentialSource::Store,
                    source_id: Some(token.id),
                });
            }
        }

        if let Some(raw) = env_value {
            let (payload, file_path) = resolve_env_payload(raw)?;
            let (mut parsed, multi) = parse_credentials(&payload)?;
            let source = if file_path.is_some() {
                CredentialSource::File
            } else {
                CredentialSource::Env
            };
            for credential in &mut parsed {
                credential.source = source;
            }
            info!(
                count = parsed.len(),
                source = source.as_str(),
                "loaded credentials from environment"
            );
            set.file_path = file_path;
            set.multi_format = multi;
            set.credentials.extend(parsed);
        }

        set.credentials.retain(|credential| {
            let valid = credential.is_valid();
            if !valid {
                warn!("dropping credential with missing refresh secret or IdC client fields");
            }
            valid
        });

        Ok(set)
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Keys and credentials served to the rotation loop; disabled entries
    /// are retained in `credentials` for write-back but never served.
    pub fn served(&self) -> Vec<(String, &Credential)> {
        self.credentials
            .iter()
            .enumerate()
            .filter(|(_, credential)| !credential.disabled)
            .map(|(index, credential)| (key_for_index(index), credential))
            .collect()
    }

    pub fn served_keys(&self) -> Vec<String> {
        self.served().into_iter().map(|(key, _)| key).collect()
    }

    /// Credentials that came from the file source, in order.
    pub fn file_credentials(&self) -> Vec<&Credential> {
        self.credentials
            .iter()
            .filter(|credential| credential.source == CredentialSource::File)
            .collect()
    }
}

fn resolve_env_payload(raw: &str) -> AuthResult<(String, Option<PathBuf>)> {
    let candidate = Path::new(raw);
    if candidate.is_file() {
        let payload = std::fs::read_to_string(candidate)
            .map_err(|err| AuthError::InvalidConfig(format!("read credential file: {err}")))?;
        return Ok((payload, Some(candidate.to_path_buf())));
    }
    Ok((raw.to_string(), None))
}

/// Parse either a JSON array of credentials or a single credential object.
/// The boolean reports the array (persistable) shape.
pub fn parse_credentials(payload: &str) -> AuthResult<(Vec<Credential>, bool)> {
    if let Ok(list) = serde_json::from_str::<Vec<Credential>>(payload) {
        return Ok((list, true));
    }
    match serde_json::from_str::<Credential>(payload) {
        Ok(single) => Ok((vec![single], false)),
        Err(err) => Err(AuthError::InvalidConfig(format!(
            "credential payload is neither array nor object: {err}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_array_payload() {
        let payload = r#"[
            {"auth":"Social","refreshToken":"rt-1"},
            {"auth":"IdC","refreshToken":"rt-2","clientId":"c","clientSecret":"s"}
        ]"#;
        let (credentials, multi) = parse_credentials(payload).unwrap();
        assert!(multi);
        assert_eq!(credentials.len(), 2);
        assert_eq!(credentials[0].auth_kind, AuthKind::Social);
        assert_eq!(credentials[1].auth_kind, AuthKind::Idc);
    }

    #[test]
    fn parses_single_object_payload() {
        let (credentials, multi) =
            parse_credentials(r#"{"refreshToken":"rt-solo"}"#).unwrap();
        assert!(!multi);
        assert_eq!(credentials.len(), 1);
        assert_eq!(credentials[0].auth_kind, AuthKind::Social);
    }

    #[test]
    fn load_drops_invalid_entries() {
        let payload = r#"[
            {"refreshToken":""},
            {"auth":"IdC","refreshToken":"rt-no-client"},
            {"refreshToken":"rt-good"}
        ]"#;
        let set = CredentialSet::from_parts(None, Some(payload)).unwrap();
        assert_eq!(set.credentials.len(), 1);
        assert_eq!(set.credentials[0].refresh_token, "rt-good");
    }

    #[test]
    fn disabled_entries_are_retained_but_not_served() {
        let payload = r#"[
            {"refreshToken":"rt-a","disabled":true},
            {"refreshToken":"rt-b"}
        ]"#;
        let set = CredentialSet::from_parts(None, Some(payload)).unwrap();
        assert_eq!(set.credentials.len(), 2);
        let served = set.served();
        assert_eq!(served.len(), 1);
        assert_eq!(served[0].0, "token_1");
        assert_eq!(served[0].1.refresh_token, "rt-b");
    }

    #[test]
    fn serialized_shape_round_trips() {
        let credential = Credential {
            auth_kind: AuthKind::Idc,
            refresh_token: "rt".to_string(),
            client_id: Some("cid".to_string()),
            client_secret: Some("cs".to_string()),
            disabled: false,
            source: CredentialSource::File,
            source_id: None,
        };
        let json = serde_json::to_value(&credential).unwrap();
        assert_eq!(json["auth"], "IdC");
        assert_eq!(json["refreshToken"], "rt");
        assert!(json.get("disabled").is_none());
        let back: Credential = serde_json::from_value(json).unwrap();
        assert_eq!(back.auth_kind, AuthKind::Idc);
        assert_eq!(back.source, CredentialSource::Env);
    }
}

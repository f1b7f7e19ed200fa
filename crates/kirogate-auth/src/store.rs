//! JSON-file-backed managed store. Only the slice the gateway core consumes
//! lives here: enabled-token listing and refresh-secret updates, persisted
//! with atomic rename semantics.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::credential::AuthKind;
use crate::error::{AuthError, AuthResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredToken {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
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
    /// Unix seconds of the last mutation.
    #[serde(
        rename = "updatedAt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_at: Option<i64>,
}

/// Partial update applied by [`TokenStore::update_token`].
#[derive(Debug, Clone, Default)]
pub struct TokenStorePatch {
    pub refresh_token: Option<String>,
    pub disabled: Option<bool>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    tokens: Vec<StoredToken>,
}

#[derive(Debug)]
pub struct TokenStore {
    path: PathBuf,
    data: RwLock<StoreData>,
}

impl TokenStore {
    /// Open the store file, creating an empty one when missing.
    pub fn open(path: impl AsRef<Path>) -> AuthResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|err| AuthError::Persistence(format!("create store dir: {err}")))?;
        }

        let data = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|err| AuthError::Persistence(format!("parse store file: {err}")))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(err) => {
                return Err(AuthError::Persistence(format!("read store file: {err}")));
            }
        };

        let store = Self {
            path,
            data: RwLock::new(data),
        };
        store.save()?;
        Ok(store)
    }

    pub fn get_enabled_tokens(&self) -> Vec<StoredToken> {
        let data = self.data.read().expect("store lock poisoned");
        data.tokens
            .iter()
            .filter(|token| !token.disabled)
            .cloned()
            .collect()
    }

    /// Apply a partial update to one token and persist.
    pub fn update_token(&self, id: &str, patch: TokenStorePatch) -> AuthResult<StoredToken> {
        let updated = {
            let mut data = self.data.write().expect("store lock poisoned");
            let token = data
                .tokens
                .iter_mut()
                .find(|token| token.id == id)
                .ok_or_else(|| AuthError::Persistence(format!("unknown store token: {id}")))?;
            if let Some(refresh_token) = patch.refresh_token {
                if !refresh_token.is_empty() {
                    token.refresh_token = refresh_token;
                }
            }
            if let Some(disabled) = patch.disabled {
                token.disabled = disabled;
            }
            token.updated_at = Some(epoch_now());
            token.clone()
        };
        self.save()?;
        Ok(updated)
    }

    /// Insert a token (used by tests and bootstrap seeding).
    pub fn add_token(&self, token: StoredToken) -> AuthResult<()> {
        {
            let mut data = self.data.write().expect("store lock poisoned");
            data.tokens.push(token);
        }
        self.save()
    }

    /// Atomic persist: write `<path>.tmp`, then rename into place.
    fn save(&self) -> AuthResult<()> {
        let payload = {
            let data = self.data.read().expect("store lock poisoned");
            serde_json::to_vec_pretty(&*data)
                .map_err(|err| AuthError::Persistence(format!("encode store: {err}")))?
        };

        let tmp = crate::persist::tmp_sibling(&self.path);
        write_owner_only(&tmp, &payload)
            .map_err(|err| AuthError::Persistence(format!("write store tmp: {err}")))?;
        if let Err(err) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(AuthError::Persistence(format!("rename store file: {err}")));
        }
        debug!(path = %self.path.display(), "store persisted");
        Ok(())
    }
}

/// Write a file readable and writable by the owner only.
pub(crate) fn write_owner_only(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, payload)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

pub(crate) fn epoch_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

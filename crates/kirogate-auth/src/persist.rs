//! Write-back of rotated refresh secrets to the configuration sources.

use std::path::Path;

use tracing::{debug, warn};

use crate::credential::{Credential, CredentialSource};
use crate::error::{AuthError, AuthResult};
use crate::store::{TokenStore, TokenStorePatch, write_owner_only};

/// Persist the file-sourced credentials as a 2-space-indented JSON array,
/// atomically: write `<path>.tmp`, rename into place, owner-only bits.
pub fn persist_file(path: &Path, credentials: &[Credential]) -> AuthResult<()> {
    let file_credentials: Vec<&Credential> = credentials
        .iter()
        .filter(|credential| credential.source == CredentialSource::File)
        .collect();
    if file_credentials.is_empty() {
        return Ok(());
    }

    let payload = serde_json::to_vec_pretty(&file_credentials)
        .map_err(|err| AuthError::Persistence(format!("encode credentials: {err}")))?;

    let tmp = tmp_sibling(path);
    write_owner_only(&tmp, &payload)
        .map_err(|err| AuthError::Persistence(format!("write credentials tmp: {err}")))?;
    if let Err(err) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(AuthError::Persistence(format!(
            "rename credentials file: {err}"
        )));
    }
    debug!(path = %path.display(), count = file_credentials.len(), "credential file written back");
    Ok(())
}

/// `<path>.tmp`, next to the target so the rename stays on one filesystem.
pub fn tmp_sibling(path: &Path) -> std::path::PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::path::PathBuf::from(tmp)
}

/// One write-back pass over every source. Store-sourced entries update the
/// managed store; file-sourced entries rewrite the array file when the file
/// shape allows it. All failures are logged and swallowed: persistence never
/// fails a request.
pub fn write_back(
    store: Option<&TokenStore>,
    file_path: Option<&Path>,
    multi_format: bool,
    credentials: &[Credential],
) {
    let mut store_updates = 0usize;
    if let Some(store) = store {
        for credential in credentials {
            if credential.source != CredentialSource::Store {
                continue;
            }
            let Some(id) = credential.source_id.as_deref() else {
                continue;
            };
            match store.update_token(
                id,
                TokenStorePatch {
                    refresh_token: Some(credential.refresh_token.clone()),
                    disabled: None,
                },
            ) {
                Ok(_) => store_updates += 1,
                Err(err) => warn!(store_id = id, %err, "store write-back failed"),
            }
        }
    }

    match file_path {
        Some(path) if multi_format => {
            if let Err(err) = persist_file(path, credentials) {
                warn!(path = %path.display(), %err, "file write-back failed");
            }
        }
        Some(path) => {
            // Known limitation: a single-object credential file cannot be
            // rewritten as an array; the rotated secret lives only in memory.
            warn!(path = %path.display(), "single-credential file source is non-persistable");
        }
        None => {}
    }

    if store_updates > 0 {
        debug!(store_updates, "store write-back complete");
    }
}

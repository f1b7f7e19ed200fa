//! Refresh-secret rotation write-back against real files.

use kirogate_auth::credential::{CredentialSet, CredentialSource, parse_credentials};
use kirogate_auth::persist::write_back;
use kirogate_auth::store::{StoredToken, TokenStore, TokenStorePatch};
use tempfile::tempdir;

fn load_from_file(path: &std::path::Path) -> CredentialSet {
    let payload = std::fs::read_to_string(path).unwrap();
    let (mut credentials, multi) = parse_credentials(&payload).unwrap();
    for credential in &mut credentials {
        credential.source = CredentialSource::File;
    }
    CredentialSet {
        credentials,
        file_path: Some(path.to_path_buf()),
        multi_format: multi,
    }
}

#[test]
fn rotated_secret_lands_in_the_array_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tokens.json");
    std::fs::write(
        &path,
        r#"[
  {"auth":"Social","refreshToken":"rt-original-0"},
  {"auth":"Social","refreshToken":"rt-original-1"}
]"#,
    )
    .unwrap();

    let mut set = load_from_file(&path);
    assert!(set.multi_format);

    // The identity service rotated the first credential's secret.
    set.credentials[0].refresh_token = "rt-rotated-0".to_string();
    write_back(None, set.file_path.as_deref(), set.multi_format, &set.credentials);

    let reloaded = load_from_file(&path);
    assert_eq!(reloaded.credentials.len(), 2);
    assert_eq!(reloaded.credentials[0].refresh_token, "rt-rotated-0");
    assert_eq!(reloaded.credentials[1].refresh_token, "rt-original-1");
    assert!(!kirogate_auth::persist::tmp_sibling(&path).exists());
}

#[test]
fn file_always_parses_between_rotations() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tokens.json");
    std::fs::write(&path, r#"[{"auth":"Social","refreshToken":"rt-0"}]"#).unwrap();

    let mut set = load_from_file(&path);
    for round in 1..=25 {
        set.credentials[0].refresh_token = format!("rt-{round}");
        write_back(None, set.file_path.as_deref(), set.multi_format, &set.credentials);

        // Whatever instant we reread at, the file is a complete array with
        // either the old or the new secret; after write_back returns it is
        // exactly the new one.
        let reloaded = load_from_file(&path);
        assert_eq!(reloaded.credentials[0].refresh_token, format!("rt-{round}"));
    }
    assert!(!kirogate_auth::persist::tmp_sibling(&path).exists());
}

#[test]
fn single_object_file_is_not_persisted() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("token.json");
    let original = r#"{"auth":"Social","refreshToken":"rt-solo"}"#;
    std::fs::write(&path, original).unwrap();

    let mut set = load_from_file(&path);
    assert!(!set.multi_format);

    set.credentials[0].refresh_token = "rt-rotated".to_string();
    write_back(None, set.file_path.as_deref(), set.multi_format, &set.credentials);

    // Known limitation: the rotated secret stays in memory only.
    let on_disk = std::fs::read_to_string(&path).unwrap();
    assert_eq!(on_disk, original);
}

#[test]
fn store_and_file_sources_write_back_together() {
    let dir = tempdir().unwrap();
    let file_path = dir.path().join("tokens.json");
    std::fs::write(&file_path, r#"[{"auth":"Social","refreshToken":"rt-file"}]"#).unwrap();

    let store = TokenStore::open(dir.path().join("store.json")).unwrap();
    store
        .add_token(StoredToken {
            id: "sid-1".to_string(),
            name: String::new(),
            auth_kind: kirogate_auth::AuthKind::Social,
            refresh_token: "rt-store".to_string(),
            client_id: None,
            client_secret: None,
            disabled: false,
            updated_at: None,
        })
        .unwrap();

    let mut set = CredentialSet::from_parts(Some(&store), None).unwrap();
    assert_eq!(set.credentials.len(), 1);

    let mut file_set = load_from_file(&file_path);
    set.credentials.append(&mut file_set.credentials);
    set.file_path = Some(file_path.clone());
    set.multi_format = true;

    set.credentials[0].refresh_token = "rt-store-rotated".to_string();
    set.credentials[1].refresh_token = "rt-file-rotated".to_string();
    write_back(
        Some(&store),
        set.file_path.as_deref(),
        set.multi_format,
        &set.credentials,
    );

    assert_eq!(
        store.get_enabled_tokens()[0].refresh_token,
        "rt-store-rotated"
    );
    let reloaded = load_from_file(&file_path);
    assert_eq!(reloaded.credentials[0].refresh_token, "rt-file-rotated");
}

#[test]
fn store_update_rejects_empty_secret() {
    let dir = tempdir().unwrap();
    let store = TokenStore::open(dir.path().join("store.json")).unwrap();
    store
        .add_token(StoredToken {
            id: "sid".to_string(),
            name: String::new(),
            auth_kind: kirogate_auth::AuthKind::Social,
            refresh_token: "rt-keep".to_string(),
            client_id: None,
            client_secret: None,
            disabled: false,
            updated_at: None,
        })
        .unwrap();

    store
        .update_token(
            "sid",
            TokenStorePatch {
                refresh_token: Some(String::new()),
                disabled: None,
            },
        )
        .unwrap();
    assert_eq!(store.get_enabled_tokens()[0].refresh_token, "rt-keep");
}

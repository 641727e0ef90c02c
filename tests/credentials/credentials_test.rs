//! Coverage for credential loading and permission checks.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use courier::config::BridgeConfig;
use courier::credentials::{enforce_private_file_permissions, load_credentials, Credentials};

fn temp_env_path() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("courier_test_{}", uuid::Uuid::new_v4()));
    let create = fs::create_dir_all(&dir);
    assert!(create.is_ok());
    dir.join(".env")
}

#[test]
fn loads_env_credentials() {
    let env_path = temp_env_path();
    let write = fs::write(&env_path, "COURIER_BRIDGE_TOKEN=bridge-secret\nOTHER=abc123\n");
    assert!(write.is_ok());
    let perms = enforce_private_file_permissions(&env_path);
    assert!(perms.is_ok());

    let loaded = load_credentials(&env_path);
    assert!(loaded.is_ok());
    let credentials = match loaded {
        Ok(credentials) => credentials,
        Err(err) => panic!("credentials should load: {err}"),
    };

    assert_eq!(credentials.get("COURIER_BRIDGE_TOKEN"), Some("bridge-secret"));
    assert_eq!(credentials.get("OTHER"), Some("abc123"));
    assert_eq!(
        credentials.bridge_token(&BridgeConfig::default()).as_deref(),
        Some("bridge-secret")
    );
}

#[test]
fn missing_file_is_an_error() {
    let env_path = temp_env_path();
    assert!(load_credentials(&env_path).is_err());
}

#[test]
fn debug_output_redacts_values() {
    let credentials = Credentials::from_map(BTreeMap::from([(
        "COURIER_BRIDGE_TOKEN".to_owned(),
        "super-secret".to_owned(),
    )]));
    let rendered = format!("{credentials:?}");
    assert!(rendered.contains("COURIER_BRIDGE_TOKEN"));
    assert!(!rendered.contains("super-secret"));
}

#[test]
fn blank_or_unconfigured_token_is_absent() {
    let credentials = Credentials::from_map(BTreeMap::from([(
        "COURIER_TEST_BLANK_TOKEN".to_owned(),
        "   ".to_owned(),
    )]));
    let bridge = BridgeConfig {
        token_env: Some("COURIER_TEST_BLANK_TOKEN".to_owned()),
        ..BridgeConfig::default()
    };
    assert_eq!(credentials.bridge_token(&bridge), None);

    let no_token = BridgeConfig {
        token_env: None,
        ..BridgeConfig::default()
    };
    assert_eq!(credentials.bridge_token(&no_token), None);
}

#[cfg(unix)]
#[test]
fn rejects_world_readable_env_file() {
    use std::os::unix::fs::PermissionsExt;

    let env_path = temp_env_path();
    let write = fs::write(&env_path, "COURIER_BRIDGE_TOKEN=bridge-secret\n");
    assert!(write.is_ok());

    let perms = fs::set_permissions(&env_path, fs::Permissions::from_mode(0o644));
    assert!(perms.is_ok());

    let loaded = load_credentials(&env_path);
    assert!(loaded.is_err());
}

// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end lifecycle scenarios for the facade, seeded from the literal
//! test scenarios the envelope state machine must satisfy.

use secure_local_storage::{test_utils, Error, Facade, ImportKind, StorageConfig};
use serde_json::json;
use tempfile::TempDir;

fn config(dir: &std::path::Path, storage_key: &str) -> StorageConfig {
    StorageConfig::new(storage_key).with_storage_path(dir.to_path_buf())
}

/// The on-disk KV slot path for `storage_key`, mirroring `KvStore`'s own
/// filename sanitization (non-alphanumeric/`-`/`_` chars become `_`).
fn kv_path(dir: &std::path::Path, storage_key: &str) -> std::path::PathBuf {
    let sanitized: String = storage_key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    dir.join(format!("{sanitized}.json"))
}

#[tokio::test]
async fn scenario_device_mode_round_trip() {
    let log_path = test_utils::setup_test_logging("scenario_device_mode_round_trip");
    if let Err(e) = std::fs::write(&log_path, "Starting device mode round-trip scenario\n") {
        panic!("Failed to write to test log {}: {}", log_path.display(), e);
    }

    let dir = TempDir::new().unwrap();
    let facade = Facade::new(config(dir.path(), "app:sls")).unwrap();

    facade
        .set_data(&json!({"value1": 42, "nested": {"a": "b"}}))
        .await
        .unwrap();

    let mut view = facade.get_data().await.unwrap();
    assert_eq!(
        view.as_json().unwrap(),
        &json!({"value1": 42, "nested": {"a": "b"}})
    );
    view.clear();
    assert!(view.keys().is_err());

    // Clearing the view must not touch the persisted bundle.
    let view2 = facade.get_data().await.unwrap();
    assert_eq!(
        view2.as_json().unwrap(),
        &json!({"value1": 42, "nested": {"a": "b"}})
    );

    assert!(log_path.exists());
}

#[tokio::test]
async fn scenario_lock_unlock() {
    let log_path = test_utils::setup_test_logging("scenario_lock_unlock");
    if let Err(e) = std::fs::write(&log_path, "Starting lock/unlock scenario\n") {
        panic!("Failed to write to test log {}: {}", log_path.display(), e);
    }

    let dir = TempDir::new().unwrap();
    let facade = Facade::new(config(dir.path(), "app:sls")).unwrap();

    facade.set_data(&json!({"note": "hi"})).await.unwrap();
    facade
        .set_master_password("correct horse battery staple")
        .await
        .unwrap();
    facade.lock().await;

    assert!(matches!(facade.get_data().await, Err(Error::Locked)));

    let err = facade.unlock("wrong").await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(facade.is_locked().await);

    facade
        .unlock("correct horse battery staple")
        .await
        .unwrap();
    let view = facade.get_data().await.unwrap();
    assert_eq!(view.as_json().unwrap(), &json!({"note": "hi"}));
}

#[tokio::test]
async fn scenario_export_import_custom_password_device_to_device() {
    let src_dir = TempDir::new().unwrap();
    let dst_dir = TempDir::new().unwrap();

    let source = Facade::new(config(src_dir.path(), "src")).unwrap();
    source.set_data(&json!({"a": 1})).await.unwrap();
    let exported = source.export_data(Some("export-pass")).await.unwrap();

    let target = Facade::new(config(dst_dir.path(), "dst")).unwrap();
    let kind = target
        .import_data(&exported, "export-pass")
        .await
        .unwrap();
    assert_eq!(kind, ImportKind::CustomExportPassword);
    assert!(!target.is_using_master_password().await);
    assert!(!target.is_locked().await);

    let view = target.get_data().await.unwrap();
    assert_eq!(view.as_json().unwrap(), &json!({"a": 1}));
}

#[tokio::test]
async fn scenario_import_master_protected_bundle() {
    let src_dir = TempDir::new().unwrap();
    let dst_dir = TempDir::new().unwrap();

    let source = Facade::new(config(src_dir.path(), "src")).unwrap();
    source.set_master_password("mp").await.unwrap();
    source.set_data(&json!({"z": 9})).await.unwrap();
    let exported = source.export_data(None).await.unwrap();

    let target = Facade::new(config(dst_dir.path(), "dst")).unwrap();
    let kind = target.import_data(&exported, "mp").await.unwrap();
    assert_eq!(kind, ImportKind::MasterPassword);
    assert!(target.is_locked().await);
    assert!(matches!(target.get_data().await, Err(Error::Locked)));

    target.unlock("mp").await.unwrap();
    let view = target.get_data().await.unwrap();
    assert_eq!(view.as_json().unwrap(), &json!({"z": 9}));
}

#[tokio::test]
async fn scenario_aad_binding_rejects_mixed_header_and_data() {
    use secure_local_storage::bundle::parse_bundle;

    let dir = TempDir::new().unwrap();
    let storage_key = "app:sls";
    let facade = Facade::new(config(dir.path(), storage_key)).unwrap();
    facade.set_data(&json!({"a": 1})).await.unwrap();

    // Rotate keys to obtain a freshly wrapped (device-KEK-valid) header, then
    // splice it onto the original data payload, leaving data.iv/ciphertext
    // bound to the *old* header via AAD.
    let path = kv_path(dir.path(), storage_key);
    let original = std::fs::read_to_string(&path).unwrap();
    let original_bundle = parse_bundle(&original).unwrap();

    facade.rotate_keys().await.unwrap();
    let rotated = std::fs::read_to_string(&path).unwrap();
    let rotated_bundle = parse_bundle(&rotated).unwrap();

    let mut spliced = rotated_bundle;
    spliced.data = original_bundle.data;
    std::fs::write(&path, serde_json::to_string(&spliced).unwrap()).unwrap();

    let reopened = Facade::new(config(dir.path(), storage_key)).unwrap();
    assert!(matches!(reopened.get_data().await, Err(Error::Crypto(_))));
}

#[tokio::test]
async fn scenario_v2_to_v3_migration_on_unlock() {
    use secure_local_storage::cipher;
    use secure_local_storage::kdf::derive_kek;

    let dir = TempDir::new().unwrap();
    let storage_key = "app:sls";

    // Seed a valid V2 master bundle directly, bypassing the facade (which
    // never emits V2 bundles), the way a legacy on-disk store would look.
    let salt = cipher::generate_salt();
    let rounds = 4;
    let kek = derive_kek("migrate-1", &salt, rounds).unwrap();
    let dek = cipher::generate_dek();
    let wrapped = cipher::wrap(&dek, &kek, None).unwrap();
    let plaintext = json!({"b": 2});
    let encrypted = cipher::encrypt(&dek, &plaintext, None).unwrap();

    let v2_bundle = json!({
        "header": {
            "v": 2,
            "salt": secure_local_storage::bundle::b64(&salt),
            "rounds": rounds,
            "iv": secure_local_storage::bundle::b64(&wrapped.iv),
            "wrappedKey": secure_local_storage::bundle::b64(&wrapped.ciphertext),
        },
        "data": {
            "iv": secure_local_storage::bundle::b64(&encrypted.iv),
            "ciphertext": secure_local_storage::bundle::b64(&encrypted.ciphertext),
        }
    });
    std::fs::write(
        kv_path(dir.path(), storage_key),
        serde_json::to_string(&v2_bundle).unwrap(),
    )
    .unwrap();

    let facade = Facade::new(config(dir.path(), storage_key)).unwrap();
    assert!(matches!(facade.get_data().await, Err(Error::Locked)));

    facade.unlock("migrate-1").await.unwrap();
    let view = facade.get_data().await.unwrap();
    assert_eq!(view.as_json().unwrap(), &json!({"b": 2}));

    let persisted = std::fs::read_to_string(kv_path(dir.path(), storage_key)).unwrap();
    let migrated = secure_local_storage::bundle::parse_bundle(&persisted).unwrap();
    assert!(migrated.is_v3());
    assert_eq!(migrated.ctx(), secure_local_storage::Ctx::Store);
}

#[tokio::test]
async fn rotate_keys_changes_identity_but_preserves_payload() {
    let dir = TempDir::new().unwrap();
    let storage_key = "app:sls";
    let facade = Facade::new(config(dir.path(), storage_key)).unwrap();
    facade.set_data(&json!({"x": 1})).await.unwrap();

    let path = kv_path(dir.path(), storage_key);
    let before = std::fs::read_to_string(&path).unwrap();

    facade.rotate_keys().await.unwrap();
    let after = std::fs::read_to_string(&path).unwrap();
    assert_ne!(before, after);

    let view = facade.get_data().await.unwrap();
    assert_eq!(view.as_json().unwrap(), &json!({"x": 1}));
}

#[tokio::test]
async fn cross_storage_key_bundle_triggers_device_kek_reset() {
    use secure_local_storage::ResetReason;

    // A bundle's Wrap AAD binds in the storage key it was written under, so
    // dropping one key's bundle under another key's slot is indistinguishable
    // from an untrusted/corrupted bundle: initialization resets to a fresh
    // empty device store rather than surfacing the original payload.
    let dir = TempDir::new().unwrap();
    let a = Facade::new(config(dir.path(), "app:a")).unwrap();
    a.set_data(&json!({"owner": "a"})).await.unwrap();

    let path_a = kv_path(dir.path(), "app:a");
    let bundle_a = std::fs::read_to_string(&path_a).unwrap();

    let path_b = kv_path(dir.path(), "app:b");
    std::fs::write(&path_b, &bundle_a).unwrap();

    let b = Facade::new(config(dir.path(), "app:b")).unwrap();
    let view = b.get_data().await.unwrap();
    assert_eq!(view.as_json().unwrap(), &json!({}));
    assert_eq!(
        b.last_reset_reason().await.unwrap(),
        Some(ResetReason::DeviceKekMismatch)
    );
}

#[tokio::test]
async fn clear_resets_to_a_fresh_empty_device_store() {
    let dir = TempDir::new().unwrap();
    let facade = Facade::new(config(dir.path(), "app:sls")).unwrap();
    facade.set_data(&json!({"a": 1})).await.unwrap();
    facade.set_master_password("pw").await.unwrap();

    facade.clear().await.unwrap();

    assert!(!facade.is_using_master_password().await);
    assert!(!facade.is_locked().await);
    let view = facade.get_data().await.unwrap();
    assert_eq!(view.as_json().unwrap(), &json!({}));
}

#[tokio::test]
async fn slot_holding_non_bundle_json_resets_with_invalid_config_reason() {
    use secure_local_storage::ResetReason;

    let dir = TempDir::new().unwrap();
    let storage_key = "app:sls";

    // Valid JSON, but not shaped like a Bundle at all - distinct from an
    // absent slot, which leaves reset_reason unset.
    std::fs::write(
        kv_path(dir.path(), storage_key),
        serde_json::to_string(&json!({"not": "a bundle"})).unwrap(),
    )
    .unwrap();

    let facade = Facade::new(config(dir.path(), storage_key)).unwrap();
    let view = facade.get_data().await.unwrap();
    assert_eq!(view.as_json().unwrap(), &json!({}));
    assert_eq!(
        facade.last_reset_reason().await.unwrap(),
        Some(ResetReason::InvalidConfig)
    );
}

#[tokio::test]
async fn absent_slot_leaves_reset_reason_unset() {
    let dir = TempDir::new().unwrap();
    let facade = Facade::new(config(dir.path(), "app:sls")).unwrap();
    let view = facade.get_data().await.unwrap();
    assert_eq!(view.as_json().unwrap(), &json!({}));
    assert_eq!(facade.last_reset_reason().await.unwrap(), None);
}

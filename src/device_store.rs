// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The device key store: a per-namespace provider of the non-extractable KEK
//! used to protect data in "device mode".
//!
//! Namespaces are `(dbName, storeName, keyId)` triples, the Rust analogue of
//! an IndexedDB object store key. Each namespace's key is cached in-process
//! and, when a storage directory is available, persisted to a permissioned
//! file so it survives process restarts. If persistence is unavailable the
//! store degrades to pure in-memory operation: best effort, never fatal.

use crate::cipher::{KeyHandle, KeyUsages, KEY_LENGTH};
use crate::error::Result;
use base64::{engine::general_purpose::STANDARD, Engine};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use tokio::fs as async_fs;
use tokio::sync::Mutex;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub struct DeviceKeyStore {
    dir: Option<PathBuf>,
    cache: Mutex<HashMap<String, KeyHandle>>,
}

/// Process-wide registry of device key stores keyed by namespace string, so
/// that distinct `Facade` instances configured with the same
/// `(dbName, storeName, keyId)` namespace observe the same key and its
/// rotations.
static REGISTRY: OnceLock<StdMutex<HashMap<String, Arc<DeviceKeyStore>>>> = OnceLock::new();

/// Return the shared device key store for `namespace`, creating one backed
/// by `dir` on first use. Subsequent calls with the same namespace ignore
/// `dir` and return the existing store.
pub fn shared(namespace: &str, dir: Option<PathBuf>) -> Arc<DeviceKeyStore> {
    let registry = REGISTRY.get_or_init(|| StdMutex::new(HashMap::new()));
    let mut guard = registry.lock().expect("device key store registry poisoned");
    guard
        .entry(namespace.to_string())
        .or_insert_with(|| Arc::new(DeviceKeyStore::new(dir)))
        .clone()
}

impl DeviceKeyStore {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, namespace: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|d| d.join(format!("{}.key", sanitize_filename(namespace))))
    }

    /// Return the device KEK for `namespace`, creating and persisting a
    /// fresh one on first use. The handle is non-extractable and carries
    /// wrap/unwrap usages only, matching a device-bound key's role.
    pub async fn get_key(&self, namespace: &str) -> Result<KeyHandle> {
        let mut cache = self.cache.lock().await;
        if let Some(existing) = cache.get(namespace) {
            return Ok(existing.clone());
        }

        if let Some(path) = self.path_for(namespace) {
            if let Some(loaded) = self.load_from_disk(&path).await? {
                cache.insert(namespace.to_string(), loaded.clone());
                return Ok(loaded);
            }
        }

        let mut bytes = [0u8; KEY_LENGTH];
        use rand::{rngs::OsRng, RngCore};
        OsRng.fill_bytes(&mut bytes);
        let handle = KeyHandle::new(bytes, false, KeyUsages::WRAP | KeyUsages::UNWRAP);

        if let Some(path) = self.path_for(namespace) {
            if let Err(e) = self.persist(&path, &bytes).await {
                tracing::warn!("device key for {namespace} could not be persisted: {e}");
            }
        }

        cache.insert(namespace.to_string(), handle.clone());
        Ok(handle)
    }

    /// Discard and regenerate the device KEK for `namespace`. Used when a
    /// device-mode bundle fails to unwrap and the facade must reset rather
    /// than stay stuck.
    pub async fn rotate_key(&self, namespace: &str) -> Result<KeyHandle> {
        let mut cache = self.cache.lock().await;
        cache.remove(namespace);
        if let Some(path) = self.path_for(namespace) {
            if let Err(e) = async_fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("failed to remove stale device key file for {namespace}: {e}");
                }
            }
        }
        drop(cache);
        self.get_key(namespace).await
    }

    /// Remove any on-disk and in-memory trace of the device key for `namespace`.
    pub async fn delete_persistent(&self, namespace: &str) {
        let mut cache = self.cache.lock().await;
        cache.remove(namespace);
        if let Some(path) = self.path_for(namespace) {
            if let Err(e) = async_fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("failed to delete device key file for {namespace}: {e}");
                }
            }
        }
    }

    async fn load_from_disk(&self, path: &PathBuf) -> Result<Option<KeyHandle>> {
        let content = match async_fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                tracing::warn!("failed to read device key file {path:?}: {e}");
                return Ok(None);
            }
        };
        let decoded = match STANDARD.decode(content.trim()) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("device key file {path:?} is not valid base64: {e}");
                return Ok(None);
            }
        };
        if decoded.len() != KEY_LENGTH {
            tracing::warn!("device key file {path:?} has unexpected length, ignoring");
            return Ok(None);
        }
        let mut bytes = [0u8; KEY_LENGTH];
        bytes.copy_from_slice(&decoded);
        Ok(Some(KeyHandle::new(
            bytes,
            false,
            KeyUsages::WRAP | KeyUsages::UNWRAP,
        )))
    }

    async fn persist(&self, path: &PathBuf, bytes: &[u8; KEY_LENGTH]) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                async_fs::create_dir_all(parent).await?;
            }
            #[cfg(unix)]
            {
                let metadata = async_fs::metadata(parent).await?;
                let mut permissions = metadata.permissions();
                permissions.set_mode(0o700);
                async_fs::set_permissions(parent, permissions).await?;
            }
        }
        let encoded = STANDARD.encode(bytes);
        async_fs::write(path, &encoded).await?;
        #[cfg(unix)]
        {
            let metadata = async_fs::metadata(path).await?;
            let mut permissions = metadata.permissions();
            permissions.set_mode(0o600);
            async_fs::set_permissions(path, permissions).await?;
        }
        Ok(())
    }
}

fn sanitize_filename(namespace: &str) -> String {
    namespace
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_key_is_stable_across_calls() {
        let store = DeviceKeyStore::new(None);
        let a = store.get_key("db::store::id").await.unwrap();
        let b = store.get_key("db::store::id").await.unwrap();
        assert_eq!(
            a.into_extractable_bytes().is_err(),
            b.into_extractable_bytes().is_err()
        );
    }

    #[tokio::test]
    async fn distinct_namespaces_get_distinct_keys() {
        use crate::cipher::{generate_dek, wrap};
        let store = DeviceKeyStore::new(None);
        let a = store.get_key("ns-a").await.unwrap();
        let b = store.get_key("ns-b").await.unwrap();
        let dek = generate_dek();
        let wrapped_a = wrap(&dek, &a, None).unwrap();
        assert!(crate::cipher::unwrap(&wrapped_a.iv, &wrapped_a.ciphertext, &b, false, None).is_err());
    }

    #[tokio::test]
    async fn key_persists_across_store_instances() {
        let dir = tempfile::TempDir::new().unwrap();
        let store1 = DeviceKeyStore::new(Some(dir.path().to_path_buf()));
        let key1 = store1.get_key("ns").await.unwrap();

        let store2 = DeviceKeyStore::new(Some(dir.path().to_path_buf()));
        let key2 = store2.get_key("ns").await.unwrap();

        use crate::cipher::{generate_dek, unwrap, wrap};
        let dek = generate_dek();
        let wrapped = wrap(&dek, &key1, None).unwrap();
        assert!(unwrap(&wrapped.iv, &wrapped.ciphertext, &key2, false, None).is_ok());
    }

    #[tokio::test]
    async fn rotate_key_invalidates_old_key() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = DeviceKeyStore::new(Some(dir.path().to_path_buf()));
        let old = store.get_key("ns").await.unwrap();
        let new = store.rotate_key("ns").await.unwrap();

        use crate::cipher::{generate_dek, unwrap, wrap};
        let dek = generate_dek();
        let wrapped = wrap(&dek, &old, None).unwrap();
        assert!(unwrap(&wrapped.iv, &wrapped.ciphertext, &new, false, None).is_err());
    }

    #[tokio::test]
    async fn delete_persistent_removes_file_and_cache() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = DeviceKeyStore::new(Some(dir.path().to_path_buf()));
        store.get_key("ns").await.unwrap();
        store.delete_persistent("ns").await;
        assert!(store.path_for("ns").map(|p| !p.exists()).unwrap_or(true));
    }

    #[tokio::test]
    async fn missing_storage_dir_degrades_to_in_memory() {
        let store = DeviceKeyStore::new(None);
        assert!(store.get_key("ns").await.is_ok());
    }

    #[tokio::test]
    async fn shared_returns_same_store_for_same_namespace() {
        use crate::cipher::{generate_dek, unwrap, wrap};
        let unique = format!("shared-ns-{:?}", std::thread::current().id());
        let a = shared(&unique, None);
        let b = shared(&unique, None);
        let key_a = a.get_key("ns").await.unwrap();
        let key_b = b.get_key("ns").await.unwrap();
        let dek = generate_dek();
        let wrapped = wrap(&dek, &key_a, None).unwrap();
        assert!(unwrap(&wrapped.iv, &wrapped.ciphertext, &key_b, false, None).is_ok());
    }
}

// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Facade configuration: storage key, device-key-store namespace, and
//! storage-directory resolution.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Device-key-store namespace: a `(dbName, storeName, keyId)` triple.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdbConfig {
    pub db_name: String,
    pub store_name: String,
    pub key_id: String,
}

impl Default for IdbConfig {
    fn default() -> Self {
        Self {
            db_name: "secure-local-storage".to_string(),
            store_name: "device-keys".to_string(),
            key_id: "default".to_string(),
        }
    }
}

impl IdbConfig {
    /// Serialize the namespace triple into a single key for the in-process
    /// device-key-store registry.
    pub fn namespace(&self) -> String {
        format!("{}::{}::{}", self.db_name, self.store_name, self.key_id)
    }
}

/// Configuration for a [`crate::facade::Facade`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// KV slot name; also the AAD root for `ctx == "store"` bundles.
    pub storage_key: String,

    /// Device-key-store namespace.
    #[serde(default)]
    pub idb: IdbConfig,

    /// Override for the on-disk storage directory. If unset, falls back to
    /// `SLS_HOME` then the OS config directory.
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_key: "app:secure-local-storage".to_string(),
            idb: IdbConfig::default(),
            storage_path: None,
        }
    }
}

impl StorageConfig {
    pub fn new(storage_key: impl Into<String>) -> Self {
        Self {
            storage_key: storage_key.into(),
            ..Default::default()
        }
    }

    pub fn with_idb(mut self, idb: IdbConfig) -> Self {
        self.idb = idb;
        self
    }

    pub fn with_storage_path(mut self, path: PathBuf) -> Self {
        self.storage_path = Some(path);
        self
    }

    /// Resolve the directory holding the KV file and the device-key store.
    /// Precedence: `storage_path` > `SLS_HOME` env var > OS config directory.
    pub fn storage_dir(&self) -> crate::error::Result<PathBuf> {
        if let Some(custom) = &self.storage_path {
            return Ok(custom.clone());
        }
        if let Ok(home) = std::env::var("SLS_HOME") {
            return Ok(PathBuf::from(home));
        }
        let base = dirs::config_dir().ok_or_else(|| {
            crate::error::Error::NotSupported("could not determine config directory".into())
        })?;
        Ok(base.join("secure-local-storage"))
    }

    pub fn keys_dir(&self) -> crate::error::Result<PathBuf> {
        Ok(self.storage_dir()?.join("keys"))
    }
}

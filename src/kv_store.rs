// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The site-local key/value store: a single JSON string slot keyed by
//! `storage_key`, the Rust analogue of a browser's `localStorage` entry.
//!
//! Writes go through a write-temp-then-rename discipline with a post-write
//! readback integrity check.

use crate::error::{Error, Result};
use serde_json::Value;
use std::path::PathBuf;
use tokio::fs as async_fs;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Soft quota enforced before attempting a write, simulating the browser
/// quota errors a `localStorage`-backed caller needs to detect by name/code.
pub const DEFAULT_MAX_BYTES: usize = 10 * 1024 * 1024;

pub struct KvStore {
    dir: PathBuf,
    max_bytes: usize,
}

impl KvStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_filename(key)))
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.dir.exists() {
            async_fs::create_dir_all(&self.dir).await?;
        }
        #[cfg(unix)]
        {
            let metadata = async_fs::metadata(&self.dir).await?;
            let mut permissions = metadata.permissions();
            permissions.set_mode(0o700);
            async_fs::set_permissions(&self.dir, permissions).await?;
        }
        Ok(())
    }

    /// Read and parse the bundle JSON at `key`. Malformed JSON or a missing
    /// slot both yield `None`.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let content = match async_fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };
        Ok(serde_json::from_str(&content).ok())
    }

    /// Stringify and write `value` to `key`, reading it back to verify
    /// integrity. Detects quota exhaustion and surfaces it distinctly from
    /// other persistence failures.
    pub async fn set(&self, key: &str, value: &Value) -> Result<()> {
        self.ensure_dir().await?;
        let content = serde_json::to_string(value)?;
        let attempted_bytes = content.len();
        if attempted_bytes > self.max_bytes {
            return Err(Error::StorageFull { attempted_bytes });
        }

        let path = self.path_for(key);
        let temp_path = path.with_extension("tmp");
        if let Err(e) = async_fs::write(&temp_path, &content).await {
            return Err(classify_write_error(e, attempted_bytes));
        }

        #[cfg(unix)]
        {
            let metadata = async_fs::metadata(&temp_path).await?;
            let mut permissions = metadata.permissions();
            permissions.set_mode(0o600);
            async_fs::set_permissions(&temp_path, permissions).await?;
        }

        async_fs::rename(&temp_path, &path).await?;

        let readback = async_fs::read_to_string(&path).await?;
        if readback != content {
            return Err(Error::Persistence(format!(
                "readback mismatch writing key {key}"
            )));
        }
        Ok(())
    }

    /// Best-effort removal; never throws.
    pub async fn clear(&self, key: &str) {
        let path = self.path_for(key);
        if let Err(e) = async_fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("failed to clear kv slot {key}: {e}");
            }
        }
    }
}

fn classify_write_error(e: std::io::Error, attempted_bytes: usize) -> Error {
    // ENOSPC: the OS-level analogue of a browser QuotaExceededError.
    if e.raw_os_error() == Some(28) {
        return Error::StorageFull { attempted_bytes };
    }
    Error::Persistence(e.to_string())
}

fn sanitize_filename(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

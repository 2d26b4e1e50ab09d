// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Session cache: holds at most one derived master-password KEK, keyed by
//! the exact `(salt, rounds)` pair it was derived from.
//!
//! This cache never expires on its own — it is cleared explicitly on lock,
//! since a derived KEK is only ever valid for the bundle header it was
//! derived against.

use crate::cipher::KeyHandle;
use tokio::sync::RwLock;

struct Entry {
    kek: KeyHandle,
    salt_b64: String,
    rounds: u32,
}

#[derive(Default)]
pub struct SessionCache {
    entry: RwLock<Option<Entry>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self {
            entry: RwLock::new(None),
        }
    }

    /// Store `kek` as the cached derivation for `(salt_b64, rounds)`,
    /// replacing whatever was cached before.
    pub async fn set(&self, kek: KeyHandle, salt_b64: impl Into<String>, rounds: u32) {
        let mut guard = self.entry.write().await;
        *guard = Some(Entry {
            kek,
            salt_b64: salt_b64.into(),
            rounds,
        });
    }

    /// Return the cached KEK iff it was derived from exactly this
    /// `(salt_b64, rounds)` pair.
    pub async fn matches(&self, salt_b64: &str, rounds: u32) -> Option<KeyHandle> {
        let guard = self.entry.read().await;
        guard.as_ref().and_then(|entry| {
            if entry.salt_b64 == salt_b64 && entry.rounds == rounds {
                Some(entry.kek.clone())
            } else {
                None
            }
        })
    }

    pub async fn clear(&self) {
        let mut guard = self.entry.write().await;
        *guard = None;
    }

    pub async fn is_empty(&self) -> bool {
        self.entry.read().await.is_none()
    }
}

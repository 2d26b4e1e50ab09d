// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! At-rest encryption for a single JSON document kept in a site-local
//! key/value slot.
//!
//! Two protection modes are offered: a **device-bound mode**, where the
//! wrapping key is a non-extractable key held in a per-namespace device key
//! store, and a **master-password mode**, where the wrapping key is derived
//! from a user passphrase via Argon2id. [`Facade`] is the entry point: it
//! owns the lifecycle state machine, the session cache, and the readiness
//! barrier gating every operation except [`Facade::lock`],
//! [`Facade::is_locked`], and [`Facade::is_using_master_password`].

pub mod bundle;
pub mod cipher;
pub mod config;
pub mod device_store;
pub mod envelope;
pub mod error;
pub mod facade;
pub mod kdf;
pub mod kv_store;
pub mod portability;
pub mod session_cache;
pub mod state;
pub mod view;

pub use bundle::{Bundle, Ctx};
pub use cipher::{KeyHandle, KeyUsages};
pub use config::{IdbConfig, StorageConfig};
pub use error::{Error, Result};
pub use facade::{Facade, DATA_VERSION};
pub use portability::ImportKind;
pub use state::ResetReason;
pub use view::SecureDataView;

/// Test utilities for logging and fixtures, shared across this crate's
/// integration tests.
pub mod test_utils {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::OnceLock;

    static TEST_LOG_COUNTER: AtomicUsize = AtomicUsize::new(0);
    static TEST_LOG_DIR: OnceLock<PathBuf> = OnceLock::new();

    /// Get the path for a test log file.
    pub fn test_log_path(test_name: &str) -> PathBuf {
        let counter = TEST_LOG_COUNTER.fetch_add(1, Ordering::SeqCst);
        let log_dir =
            TEST_LOG_DIR.get_or_init(|| std::env::temp_dir().join("secure-local-storage-test-logs"));

        std::fs::create_dir_all(log_dir).unwrap();
        log_dir.join(format!("test-{}-{}.log", test_name, counter))
    }

    /// Set up test logging for a test and return the log path.
    pub fn setup_test_logging(test_name: &str) -> PathBuf {
        let log_path = test_log_path(test_name);
        if let Err(e) = std::fs::write(&log_path, format!("Starting test: {}\n", test_name)) {
            tracing::warn!(
                "Failed to write to test log file {}: {}",
                log_path.display(),
                e
            );
        }
        log_path
    }
}

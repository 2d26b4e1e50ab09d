// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the secure local storage envelope state machine

use thiserror::Error;

/// Result type alias for secure-local-storage operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while operating on an encrypted envelope
#[derive(Debug, Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("storage is locked")]
    Locked,

    #[error("operation not valid in current mode: {0}")]
    Mode(String),

    #[error("storage quota exceeded while writing {attempted_bytes} bytes")]
    StorageFull { attempted_bytes: usize },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("cryptographic error: {0}")]
    Crypto(String),

    #[error("import error: {0}")]
    Import(String),

    #[error("export error: {0}")]
    Export(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

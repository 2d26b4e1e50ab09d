// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The persisted/exported bundle data model and the version manager:
//! structural + semantic validation, version classification, and the
//! additional-authenticated-data (AAD) strings that bind ciphertext to its
//! header and storage context.

use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

/// Guard against absurdly large serialized bundles before attempting to parse.
pub const MAX_BUNDLE_LEN: usize = 2 * 1024 * 1024;
/// Guard against absurdly large individual base64 fields before decoding.
pub const MAX_B64_FIELD_LEN: usize = 1024 * 1024;

/// The AAD root a bundle is bound to: the storage key for persisted bundles,
/// or the literal "export" for portable bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ctx {
    Store,
    Export,
}

/// Wrap header: everything needed to unwrap the DEK and, for V3, to derive
/// the Wrap/Data AAD.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Header {
    pub v: u8,
    #[serde(default)]
    pub salt: String,
    pub rounds: u32,
    pub iv: String,
    #[serde(rename = "wrappedKey")]
    pub wrapped_key: String,
    #[serde(rename = "mPw", skip_serializing_if = "Option::is_none", default)]
    pub m_pw: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ctx: Option<Ctx>,
}

/// Ciphertext payload: AES-GCM nonce plus authenticated output, both base64.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DataPayload {
    #[serde(default)]
    pub iv: String,
    #[serde(default)]
    pub ciphertext: String,
}

/// A persisted or exported envelope bundle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bundle {
    pub header: Header,
    pub data: DataPayload,
}

impl Bundle {
    pub fn is_v2(&self) -> bool {
        self.header.v == 2
    }

    pub fn is_v3(&self) -> bool {
        self.header.v == 3
    }

    /// Whether this bundle is protected by a user-chosen passphrase rather
    /// than a device KEK.
    pub fn is_master_protected(&self) -> bool {
        self.header.m_pw == Some(true)
            || (self.header.rounds > 1 && self.header.m_pw != Some(false))
    }

    /// Structural and semantic validation shared by persisted and exported
    /// bundles.
    pub fn validate(&self) -> Result<()> {
        if self.header.v != 2 && self.header.v != 3 {
            return Err(Error::Validation(format!(
                "unsupported bundle version: {}",
                self.header.v
            )));
        }

        if self.header.rounds == 0 {
            return Err(Error::Validation("rounds must be a positive integer".into()));
        }
        if self.header.rounds == 1 && !self.header.salt.is_empty() {
            return Err(Error::Validation(
                "rounds == 1 requires an empty salt (device/non-password wrap)".into(),
            ));
        }
        if self.header.rounds > 1 {
            if self.header.salt.is_empty() {
                return Err(Error::Validation(
                    "rounds > 1 requires a non-empty salt (password wrap)".into(),
                ));
            }
            decode_b64_checked(&self.header.salt)?;
        }

        if self.header.iv.is_empty() {
            return Err(Error::Validation("header.iv must be non-empty".into()));
        }
        decode_b64_checked(&self.header.iv)?;
        if self.header.wrapped_key.is_empty() {
            return Err(Error::Validation(
                "header.wrappedKey must be non-empty".into(),
            ));
        }
        decode_b64_checked(&self.header.wrapped_key)?;

        let data_empty = self.data.iv.is_empty() && self.data.ciphertext.is_empty();
        let data_full = !self.data.iv.is_empty() && !self.data.ciphertext.is_empty();
        if !data_empty && !data_full {
            return Err(Error::Validation(
                "data.iv and data.ciphertext must be both empty or both present".into(),
            ));
        }
        if data_full {
            decode_b64_checked(&self.data.iv)?;
            decode_b64_checked(&self.data.ciphertext)?;
        }

        if self.is_v3() {
            if self.header.ctx.is_none() {
                return Err(Error::Validation("V3 bundles require a ctx field".into()));
            }
        } else if self.header.ctx.is_some() {
            return Err(Error::Validation("V2 bundles must not carry a ctx field".into()));
        }

        Ok(())
    }

    /// Validation for bundles read from local persistence: V3 bundles must
    /// additionally declare `ctx == "store"`.
    pub fn validate_for_store(&self) -> Result<()> {
        self.validate()?;
        if self.is_v3() && self.header.ctx != Some(Ctx::Store) {
            return Err(Error::Validation(
                "a bundle persisted locally must have ctx == \"store\"".into(),
            ));
        }
        Ok(())
    }

    /// The `ctx` this bundle carries, defaulting to `Store` for V2 bundles
    /// (which have no AAD and thus no real ctx, but callers treat them as
    /// local/store bundles).
    pub fn ctx(&self) -> Ctx {
        self.header.ctx.unwrap_or(Ctx::Store)
    }
}

fn decode_b64_checked(s: &str) -> Result<Vec<u8>> {
    if s.len() > MAX_B64_FIELD_LEN {
        return Err(Error::Validation("base64 field exceeds max length".into()));
    }
    STANDARD
        .decode(s)
        .map_err(|e| Error::Validation(format!("invalid base64: {e}")))
}

pub fn b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_b64(s: &str) -> Result<Vec<u8>> {
    decode_b64_checked(s)
}

/// Parse a serialized bundle, rejecting anything over [`MAX_BUNDLE_LEN`]
/// before even attempting to parse JSON.
pub fn parse_bundle(serialized: &str) -> Result<Bundle> {
    if serialized.len() > MAX_BUNDLE_LEN {
        return Err(Error::Validation(format!(
            "serialized bundle exceeds max length of {MAX_BUNDLE_LEN} bytes"
        )));
    }
    serde_json::from_str(serialized).map_err(|e| Error::Validation(format!("malformed bundle JSON: {e}")))
}

/// Build the Wrap AAD: `sls|wrap|v<version>|<root>`.
pub fn build_wrap_aad(ctx: Ctx, v: u8, storage_root: &str) -> Vec<u8> {
    let root = aad_root(ctx, storage_root);
    format!("sls|wrap|v{v}|{root}").into_bytes()
}

/// Build the Data AAD: `sls|data|v<version>|<root>|<ivWrap>|<wrappedKey>`.
pub fn build_data_aad(
    ctx: Ctx,
    v: u8,
    storage_root: &str,
    iv_wrap_b64: &str,
    wrapped_key_b64: &str,
) -> Vec<u8> {
    let root = aad_root(ctx, storage_root);
    format!("sls|data|v{v}|{root}|{iv_wrap_b64}|{wrapped_key_b64}").into_bytes()
}

fn aad_root(ctx: Ctx, storage_root: &str) -> String {
    match ctx {
        Ctx::Store => storage_root.to_string(),
        Ctx::Export => "export".to_string(),
    }
}

/// The Wrap AAD for this bundle, or `None` for V2 (no AAD).
pub fn wrap_aad_for(bundle: &Bundle, storage_root: &str) -> Option<Vec<u8>> {
    if bundle.is_v2() {
        return None;
    }
    Some(build_wrap_aad(bundle.ctx(), bundle.header.v, storage_root))
}

/// The Data AAD for this bundle, or `None` for V2 (no AAD).
pub fn data_aad_for(bundle: &Bundle, storage_root: &str) -> Option<Vec<u8>> {
    if bundle.is_v2() {
        return None;
    }
    Some(build_data_aad(
        bundle.ctx(),
        bundle.header.v,
        storage_root,
        &bundle.header.iv,
        &bundle.header.wrapped_key,
    ))
}

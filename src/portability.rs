// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Export and import bundle construction. V2→V3 migration reuses
//! [`crate::envelope::re_encrypt`] directly since migrating is just a
//! re-encrypt onto a store-context V3 header under the same KEK.

use crate::bundle::{decode_b64, parse_bundle, Bundle, Ctx};
use crate::cipher::{self, KeyHandle};
use crate::envelope;
use crate::error::{Error, Result};
use crate::kdf::{self, DEFAULT_ROUNDS};

/// Which secret unlocked an imported bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    MasterPassword,
    CustomExportPassword,
}

pub struct ImportOutcome {
    pub bundle: Bundle,
    pub kind: ImportKind,
    /// Present (unlocked device mode) for custom-export imports; `None` for
    /// master-protected imports, which land in the Locked state.
    pub dek: Option<KeyHandle>,
}

/// Parse, validate, classify, and ingest a serialized bundle under `password`.
///
/// `local_storage_key` is this facade's configured storage key, used only as
/// the AAD root for the (rare) case of re-importing a store-context bundle;
/// it has no bearing on export-context bundles, whose AAD root is the
/// literal `"export"`.
pub fn import_bundle(
    serialized: &str,
    password: &str,
    local_storage_key: &str,
    device_kek: &KeyHandle,
) -> Result<ImportOutcome> {
    let bundle = parse_bundle(serialized).map_err(import_err)?;
    bundle.validate().map_err(import_err)?;

    if password.trim().is_empty() {
        let msg = if bundle.is_master_protected() {
            "a master password is required to import this bundle"
        } else {
            "a custom export password is required to import this bundle"
        };
        return Err(Error::Import(msg.to_string()));
    }

    let wrap_aad = crate::bundle::wrap_aad_for(&bundle, local_storage_key);
    let salt = decode_b64(&bundle.header.salt).map_err(import_err)?;
    let kek = kdf::derive_kek(password, &salt, bundle.header.rounds).map_err(import_err)?;

    // Verify authentication with a non-extractable unwrap first.
    cipher::unwrap(
        &decode_b64(&bundle.header.iv).map_err(import_err)?,
        &decode_b64(&bundle.header.wrapped_key).map_err(import_err)?,
        &kek,
        false,
        wrap_aad.as_deref(),
    )
    .map_err(import_err)?;

    if bundle.is_master_protected() {
        let new_bundle = if bundle.is_v3() && bundle.ctx() == Ctx::Store {
            bundle.clone()
        } else {
            let extractable_dek = envelope::ensure_loaded(&bundle, &kek, local_storage_key, true)
                .map_err(import_err)?;
            let (rewrapped, _) = envelope::re_encrypt(
                &bundle,
                &extractable_dek,
                local_storage_key,
                &kek,
                bundle.header.rounds,
                &bundle.header.salt,
                Ctx::Store,
                Some(true),
            )
            .map_err(import_err)?;
            rewrapped
        };
        Ok(ImportOutcome {
            bundle: new_bundle,
            kind: ImportKind::MasterPassword,
            dek: None,
        })
    } else {
        let extractable_dek =
            envelope::ensure_loaded(&bundle, &kek, local_storage_key, true).map_err(import_err)?;
        let (new_bundle, new_dek) = envelope::re_encrypt(
            &bundle,
            &extractable_dek,
            local_storage_key,
            device_kek,
            1,
            "",
            Ctx::Store,
            Some(false),
        )
        .map_err(import_err)?;
        Ok(ImportOutcome {
            bundle: new_bundle,
            kind: ImportKind::CustomExportPassword,
            dek: Some(new_dek),
        })
    }
}

fn import_err(e: Error) -> Error {
    match e {
        Error::Import(_) => e,
        other => Error::Import(other.to_string()),
    }
}

/// Build an export-context bundle string.
///
/// `extractable_dek` must be the currently active DEK re-unwrapped as
/// extractable using the currently active KEK before this call.
#[allow(clippy::too_many_arguments)]
pub fn export_bundle(
    bundle: &Bundle,
    storage_key: &str,
    extractable_dek: &KeyHandle,
    is_master_mode: bool,
    custom_password: Option<&str>,
    current_salt_b64: &str,
    current_rounds: u32,
    active_kek_for_reuse: &KeyHandle,
) -> Result<String> {
    let (kek, salt_b64, rounds, m_pw) = match custom_password {
        Some(pw) => {
            if pw.trim().is_empty() {
                return Err(Error::Export("export password must not be blank".into()));
            }
            let salt = cipher::generate_salt();
            let kek = kdf::derive_kek(pw, &salt, DEFAULT_ROUNDS)
                .map_err(|e| Error::Export(e.to_string()))?;
            (kek, crate::bundle::b64(&salt), DEFAULT_ROUNDS, false)
        }
        None => {
            if !is_master_mode {
                return Err(Error::Export(
                    "a custom export password is required outside master mode".into(),
                ));
            }
            (
                active_kek_for_reuse.clone(),
                current_salt_b64.to_string(),
                current_rounds,
                true,
            )
        }
    };

    let (new_bundle, _) = envelope::re_encrypt(
        bundle,
        extractable_dek,
        storage_key,
        &kek,
        rounds,
        &salt_b64,
        Ctx::Export,
        Some(m_pw),
    )
    .map_err(|e| Error::Export(e.to_string()))?;

    serde_json::to_string(&new_bundle).map_err(Error::from)
}

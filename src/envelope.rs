// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! DEK/KEK envelope orchestration: building a fresh bundle, re-encrypting
//! under a new KEK, and loading the DEK into RAM for an existing bundle.

use crate::bundle::{b64, build_data_aad, build_wrap_aad, Bundle, Ctx, DataPayload, Header};
use crate::cipher::{self, KeyHandle};
use crate::error::Result;
use serde_json::{json, Value};

/// Build a brand-new V3 store-context bundle wrapping a fresh DEK under
/// `kek`, with an empty payload.
///
/// The returned `KeyHandle` is re-unwrapped non-extractable before handing
/// it back, so the long-lived in-RAM DEK a caller stores never carries the
/// raw bytes exposed by [`cipher::generate_dek`].
pub fn create_empty(kek: &KeyHandle, storage_key: &str, rounds: u32, salt_b64: &str) -> Result<(Bundle, KeyHandle)> {
    let dek = cipher::generate_dek();
    let wrap_aad = build_wrap_aad(Ctx::Store, 3, storage_key);
    let wrapped = cipher::wrap(&dek, kek, Some(&wrap_aad))?;
    let iv_wrap_b64 = b64(&wrapped.iv);
    let wrapped_key_b64 = b64(&wrapped.ciphertext);

    let non_extractable_dek =
        cipher::unwrap(&wrapped.iv, &wrapped.ciphertext, kek, false, Some(&wrap_aad))?;

    let data_aad = build_data_aad(Ctx::Store, 3, storage_key, &iv_wrap_b64, &wrapped_key_b64);
    let out = cipher::encrypt(&non_extractable_dek, &json!({}), Some(&data_aad))?;

    let bundle = Bundle {
        header: Header {
            v: 3,
            salt: salt_b64.to_string(),
            rounds,
            iv: iv_wrap_b64,
            wrapped_key: wrapped_key_b64,
            m_pw: Some(rounds > 1),
            ctx: Some(Ctx::Store),
        },
        data: DataPayload {
            iv: b64(&out.iv),
            ciphertext: b64(&out.ciphertext),
        },
    };
    Ok((bundle, non_extractable_dek))
}

/// Decrypt `bundle`'s payload under `old_dek`, then produce a new bundle
/// wrapping a re-unwrapped DEK under `new_kek` with fresh AAD under `new_ctx`.
///
/// Returns the new bundle and the non-extractable DEK to hold for `new_kek`.
pub fn re_encrypt(
    bundle: &Bundle,
    old_dek: &KeyHandle,
    storage_key: &str,
    new_kek: &KeyHandle,
    new_rounds: u32,
    new_salt_b64: &str,
    new_ctx: Ctx,
    new_m_pw: Option<bool>,
) -> Result<(Bundle, KeyHandle)> {
    let data_aad = crate::bundle::data_aad_for(bundle, storage_key);
    let plaintext = cipher::decrypt(
        old_dek,
        &crate::bundle::decode_b64(&bundle.data.iv)?,
        &crate::bundle::decode_b64(&bundle.data.ciphertext)?,
        data_aad.as_deref(),
    )?;

    let wrap_aad = build_wrap_aad(new_ctx, 3, storage_key);
    let extractable_dek = reimport_extractable(old_dek)?;
    let wrapped = cipher::wrap(&extractable_dek, new_kek, Some(&wrap_aad))?;
    let iv_wrap_b64 = b64(&wrapped.iv);
    let wrapped_key_b64 = b64(&wrapped.ciphertext);

    let new_data_aad = build_data_aad(new_ctx, 3, storage_key, &iv_wrap_b64, &wrapped_key_b64);
    let out = cipher::encrypt(&extractable_dek, &plaintext, Some(&new_data_aad))?;

    let new_bundle = Bundle {
        header: Header {
            v: 3,
            salt: new_salt_b64.to_string(),
            rounds: new_rounds,
            iv: iv_wrap_b64,
            wrapped_key: wrapped_key_b64,
            m_pw: new_m_pw,
            ctx: Some(new_ctx),
        },
        data: DataPayload {
            iv: b64(&out.iv),
            ciphertext: b64(&out.ciphertext),
        },
    };

    let new_dek = cipher::unwrap(
        &wrapped.iv,
        &wrapped.ciphertext,
        new_kek,
        false,
        Some(&wrap_aad),
    )?;
    Ok((new_bundle, new_dek))
}

/// Unwrap `bundle`'s DEK under `kek`, yielding a handle usable for decrypt
/// (and, if `for_wrapping`, for a subsequent wrap during a mode transition).
pub fn ensure_loaded(bundle: &Bundle, kek: &KeyHandle, storage_key: &str, for_wrapping: bool) -> Result<KeyHandle> {
    let wrap_aad = crate::bundle::wrap_aad_for(bundle, storage_key);
    cipher::unwrap(
        &crate::bundle::decode_b64(&bundle.header.iv)?,
        &crate::bundle::decode_b64(&bundle.header.wrapped_key)?,
        kek,
        for_wrapping,
        wrap_aad.as_deref(),
    )
}

/// Decrypt `bundle`'s payload under the already-loaded `dek`.
pub fn decrypt_payload(bundle: &Bundle, dek: &KeyHandle, storage_key: &str) -> Result<Value> {
    let data_aad = crate::bundle::data_aad_for(bundle, storage_key);
    cipher::decrypt(
        dek,
        &crate::bundle::decode_b64(&bundle.data.iv)?,
        &crate::bundle::decode_b64(&bundle.data.ciphertext)?,
        data_aad.as_deref(),
    )
}

/// Re-encrypt `payload` under `dek` for `bundle`'s existing header, returning
/// the updated bundle (used by plain `setData`, no header change).
pub fn encrypt_payload(bundle: &Bundle, dek: &KeyHandle, storage_key: &str, payload: &Value) -> Result<Bundle> {
    let data_aad = crate::bundle::data_aad_for(bundle, storage_key);
    let out = cipher::encrypt(dek, payload, data_aad.as_deref())?;
    let mut next = bundle.clone();
    next.data = DataPayload {
        iv: b64(&out.iv),
        ciphertext: b64(&out.ciphertext),
    };
    Ok(next)
}

fn reimport_extractable(dek: &KeyHandle) -> Result<KeyHandle> {
    use crate::cipher::KeyUsages;
    let bytes = dek.clone().into_extractable_bytes()?;
    Ok(KeyHandle::new(
        *bytes,
        true,
        KeyUsages::ENCRYPT | KeyUsages::DECRYPT | KeyUsages::WRAP | KeyUsages::UNWRAP,
    ))
}

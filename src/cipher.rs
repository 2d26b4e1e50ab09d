// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Symmetric cipher primitive: AES-256-GCM encrypt/decrypt and key wrap/unwrap.
//!
//! A thin validating wrapper around `aes_gcm::Aes256Gcm`. Key material never
//! leaves this module as a bare byte slice except through
//! [`KeyHandle::into_extractable_bytes`], reserved for the single wrap call
//! during a mode transition.

use crate::error::{Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use serde_json::Value;
use zeroize::Zeroizing;

pub const KEY_LENGTH: usize = 32;
pub const NONCE_LENGTH: usize = 12;
pub const SALT_LENGTH: usize = 16;

bitflags::bitflags! {
    /// Usages a key handle is permitted for, mirroring WebCrypto's usage list.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KeyUsages: u8 {
        const ENCRYPT = 0b0001;
        const DECRYPT = 0b0010;
        const WRAP    = 0b0100;
        const UNWRAP  = 0b1000;
    }
}

/// A symmetric AES-256-GCM key handle.
///
/// Handles created with `extractable = false` never expose their raw bytes;
/// [`into_extractable_bytes`](KeyHandle::into_extractable_bytes) is the only
/// escape hatch and only succeeds on handles explicitly marked extractable.
#[derive(Clone)]
pub struct KeyHandle {
    bytes: Zeroizing<[u8; KEY_LENGTH]>,
    extractable: bool,
    usages: KeyUsages,
}

impl std::fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyHandle")
            .field("bytes", &"[REDACTED]")
            .field("extractable", &self.extractable)
            .field("usages", &self.usages)
            .finish()
    }
}

impl KeyHandle {
    pub fn new(bytes: [u8; KEY_LENGTH], extractable: bool, usages: KeyUsages) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
            extractable,
            usages,
        }
    }

    pub fn usages(&self) -> KeyUsages {
        self.usages
    }

    pub fn is_extractable(&self) -> bool {
        self.extractable
    }

    fn raw(&self) -> &[u8; KEY_LENGTH] {
        &self.bytes
    }

    fn require(&self, usage: KeyUsages) -> Result<()> {
        if !self.usages.contains(usage) {
            return Err(Error::Validation(format!(
                "key handle missing required usage {usage:?}"
            )));
        }
        Ok(())
    }

    /// Consume this handle and return its raw bytes, iff it was created extractable.
    pub fn into_extractable_bytes(self) -> Result<Zeroizing<[u8; KEY_LENGTH]>> {
        if !self.extractable {
            return Err(Error::Validation("key handle is not extractable".into()));
        }
        Ok(self.bytes)
    }
}

/// Generate a random 16-byte salt from the CSPRNG.
pub fn generate_salt() -> [u8; SALT_LENGTH] {
    let mut salt = [0u8; SALT_LENGTH];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Generate a fresh extractable DEK with the full usage set.
pub fn generate_dek() -> KeyHandle {
    let mut bytes = [0u8; KEY_LENGTH];
    OsRng.fill_bytes(&mut bytes);
    KeyHandle::new(
        bytes,
        true,
        KeyUsages::ENCRYPT | KeyUsages::DECRYPT | KeyUsages::WRAP | KeyUsages::UNWRAP,
    )
}

/// Result of an AES-GCM encrypt or key-wrap call: nonce plus authenticated output.
pub struct CipherOutput {
    pub iv: [u8; NONCE_LENGTH],
    pub ciphertext: Vec<u8>,
}

fn random_nonce() -> [u8; NONCE_LENGTH] {
    let mut nonce = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn make_cipher(key: &KeyHandle) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key.raw().as_slice())
        .map_err(|e| Error::Crypto(format!("invalid key material: {e}")))
}

/// JSON-serialize `obj`, encrypt it with a fresh random nonce under `key`.
pub fn encrypt(key: &KeyHandle, obj: &Value, aad: Option<&[u8]>) -> Result<CipherOutput> {
    key.require(KeyUsages::ENCRYPT)?;
    let cipher = make_cipher(key)?;
    let iv = random_nonce();
    let nonce = Nonce::from_slice(&iv);
    let plaintext = Zeroizing::new(serde_json::to_vec(obj)?);
    let payload = Payload {
        msg: plaintext.as_ref(),
        aad: aad.unwrap_or(&[]),
    };
    let ciphertext = cipher
        .encrypt(nonce, payload)
        .map_err(|e| Error::Crypto(format!("encryption failed: {e}")))?;
    Ok(CipherOutput { iv, ciphertext })
}

/// Decrypt `ct` under `key`, then JSON-parse the result into an object `Value`.
pub fn decrypt(key: &KeyHandle, iv: &[u8], ct: &[u8], aad: Option<&[u8]>) -> Result<Value> {
    if iv.len() != NONCE_LENGTH {
        return Err(Error::Validation(format!(
            "invalid iv length: expected {NONCE_LENGTH}, got {}",
            iv.len()
        )));
    }
    if ct.is_empty() {
        return Err(Error::Validation("ciphertext must not be empty".into()));
    }
    key.require(KeyUsages::DECRYPT)?;
    let cipher = make_cipher(key)?;
    let nonce = Nonce::from_slice(iv);
    let payload = Payload {
        msg: ct,
        aad: aad.unwrap_or(&[]),
    };
    let plaintext = cipher
        .decrypt(nonce, payload)
        .map_err(|e| Error::Crypto(format!("decryption failed: {e}")))?;
    let value: Value = serde_json::from_slice(&plaintext)
        .map_err(|e| Error::Validation(format!("decrypted plaintext is not valid JSON: {e}")))?;
    if !value.is_object() {
        return Err(Error::Validation(
            "decrypted plaintext is not a JSON object".into(),
        ));
    }
    Ok(value)
}

/// Wrap `dek`'s raw key bytes under `kek`, producing a new random wrap nonce.
///
/// `dek` must be extractable: wrapping needs its raw bytes as the AEAD plaintext.
pub fn wrap(dek: &KeyHandle, kek: &KeyHandle, aad: Option<&[u8]>) -> Result<CipherOutput> {
    kek.require(KeyUsages::WRAP)?;
    let extractable_dek = dek.clone().into_extractable_bytes()?;
    let cipher = make_cipher(kek)?;
    let iv = random_nonce();
    let nonce = Nonce::from_slice(&iv);
    let payload = Payload {
        msg: extractable_dek.as_slice(),
        aad: aad.unwrap_or(&[]),
    };
    let ciphertext = cipher
        .encrypt(nonce, payload)
        .map_err(|e| Error::Crypto(format!("key wrap failed: {e}")))?;
    Ok(CipherOutput { iv, ciphertext })
}

/// Unwrap a previously wrapped DEK under `kek`.
///
/// The returned handle is extractable (and carries wrap/unwrap usages) iff
/// `for_wrapping` is set.
pub fn unwrap(
    iv_wrap: &[u8],
    wrapped_key: &[u8],
    kek: &KeyHandle,
    for_wrapping: bool,
    aad: Option<&[u8]>,
) -> Result<KeyHandle> {
    if iv_wrap.len() != NONCE_LENGTH {
        return Err(Error::Validation(format!(
            "invalid wrap iv length: expected {NONCE_LENGTH}, got {}",
            iv_wrap.len()
        )));
    }
    if wrapped_key.is_empty() {
        return Err(Error::Validation("wrapped key must not be empty".into()));
    }
    kek.require(KeyUsages::UNWRAP)?;
    let cipher = make_cipher(kek)?;
    let nonce = Nonce::from_slice(iv_wrap);
    let payload = Payload {
        msg: wrapped_key,
        aad: aad.unwrap_or(&[]),
    };
    let raw = cipher
        .decrypt(nonce, payload)
        .map_err(|e| Error::Crypto(format!("key unwrap failed: {e}")))?;
    if raw.len() != KEY_LENGTH {
        return Err(Error::Crypto(format!(
            "unwrapped key has unexpected length: {}",
            raw.len()
        )));
    }
    let mut bytes = [0u8; KEY_LENGTH];
    bytes.copy_from_slice(&raw);
    let usages = if for_wrapping {
        KeyUsages::WRAP | KeyUsages::UNWRAP | KeyUsages::ENCRYPT | KeyUsages::DECRYPT
    } else {
        KeyUsages::ENCRYPT | KeyUsages::DECRYPT
    };
    Ok(KeyHandle::new(bytes, for_wrapping, usages))
}

// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The public facade: readiness barrier, state machine delegation, and the
//! mode-transition procedures.

use crate::bundle::{b64, decode_b64, Bundle, Ctx};
use crate::cipher;
use crate::config::StorageConfig;
use crate::device_store::{self, DeviceKeyStore};
use crate::envelope;
use crate::error::{Error, Result};
use crate::kdf::{self, DEFAULT_ROUNDS};
use crate::kv_store::KvStore;
use crate::portability::{self, ImportKind};
use crate::session_cache::SessionCache;
use crate::state::{ResetReason, State};
use crate::view::SecureDataView;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};

/// The version this implementation emits for newly written bundles.
pub const DATA_VERSION: u8 = 3;

struct Inner {
    state: State,
    bundle: Option<Bundle>,
    dek: Option<cipher::KeyHandle>,
    reset_reason: Option<ResetReason>,
}

/// A single encrypted `localStorage`-equivalent slot, gated by a readiness
/// barrier and delegating every operation to the current lifecycle state.
pub struct Facade {
    config: StorageConfig,
    kv: KvStore,
    device_store: Arc<DeviceKeyStore>,
    session_cache: SessionCache,
    inner: RwLock<Inner>,
    ready: OnceCell<()>,
}

impl Facade {
    /// Construct a facade for `config`. Initialization (loading or creating
    /// the bundle) is deferred to the first operation that awaits the
    /// readiness barrier.
    pub fn new(config: StorageConfig) -> Result<Self> {
        let namespace = config.idb.namespace();
        let keys_dir = config.keys_dir().ok();
        let device_store = device_store::shared(&namespace, keys_dir);
        let storage_dir = config.storage_dir()?;
        let kv = KvStore::new(storage_dir);
        Ok(Self {
            config,
            kv,
            device_store,
            session_cache: SessionCache::new(),
            inner: RwLock::new(Inner {
                state: State::Initial,
                bundle: None,
                dek: None,
                reset_reason: None,
            }),
            ready: OnceCell::new(),
        })
    }

    pub fn data_version(&self) -> u8 {
        DATA_VERSION
    }

    async fn device_kek(&self) -> Result<cipher::KeyHandle> {
        self.device_store.get_key(&self.config.idb.namespace()).await
    }

    async fn persist(&self, bundle: &Bundle) -> Result<()> {
        let value = serde_json::to_value(bundle)?;
        self.kv.set(&self.config.storage_key, &value).await
    }

    async fn ensure_ready(&self) -> Result<()> {
        self.ready.get_or_try_init(|| self.initialize()).await?;
        Ok(())
    }

    async fn initialize(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        let loaded = self.kv.get(&self.config.storage_key).await?;
        let slot_present = loaded.is_some();
        let parsed = loaded.and_then(|value| serde_json::from_value::<Bundle>(value).ok());

        let bundle = match parsed {
            Some(b) if b.validate_for_store().is_ok() => b,
            other => {
                // A present-but-unparseable-or-invalid slot is a corrupt
                // config; an absent slot is just first use.
                let reason = (slot_present || other.is_some()).then_some(ResetReason::InvalidConfig);
                return self.fresh_device_bundle(&mut inner, reason).await;
            }
        };

        if bundle.is_master_protected() {
            inner.state = State::Locked;
            inner.bundle = Some(bundle);
            inner.dek = None;
            return Ok(());
        }

        let namespace = self.config.idb.namespace();
        let device_kek = self.device_store.get_key(&namespace).await?;
        let for_wrapping = bundle.is_v2();

        match envelope::ensure_loaded(&bundle, &device_kek, &self.config.storage_key, for_wrapping) {
            Ok(dek) => {
                if bundle.is_v2() {
                    let (migrated, new_dek) = envelope::re_encrypt(
                        &bundle,
                        &dek,
                        &self.config.storage_key,
                        &device_kek,
                        bundle.header.rounds,
                        &bundle.header.salt,
                        Ctx::Store,
                        bundle.header.m_pw,
                    )?;
                    self.persist(&migrated).await?;
                    inner.bundle = Some(migrated);
                    inner.dek = Some(new_dek);
                } else {
                    inner.bundle = Some(bundle);
                    inner.dek = Some(dek);
                }
                inner.state = State::DeviceMode;
                Ok(())
            }
            Err(_) => {
                tracing::warn!("device KEK failed to unwrap persisted bundle, resetting namespace {namespace}");
                self.device_store.rotate_key(&namespace).await?;
                self.fresh_device_bundle(&mut inner, Some(ResetReason::DeviceKekMismatch))
                    .await
            }
        }
    }

    async fn fresh_device_bundle(&self, inner: &mut Inner, reason: Option<ResetReason>) -> Result<()> {
        let namespace = self.config.idb.namespace();
        let device_kek = self.device_store.get_key(&namespace).await?;
        let (bundle, dek) = envelope::create_empty(&device_kek, &self.config.storage_key, 1, "")?;
        self.persist(&bundle).await?;
        inner.state = State::DeviceMode;
        inner.bundle = Some(bundle);
        inner.dek = Some(dek);
        inner.reset_reason = reason;
        Ok(())
    }

    pub async fn is_locked(&self) -> bool {
        self.inner.read().await.state.is_locked()
    }

    pub async fn is_using_master_password(&self) -> bool {
        self.inner.read().await.state.is_using_master_password()
    }

    pub async fn last_reset_reason(&self) -> Result<Option<ResetReason>> {
        self.ensure_ready().await?;
        Ok(self.inner.read().await.reset_reason)
    }

    /// Drop the in-RAM DEK and return to Locked. No-op outside master mode.
    pub async fn lock(&self) {
        let mut inner = self.inner.write().await;
        if inner.state == State::MasterMode {
            inner.dek = None;
            inner.state = State::Locked;
        }
        drop(inner);
        self.session_cache.clear().await;
    }

    pub async fn unlock(&self, password: &str) -> Result<()> {
        self.ensure_ready().await?;
        let (bundle, state) = {
            let inner = self.inner.read().await;
            (inner.bundle.clone(), inner.state)
        };

        match state {
            State::DeviceMode | State::MasterMode => return Ok(()),
            State::Initial => unreachable!("ensure_ready guarantees the barrier has resolved"),
            State::Locked => {}
        }

        let bundle = bundle.ok_or_else(|| Error::Persistence("locked with no bundle loaded".into()))?;
        let salt = decode_b64(&bundle.header.salt)?;
        let kek = kdf::derive_kek(password, &salt, bundle.header.rounds)?;

        let for_wrapping = bundle.is_v2();
        let dek = envelope::ensure_loaded(&bundle, &kek, &self.config.storage_key, for_wrapping)
            .map_err(|_| Error::Validation("incorrect password".into()))?;

        let (final_bundle, final_dek) = if bundle.is_v2() {
            let (migrated, new_dek) = envelope::re_encrypt(
                &bundle,
                &dek,
                &self.config.storage_key,
                &kek,
                bundle.header.rounds,
                &bundle.header.salt,
                Ctx::Store,
                Some(true),
            )?;
            self.persist(&migrated).await?;
            (migrated, new_dek)
        } else {
            (bundle.clone(), dek)
        };

        self.session_cache
            .set(kek, bundle.header.salt.clone(), bundle.header.rounds)
            .await;

        let mut inner = self.inner.write().await;
        inner.bundle = Some(final_bundle);
        inner.dek = Some(final_dek);
        inner.state = State::MasterMode;
        Ok(())
    }

    pub async fn set_master_password(&self, password: &str) -> Result<()> {
        self.ensure_ready().await?;
        let (bundle, state) = {
            let inner = self.inner.read().await;
            (inner.bundle.clone(), inner.state)
        };

        match state {
            State::Locked => return Err(Error::Locked),
            State::MasterMode => return Err(Error::Mode("a master password is already set".into())),
            State::Initial => unreachable!("ensure_ready guarantees the barrier has resolved"),
            State::DeviceMode => {}
        }

        if password.trim().is_empty() {
            return Err(Error::Validation("password must not be empty".into()));
        }

        let bundle = bundle.ok_or_else(|| Error::Persistence("no bundle loaded".into()))?;
        let device_kek = self.device_kek().await?;
        let extractable = envelope::ensure_loaded(&bundle, &device_kek, &self.config.storage_key, true)?;

        let salt = cipher::generate_salt();
        let salt_b64 = b64(&salt);
        let rounds = DEFAULT_ROUNDS;
        let kek = kdf::derive_kek(password, &salt, rounds)?;

        let (new_bundle, new_dek) = envelope::re_encrypt(
            &bundle,
            &extractable,
            &self.config.storage_key,
            &kek,
            rounds,
            &salt_b64,
            Ctx::Store,
            Some(true),
        )?;
        self.persist(&new_bundle).await?;
        self.session_cache.set(kek, salt_b64, rounds).await;

        let mut inner = self.inner.write().await;
        inner.bundle = Some(new_bundle);
        inner.dek = Some(new_dek);
        inner.state = State::MasterMode;
        Ok(())
    }

    pub async fn remove_master_password(&self) -> Result<()> {
        self.ensure_ready().await?;
        let (bundle, state) = {
            let inner = self.inner.read().await;
            (inner.bundle.clone(), inner.state)
        };

        match state {
            State::Locked => return Err(Error::Locked),
            State::DeviceMode => return Err(Error::Mode("no master password is set".into())),
            State::Initial => unreachable!("ensure_ready guarantees the barrier has resolved"),
            State::MasterMode => {}
        }

        let bundle = bundle.ok_or_else(|| Error::Persistence("no bundle loaded".into()))?;
        let kek = self
            .session_cache
            .matches(&bundle.header.salt, bundle.header.rounds)
            .await
            .ok_or_else(|| Error::Persistence("master KEK not cached while in master mode".into()))?;
        let extractable = envelope::ensure_loaded(&bundle, &kek, &self.config.storage_key, true)?;

        let device_kek = self.device_kek().await?;
        let (new_bundle, new_dek) = envelope::re_encrypt(
            &bundle,
            &extractable,
            &self.config.storage_key,
            &device_kek,
            1,
            "",
            Ctx::Store,
            Some(false),
        )?;
        self.persist(&new_bundle).await?;
        self.session_cache.clear().await;

        let mut inner = self.inner.write().await;
        inner.bundle = Some(new_bundle);
        inner.dek = Some(new_dek);
        inner.state = State::DeviceMode;
        Ok(())
    }

    pub async fn rotate_master_password(&self, old_password: &str, new_password: &str) -> Result<()> {
        self.ensure_ready().await?;
        let state = self.inner.read().await.state;

        if state == State::Initial {
            unreachable!("ensure_ready guarantees the barrier has resolved");
        }
        if state == State::DeviceMode {
            return self.set_master_password(new_password).await;
        }
        if new_password.trim().is_empty() {
            return Err(Error::Validation("new password must not be empty".into()));
        }

        let bundle = {
            let inner = self.inner.read().await;
            inner.bundle.clone()
        }
        .ok_or_else(|| Error::Persistence("no bundle loaded".into()))?;

        let salt = decode_b64(&bundle.header.salt)?;
        let old_kek = kdf::derive_kek(old_password, &salt, bundle.header.rounds)?;
        let extractable = envelope::ensure_loaded(&bundle, &old_kek, &self.config.storage_key, true)
            .map_err(|_| Error::Validation("incorrect current password".into()))?;

        let new_salt = cipher::generate_salt();
        let new_salt_b64 = b64(&new_salt);
        let rounds = bundle.header.rounds;
        let new_kek = kdf::derive_kek(new_password, &new_salt, rounds)?;

        let (new_bundle, new_dek) = envelope::re_encrypt(
            &bundle,
            &extractable,
            &self.config.storage_key,
            &new_kek,
            rounds,
            &new_salt_b64,
            Ctx::Store,
            Some(true),
        )?;
        self.persist(&new_bundle).await?;
        self.session_cache.set(new_kek, new_salt_b64, rounds).await;

        let mut inner = self.inner.write().await;
        inner.bundle = Some(new_bundle);
        inner.dek = Some(new_dek);
        inner.state = State::MasterMode;
        Ok(())
    }

    pub async fn rotate_keys(&self) -> Result<()> {
        self.ensure_ready().await?;
        let (bundle, state) = {
            let inner = self.inner.read().await;
            (inner.bundle.clone(), inner.state)
        };

        match state {
            State::Locked => return Err(Error::Locked),
            State::MasterMode => return Err(Error::Mode("rotateKeys is not valid in master mode".into())),
            State::Initial => unreachable!("ensure_ready guarantees the barrier has resolved"),
            State::DeviceMode => {}
        }

        let bundle = bundle.ok_or_else(|| Error::Persistence("no bundle loaded".into()))?;
        let namespace = self.config.idb.namespace();
        let old_kek = self.device_store.get_key(&namespace).await?;
        let extractable = envelope::ensure_loaded(&bundle, &old_kek, &self.config.storage_key, true)?;
        let new_kek = self.device_store.rotate_key(&namespace).await?;

        let (new_bundle, new_dek) = envelope::re_encrypt(
            &bundle,
            &extractable,
            &self.config.storage_key,
            &new_kek,
            1,
            "",
            Ctx::Store,
            Some(false),
        )?;
        self.persist(&new_bundle).await?;

        let mut inner = self.inner.write().await;
        inner.bundle = Some(new_bundle);
        inner.dek = Some(new_dek);
        Ok(())
    }

    pub async fn get_data(&self) -> Result<SecureDataView> {
        self.ensure_ready().await?;
        let inner = self.inner.read().await;
        match inner.state {
            State::Locked => Err(Error::Locked),
            State::Initial => unreachable!("ensure_ready guarantees the barrier has resolved"),
            State::DeviceMode | State::MasterMode => {
                let bundle = inner
                    .bundle
                    .as_ref()
                    .ok_or_else(|| Error::Persistence("no bundle loaded".into()))?;
                let dek = inner
                    .dek
                    .as_ref()
                    .ok_or_else(|| Error::Persistence("no DEK loaded".into()))?;
                let payload = envelope::decrypt_payload(bundle, dek, &self.config.storage_key)?;
                Ok(SecureDataView::new(payload))
            }
        }
    }

    pub async fn set_data(&self, value: &Value) -> Result<()> {
        self.ensure_ready().await?;
        if !value.is_object() {
            return Err(Error::Validation("payload must be a plain JSON object".into()));
        }

        let (bundle, dek, state) = {
            let inner = self.inner.read().await;
            (inner.bundle.clone(), inner.dek.clone(), inner.state)
        };

        match state {
            State::Locked => return Err(Error::Locked),
            State::Initial => unreachable!("ensure_ready guarantees the barrier has resolved"),
            State::DeviceMode | State::MasterMode => {}
        }

        let bundle = bundle.ok_or_else(|| Error::Persistence("no bundle loaded".into()))?;
        let dek = dek.ok_or_else(|| Error::Persistence("no DEK loaded".into()))?;
        let new_bundle = envelope::encrypt_payload(&bundle, &dek, &self.config.storage_key, value)?;
        self.persist(&new_bundle).await?;

        let mut inner = self.inner.write().await;
        inner.bundle = Some(new_bundle);
        Ok(())
    }

    pub async fn export_data(&self, custom_password: Option<&str>) -> Result<String> {
        self.ensure_ready().await?;
        let (bundle, state) = {
            let inner = self.inner.read().await;
            (inner.bundle.clone(), inner.state)
        };
        let bundle = bundle.ok_or_else(|| Error::Persistence("no bundle loaded".into()))?;

        match state {
            State::DeviceMode => {
                if custom_password.is_none() {
                    return Err(Error::Export(
                        "a custom export password is required in device mode".into(),
                    ));
                }
                let namespace = self.config.idb.namespace();
                let device_kek = self.device_store.get_key(&namespace).await?;
                let extractable = envelope::ensure_loaded(&bundle, &device_kek, &self.config.storage_key, true)?;
                portability::export_bundle(
                    &bundle,
                    &self.config.storage_key,
                    &extractable,
                    false,
                    custom_password,
                    "",
                    1,
                    &device_kek,
                )
            }
            State::MasterMode => {
                let kek = self
                    .session_cache
                    .matches(&bundle.header.salt, bundle.header.rounds)
                    .await
                    .ok_or_else(|| Error::Persistence("master KEK not cached while in master mode".into()))?;
                let extractable = envelope::ensure_loaded(&bundle, &kek, &self.config.storage_key, true)?;
                portability::export_bundle(
                    &bundle,
                    &self.config.storage_key,
                    &extractable,
                    true,
                    custom_password,
                    &bundle.header.salt,
                    bundle.header.rounds,
                    &kek,
                )
            }
            State::Locked => Err(Error::Locked),
            State::Initial => unreachable!("ensure_ready guarantees the barrier has resolved"),
        }
    }

    pub async fn import_data(&self, serialized: &str, password: &str) -> Result<ImportKind> {
        self.ensure_ready().await?;
        let namespace = self.config.idb.namespace();
        let device_kek = self.device_store.get_key(&namespace).await?;
        let outcome = portability::import_bundle(serialized, password, &self.config.storage_key, &device_kek)?;
        self.persist(&outcome.bundle).await?;
        self.session_cache.clear().await;

        let mut inner = self.inner.write().await;
        match outcome.kind {
            ImportKind::MasterPassword => {
                inner.bundle = Some(outcome.bundle);
                inner.dek = None;
                inner.state = State::Locked;
            }
            ImportKind::CustomExportPassword => {
                inner.bundle = Some(outcome.bundle);
                inner.dek = outcome.dek;
                inner.state = State::DeviceMode;
            }
        }
        Ok(outcome.kind)
    }

    /// Destroy the current bundle and device-key record, then build a fresh
    /// empty device-mode store. Legal from every state, including before
    /// the readiness barrier resolves.
    pub async fn clear(&self) -> Result<()> {
        let namespace = self.config.idb.namespace();
        self.device_store.delete_persistent(&namespace).await;
        self.kv.clear(&self.config.storage_key).await;
        self.session_cache.clear().await;

        let mut inner = self.inner.write().await;
        self.fresh_device_bundle(&mut inner, None).await?;
        drop(inner);
        let _ = self.ready.set(());
        Ok(())
    }
}

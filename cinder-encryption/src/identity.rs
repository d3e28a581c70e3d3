// SPDX-License-Identifier: MIT OR Apache-2.0

//! Long-term identity of this device and its one-time prekeys.
//!
//! [`IdentityManager`] holds the pure state transitions on [`DeviceIdentity`], while
//! [`IdentityStore`] persists the state in secure storage and publishes the public projection to
//! the key directory.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use cinder_core::cbor::{DecodeError, EncodeError, decode_cbor, encode_cbor};
use cinder_core::{DeviceLabel, UserId};
use cinder_store::{SecureStorage, WriteBatch, WriteOp};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::config::Config;
use crate::crypto::ed25519::{Signature, SigningKey, VerifyingKey};
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::crypto::{Rng, RngError};
use crate::directory::{DirectoryError, KeyDirectory};
use crate::error::StorageError;
use crate::key_bundle::{DeviceMetadata, KeyBundle, OneTimePreKey, OneTimePreKeyId};
use crate::session_store::{SessionStore, SessionStoreError};

/// Storage key of the persisted device identity.
pub const IDENTITY_KEY: &str = "identity";

/// Pure state transitions on a device identity.
#[derive(Clone, Debug)]
pub struct IdentityManager;

/// Secret key material of this device (for persistence, never leaves the device).
#[derive(Debug, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "test_utils"), derive(Clone))]
pub struct DeviceIdentity {
    user_id: UserId,
    device_label: DeviceLabel,
    metadata: DeviceMetadata,
    signing_key: SigningKey,
    signed_prekey_secret: SecretKey,
    signed_prekey_signature: Signature,
    onetime_secrets: BTreeMap<OneTimePreKeyId, SecretKey>,
    onetime_next_id: OneTimePreKeyId,
    /// Ephemeral keys of accepted handshakes per initiator identity.
    seen_handshakes: HashMap<VerifyingKey, VecDeque<PublicKey>>,
    published: bool,
}

impl DeviceIdentity {
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn device_label(&self) -> &DeviceLabel {
        &self.device_label
    }

    pub fn identity_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// X25519 secret converted from the signing key.
    pub(crate) fn identity_secret(&self) -> SecretKey {
        self.signing_key.exchange_secret()
    }

    pub(crate) fn signed_prekey_secret(&self) -> &SecretKey {
        &self.signed_prekey_secret
    }

    /// Number of one-time prekeys which were not consumed yet.
    pub fn onetime_prekey_count(&self) -> usize {
        self.onetime_secrets.len()
    }

    pub fn is_published(&self) -> bool {
        self.published
    }

    fn belongs_to(&self, user_id: &UserId, device_label: &DeviceLabel) -> bool {
        &self.user_id == user_id && &self.device_label == device_label
    }
}

impl IdentityManager {
    /// Returns a freshly generated identity with a signed exchange key and `onetime_prekey_count`
    /// one-time prekeys.
    pub fn init(
        user_id: UserId,
        device_label: DeviceLabel,
        metadata: DeviceMetadata,
        config: &Config,
        rng: &Rng,
    ) -> Result<DeviceIdentity, IdentityError> {
        let signing_key = SigningKey::generate(rng)?;
        let signed_prekey_secret = SecretKey::generate(rng)?;
        let signed_prekey_signature =
            signing_key.sign(signed_prekey_secret.public_key().as_bytes());

        let y = DeviceIdentity {
            user_id,
            device_label,
            metadata,
            signing_key,
            signed_prekey_secret,
            signed_prekey_signature,
            onetime_secrets: BTreeMap::new(),
            onetime_next_id: 0,
            seen_handshakes: HashMap::new(),
            published: false,
        };

        Self::refill_onetime_prekeys(y, config.onetime_prekey_count, rng)
    }

    /// Public projection of the identity, ready to be published.
    pub fn key_bundle(y: &DeviceIdentity) -> KeyBundle {
        let onetime_prekeys = y
            .onetime_secrets
            .iter()
            .map(|(id, secret)| OneTimePreKey::new(secret.public_key(), *id))
            .collect();

        KeyBundle::new(
            y.user_id.clone(),
            y.device_label.clone(),
            y.identity_key(),
            y.signed_prekey_secret.public_key(),
            y.signed_prekey_signature,
            onetime_prekeys,
            y.metadata.clone(),
        )
    }

    /// Removes and returns the one-time prekey secret with the given id.
    ///
    /// Fails when the id was never issued or when the key was consumed before. Ids are never
    /// reissued so both cases can be told apart.
    pub fn use_onetime_secret(
        mut y: DeviceIdentity,
        id: OneTimePreKeyId,
    ) -> Result<(DeviceIdentity, SecretKey), IdentityError> {
        match y.onetime_secrets.remove(&id) {
            Some(secret) => Ok((y, secret)),
            None if id < y.onetime_next_id => Err(IdentityError::ConsumedOneTimePreKey(id)),
            None => Err(IdentityError::UnknownOneTimePreKey(id)),
        }
    }

    /// Generates new one-time prekeys until `target` unused ones are available.
    pub fn refill_onetime_prekeys(
        mut y: DeviceIdentity,
        target: usize,
        rng: &Rng,
    ) -> Result<DeviceIdentity, IdentityError> {
        while y.onetime_secrets.len() < target {
            let secret = SecretKey::generate(rng)?;
            let existing = y.onetime_secrets.insert(y.onetime_next_id, secret);
            debug_assert!(existing.is_none(), "never issue the same id twice");
            y.onetime_next_id += 1;
        }
        Ok(y)
    }

    /// Remembers the ephemeral key of a handshake accepted from `their_identity_key`, forgetting
    /// the oldest ones of that initiator beyond `window`.
    ///
    /// Handshakes of other initiators never push keys out of this window.
    pub fn remember_handshake(
        mut y: DeviceIdentity,
        their_identity_key: VerifyingKey,
        ephemeral_key: PublicKey,
        window: usize,
    ) -> DeviceIdentity {
        let seen = y.seen_handshakes.entry(their_identity_key).or_default();
        seen.push_back(ephemeral_key);
        while seen.len() > window {
            seen.pop_front();
        }
        y
    }

    pub fn has_seen_handshake(
        y: &DeviceIdentity,
        their_identity_key: &VerifyingKey,
        ephemeral_key: &PublicKey,
    ) -> bool {
        y.seen_handshakes
            .get(their_identity_key)
            .is_some_and(|seen| seen.contains(ephemeral_key))
    }

    fn mark_published(mut y: DeviceIdentity, published: bool) -> DeviceIdentity {
        y.published = published;
        y
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error("one-time prekey {0} was never issued")]
    UnknownOneTimePreKey(OneTimePreKeyId),

    #[error("one-time prekey {0} was already consumed")]
    ConsumedOneTimePreKey(OneTimePreKeyId),
}

/// Persists the device identity and publishes its key bundle.
#[derive(Debug)]
pub struct IdentityStore<S, D> {
    storage: S,
    directory: D,
    config: Config,
    rng: Arc<Rng>,
    lock: Mutex<()>,
}

impl<S, D> IdentityStore<S, D>
where
    S: SecureStorage + Clone,
    D: KeyDirectory,
{
    pub fn new(storage: S, directory: D, config: Config, rng: Arc<Rng>) -> Self {
        Self {
            storage,
            directory,
            config,
            rng,
            lock: Mutex::new(()),
        }
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Exclusive access to identity mutations.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    /// Loads the current identity, if any.
    pub async fn identity(&self) -> Result<Option<DeviceIdentity>, IdentityStoreError> {
        let Some(bytes) = self
            .storage
            .get(IDENTITY_KEY)
            .await
            .map_err(StorageError::new)?
        else {
            return Ok(None);
        };
        Ok(Some(decode_cbor(&bytes[..])?))
    }

    /// Returns the key bundle of the identity for `(user_id, device_label)`, generating and
    /// publishing it first if it does not exist yet.
    ///
    /// An existing identity is returned as-is. If a previous attempt failed to reach the directory
    /// the bundle is published again. An identity stored for another user or device label is
    /// discarded together with all sessions, as if [`IdentityStore::reset_identity`] was called.
    pub async fn ensure_identity(
        &self,
        user_id: &UserId,
        device_label: &DeviceLabel,
        metadata: DeviceMetadata,
    ) -> Result<KeyBundle, IdentityStoreError> {
        let _guard = self.lock().await;

        let identity = match self.identity().await? {
            Some(identity) if identity.belongs_to(user_id, device_label) => {
                if identity.is_published() {
                    return Ok(IdentityManager::key_bundle(&identity));
                }
                identity
            }
            existing => {
                let mut batch = WriteBatch::new();
                if let Some(existing) = existing {
                    warn!(
                        user_id = %existing.user_id(),
                        device_label = %existing.device_label(),
                        "replacing identity of another user or device, dropping its sessions"
                    );
                    batch = self.removal_batch().await?;
                }

                let identity = IdentityManager::init(
                    user_id.clone(),
                    device_label.clone(),
                    metadata,
                    &self.config,
                    &self.rng,
                )?;
                batch.push(Self::identity_write_op(&identity)?);
                self.storage
                    .write_batch(batch)
                    .await
                    .map_err(StorageError::new)?;

                debug!(
                    %user_id,
                    %device_label,
                    identity_key = %identity.identity_key(),
                    "generated new device identity"
                );

                identity
            }
        };

        let bundle = IdentityManager::key_bundle(&identity);
        self.directory.publish(&bundle).await?;

        let identity = IdentityManager::mark_published(identity, true);
        self.persist(&identity).await?;

        Ok(bundle)
    }

    /// Discards the identity and every session which was established with it.
    ///
    /// This can't be undone, peers which still hold the old public keys can not complete
    /// handshakes with this device anymore.
    pub async fn reset_identity(&self) -> Result<(), IdentityStoreError> {
        let _guard = self.lock().await;

        let batch = self.removal_batch().await?;
        let removed = batch.len();
        self.storage
            .write_batch(batch)
            .await
            .map_err(StorageError::new)?;

        debug!(removed, "reset device identity");
        Ok(())
    }

    /// Tops up the one-time prekey pool if it dropped to the configured threshold, persists the
    /// identity and republishes the bundle.
    ///
    /// Expects the caller to hold the identity lock. Failing to reach the directory is not an
    /// error, the next refill will publish again.
    pub(crate) async fn replenish_locked(
        &self,
        identity: DeviceIdentity,
    ) -> Result<DeviceIdentity, IdentityStoreError> {
        if identity.onetime_prekey_count() > self.config.onetime_prekey_refill_threshold {
            return Ok(identity);
        }

        let identity = IdentityManager::refill_onetime_prekeys(
            identity,
            self.config.onetime_prekey_count,
            &self.rng,
        )?;
        let bundle = IdentityManager::key_bundle(&identity);
        let published = match self.directory.publish(&bundle).await {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, "could not republish key bundle after refilling one-time prekeys");
                false
            }
        };
        let identity = IdentityManager::mark_published(identity, published);
        self.persist(&identity).await?;

        debug!(
            onetime_prekeys = identity.onetime_prekey_count(),
            published, "refilled one-time prekeys"
        );

        Ok(identity)
    }

    pub(crate) fn identity_write_op(
        identity: &DeviceIdentity,
    ) -> Result<WriteOp, IdentityStoreError> {
        Ok(WriteOp::Set(IDENTITY_KEY.to_owned(), encode_cbor(identity)?))
    }

    async fn persist(&self, identity: &DeviceIdentity) -> Result<(), IdentityStoreError> {
        self.storage
            .set(IDENTITY_KEY, encode_cbor(identity)?)
            .await
            .map_err(StorageError::new)?;
        Ok(())
    }

    async fn removal_batch(&self) -> Result<WriteBatch, IdentityStoreError> {
        let sessions = SessionStore::new(self.storage.clone());
        let mut batch = sessions.removal_batch().await?;
        batch.delete(IDENTITY_KEY);
        Ok(batch)
    }
}

#[derive(Debug, Error)]
pub enum IdentityStoreError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Sessions(#[from] SessionStoreError),

    #[error("could not encode identity: {0}")]
    Encode(#[from] EncodeError),

    #[error("could not decode stored identity: {0}")]
    Decode(#[from] DecodeError),
}

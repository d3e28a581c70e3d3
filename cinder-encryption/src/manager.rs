// SPDX-License-Identifier: MIT OR Apache-2.0

//! Entry point for the message layer: encrypt for and decrypt from peers.
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};

use cinder_core::{ConversationId, DeviceLabel, MessageId, UserId};
use cinder_store::{SecureStorage, WriteBatch};
use rand_chacha::ChaCha20Rng;
use rand_chacha::rand_core::SeedableRng;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::backoff::Backoff;
use crate::config::Config;
use crate::crypto::Rng;
use crate::directory::{DirectoryError, KeyDirectory};
use crate::display_cache::{DisplayCache, MessageContent};
use crate::envelope::Envelope;
use crate::error::{DecryptionFailure, SessionError, StorageError};
use crate::handshake::{Handshake, HandshakeMaterial};
use crate::identity::{DeviceIdentity, IdentityError, IdentityStore, IdentityStoreError};
use crate::key_bundle::{DeviceMetadata, KeyBundle};
use crate::ratchet::{Ratchet, Role, SessionState};
use crate::session_store::{PeerPair, SessionStore};
use crate::transport::StoredMessage;

/// Encrypted two-party sessions of one device.
///
/// Sessions are created lazily: the first `encrypt_for_peer` towards a peer runs the handshake
/// against their published key bundle, the first `decrypt_from_peer` of a message carrying
/// handshake material answers it. Every successful operation persists the advanced session before
/// returning.
///
/// Operations on the same `(local, remote)` pair are queued in call order, operations on different
/// pairs run concurrently. Decrypting still requires the caller to hand in messages in the order
/// they were sent, a message which arrives too early fails with a deferrable error.
#[derive(Debug)]
pub struct SessionManager<S, D> {
    storage: S,
    identities: IdentityStore<S, D>,
    sessions: SessionStore<S>,
    display: DisplayCache<S>,
    rng: Arc<Rng>,

    /// Held for reading by session operations and for writing while the identity is replaced.
    epoch: RwLock<()>,

    /// One FIFO lock per peer pair, dropped again once nobody holds or waits for it.
    peers: std::sync::Mutex<HashMap<PeerPair, Arc<Mutex<()>>>>,
}

impl<S, D> SessionManager<S, D>
where
    S: SecureStorage + Clone,
    D: KeyDirectory,
{
    /// Creates a manager seeded from the operating system's randomness.
    pub fn new(storage: S, directory: D, config: Config) -> Result<Self, SessionError> {
        let rng = Rng::try_from_os().map_err(|err| {
            SessionError::IdentityGeneration(IdentityStoreError::Identity(IdentityError::Rng(err)))
        })?;
        Ok(Self::with_rng(storage, directory, config, rng))
    }

    pub fn with_rng(storage: S, directory: D, config: Config, rng: Rng) -> Self {
        let rng = Arc::new(rng);
        Self {
            identities: IdentityStore::new(storage.clone(), directory, config, rng.clone()),
            sessions: SessionStore::new(storage.clone()),
            display: DisplayCache::new(storage.clone()),
            storage,
            rng,
            epoch: RwLock::new(()),
            peers: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        self.identities.config()
    }

    pub fn directory(&self) -> &D {
        self.identities.directory()
    }

    /// Makes sure this device has an identity for `user_id` and its key bundle is published.
    ///
    /// Idempotent, see [`IdentityStore::ensure_identity`].
    pub async fn ensure_identity(
        &self,
        user_id: &UserId,
        device_label: &DeviceLabel,
        metadata: DeviceMetadata,
    ) -> Result<KeyBundle, SessionError> {
        let _epoch = self.epoch.write().await;
        self.identities
            .ensure_identity(user_id, device_label, metadata)
            .await
            .map_err(|err| match err {
                IdentityStoreError::Directory(err) => SessionError::DirectoryUnavailable(err),
                err => SessionError::IdentityGeneration(err),
            })
    }

    /// Irreversibly discards the identity and all sessions.
    ///
    /// Waits for in-flight session operations to finish. Messages of discarded sessions can not be
    /// decrypted anymore, neither by this device nor by any future identity.
    pub async fn reset_identity(&self) -> Result<(), SessionError> {
        let _epoch = self.epoch.write().await;
        self.identities.reset_identity().await?;
        Ok(())
    }

    pub async fn identity(&self) -> Result<Option<DeviceIdentity>, SessionError> {
        Ok(self.identities.identity().await?)
    }

    /// Current session state with a peer, if one was established.
    pub async fn session(
        &self,
        local: &UserId,
        remote: &UserId,
    ) -> Result<Option<SessionState>, SessionError> {
        let pair = PeerPair::new(local.clone(), remote.clone());
        Ok(self.sessions.session(&pair).await?)
    }

    /// Drops the session with a peer, the next message towards them starts a new handshake.
    ///
    /// Returns false if there was no session.
    pub async fn end_session(&self, local: &UserId, remote: &UserId) -> Result<bool, SessionError> {
        let _epoch = self.epoch.read().await;
        let pair = PeerPair::new(local.clone(), remote.clone());
        let lock = self.peer_lock(&pair);
        let _peer = lock.lock().await;

        let removed = self.sessions.remove_session(&pair).await?;
        if removed {
            debug!(%pair, "ended session");
        }
        Ok(removed)
    }

    /// Encrypts `plaintext` for `remote` and returns the serialized envelope.
    ///
    /// The conversation id is bound into the ciphertext as associated data, the blob can only be
    /// decrypted in the same conversation.
    pub async fn encrypt_for_peer(
        &self,
        local: &UserId,
        remote: &UserId,
        conversation_id: &ConversationId,
        plaintext: &[u8],
    ) -> Result<String, SessionError> {
        let _epoch = self.epoch.read().await;
        let pair = PeerPair::new(local.clone(), remote.clone());
        let lock = self.peer_lock(&pair);
        let _peer = lock.lock().await;

        let identity = self.local_identity(local).await?;

        let session = match self.sessions.session(&pair).await? {
            Some(session) => session,
            None => self.initiate(&identity, &pair).await?,
        };

        let (session, envelope) =
            Ratchet::encrypt_next(session, plaintext, conversation_id.as_bytes(), &self.rng)
                .map_err(SessionError::Encryption)?;
        let blob = envelope.to_json().map_err(SessionError::Envelope)?;

        self.sessions.set_session(&pair, &session).await?;

        Ok(blob)
    }

    /// Same as [`SessionManager::encrypt_for_peer`], but retries up to `attempts` times with the
    /// configured backoff while the key directory is unavailable.
    ///
    /// Only the first message towards a peer needs the directory. Every other error is returned
    /// right away.
    pub async fn encrypt_for_peer_with_retry(
        &self,
        local: &UserId,
        remote: &UserId,
        conversation_id: &ConversationId,
        plaintext: &[u8],
        attempts: usize,
    ) -> Result<String, SessionError> {
        let mut backoff = self.backoff()?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .encrypt_for_peer(local, remote, conversation_id, plaintext)
                .await
            {
                Err(SessionError::DirectoryUnavailable(err)) if attempt < attempts => {
                    trace!(%remote, attempt, %err, "retry reaching key directory");
                    backoff.increment();
                    backoff.sleep().await;
                }
                result => return result,
            }
        }
    }

    /// Retry schedule of [`Config::backoff`], for callers retrying after
    /// [`SessionError::DirectoryUnavailable`] on their own.
    pub fn backoff(&self) -> Result<Backoff, SessionError> {
        let seed = self.rng.random_array().map_err(|err| {
            SessionError::IdentityGeneration(IdentityStoreError::Identity(IdentityError::Rng(err)))
        })?;
        Ok(Backoff::new(
            self.config().backoff.clone(),
            ChaCha20Rng::from_seed(seed),
        ))
    }

    /// Decrypts a blob `remote` sent in the given conversation.
    ///
    /// Blobs need to be passed in in the order they were written. A failure leaves the session
    /// untouched, so the next blob can still be decrypted.
    pub async fn decrypt_from_peer(
        &self,
        local: &UserId,
        remote: &UserId,
        conversation_id: &ConversationId,
        blob: &str,
    ) -> Result<Vec<u8>, SessionError> {
        let _epoch = self.epoch.read().await;
        let pair = PeerPair::new(local.clone(), remote.clone());
        let lock = self.peer_lock(&pair);
        let _peer = lock.lock().await;

        self.decrypt_locked(&pair, conversation_id, blob, None).await
    }

    /// Returns the displayable content of a stored message.
    ///
    /// Messages which were read or written on this device before are served from the display
    /// cache without touching the session. Everything else is decrypted, a message which can not
    /// be decrypted (anymore) is reported as [`MessageContent::Destroyed`].
    ///
    /// A message which might still decrypt once earlier ones were processed is returned as a
    /// deferrable [`SessionError::DecryptionFailure`] instead.
    pub async fn read_message(
        &self,
        local: &UserId,
        message: &StoredMessage,
    ) -> Result<MessageContent, SessionError> {
        if let Some(plaintext) = self
            .display
            .get(local, &message.conversation_id, &message.id)
            .await?
        {
            return Ok(MessageContent::Cached(plaintext));
        }

        // Own messages are encrypted for the peer, we can't read them back.
        if &message.sender_id == local {
            return Ok(MessageContent::Destroyed);
        }

        let _epoch = self.epoch.read().await;
        let pair = PeerPair::new(local.clone(), message.sender_id.clone());
        let lock = self.peer_lock(&pair);
        let _peer = lock.lock().await;

        match self
            .decrypt_locked(
                &pair,
                &message.conversation_id,
                &message.blob,
                Some(&message.id),
            )
            .await
        {
            Ok(plaintext) => Ok(MessageContent::Decrypted(plaintext)),
            Err(SessionError::DecryptionFailure(failure)) if failure.is_deferrable() => {
                Err(SessionError::DecryptionFailure(failure))
            }
            Err(SessionError::DecryptionFailure(_) | SessionError::HandshakeVerification(_)) => {
                Ok(MessageContent::Destroyed)
            }
            Err(err) => Err(err),
        }
    }

    /// Reads a backlog of messages one after another, in the given order.
    ///
    /// Messages which arrived ahead of others are retried after the rest of the backlog was
    /// processed. What still can't be decrypted when no further progress is made is destroyed.
    pub async fn read_backlog(
        &self,
        local: &UserId,
        messages: &[StoredMessage],
    ) -> Result<Vec<MessageContent>, SessionError> {
        let mut contents: Vec<Option<MessageContent>> = messages.iter().map(|_| None).collect();
        let mut pending: Vec<usize> = (0..messages.len()).collect();

        while !pending.is_empty() {
            let mut deferred = Vec::new();
            for &index in &pending {
                match self.read_message(local, &messages[index]).await {
                    Ok(content) => contents[index] = Some(content),
                    Err(SessionError::DecryptionFailure(failure)) if failure.is_deferrable() => {
                        trace!(message_id = %messages[index].id, %failure, "deferred message");
                        deferred.push(index);
                    }
                    Err(err) => return Err(err),
                }
            }

            if deferred.len() == pending.len() {
                debug!(
                    count = deferred.len(),
                    "messages of backlog can not be decrypted anymore"
                );
                break;
            }
            pending = deferred;
        }

        Ok(contents
            .into_iter()
            .map(|content| content.unwrap_or(MessageContent::Destroyed))
            .collect())
    }

    /// Keeps the plaintext of a message written on this device for display.
    pub async fn remember_sent(
        &self,
        local: &UserId,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        plaintext: &[u8],
    ) -> Result<(), SessionError> {
        self.display
            .insert(local, conversation_id, message_id, plaintext)
            .await?;
        Ok(())
    }

    fn peer_lock(&self, pair: &PeerPair) -> Arc<Mutex<()>> {
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        // Locks are only handed out under this mutex, an entry only referenced by the map has no
        // holders or waiters.
        peers.retain(|other, lock| other == pair || Arc::strong_count(lock) > 1);
        peers.entry(pair.clone()).or_default().clone()
    }

    #[cfg(test)]
    fn tracked_peers(&self) -> usize {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn local_identity(&self, local: &UserId) -> Result<DeviceIdentity, SessionError> {
        match self.identities.identity().await? {
            Some(identity) if identity.user_id() == local => Ok(identity),
            _ => Err(SessionError::NoIdentity),
        }
    }

    /// Fetches the bundle of a peer we start a handshake with, claiming one of its one-time
    /// prekeys.
    async fn fetch_bundle(&self, user_id: &UserId) -> Result<KeyBundle, SessionError> {
        let bundle = self.identities.directory().fetch(user_id).await;
        Self::expect_bundle(user_id, bundle)
    }

    /// Fetches the bundle of a peer who started a handshake with us, for verification only.
    async fn fetch_sender_bundle(&self, user_id: &UserId) -> Result<KeyBundle, SessionError> {
        let bundle = self.identities.directory().fetch_identity(user_id).await;
        Self::expect_bundle(user_id, bundle)
    }

    fn expect_bundle(
        user_id: &UserId,
        bundle: Result<Option<KeyBundle>, DirectoryError>,
    ) -> Result<KeyBundle, SessionError> {
        match bundle.map_err(SessionError::DirectoryUnavailable)? {
            Some(bundle) if bundle.user_id() == user_id => Ok(bundle),
            Some(bundle) => {
                warn!(
                    %user_id,
                    returned = %bundle.user_id(),
                    "directory returned key bundle of another user"
                );
                Err(SessionError::NoKeyBundle(user_id.clone()))
            }
            None => Err(SessionError::NoKeyBundle(user_id.clone())),
        }
    }

    async fn initiate(
        &self,
        identity: &DeviceIdentity,
        pair: &PeerPair,
    ) -> Result<SessionState, SessionError> {
        let their_bundle = self.fetch_bundle(&pair.remote).await?;

        let (root_key, material) = Handshake::initiate(identity, &their_bundle, &self.rng)
            .map_err(SessionError::HandshakeVerification)?;

        debug!(
            %pair,
            device_label = %their_bundle.device_label(),
            onetime_prekey = ?material.onetime_prekey_id,
            "established session as initiator"
        );

        let handshake_key = material.ephemeral_key;
        Ratchet::establish(
            root_key,
            Role::Initiator,
            *their_bundle.identity_key(),
            handshake_key,
            Some(material),
        )
        .map_err(SessionError::Encryption)
    }

    /// Expects the caller to hold the epoch and peer locks.
    async fn decrypt_locked(
        &self,
        pair: &PeerPair,
        conversation_id: &ConversationId,
        blob: &str,
        message_id: Option<&MessageId>,
    ) -> Result<Vec<u8>, SessionError> {
        self.local_identity(&pair.local).await?;

        let envelope = Envelope::from_json(blob).map_err(|err| {
            debug!(%pair, %err, "could not parse envelope");
            SessionError::DecryptionFailure(err.into())
        })?;

        let current = self.sessions.session(pair).await?;

        match (envelope.handshake(), current) {
            // A retransmitted or late first message of the current session.
            (Some(handshake), Some(session))
                if &handshake.ephemeral_key == session.handshake_key() =>
            {
                self.decrypt_established(pair, session, &envelope, conversation_id, message_id)
                    .await
            }
            (Some(handshake), current) => {
                self.decrypt_first(
                    pair,
                    current,
                    handshake,
                    &envelope,
                    conversation_id,
                    message_id,
                )
                .await
            }
            (None, Some(session)) => {
                self.decrypt_established(pair, session, &envelope, conversation_id, message_id)
                    .await
            }
            (None, None) => {
                debug!(%pair, "received message without session");
                Err(SessionError::DecryptionFailure(DecryptionFailure::NoSession))
            }
        }
    }

    async fn decrypt_established(
        &self,
        pair: &PeerPair,
        session: SessionState,
        envelope: &Envelope,
        conversation_id: &ConversationId,
        message_id: Option<&MessageId>,
    ) -> Result<Vec<u8>, SessionError> {
        let (session, plaintext) =
            Ratchet::decrypt_next(session, envelope, conversation_id.as_bytes()).map_err(|err| {
                debug!(%pair, %err, "could not decrypt message");
                SessionError::DecryptionFailure(err.into())
            })?;

        let mut batch = WriteBatch::new();
        batch.push(SessionStore::<S>::set_session_op(pair, &session)?);
        if let Some(message_id) = message_id {
            batch.push(DisplayCache::<S>::insert_op(
                &pair.local,
                conversation_id,
                message_id,
                &plaintext,
            ));
        }
        self.storage
            .write_batch(batch)
            .await
            .map_err(StorageError::new)?;

        Ok(plaintext)
    }

    /// Answers the handshake of a first message and decrypts it.
    ///
    /// The consumed one-time prekey and the new session are only persisted if the message
    /// decrypted, a forged first message never changes any state.
    async fn decrypt_first(
        &self,
        pair: &PeerPair,
        current: Option<SessionState>,
        handshake: &HandshakeMaterial,
        envelope: &Envelope,
        conversation_id: &ConversationId,
        message_id: Option<&MessageId>,
    ) -> Result<Vec<u8>, SessionError> {
        // The sender's identity key is checked against their independently fetched bundle.
        let their_bundle = self.fetch_sender_bundle(&pair.remote).await?;

        let _identity = self.identities.lock().await;
        let identity = self.local_identity(&pair.local).await?;

        let (identity, root_key) = Handshake::respond(
            identity,
            handshake,
            &their_bundle,
            self.config().handshake_replay_window,
        )
        .map_err(|err| {
            // Handshakes referring to keys we moved on from belong to sessions which were
            // replaced or to an identity one of us reset.
            if err.is_stale(current.is_some()) {
                debug!(%pair, %err, "received handshake of an outdated session");
                SessionError::DecryptionFailure(DecryptionFailure::StaleHandshake(err))
            } else {
                debug!(%pair, %err, "rejected handshake");
                SessionError::HandshakeVerification(err)
            }
        })?;

        let session = Ratchet::establish(
            root_key,
            Role::Responder,
            handshake.identity_key,
            handshake.ephemeral_key,
            None,
        )
        .map_err(|err| SessionError::DecryptionFailure(err.into()))?;

        let (session, plaintext) =
            Ratchet::decrypt_next(session, envelope, conversation_id.as_bytes()).map_err(|err| {
                debug!(%pair, %err, "could not decrypt first message");
                SessionError::DecryptionFailure(err.into())
            })?;

        // Both sides initiated at the same time: the session with the lower handshake key wins on
        // both ends. A peer which re-keyed always replaces our session.
        let keep_ours = current.as_ref().is_some_and(|ours| {
            ours.role() == Role::Initiator
                && !ours.is_handshake_complete()
                && ours.their_identity_key() == &handshake.identity_key
                && ours.handshake_key().as_bytes() < handshake.ephemeral_key.as_bytes()
        });

        let mut batch = WriteBatch::new();
        batch.push(IdentityStore::<S, D>::identity_write_op(&identity)?);
        if !keep_ours {
            batch.push(SessionStore::<S>::set_session_op(pair, &session)?);
        }
        if let Some(message_id) = message_id {
            batch.push(DisplayCache::<S>::insert_op(
                &pair.local,
                conversation_id,
                message_id,
                &plaintext,
            ));
        }
        self.storage
            .write_batch(batch)
            .await
            .map_err(StorageError::new)?;

        if keep_ours {
            debug!(%pair, "simultaneous handshake, keeping own session");
        } else if current.is_some() {
            warn!(%pair, "peer started a new session, replacing the existing one");
        } else {
            debug!(
                %pair,
                onetime_prekey = ?handshake.onetime_prekey_id,
                "established session as responder"
            );
        }

        if handshake.onetime_prekey_id.is_some() {
            if let Err(err) = self.identities.replenish_locked(identity).await {
                warn!(%err, "could not refill one-time prekeys");
            }
        }

        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use cinder_store::MemoryStorage;

    use crate::config::Config;
    use crate::crypto::Rng;
    use crate::directory::MemoryDirectory;
    use crate::error::{DecryptionFailure, SessionError};
    use crate::handshake::HandshakeError;
    use crate::key_bundle::DeviceMetadata;
    use crate::ratchet::{RatchetError, Role};

    use super::SessionManager;

    type Manager = SessionManager<MemoryStorage, MemoryDirectory>;

    async fn peer(name: &str, seed: u8, directory: &MemoryDirectory) -> Manager {
        let config = Config {
            onetime_prekey_count: 4,
            onetime_prekey_refill_threshold: 1,
            ..Config::default()
        };
        let manager = SessionManager::with_rng(
            MemoryStorage::new(),
            directory.clone(),
            config,
            Rng::from_seed([seed; 32]),
        );
        manager
            .ensure_identity(&name.into(), &"primary".into(), DeviceMetadata::default())
            .await
            .unwrap();
        manager
    }

    #[tokio::test]
    async fn first_and_subsequent_messages() {
        let directory = MemoryDirectory::new();
        let alice = peer("alice", 1, &directory).await;
        let bob = peer("bob", 2, &directory).await;

        let blob_1 = alice
            .encrypt_for_peer(&"alice".into(), &"bob".into(), &"conv1".into(), b"hello")
            .await
            .unwrap();
        let blob_2 = alice
            .encrypt_for_peer(&"alice".into(), &"bob".into(), &"conv1".into(), b"world")
            .await
            .unwrap();

        let session = alice
            .session(&"alice".into(), &"bob".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.role(), Role::Initiator);
        assert_eq!(session.sending_counter(), 2);
        assert!(!session.is_handshake_complete());

        assert_eq!(
            bob.decrypt_from_peer(&"bob".into(), &"alice".into(), &"conv1".into(), &blob_1)
                .await
                .unwrap(),
            b"hello"
        );
        assert_eq!(
            bob.decrypt_from_peer(&"bob".into(), &"alice".into(), &"conv1".into(), &blob_2)
                .await
                .unwrap(),
            b"world"
        );

        // Bob replies in the same session, which completes the handshake for Alice.
        let reply = bob
            .encrypt_for_peer(&"bob".into(), &"alice".into(), &"conv1".into(), b"hi alice")
            .await
            .unwrap();
        assert_eq!(
            alice
                .decrypt_from_peer(&"alice".into(), &"bob".into(), &"conv1".into(), &reply)
                .await
                .unwrap(),
            b"hi alice"
        );
        let session = alice
            .session(&"alice".into(), &"bob".into())
            .await
            .unwrap()
            .unwrap();
        assert!(session.is_handshake_complete());
        assert_eq!(session.receiving_counter(), 1);
    }

    #[tokio::test]
    async fn no_identity() {
        let directory = MemoryDirectory::new();
        let alice = peer("alice", 1, &directory).await;

        assert_matches!(
            alice
                .encrypt_for_peer(&"carol".into(), &"bob".into(), &"conv1".into(), b"hello")
                .await,
            Err(SessionError::NoIdentity)
        );
        assert_matches!(
            alice
                .encrypt_for_peer(&"alice".into(), &"bob".into(), &"conv1".into(), b"hello")
                .await,
            Err(SessionError::NoKeyBundle(user_id)) if user_id.as_str() == "bob"
        );
    }

    #[tokio::test]
    async fn replayed_first_message() {
        let directory = MemoryDirectory::new();
        let alice = peer("alice", 1, &directory).await;
        let bob = peer("bob", 2, &directory).await;

        let blob = alice
            .encrypt_for_peer(&"alice".into(), &"bob".into(), &"conv1".into(), b"hello")
            .await
            .unwrap();
        bob.decrypt_from_peer(&"bob".into(), &"alice".into(), &"conv1".into(), &blob)
            .await
            .unwrap();

        // Same handshake as the current session, processed by the session itself.
        assert_matches!(
            bob.decrypt_from_peer(&"bob".into(), &"alice".into(), &"conv1".into(), &blob)
                .await,
            Err(SessionError::DecryptionFailure(DecryptionFailure::Ratchet(
                RatchetError::ReplayedMessage(0, 1)
            )))
        );

        // Once Alice re-keyed, the old handshake belongs to an outdated session.
        alice.reset_identity().await.unwrap();
        alice
            .ensure_identity(&"alice".into(), &"primary".into(), DeviceMetadata::default())
            .await
            .unwrap();
        let blob_new = alice
            .encrypt_for_peer(&"alice".into(), &"bob".into(), &"conv1".into(), b"again")
            .await
            .unwrap();
        assert_eq!(
            bob.decrypt_from_peer(&"bob".into(), &"alice".into(), &"conv1".into(), &blob_new)
                .await
                .unwrap(),
            b"again"
        );
        assert_matches!(
            bob.decrypt_from_peer(&"bob".into(), &"alice".into(), &"conv1".into(), &blob)
                .await,
            Err(SessionError::DecryptionFailure(DecryptionFailure::StaleHandshake(
                HandshakeError::IdentityKeyMismatch
            )))
        );
    }

    #[tokio::test]
    async fn peer_locks_are_dropped() {
        let directory = MemoryDirectory::new();
        let alice = peer("alice", 1, &directory).await;
        let _bob = peer("bob", 2, &directory).await;
        let _carol = peer("carol", 3, &directory).await;

        for remote in ["bob", "carol", "bob", "carol"] {
            alice
                .encrypt_for_peer(&"alice".into(), &remote.into(), &"conv1".into(), b"hi")
                .await
                .unwrap();
        }

        // Only the pair used last is still tracked.
        assert_eq!(alice.tracked_peers(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_while_directory_is_offline() {
        let directory = MemoryDirectory::new();
        let alice = peer("alice", 1, &directory).await;
        let bob = peer("bob", 2, &directory).await;
        directory.set_online(false);

        assert_matches!(
            alice
                .encrypt_for_peer_with_retry(
                    &"alice".into(),
                    &"bob".into(),
                    &"conv1".into(),
                    b"hello",
                    3
                )
                .await,
            Err(SessionError::DirectoryUnavailable(_))
        );

        // Comes back online while we are waiting.
        let reconnect = {
            let directory = directory.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                directory.set_online(true);
            }
        };
        let (alice_id, bob_id, conv1): (cinder_core::UserId, cinder_core::UserId, cinder_core::ConversationId) =
            ("alice".into(), "bob".into(), "conv1".into());
        let (_, blob) = tokio::join!(
            reconnect,
            alice.encrypt_for_peer_with_retry(
                &alice_id,
                &bob_id,
                &conv1,
                b"hello",
                10
            )
        );
        assert_eq!(
            bob.decrypt_from_peer(&"bob".into(), &"alice".into(), &"conv1".into(), &blob.unwrap())
                .await
                .unwrap(),
            b"hello"
        );
    }

    #[tokio::test]
    async fn simultaneous_initiation() {
        let directory = MemoryDirectory::new();
        let alice = peer("alice", 1, &directory).await;
        let bob = peer("bob", 2, &directory).await;

        let from_alice = alice
            .encrypt_for_peer(&"alice".into(), &"bob".into(), &"conv1".into(), b"hi bob")
            .await
            .unwrap();
        let from_bob = bob
            .encrypt_for_peer(&"bob".into(), &"alice".into(), &"conv1".into(), b"hi alice")
            .await
            .unwrap();

        assert_eq!(
            bob.decrypt_from_peer(&"bob".into(), &"alice".into(), &"conv1".into(), &from_alice)
                .await
                .unwrap(),
            b"hi bob"
        );
        assert_eq!(
            alice
                .decrypt_from_peer(&"alice".into(), &"bob".into(), &"conv1".into(), &from_bob)
                .await
                .unwrap(),
            b"hi alice"
        );

        // Both ends settled on the same session.
        let session_alice = alice
            .session(&"alice".into(), &"bob".into())
            .await
            .unwrap()
            .unwrap();
        let session_bob = bob
            .session(&"bob".into(), &"alice".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session_alice.handshake_key(), session_bob.handshake_key());
        assert_ne!(session_alice.role(), session_bob.role());

        let blob = alice
            .encrypt_for_peer(&"alice".into(), &"bob".into(), &"conv1".into(), b"still there?")
            .await
            .unwrap();
        assert_eq!(
            bob.decrypt_from_peer(&"bob".into(), &"alice".into(), &"conv1".into(), &blob)
                .await
                .unwrap(),
            b"still there?"
        );
        let blob = bob
            .encrypt_for_peer(&"bob".into(), &"alice".into(), &"conv1".into(), b"yes")
            .await
            .unwrap();
        assert_eq!(
            alice
                .decrypt_from_peer(&"alice".into(), &"bob".into(), &"conv1".into(), &blob)
                .await
                .unwrap(),
            b"yes"
        );
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

use std::error::Error as StdError;

use cinder_core::UserId;
use thiserror::Error;

use crate::directory::DirectoryError;
use crate::envelope::EnvelopeError;
use crate::handshake::HandshakeError;
use crate::identity::IdentityStoreError;
use crate::ratchet::RatchetError;
use crate::session_store::SessionStoreError;

/// Error reported by the platform's secure storage.
#[derive(Debug, Error)]
#[error("secure storage failed: {0}")]
pub struct StorageError(Box<dyn StdError + Send + Sync>);

impl StorageError {
    pub fn new<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self(Box::new(err))
    }
}

/// Errors surfaced to the message layer by the session manager.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No secure randomness or storage available to create keys. Nothing can be encrypted or
    /// decrypted on this device.
    #[error("could not generate device identity: {0}")]
    IdentityGeneration(#[source] IdentityStoreError),

    /// The key directory could not be reached. Retry later (with backoff).
    #[error("key directory unavailable: {0}")]
    DirectoryUnavailable(#[source] DirectoryError),

    /// The handshake of a first message could not be verified, the message is rejected.
    #[error("handshake verification failed: {0}")]
    HandshakeVerification(#[source] HandshakeError),

    /// This one message can not be decrypted.
    #[error("decryption failed: {0}")]
    DecryptionFailure(#[source] DecryptionFailure),

    /// `ensure_identity` was not called for the local user yet.
    #[error("no device identity for this user")]
    NoIdentity,

    /// The directory has no key bundle for this user.
    #[error("no key bundle published for user {0}")]
    NoKeyBundle(UserId),

    /// Deriving keys or encrypting an outgoing message failed.
    #[error("encryption failed: {0}")]
    Encryption(#[source] RatchetError),

    /// The outgoing envelope could not be serialized.
    #[error("could not encode envelope: {0}")]
    Envelope(#[source] EnvelopeError),

    /// Persisting or loading state failed.
    #[error(transparent)]
    Storage(#[from] IdentityStoreError),
}

impl From<SessionStoreError> for SessionError {
    fn from(err: SessionStoreError) -> Self {
        SessionError::Storage(IdentityStoreError::Sessions(err))
    }
}

impl From<StorageError> for SessionError {
    fn from(err: StorageError) -> Self {
        SessionError::Storage(IdentityStoreError::Storage(err))
    }
}

impl SessionError {
    /// True if retrying the same operation later might succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SessionError::DirectoryUnavailable(_) | SessionError::NoKeyBundle(_) => true,
            SessionError::DecryptionFailure(failure) => failure.is_deferrable(),
            _ => false,
        }
    }
}

/// Reasons why a single envelope could not be decrypted.
#[derive(Debug, Error)]
pub enum DecryptionFailure {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Ratchet(#[from] RatchetError),

    /// A subsequent message arrived without an established session, for example because the
    /// first message is still missing or the local identity was reset.
    #[error("no session established with this peer")]
    NoSession,

    /// A first message whose handshake refers to keys which were replaced since, for example
    /// after one side reset its identity.
    #[error("handshake of an outdated session: {0}")]
    StaleHandshake(#[source] HandshakeError),
}

impl DecryptionFailure {
    /// True if the message might decrypt after earlier messages were processed.
    pub fn is_deferrable(&self) -> bool {
        matches!(
            self,
            DecryptionFailure::Ratchet(RatchetError::MessageAhead(..))
                | DecryptionFailure::NoSession
        )
    }
}

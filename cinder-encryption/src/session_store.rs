// SPDX-License-Identifier: MIT OR Apache-2.0

//! Persistence of session state per pair of local and remote user.
use std::fmt;

use cinder_core::UserId;
use cinder_core::cbor::{DecodeError, EncodeError, decode_cbor, encode_cbor};
use cinder_store::{SecureStorage, WriteBatch, WriteOp};
use thiserror::Error;

use crate::error::StorageError;
use crate::ratchet::SessionState;

/// Prefix of all session keys in secure storage.
pub const SESSION_PREFIX: &str = "session/";

/// Ordered pair of users a session belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerPair {
    pub local: UserId,
    pub remote: UserId,
}

impl PeerPair {
    pub fn new(local: UserId, remote: UserId) -> Self {
        Self { local, remote }
    }

    /// Storage key of the session, user ids are hex-encoded so they can't escape the prefix.
    pub fn storage_key(&self) -> String {
        format!(
            "{SESSION_PREFIX}{}/{}",
            self.local.to_hex(),
            self.remote.to_hex()
        )
    }
}

impl fmt::Display for PeerPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

/// Maps peer pairs to their session state.
#[derive(Clone, Debug)]
pub struct SessionStore<S> {
    storage: S,
}

impl<S> SessionStore<S>
where
    S: SecureStorage,
{
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub async fn session(&self, pair: &PeerPair) -> Result<Option<SessionState>, SessionStoreError> {
        let bytes = self
            .storage
            .get(&pair.storage_key())
            .await
            .map_err(StorageError::new)?;
        match bytes {
            Some(bytes) => Ok(Some(decode_cbor(&bytes[..])?)),
            None => Ok(None),
        }
    }

    pub async fn set_session(
        &self,
        pair: &PeerPair,
        session: &SessionState,
    ) -> Result<(), SessionStoreError> {
        self.storage
            .set(&pair.storage_key(), encode_cbor(session)?)
            .await
            .map_err(StorageError::new)?;
        Ok(())
    }

    pub async fn remove_session(&self, pair: &PeerPair) -> Result<bool, SessionStoreError> {
        let removed = self
            .storage
            .delete(&pair.storage_key())
            .await
            .map_err(StorageError::new)?;
        Ok(removed)
    }

    /// Write operation storing the session, to be committed together with other changes.
    pub fn set_session_op(
        pair: &PeerPair,
        session: &SessionState,
    ) -> Result<WriteOp, SessionStoreError> {
        Ok(WriteOp::Set(pair.storage_key(), encode_cbor(session)?))
    }

    /// Batch deleting every stored session.
    pub async fn removal_batch(&self) -> Result<WriteBatch, SessionStoreError> {
        let keys = self
            .storage
            .keys_with_prefix(SESSION_PREFIX)
            .await
            .map_err(StorageError::new)?;
        Ok(keys.into_iter().map(WriteOp::Delete).collect())
    }
}

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("could not encode session: {0}")]
    Encode(#[from] EncodeError),

    #[error("could not decode stored session: {0}")]
    Decode(#[from] DecodeError),
}

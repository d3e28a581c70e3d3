// SPDX-License-Identifier: MIT OR Apache-2.0

//! `cinder-encryption` provides end-to-end encrypted two-party sessions for messaging apps where
//! the other side might be offline.
//!
//! Every device owns a long-term Ed25519 identity, a signed X25519 exchange key and a pool of
//! single-use one-time prekeys. The public part of this (the [`KeyBundle`]) is published to a key
//! directory. Anyone who wants to write to the device fetches the bundle and runs the
//! [X3DH](https://signal.org/docs/specifications/x3dh) key agreement without a round trip, the
//! public handshake material travels inside the first message of the session.
//!
//! The resulting root key seeds two symmetric key chains, one per direction. Each message uses a
//! fresh key derived from the chain, after which the chain moves forward and the old key is
//! dropped. Learning the state of a session does not reveal earlier messages (forward secrecy).
//!
//! ## Usage
//!
//! [`SessionManager`] is the entry point for the message layer. It is generic over the device's
//! [secure storage](cinder_store::SecureStorage) and the [`KeyDirectory`]:
//!
//! - [`SessionManager::ensure_identity`] creates and publishes the device identity (idempotent),
//! - [`SessionManager::encrypt_for_peer`] returns a JSON blob to hand to the message store,
//! - [`SessionManager::encrypt_for_peer_with_retry`] does the same but waits with backoff while
//!   the key directory can't be reached,
//! - [`SessionManager::decrypt_from_peer`] decrypts such a blob on the receiving side,
//! - [`SessionManager::read_backlog`] renders stored conversations, showing messages which can not
//!   be decrypted anymore as "destroyed".
//!
//! Blobs of one sender need to be decrypted in the order they were written. Messages arriving too
//! early fail with an error for which [`DecryptionFailure::is_deferrable`] returns true, they can
//! be retried after the missing ones were processed.
//!
//! ## Resetting identities
//!
//! [`SessionManager::reset_identity`] discards all key material of the device. Sessions with the
//! old identity can never be recovered, peers need to start new ones with the new key bundle.
//! Messages which were decrypted before remain readable through the local display cache.
//!
//! ## Security
//!
//! The symmetric chains give forward secrecy but no post-compromise security: there is no
//! Diffie-Hellman ratchet, a leaked session state allows decrypting all future messages of that
//! session until one side resets its identity.
pub mod backoff;
mod config;
pub mod crypto;
pub mod directory;
mod display_cache;
mod envelope;
mod error;
mod handshake;
mod identity;
mod key_bundle;
mod manager;
mod ratchet;
mod session_store;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
pub mod transport;

pub use config::{
    Config, DEFAULT_HANDSHAKE_REPLAY_WINDOW, DEFAULT_ONETIME_PREKEY_COUNT,
    DEFAULT_ONETIME_PREKEY_REFILL_THRESHOLD,
};
pub use crypto::{Rng, RngError};
pub use directory::{DirectoryError, KeyDirectory, MemoryDirectory};
pub use display_cache::{DESTROYED_MESSAGE_PLACEHOLDER, DisplayCache, MessageContent};
pub use envelope::{Envelope, EnvelopeError, RatchetMessage};
pub use error::{DecryptionFailure, SessionError, StorageError};
pub use handshake::{Handshake, HandshakeError, HandshakeMaterial, RootKey};
pub use identity::{
    DeviceIdentity, IdentityError, IdentityManager, IdentityStore, IdentityStoreError,
};
pub use key_bundle::{
    DeviceMetadata, KeyBundle, KeyBundleError, OneTimePreKey, OneTimePreKeyId,
};
pub use manager::SessionManager;
pub use ratchet::{MAX_MESSAGES_AHEAD, Ratchet, RatchetError, Role, SessionState};
pub use session_store::{PeerPair, SessionStore, SessionStoreError};
pub use transport::{MemoryTransport, MessageTransport, StoredMessage, TransportError};

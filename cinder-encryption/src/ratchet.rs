// SPDX-License-Identifier: MIT OR Apache-2.0

//! Forward-secure symmetric key chains for a two-party session.
//!
//! The root key from the handshake is split into two chains, one per direction. Every message
//! moves the sender's chain one step forward:
//!
//! ```text
//! chain_0 --hkdf("chain")--> chain_1 --hkdf("chain")--> chain_2 ...
//!    |                          |
//! hkdf("message")            hkdf("message")
//!    |                          |
//! message_key_0              message_key_1
//! ```
//!
//! Old chain keys are dropped (and zeroized) after each step, so learning the current chain key
//! does not reveal keys of earlier messages.
//!
//! Messages need to be decrypted in the order they were written. A message "from the future"
//! fails with [`RatchetError::MessageAhead`] and can be retried after the missing ones were
//! processed, a message "from the past" fails with [`RatchetError::ReplayedMessage`]. A failed
//! step never changes the session state.
//!
//! Only authentic messages are reported as ahead: the receiver derives the message key of the
//! later position on a copy of the chain and checks the ciphertext first. Messages of another
//! session can't ever be decrypted and fail like any forged message.
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroize;

use crate::crypto::aead::{ALGORITHM, AeadError, AeadNonce, aead_decrypt, aead_encrypt};
use crate::crypto::ed25519::VerifyingKey;
use crate::crypto::hkdf::{HkdfError, hkdf};
use crate::crypto::x25519::PublicKey;
use crate::crypto::{Rng, RngError, Secret};
use crate::envelope::{Envelope, RatchetMessage};
use crate::handshake::{HandshakeMaterial, RootKey};

pub const CHAIN_KEY_SIZE: usize = 32;

pub const MESSAGE_KEY_SIZE: usize = 32;

const CHAINS_INFO: &[u8] = b"cinder-chains-v1";

/// Maximum distance to the expected position up to which early messages are authenticated.
pub const MAX_MESSAGES_AHEAD: u64 = 1000;

/// Which side of the handshake we were on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "test_utils"), derive(Clone))]
pub struct ChainState {
    key: Secret<CHAIN_KEY_SIZE>,
    counter: u64,
}

impl ChainState {
    fn init(key: Secret<CHAIN_KEY_SIZE>) -> Self {
        Self { key, counter: 0 }
    }

    /// Returns the message key for the current position and the chain moved one step forward.
    fn step(&self) -> Result<(Secret<MESSAGE_KEY_SIZE>, ChainState), RatchetError> {
        let counter = self
            .counter
            .checked_add(1)
            .ok_or(RatchetError::CounterExhausted)?;
        let message_key = Secret::from_bytes(hkdf(b"message", self.key.as_bytes(), None)?);
        let next = ChainState {
            key: Secret::from_bytes(hkdf(b"chain", self.key.as_bytes(), None)?),
            counter,
        };
        Ok((message_key, next))
    }
}

/// Established session with one peer (for persistence).
///
/// A session which does not exist yet is "uninitialized". [`Ratchet::establish`] is the only way
/// to create one.
#[derive(Debug, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "test_utils"), derive(Clone))]
pub struct SessionState {
    role: Role,
    root_key: RootKey,
    sending: ChainState,
    receiving: ChainState,
    their_identity_key: VerifyingKey,
    handshake_key: PublicKey,
    pending_handshake: Option<HandshakeMaterial>,
    handshake_complete: bool,
}

impl SessionState {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn their_identity_key(&self) -> &VerifyingKey {
        &self.their_identity_key
    }

    /// Ephemeral key of the handshake which established this session.
    pub fn handshake_key(&self) -> &PublicKey {
        &self.handshake_key
    }

    /// True when the peer is known to have established the session as well.
    ///
    /// Responders know this right away, initiators once the first reply was decrypted.
    pub fn is_handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    pub fn sending_counter(&self) -> u64 {
        self.sending.counter
    }

    pub fn receiving_counter(&self) -> u64 {
        self.receiving.counter
    }

    #[cfg(test)]
    pub(crate) fn sending_chain_key(&self) -> &Secret<CHAIN_KEY_SIZE> {
        &self.sending.key
    }
}

pub struct Ratchet;

impl Ratchet {
    /// Creates a session from the root key of a completed handshake.
    ///
    /// Initiators pass the handshake material they need to attach to their first message.
    pub fn establish(
        root_key: RootKey,
        role: Role,
        their_identity_key: VerifyingKey,
        handshake_key: PublicKey,
        pending_handshake: Option<HandshakeMaterial>,
    ) -> Result<SessionState, RatchetError> {
        let mut chains: [u8; 2 * CHAIN_KEY_SIZE] =
            hkdf(b"", root_key.as_bytes(), Some(CHAINS_INFO))?;

        let mut initiator_chain = [0u8; CHAIN_KEY_SIZE];
        let mut responder_chain = [0u8; CHAIN_KEY_SIZE];
        initiator_chain.copy_from_slice(&chains[..CHAIN_KEY_SIZE]);
        responder_chain.copy_from_slice(&chains[CHAIN_KEY_SIZE..]);
        chains.zeroize();

        let initiator_chain = ChainState::init(Secret::from_bytes(initiator_chain));
        let responder_chain = ChainState::init(Secret::from_bytes(responder_chain));

        let (sending, receiving) = match role {
            Role::Initiator => (initiator_chain, responder_chain),
            Role::Responder => (responder_chain, initiator_chain),
        };

        Ok(SessionState {
            role,
            root_key,
            sending,
            receiving,
            their_identity_key,
            handshake_key,
            pending_handshake,
            handshake_complete: role == Role::Responder,
        })
    }

    /// Encrypts the next message of the sending chain.
    ///
    /// `associated_data` is authenticated but not encrypted, the receiver needs to present the
    /// same bytes.
    pub fn encrypt_next(
        mut y: SessionState,
        plaintext: &[u8],
        associated_data: &[u8],
        rng: &Rng,
    ) -> Result<(SessionState, Envelope), RatchetError> {
        let (message_key, next_chain) = y.sending.step()?;
        let counter = y.sending.counter;
        let handshake = y.pending_handshake.take();

        let nonce: AeadNonce = rng.random_array()?;
        let aad = bind_associated_data(associated_data, counter, handshake.as_ref());
        let ciphertext = aead_encrypt(message_key.as_bytes(), plaintext, nonce, Some(&aad))?;

        y.sending = next_chain;

        let message = RatchetMessage {
            algorithm: ALGORITHM.to_owned(),
            nonce,
            ciphertext,
            counter,
        };
        let envelope = match handshake {
            Some(handshake) => Envelope::FirstMessage { handshake, message },
            None => Envelope::SubsequentMessage { message },
        };

        Ok((y, envelope))
    }

    /// Decrypts the next message of the receiving chain.
    ///
    /// On any error the passed state is dropped. Callers keep using their previous (persisted)
    /// copy, which is exactly the state before this call.
    pub fn decrypt_next(
        mut y: SessionState,
        envelope: &Envelope,
        associated_data: &[u8],
    ) -> Result<(SessionState, Vec<u8>), RatchetError> {
        let message = envelope.message();

        if message.algorithm != ALGORITHM {
            return Err(RatchetError::UnsupportedAlgorithm(message.algorithm.clone()));
        }

        let expected = y.receiving.counter;
        if message.counter < expected {
            return Err(RatchetError::ReplayedMessage(message.counter, expected));
        }
        if message.counter > expected {
            authenticate_ahead(&y.receiving, envelope, associated_data)?;
            return Err(RatchetError::MessageAhead(message.counter, expected));
        }

        let (message_key, next_chain) = y.receiving.step()?;
        let aad = bind_associated_data(associated_data, message.counter, envelope.handshake());
        let plaintext = aead_decrypt(
            message_key.as_bytes(),
            &message.ciphertext,
            message.nonce,
            Some(&aad),
        )?;

        y.receiving = next_chain;
        y.handshake_complete = true;

        Ok((y, plaintext))
    }
}

/// Checks that an early message belongs to this chain without moving the chain forward.
fn authenticate_ahead(
    chain: &ChainState,
    envelope: &Envelope,
    associated_data: &[u8],
) -> Result<(), RatchetError> {
    let message = envelope.message();
    if message.counter - chain.counter > MAX_MESSAGES_AHEAD {
        return Err(RatchetError::TooFarAhead(message.counter, chain.counter));
    }

    let (mut message_key, mut next) = chain.step()?;
    while next.counter <= message.counter {
        (message_key, next) = next.step()?;
    }

    let aad = bind_associated_data(associated_data, message.counter, envelope.handshake());
    aead_decrypt(
        message_key.as_bytes(),
        &message.ciphertext,
        message.nonce,
        Some(&aad),
    )?;
    Ok(())
}

/// Associated data of the AEAD: caller data (length-prefixed), algorithm, counter and the
/// handshake block if one is attached.
fn bind_associated_data(
    associated_data: &[u8],
    counter: u64,
    handshake: Option<&HandshakeMaterial>,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(associated_data.len() + 128);
    buf.extend_from_slice(&(associated_data.len() as u64).to_be_bytes());
    buf.extend_from_slice(associated_data);
    buf.extend_from_slice(ALGORITHM.as_bytes());
    buf.extend_from_slice(&counter.to_be_bytes());
    if let Some(handshake) = handshake {
        buf.extend_from_slice(&handshake.to_bytes());
    }
    buf
}

#[derive(Debug, Error)]
pub enum RatchetError {
    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    Aead(#[from] AeadError),

    #[error(transparent)]
    Rng(#[from] RngError),

    #[error("unsupported algorithm \"{0}\"")]
    UnsupportedAlgorithm(String),

    #[error("message {0} was already processed (next expected message: {1})")]
    ReplayedMessage(u64, u64),

    #[error("message {0} arrived before message {1}")]
    MessageAhead(u64, u64),

    #[error("message {0} is too far ahead of message {1}")]
    TooFarAhead(u64, u64),

    #[error("message counter exhausted")]
    CounterExhausted,
}

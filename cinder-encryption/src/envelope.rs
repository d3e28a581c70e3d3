// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire format of encrypted messages.
//!
//! Envelopes are serialized as JSON with hex-encoded byte fields:
//!
//! ```text
//! {
//!   "algorithm": "xchacha20poly1305-ietf",
//!   "nonce": "..",
//!   "ciphertext": "..",
//!   "counter": 0,
//!   "handshake": {
//!     "ephemeralPublicKey": "..",
//!     "oneTimePrekeyId": "12",
//!     "identityPublicKey": ".."
//!   }
//! }
//! ```
//!
//! The `handshake` block is only present on the first message a sender writes in a session.
use cinder_core::serde::{deserialize_hex, deserialize_hex_array, serialize_hex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::aead::AeadNonce;
use crate::handshake::HandshakeMaterial;

/// Ciphertext produced by one step of a sending chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RatchetMessage {
    pub algorithm: String,
    pub nonce: AeadNonce,
    pub ciphertext: Vec<u8>,
    pub counter: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Envelope {
    /// First message of a session, carrying what the receiver needs to establish it.
    FirstMessage {
        handshake: HandshakeMaterial,
        message: RatchetMessage,
    },

    SubsequentMessage {
        message: RatchetMessage,
    },
}

impl Envelope {
    pub fn message(&self) -> &RatchetMessage {
        match self {
            Envelope::FirstMessage { message, .. } => message,
            Envelope::SubsequentMessage { message } => message,
        }
    }

    pub fn handshake(&self) -> Option<&HandshakeMaterial> {
        match self {
            Envelope::FirstMessage { handshake, .. } => Some(handshake),
            Envelope::SubsequentMessage { .. } => None,
        }
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(&WireEnvelope::from(self.clone()))?)
    }

    pub fn from_json(json: &str) -> Result<Self, EnvelopeError> {
        let wire: WireEnvelope = serde_json::from_str(json)?;
        Ok(wire.into())
    }
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    algorithm: String,
    #[serde(
        serialize_with = "serialize_hex",
        deserialize_with = "deserialize_hex_array"
    )]
    nonce: AeadNonce,
    #[serde(serialize_with = "serialize_hex", deserialize_with = "deserialize_hex")]
    ciphertext: Vec<u8>,
    counter: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    handshake: Option<HandshakeMaterial>,
}

impl From<Envelope> for WireEnvelope {
    fn from(envelope: Envelope) -> Self {
        let (handshake, message) = match envelope {
            Envelope::FirstMessage { handshake, message } => (Some(handshake), message),
            Envelope::SubsequentMessage { message } => (None, message),
        };
        Self {
            algorithm: message.algorithm,
            nonce: message.nonce,
            ciphertext: message.ciphertext,
            counter: message.counter,
            handshake,
        }
    }
}

impl From<WireEnvelope> for Envelope {
    fn from(wire: WireEnvelope) -> Self {
        let message = RatchetMessage {
            algorithm: wire.algorithm,
            nonce: wire.nonce,
            ciphertext: wire.ciphertext,
            counter: wire.counter,
        };
        match wire.handshake {
            Some(handshake) => Envelope::FirstMessage { handshake, message },
            None => Envelope::SubsequentMessage { message },
        }
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::crypto::Rng;
    use crate::crypto::ed25519::SigningKey;
    use crate::crypto::x25519::SecretKey;
    use crate::handshake::HandshakeMaterial;

    use super::{Envelope, EnvelopeError, RatchetMessage};

    fn message(counter: u64) -> RatchetMessage {
        RatchetMessage {
            algorithm: "xchacha20poly1305-ietf".into(),
            nonce: [7; 24],
            ciphertext: vec![0xca, 0xfe],
            counter,
        }
    }

    #[test]
    fn handshake_only_on_first_message() {
        let rng = Rng::from_seed([1; 32]);
        let handshake = HandshakeMaterial {
            ephemeral_key: SecretKey::generate(&rng).unwrap().public_key(),
            onetime_prekey_id: Some(3),
            identity_key: SigningKey::generate(&rng).unwrap().verifying_key(),
        };

        let first = Envelope::FirstMessage {
            handshake: handshake.clone(),
            message: message(0),
        };
        let json = first.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["algorithm"], "xchacha20poly1305-ietf");
        assert_eq!(value["ciphertext"], "cafe");
        assert_eq!(value["nonce"], "07".repeat(24));
        assert_eq!(value["counter"], 0);
        assert_eq!(value["handshake"]["oneTimePrekeyId"], "3");
        assert_eq!(Envelope::from_json(&json).unwrap(), first);

        let subsequent = Envelope::SubsequentMessage {
            message: message(1),
        };
        let json = subsequent.to_json().unwrap();
        assert!(!json.contains("handshake"));
        assert_eq!(Envelope::from_json(&json).unwrap(), subsequent);
        assert_eq!(subsequent.handshake(), None);
    }

    #[test]
    fn malformed() {
        assert_matches!(Envelope::from_json("not json"), Err(EnvelopeError::Json(_)));
        assert_matches!(
            Envelope::from_json(r#"{"algorithm":"a","nonce":"00","ciphertext":"","counter":0}"#),
            Err(EnvelopeError::Json(_))
        );
    }
}

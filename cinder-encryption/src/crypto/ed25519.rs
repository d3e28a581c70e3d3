// SPDX-License-Identifier: MIT OR Apache-2.0

//! Edwards-Curve Digital Signature Algorithm (EdDSA) related to Curve25519 using SHA-512.
//!
//! A device uses one Ed25519 key pair as its long-term identity. The matching X25519 key pair for
//! Diffie-Hellman is derived from it by converting the Edwards point into its Montgomery form, so
//! only one secret needs to be generated and stored.
use std::fmt;

use cinder_core::serde::{deserialize_hex_array, serialize_hex};
use curve25519_dalek::MontgomeryPoint;
use ed25519_dalek::Signer;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::x25519;
use crate::crypto::{Rng, RngError, Secret};

pub const SIGNING_KEY_SIZE: usize = 32;

pub const VERIFYING_KEY_SIZE: usize = 32;

pub const SIGNATURE_SIZE: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningKey(Secret<SIGNING_KEY_SIZE>);

impl SigningKey {
    pub(crate) fn from_bytes(bytes: [u8; SIGNING_KEY_SIZE]) -> Self {
        Self(Secret::from_bytes(bytes))
    }

    pub fn generate(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self::from_bytes(rng.random_array()?))
    }

    fn to_dalek(&self) -> ed25519_dalek::SigningKey {
        ed25519_dalek::SigningKey::from_bytes(self.0.as_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey(self.to_dalek().verifying_key().to_bytes())
    }

    pub fn sign(&self, bytes: &[u8]) -> Signature {
        Signature(self.to_dalek().sign(bytes).to_bytes())
    }

    /// X25519 secret derived from this signing key.
    ///
    /// Its public key equals [`VerifyingKey::exchange_key`] of our verifying key.
    pub fn exchange_secret(&self) -> x25519::SecretKey {
        x25519::SecretKey::from_bytes(self.to_dalek().to_scalar_bytes())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct VerifyingKey([u8; VERIFYING_KEY_SIZE]);

impl VerifyingKey {
    pub fn from_bytes(bytes: [u8; VERIFYING_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; VERIFYING_KEY_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; VERIFYING_KEY_SIZE] {
        self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn to_dalek(self) -> Result<ed25519_dalek::VerifyingKey, SignatureError> {
        ed25519_dalek::VerifyingKey::from_bytes(&self.0).map_err(|_| SignatureError::InvalidKey)
    }

    pub fn verify(&self, bytes: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        let signature = ed25519_dalek::Signature::from_bytes(&signature.0);
        self.to_dalek()?
            .verify_strict(bytes, &signature)
            .map_err(|_| SignatureError::VerificationFailed)?;
        Ok(())
    }

    /// X25519 public key for Diffie-Hellman, the Montgomery form of this Edwards point.
    pub fn exchange_key(&self) -> Result<x25519::PublicKey, SignatureError> {
        let point: MontgomeryPoint = self.to_dalek()?.to_montgomery();
        Ok(x25519::PublicKey::from_bytes(point.to_bytes()))
    }
}

impl fmt::Display for VerifyingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Signature([u8; SIGNATURE_SIZE]);

impl Signature {
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; SIGNATURE_SIZE] {
        self.0
    }
}

impl Serialize for VerifyingKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serialize_hex(self.as_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for VerifyingKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: [u8; VERIFYING_KEY_SIZE] = deserialize_hex_array(deserializer)?;
        Ok(Self(bytes))
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serialize_hex(self.as_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: [u8; SIGNATURE_SIZE] = deserialize_hex_array(deserializer)?;
        Ok(Self(bytes))
    }
}

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("signature does not match public key and payload")]
    VerificationFailed,

    #[error("bytes do not represent a valid ed25519 public key")]
    InvalidKey,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::crypto::Rng;

    use super::{SignatureError, SigningKey};

    #[test]
    fn sign_and_verify() {
        let rng = Rng::from_seed([1; 32]);

        let signing_key = SigningKey::generate(&rng).unwrap();
        let verifying_key = signing_key.verifying_key();
        let signature = signing_key.sign(b"Hello, Bob!");
        assert!(verifying_key.verify(b"Hello, Bob!", &signature).is_ok());
    }

    #[test]
    fn failed_verify() {
        let rng = Rng::from_seed([1; 32]);

        let signing_key = SigningKey::generate(&rng).unwrap();
        let verifying_key = signing_key.verifying_key();
        let signature = signing_key.sign(b"Hello, Bob!");

        let invalid_signing_key = SigningKey::generate(&rng).unwrap();
        let invalid_verifying_key = invalid_signing_key.verifying_key();
        let invalid_signature = invalid_signing_key.sign(b"Hello, Bob!");

        assert_matches!(
            verifying_key.verify(b"Invalid Data", &signature),
            Err(SignatureError::VerificationFailed)
        );
        assert_matches!(
            invalid_verifying_key.verify(b"Hello, Bob!", &signature),
            Err(SignatureError::VerificationFailed)
        );
        assert_matches!(
            verifying_key.verify(b"Hello, Bob!", &invalid_signature),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn exchange_key_matches_exchange_secret() {
        let rng = Rng::from_seed([3; 32]);

        let alice = SigningKey::generate(&rng).unwrap();
        let bob = SigningKey::generate(&rng).unwrap();

        let alice_exchange = alice.verifying_key().exchange_key().unwrap();
        assert_eq!(alice.exchange_secret().public_key(), alice_exchange);

        // Both sides derive the same secret from converted identity keys.
        let bob_exchange = bob.verifying_key().exchange_key().unwrap();
        let shared_1 = alice
            .exchange_secret()
            .calculate_agreement(&bob_exchange)
            .unwrap();
        let shared_2 = bob
            .exchange_secret()
            .calculate_agreement(&alice_exchange)
            .unwrap();
        assert_eq!(shared_1, shared_2);
    }
}

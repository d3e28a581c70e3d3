// SPDX-License-Identifier: MIT OR Apache-2.0

//! Elliptic-curve Diffie–Hellman (ECDH) key agreement scheme (X25519).
use std::fmt;

use cinder_core::serde::{deserialize_hex_array, serialize_hex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{Rng, RngError, Secret};

/// 256-bit secret key size.
pub const SECRET_KEY_SIZE: usize = 32;

/// 256-bit public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// 256-bit shared secret size.
pub const SHARED_SECRET_SIZE: usize = 32;

/// Secret Curve25519 key used for ECDH key agreement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKey(Secret<SECRET_KEY_SIZE>);

impl SecretKey {
    pub(crate) fn from_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        // Clamping happens inside x25519-dalek on every use, the raw bytes are kept as-is.
        SecretKey(Secret::from_bytes(bytes))
    }

    pub fn generate(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self::from_bytes(rng.random_array()?))
    }

    fn to_dalek(&self) -> x25519_dalek::StaticSecret {
        x25519_dalek::StaticSecret::from(*self.0.as_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        let public = x25519_dalek::PublicKey::from(&self.to_dalek());
        PublicKey(public.to_bytes())
    }

    /// Computes the shared secret with the other party's public key.
    ///
    /// Low-order public keys would result in an all-zero secret independent of our secret key,
    /// these are rejected.
    pub fn calculate_agreement(
        &self,
        their_public: &PublicKey,
    ) -> Result<Secret<SHARED_SECRET_SIZE>, X25519Error> {
        let their_public = x25519_dalek::PublicKey::from(their_public.to_bytes());
        let shared_secret = self.to_dalek().diffie_hellman(&their_public);
        if !shared_secret.was_contributory() {
            return Err(X25519Error::NonContributory);
        }
        Ok(Secret::from_bytes(shared_secret.to_bytes()))
    }
}

/// Public Curve25519 key used for ECDH key agreement.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(public_key: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(public_key)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serialize_hex(self.as_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: [u8; PUBLIC_KEY_SIZE] = deserialize_hex_array(deserializer)?;
        Ok(Self(bytes))
    }
}

#[derive(Debug, Error)]
pub enum X25519Error {
    #[error("diffie-hellman with a low-order public key does not contribute to the secret")]
    NonContributory,
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Public key material a device publishes so others can start sessions with it while it is
//! offline.
use cinder_core::{DeviceLabel, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::ed25519::{Signature, SignatureError, VerifyingKey};
use crate::crypto::x25519::PublicKey;

pub type OneTimePreKeyId = u64;

/// Public part of a one-time prekey, to be used for exactly one handshake.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKey {
    id: OneTimePreKeyId,
    key: PublicKey,
}

impl OneTimePreKey {
    pub fn new(key: PublicKey, id: OneTimePreKeyId) -> Self {
        Self { id, key }
    }

    pub fn id(&self) -> OneTimePreKeyId {
        self.id
    }

    pub fn key(&self) -> &PublicKey {
        &self.key
    }
}

/// Contact details a user chose to publish together with their device keys.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Published, public-only projection of a device identity.
///
/// The signed exchange key is signed by the identity key. Verifying this signature against an
/// identity key which was obtained independently is what prevents key-substitution attacks.
///
/// In JSON all keys are hex-encoded:
///
/// ```text
/// {
///   "userId": "alice",
///   "deviceLabel": "primary",
///   "identityKey": "..",
///   "signedExchangeKey": "..",
///   "signature": "..",
///   "oneTimePrekeys": [{ "id": 0, "key": ".." }],
///   "metadata": { "displayName": "Alice" }
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyBundle {
    user_id: UserId,
    device_label: DeviceLabel,
    identity_key: VerifyingKey,
    signed_exchange_key: PublicKey,
    signature: Signature,
    #[serde(rename = "oneTimePrekeys", default)]
    onetime_prekeys: Vec<OneTimePreKey>,
    #[serde(default)]
    metadata: DeviceMetadata,
}

impl KeyBundle {
    pub fn new(
        user_id: UserId,
        device_label: DeviceLabel,
        identity_key: VerifyingKey,
        signed_exchange_key: PublicKey,
        signature: Signature,
        onetime_prekeys: Vec<OneTimePreKey>,
        metadata: DeviceMetadata,
    ) -> Self {
        Self {
            user_id,
            device_label,
            identity_key,
            signed_exchange_key,
            signature,
            onetime_prekeys,
            metadata,
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn device_label(&self) -> &DeviceLabel {
        &self.device_label
    }

    pub fn identity_key(&self) -> &VerifyingKey {
        &self.identity_key
    }

    /// X25519 form of the identity key, used in the handshake.
    pub fn identity_exchange_key(&self) -> Result<PublicKey, KeyBundleError> {
        Ok(self.identity_key.exchange_key()?)
    }

    pub fn signed_exchange_key(&self) -> &PublicKey {
        &self.signed_exchange_key
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn onetime_prekeys(&self) -> &[OneTimePreKey] {
        &self.onetime_prekeys
    }

    /// One-time prekey an initiator should use, if the pool is not empty.
    pub fn onetime_prekey(&self) -> Option<&OneTimePreKey> {
        self.onetime_prekeys.first()
    }

    /// Removes the one-time prekey which [`KeyBundle::onetime_prekey`] would hand out next.
    pub fn claim_onetime_prekey(&mut self) -> Option<OneTimePreKey> {
        if self.onetime_prekeys.is_empty() {
            None
        } else {
            Some(self.onetime_prekeys.remove(0))
        }
    }

    pub fn metadata(&self) -> &DeviceMetadata {
        &self.metadata
    }

    /// Checks that the signed exchange key was signed by the identity key.
    pub fn verify(&self) -> Result<(), KeyBundleError> {
        self.identity_key
            .verify(self.signed_exchange_key.as_bytes(), &self.signature)?;
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, KeyBundleError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, KeyBundleError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Error)]
pub enum KeyBundleError {
    #[error("invalid key bundle signature: {0}")]
    Signature(#[from] SignatureError),

    #[error("malformed key bundle document: {0}")]
    Json(#[from] serde_json::Error),
}

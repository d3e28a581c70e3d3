// SPDX-License-Identifier: MIT OR Apache-2.0

//! Extended Triple Diffie-Hellman (X3DH) key agreement.
//!
//! X3DH establishes a shared root key between two parties who mutually authenticate each other
//! based on public keys. It is designed for asynchronous settings where the responder ("Bob") is
//! offline but has published a key bundle to the directory. The initiator ("Alice") uses this
//! bundle to derive the root key without any round trip and sends the public handshake material
//! along with the first message.
//!
//! The input key material is the concatenation of, in this order:
//!
//! ```text
//! 0xFF * 32 || DH(IK_A, SPK_B) || DH(EK_A, IK_B) || DH(EK_A, SPK_B) [|| DH(EK_A, OPK_B)]
//! ```
//!
//! where `IK` are the X25519 forms of the Ed25519 identity keys, `SPK` the signed exchange key,
//! `EK` the initiator's ephemeral key and `OPK` the optional one-time prekey. The root key is
//! derived with HKDF-SHA256 using 32 zero bytes as salt.
//!
//! <https://signal.org/docs/specifications/x3dh/>
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroize;

use crate::crypto::ed25519::VerifyingKey;
use crate::crypto::hkdf::{HkdfError, hkdf};
use crate::crypto::x25519::{PublicKey, SecretKey, X25519Error};
use crate::crypto::{Rng, RngError, Secret};
use crate::identity::{DeviceIdentity, IdentityError, IdentityManager};
use crate::key_bundle::{KeyBundle, KeyBundleError, OneTimePreKeyId};

/// ASCII string identifying the application, used as KDF info.
const KDF_INFO: &[u8] = b"cinder-x3dh-v1";

/// "Discontinuity bytes" prepended to the key material.
const DISCONTINUITY: [u8; 32] = [0xFF; 32];

pub const ROOT_KEY_SIZE: usize = 32;

pub type RootKey = Secret<ROOT_KEY_SIZE>;

/// Public values the responder needs to compute the same root key as the initiator.
///
/// Travels inside the first message of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMaterial {
    #[serde(rename = "ephemeralPublicKey")]
    pub ephemeral_key: PublicKey,

    #[serde(
        rename = "oneTimePrekeyId",
        default,
        skip_serializing_if = "Option::is_none",
        with = "onetime_prekey_id"
    )]
    pub onetime_prekey_id: Option<OneTimePreKeyId>,

    #[serde(rename = "identityPublicKey")]
    pub identity_key: VerifyingKey,
}

impl HandshakeMaterial {
    /// Canonical byte representation, bound into the first message as associated data.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + 32 + 9);
        buf.extend_from_slice(self.ephemeral_key.as_bytes());
        buf.extend_from_slice(self.identity_key.as_bytes());
        match self.onetime_prekey_id {
            Some(id) => {
                buf.push(1);
                buf.extend_from_slice(&id.to_be_bytes());
            }
            None => buf.push(0),
        }
        buf
    }
}

/// One-time prekey ids are written as decimal strings.
mod onetime_prekey_id {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::key_bundle::OneTimePreKeyId;

    pub fn serialize<S>(id: &Option<OneTimePreKeyId>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match id {
            Some(id) => serializer.serialize_some(&id.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<OneTimePreKeyId>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: Option<String> = Option::deserialize(deserializer)?;
        value
            .map(|id| id.parse::<OneTimePreKeyId>().map_err(serde::de::Error::custom))
            .transpose()
    }
}

pub struct Handshake;

impl Handshake {
    /// Initiator side: derive a root key from the responder's key bundle.
    ///
    /// Uses the first one-time prekey of the bundle if there is one, otherwise the handshake
    /// continues with the three mandatory Diffie-Hellman terms.
    pub fn initiate(
        our_identity: &DeviceIdentity,
        their_bundle: &KeyBundle,
        rng: &Rng,
    ) -> Result<(RootKey, HandshakeMaterial), HandshakeError> {
        their_bundle.verify()?;

        let their_identity_key = their_bundle.identity_exchange_key()?;
        let their_prekey = their_bundle.signed_exchange_key();
        let their_onetime_prekey = their_bundle.onetime_prekey();

        let our_identity_secret = our_identity.identity_secret();
        let our_ephemeral_secret = SecretKey::generate(rng)?;

        let mut ikm = Vec::with_capacity(32 * 5);
        ikm.extend_from_slice(&DISCONTINUITY);

        // DH1 = DH(IK_A, SPK_B)
        ikm.extend_from_slice(
            our_identity_secret
                .calculate_agreement(their_prekey)?
                .as_bytes(),
        );

        // DH2 = DH(EK_A, IK_B)
        ikm.extend_from_slice(
            our_ephemeral_secret
                .calculate_agreement(&their_identity_key)?
                .as_bytes(),
        );

        // DH3 = DH(EK_A, SPK_B)
        ikm.extend_from_slice(
            our_ephemeral_secret
                .calculate_agreement(their_prekey)?
                .as_bytes(),
        );

        // DH4 = DH(EK_A, OPK_B)
        if let Some(onetime_prekey) = their_onetime_prekey {
            ikm.extend_from_slice(
                our_ephemeral_secret
                    .calculate_agreement(onetime_prekey.key())?
                    .as_bytes(),
            );
        }

        let root_key = derive_root_key(&mut ikm)?;

        let material = HandshakeMaterial {
            ephemeral_key: our_ephemeral_secret.public_key(),
            onetime_prekey_id: their_onetime_prekey.map(|key| key.id()),
            identity_key: our_identity.identity_key(),
        };

        Ok((root_key, material))
    }

    /// Responder side: recompute the root key from the initiator's handshake material.
    ///
    /// `their_bundle` is the initiator's key bundle as fetched from the directory. Its identity
    /// key needs to match the one claimed in the handshake material, otherwise anyone could
    /// substitute their own keys. A referenced one-time prekey is consumed and returned state
    /// must be persisted before the root key is used.
    pub fn respond(
        our_identity: DeviceIdentity,
        material: &HandshakeMaterial,
        their_bundle: &KeyBundle,
        replay_window: usize,
    ) -> Result<(DeviceIdentity, RootKey), HandshakeError> {
        their_bundle.verify()?;

        if their_bundle.identity_key() != &material.identity_key {
            return Err(HandshakeError::IdentityKeyMismatch);
        }

        if IdentityManager::has_seen_handshake(
            &our_identity,
            &material.identity_key,
            &material.ephemeral_key,
        ) {
            return Err(HandshakeError::ReplayedHandshake);
        }

        let their_identity_key = material
            .identity_key
            .exchange_key()
            .map_err(KeyBundleError::from)?;

        let (y, our_onetime_secret) = match material.onetime_prekey_id {
            Some(id) => {
                let (y, secret) = IdentityManager::use_onetime_secret(our_identity, id)?;
                (y, Some(secret))
            }
            None => (our_identity, None),
        };

        let our_identity_secret = y.identity_secret();
        let our_prekey_secret = y.signed_prekey_secret();

        let mut ikm = Vec::with_capacity(32 * 5);
        ikm.extend_from_slice(&DISCONTINUITY);

        // DH1 = DH(IK_A, SPK_B)
        ikm.extend_from_slice(
            our_prekey_secret
                .calculate_agreement(&their_identity_key)?
                .as_bytes(),
        );

        // DH2 = DH(EK_A, IK_B)
        ikm.extend_from_slice(
            our_identity_secret
                .calculate_agreement(&material.ephemeral_key)?
                .as_bytes(),
        );

        // DH3 = DH(EK_A, SPK_B)
        ikm.extend_from_slice(
            our_prekey_secret
                .calculate_agreement(&material.ephemeral_key)?
                .as_bytes(),
        );

        // DH4 = DH(EK_A, OPK_B)
        if let Some(our_onetime_secret) = our_onetime_secret {
            ikm.extend_from_slice(
                our_onetime_secret
                    .calculate_agreement(&material.ephemeral_key)?
                    .as_bytes(),
            );
        }

        let root_key = derive_root_key(&mut ikm)?;

        let y = IdentityManager::remember_handshake(
            y,
            material.identity_key,
            material.ephemeral_key,
            replay_window,
        );

        Ok((y, root_key))
    }
}

fn derive_root_key(ikm: &mut Vec<u8>) -> Result<RootKey, HandshakeError> {
    let salt = [0u8; 32];
    let result = hkdf(&salt, &ikm[..], Some(KDF_INFO));
    ikm.zeroize();
    Ok(Secret::from_bytes(result?))
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    KeyBundle(#[from] KeyBundleError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    X25519(#[from] X25519Error),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    Rng(#[from] RngError),

    #[error("identity key of the handshake does not match the sender's published key bundle")]
    IdentityKeyMismatch,

    #[error("handshake with this ephemeral key was already processed")]
    ReplayedHandshake,
}

impl HandshakeError {
    /// True if the handshake was valid once but refers to keys which were replaced since.
    ///
    /// An identity key differing from the sender's published one means they reset their
    /// identity. Unknown or consumed one-time prekeys only count as outdated when another session
    /// with the sender exists, otherwise they are treated as a replay.
    pub fn is_stale(&self, session_exists: bool) -> bool {
        match self {
            HandshakeError::IdentityKeyMismatch => true,
            HandshakeError::Identity(
                IdentityError::UnknownOneTimePreKey(_) | IdentityError::ConsumedOneTimePreKey(_),
            ) => session_exists,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::config::Config;
    use crate::crypto::Rng;
    use crate::identity::{DeviceIdentity, IdentityError, IdentityManager};
    use crate::key_bundle::{DeviceMetadata, KeyBundle};

    use super::{Handshake, HandshakeError, HandshakeMaterial};

    fn identity(name: &str, rng: &Rng) -> DeviceIdentity {
        let config = Config {
            onetime_prekey_count: 2,
            ..Config::default()
        };
        IdentityManager::init(
            name.into(),
            "primary".into(),
            DeviceMetadata::default(),
            &config,
            rng,
        )
        .unwrap()
    }

    #[test]
    fn symmetric_root_key() {
        let rng = Rng::from_seed([1; 32]);

        let alice = identity("alice", &rng);
        let bob = identity("bob", &rng);

        let alice_bundle = IdentityManager::key_bundle(&alice);
        let bob_bundle = IdentityManager::key_bundle(&bob);

        let (alice_root, material) = Handshake::initiate(&alice, &bob_bundle, &rng).unwrap();
        assert_eq!(material.onetime_prekey_id, Some(0));
        assert_eq!(material.identity_key, alice.identity_key());

        let (bob, bob_root) = Handshake::respond(bob, &material, &alice_bundle, 16).unwrap();
        assert_eq!(alice_root, bob_root);

        // The one-time prekey was consumed.
        assert_eq!(bob.onetime_prekey_count(), 1);

        // Replaying the same handshake fails.
        assert_matches!(
            Handshake::respond(bob, &material, &alice_bundle, 16),
            Err(HandshakeError::ReplayedHandshake)
        );
    }

    #[test]
    fn without_onetime_prekey() {
        let rng = Rng::from_seed([2; 32]);

        let alice = identity("alice", &rng);
        let bob = identity("bob", &rng);

        let alice_bundle = IdentityManager::key_bundle(&alice);
        let mut bob_bundle = IdentityManager::key_bundle(&bob);
        while bob_bundle.claim_onetime_prekey().is_some() {}

        let (alice_root, material) = Handshake::initiate(&alice, &bob_bundle, &rng).unwrap();
        assert_eq!(material.onetime_prekey_id, None);

        let (bob, bob_root) = Handshake::respond(bob, &material, &alice_bundle, 16).unwrap();
        assert_eq!(alice_root, bob_root);
        assert_eq!(bob.onetime_prekey_count(), 2);
    }

    #[test]
    fn consumed_onetime_prekey() {
        let rng = Rng::from_seed([3; 32]);

        let alice = identity("alice", &rng);
        let charlie = identity("charlie", &rng);
        let bob = identity("bob", &rng);

        let bob_bundle = IdentityManager::key_bundle(&bob);

        // Both initiators got the same one-time prekey handed out.
        let (_, material_1) = Handshake::initiate(&alice, &bob_bundle, &rng).unwrap();
        let (_, material_2) = Handshake::initiate(&charlie, &bob_bundle, &rng).unwrap();

        let (bob, _) = Handshake::respond(
            bob,
            &material_1,
            &IdentityManager::key_bundle(&alice),
            16,
        )
        .unwrap();
        assert_matches!(
            Handshake::respond(
                bob.clone(),
                &material_2,
                &IdentityManager::key_bundle(&charlie),
                16
            ),
            Err(HandshakeError::Identity(
                IdentityError::ConsumedOneTimePreKey(0)
            ))
        );

        let unknown = HandshakeMaterial {
            onetime_prekey_id: Some(99),
            ..material_2
        };
        let result =
            Handshake::respond(bob, &unknown, &IdentityManager::key_bundle(&charlie), 16);
        assert_matches!(
            result,
            Err(HandshakeError::Identity(IdentityError::UnknownOneTimePreKey(
                99
            )))
        );

        // Only outdated when there is a newer session with the sender.
        let err = result.unwrap_err();
        assert!(err.is_stale(true));
        assert!(!err.is_stale(false));
        assert!(HandshakeError::IdentityKeyMismatch.is_stale(false));
        assert!(!HandshakeError::ReplayedHandshake.is_stale(true));
    }

    #[test]
    fn key_substitution() {
        let rng = Rng::from_seed([4; 32]);

        let alice = identity("alice", &rng);
        let mallory = identity("mallory", &rng);
        let bob = identity("bob", &rng);

        let bob_bundle = IdentityManager::key_bundle(&bob);

        // Mallory claims to be Alice but Bob fetches Alice's real bundle.
        let (_, material) = Handshake::initiate(&mallory, &bob_bundle, &rng).unwrap();
        assert_matches!(
            Handshake::respond(
                bob.clone(),
                &material,
                &IdentityManager::key_bundle(&alice),
                16
            ),
            Err(HandshakeError::IdentityKeyMismatch)
        );

        // A bundle whose exchange key was not signed by its identity key is rejected.
        let alice_bundle = IdentityManager::key_bundle(&alice);
        let mallory_bundle = IdentityManager::key_bundle(&mallory);
        let forged = KeyBundle::new(
            alice_bundle.user_id().clone(),
            alice_bundle.device_label().clone(),
            *alice_bundle.identity_key(),
            *mallory_bundle.signed_exchange_key(),
            *mallory_bundle.signature(),
            vec![],
            Default::default(),
        );
        assert_matches!(
            Handshake::initiate(&bob, &forged, &rng),
            Err(HandshakeError::KeyBundle(_))
        );
        let (_, material) =
            Handshake::initiate(&alice, &IdentityManager::key_bundle(&bob), &rng).unwrap();
        assert_matches!(
            Handshake::respond(bob, &material, &forged, 16),
            Err(HandshakeError::KeyBundle(_))
        );
    }

    #[test]
    fn material_json() {
        let rng = Rng::from_seed([5; 32]);
        let alice = identity("alice", &rng);
        let bob = identity("bob", &rng);

        let (_, material) =
            Handshake::initiate(&alice, &IdentityManager::key_bundle(&bob), &rng).unwrap();
        let json = serde_json::to_value(&material).unwrap();
        assert_eq!(json["oneTimePrekeyId"], "0");
        assert_eq!(
            json["ephemeralPublicKey"].as_str().unwrap(),
            material.ephemeral_key.to_hex()
        );
        assert_eq!(
            json["identityPublicKey"].as_str().unwrap(),
            material.identity_key.to_hex()
        );

        let without: HandshakeMaterial = serde_json::from_value(serde_json::json!({
            "ephemeralPublicKey": material.ephemeral_key.to_hex(),
            "identityPublicKey": material.identity_key.to_hex(),
        }))
        .unwrap();
        assert_eq!(without.onetime_prekey_id, None);
    }
}

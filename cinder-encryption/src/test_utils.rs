// SPDX-License-Identifier: MIT OR Apache-2.0

//! Helpers to set up devices talking to each other in tests.
use cinder_core::{DeviceLabel, UserId};
use cinder_store::MemoryStorage;

use crate::config::Config;
use crate::crypto::Rng;
use crate::directory::MemoryDirectory;
use crate::error::SessionError;
use crate::key_bundle::{DeviceMetadata, KeyBundle};
use crate::manager::SessionManager;

pub type MemorySessionManager = SessionManager<MemoryStorage, MemoryDirectory>;

/// Device label used by [`TestPeer`].
pub const PRIMARY_DEVICE: &str = "primary";

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

/// Small one-time prekey pool, refilled when only one key is left.
pub fn test_config() -> Config {
    Config {
        onetime_prekey_count: 4,
        onetime_prekey_refill_threshold: 1,
        ..Config::default()
    }
}

/// A user with one device, sharing the directory with other test peers.
pub struct TestPeer {
    pub user_id: UserId,
    pub storage: MemoryStorage,
    pub manager: MemorySessionManager,
}

impl TestPeer {
    /// Creates a device with deterministic randomness without publishing an identity yet.
    pub fn new(name: &str, seed: u8, directory: &MemoryDirectory) -> Self {
        Self::with_storage(name, seed, directory, MemoryStorage::new())
    }

    /// Same as [`TestPeer::new`] but on top of existing storage, as after an app restart.
    pub fn with_storage(
        name: &str,
        seed: u8,
        directory: &MemoryDirectory,
        storage: MemoryStorage,
    ) -> Self {
        let manager = SessionManager::with_rng(
            storage.clone(),
            directory.clone(),
            test_config(),
            Rng::from_seed([seed; 32]),
        );
        Self {
            user_id: UserId::new(name),
            storage,
            manager,
        }
    }

    pub async fn ensure_identity(&self) -> Result<KeyBundle, SessionError> {
        self.manager
            .ensure_identity(
                &self.user_id,
                &DeviceLabel::new(PRIMARY_DEVICE),
                DeviceMetadata::default(),
            )
            .await
    }
}

/// Two users with published identities.
pub async fn alice_and_bob(directory: &MemoryDirectory) -> (TestPeer, TestPeer) {
    let alice = TestPeer::new("alice", 1, directory);
    let bob = TestPeer::new("bob", 2, directory);
    alice
        .ensure_identity()
        .await
        .expect("publish identity of alice");
    bob.ensure_identity()
        .await
        .expect("publish identity of bob");
    (alice, bob)
}

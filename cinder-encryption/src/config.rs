// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffConfig;

/// Size of a freshly generated one-time prekey pool.
pub const DEFAULT_ONETIME_PREKEY_COUNT: usize = 100;

/// Pool size at or below which the pool is topped up and republished.
pub const DEFAULT_ONETIME_PREKEY_REFILL_THRESHOLD: usize = 20;

/// Number of handshake ephemeral keys remembered to detect replayed first messages.
pub const DEFAULT_HANDSHAKE_REPLAY_WINDOW: usize = 1024;

/// Configuration of the session engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub onetime_prekey_count: usize,

    pub onetime_prekey_refill_threshold: usize,

    /// Handshakes without a one-time prekey can only be told apart by their ephemeral key, the
    /// last `handshake_replay_window` of every initiator are rejected when seen again.
    pub handshake_replay_window: usize,

    /// Retry schedule of `SessionManager::encrypt_for_peer_with_retry` and of the backoff handed
    /// out by `SessionManager::backoff`.
    pub backoff: BackoffConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            onetime_prekey_count: DEFAULT_ONETIME_PREKEY_COUNT,
            onetime_prekey_refill_threshold: DEFAULT_ONETIME_PREKEY_REFILL_THRESHOLD,
            handshake_replay_window: DEFAULT_HANDSHAKE_REPLAY_WINDOW,
            backoff: BackoffConfig::default(),
        }
    }
}

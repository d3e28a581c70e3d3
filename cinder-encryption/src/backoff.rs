// SPDX-License-Identifier: MIT OR Apache-2.0

//! Incremental, randomised backoff for callers retrying an unreachable key directory.
#[cfg(test)]
use mock_instant::thread_local::Instant;
use std::time::Duration;
#[cfg(not(test))]
use std::time::Instant;

use rand::Rng as _;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Simple, incremental backoff logic.
///
/// It starts at an initial value and gets incremented by a random value until it hits a ceiling.
/// After a random amount of time without being incremented it resets to the initial value again.
#[derive(Debug)]
pub struct Backoff {
    value: Duration,
    last_reset_at: Instant,
    reset_after: Duration,
    config: BackoffConfig,
    rng: ChaCha20Rng,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Backoff will always begin with this initial value.
    ///
    /// Defaults to 0 / no backoff.
    pub initial_value: Duration,

    /// Minimum increment value when increasing backoff value.
    pub min_increment: Duration,

    /// Maximum increment value when increasing backoff value.
    pub max_increment: Duration,

    /// Maximum reachable backoff value.
    pub max_value: Duration,

    /// Minimum waiting time until backoff will be reset to initial value.
    pub min_reset: Duration,

    /// Maximum waiting time until backoff will be reset to initial value.
    pub max_reset: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_value: Duration::from_secs(0),
            min_increment: Duration::from_millis(250),
            max_increment: Duration::from_millis(1000),
            max_value: Duration::from_secs(30),
            min_reset: Duration::from_secs(60),
            max_reset: Duration::from_secs(120),
        }
    }
}

impl Backoff {
    pub fn new(config: BackoffConfig, rng: ChaCha20Rng) -> Self {
        let mut backoff = Self {
            value: config.initial_value,
            last_reset_at: Instant::now(),
            reset_after: Duration::default(),
            config,
            rng,
        };
        backoff.reset();
        backoff
    }

    pub fn value(&self) -> Duration {
        self.value
    }

    pub fn increment(&mut self) {
        // Reset backoff after we've waited long enough.
        if self.last_reset_at.elapsed() >= self.reset_after {
            self.reset();
        }

        if self.value >= self.config.max_value {
            self.value = self.config.max_value;
        } else {
            let increment = self.random_increment();
            self.value = (self.value + increment).min(self.config.max_value);
        }
    }

    pub async fn sleep(&self) {
        if self.value.is_zero() {
            return;
        }

        trace!("backoff {} ms", self.value.as_millis());
        tokio::time::sleep(self.value).await;
    }

    pub fn reset(&mut self) {
        self.value = self.config.initial_value;
        self.last_reset_at = Instant::now();
        self.reset_after = self.random_reset_after();
    }

    fn random_increment(&mut self) -> Duration {
        random_duration(
            &mut self.rng,
            self.config.min_increment,
            self.config.max_increment,
        )
    }

    fn random_reset_after(&mut self) -> Duration {
        random_duration(&mut self.rng, self.config.min_reset, self.config.max_reset)
    }
}

fn random_duration(rng: &mut ChaCha20Rng, min: Duration, max: Duration) -> Duration {
    if min >= max {
        return min;
    }
    let millis = rng.random_range::<u128, _>(min.as_millis()..=max.as_millis());
    Duration::from_millis(millis as u64)
}

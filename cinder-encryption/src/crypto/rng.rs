// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Mutex;

use rand_chacha::rand_core::{SeedableRng, TryRngCore};
use thiserror::Error;

use crate::crypto::Secret;

/// Cryptographically-secure random number generator that uses the ChaCha algorithm.
///
/// Seeded from the operating system. Failing to obtain randomness surfaces as an error instead of
/// a panic so callers can report that key generation is impossible on this device.
#[derive(Debug)]
pub struct Rng {
    rng: Mutex<rand_chacha::ChaCha20Rng>,
}

impl Default for Rng {
    fn default() -> Self {
        Self {
            rng: Mutex::new(rand_chacha::ChaCha20Rng::from_os_rng()),
        }
    }
}

impl Rng {
    /// Seeds a fresh generator from the operating system, failing if it has no entropy to offer.
    pub fn try_from_os() -> Result<Self, RngError> {
        let rng = rand_chacha::ChaCha20Rng::try_from_os_rng()
            .map_err(|_| RngError::NotEnoughRandomness)?;
        Ok(Self {
            rng: Mutex::new(rng),
        })
    }
}

#[cfg(any(test, feature = "test_utils"))]
impl Rng {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            rng: Mutex::new(rand_chacha::ChaCha20Rng::from_seed(seed)),
        }
    }
}

impl Rng {
    pub fn random_array<const N: usize>(&self) -> Result<[u8; N], RngError> {
        let mut rng = self.rng.lock().map_err(|_| RngError::LockPoisoned)?;
        let mut out = [0u8; N];
        rng.try_fill_bytes(&mut out)
            .map_err(|_| RngError::NotEnoughRandomness)?;
        Ok(out)
    }

    pub fn random_secret<const N: usize>(&self) -> Result<Secret<N>, RngError> {
        Ok(Secret::from_bytes(self.random_array()?))
    }
}

#[derive(Debug, Error)]
pub enum RngError {
    #[error("rng lock is poisoned")]
    LockPoisoned,

    #[error("unable to collect enough randomness")]
    NotEnoughRandomness,
}

#[cfg(test)]
mod tests {
    use super::Rng;

    #[test]
    fn deterministic_randomness() {
        let sample_1: [u8; 64] = Rng::from_seed([1; 32]).random_array().unwrap();
        let sample_2: [u8; 64] = Rng::from_seed([1; 32]).random_array().unwrap();
        assert_eq!(sample_1, sample_2);

        let sample_3: [u8; 64] = Rng::from_seed([2; 32]).random_array().unwrap();
        assert_ne!(sample_1, sample_3);
    }
}

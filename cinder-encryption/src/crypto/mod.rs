// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic primitives used by the handshake and message chains.
pub mod aead;
pub mod ed25519;
pub mod hkdf;
mod rng;
mod secret;
pub mod x25519;

pub use rng::{Rng, RngError};
pub use secret::Secret;

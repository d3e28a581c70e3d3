// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::ZeroizeOnDrop;

/// Container for sensitive bytes (root, chain and message keys, private key material).
///
/// Memory is zeroized on drop, comparison runs in constant time and the value is never printed in
/// debug output. Bytes are only reachable from inside this crate.
#[derive(Clone, Eq, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct Secret<const N: usize>(#[serde(with = "serde_bytes")] [u8; N]);

impl<const N: usize> Secret<N> {
    pub(crate) fn from_bytes(bytes: [u8; N]) -> Self {
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }
}

impl<const N: usize> PartialEq for Secret<N> {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl<const N: usize> fmt::Debug for Secret<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret").field("value", &"***").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::Secret;

    #[test]
    fn redacted_debug() {
        let secret = Secret::from_bytes([42u8; 4]);
        assert_eq!(format!("{secret:?}"), "Secret { value: \"***\" }");
    }

    #[test]
    fn equality() {
        assert_eq!(Secret::from_bytes([1u8; 8]), Secret::from_bytes([1u8; 8]));
        assert_ne!(Secret::from_bytes([1u8; 8]), Secret::from_bytes([2u8; 8]));
    }
}

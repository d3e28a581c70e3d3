// SPDX-License-Identifier: MIT OR Apache-2.0

//! XChaCha20Poly1305 is a ChaCha20Poly1305 AEAD variant with an extended 192-bit (24-byte) nonce.
//!
//! The large nonce makes it safe to pick nonces at random for every message.
use chacha20poly1305::{AeadInPlace, Key, KeyInit, XChaCha20Poly1305, XNonce};
use thiserror::Error;

/// Algorithm tag written into every envelope.
pub const ALGORITHM: &str = "xchacha20poly1305-ietf";

pub const NONCE_SIZE: usize = 24;

pub const KEY_SIZE: usize = 32;

pub const TAG_SIZE: usize = 16;

pub type AeadNonce = [u8; NONCE_SIZE];

pub type AeadKey = [u8; KEY_SIZE];

pub fn aead_encrypt(
    key: &AeadKey,
    plaintext: &[u8],
    nonce: AeadNonce,
    aad: Option<&[u8]>,
) -> Result<Vec<u8>, AeadError> {
    let key = Key::from_slice(key);
    let nonce = XNonce::from_slice(&nonce);
    let mut ciphertext: Vec<u8> = Vec::from(plaintext);
    let cipher = XChaCha20Poly1305::new(key);
    cipher
        .encrypt_in_place(nonce, aad.unwrap_or_default(), &mut ciphertext)
        .map_err(AeadError::Encrypt)?;
    Ok(ciphertext)
}

pub fn aead_decrypt(
    key: &AeadKey,
    ciphertext_tag: &[u8],
    nonce: AeadNonce,
    aad: Option<&[u8]>,
) -> Result<Vec<u8>, AeadError> {
    if ciphertext_tag.len() < TAG_SIZE {
        return Err(AeadError::CiphertextTooShort(ciphertext_tag.len()));
    }

    let key = Key::from_slice(key);
    let nonce = XNonce::from_slice(&nonce);
    let mut plaintext: Vec<u8> = Vec::from(ciphertext_tag);
    let cipher = XChaCha20Poly1305::new(key);
    cipher
        .decrypt_in_place(nonce, aad.unwrap_or_default(), &mut plaintext)
        .map_err(AeadError::Decrypt)?;
    Ok(plaintext)
}

#[derive(Debug, Error)]
pub enum AeadError {
    #[error("could not encrypt with xchacha20poly1305 aead: {0}")]
    Encrypt(chacha20poly1305::Error),

    #[error("could not decrypt with xchacha20poly1305 aead: {0}")]
    Decrypt(chacha20poly1305::Error),

    #[error("ciphertext of {0} bytes is shorter than the authentication tag")]
    CiphertextTooShort(usize),
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! XChaCha20Poly1305 is a ChaCha20Poly1305 AEAD variant with an extended 192-bit (24-byte) nonce.
//!
//! Blobs and administrator chains are stored as `nonce || ciphertext || tag` so they can be
//! handed around as a single opaque byte string.
use chacha20poly1305::{AeadInPlace, Key, KeyInit, XChaCha20Poly1305, XNonce};
use thiserror::Error;

use crate::crypto::{Rng, RngError};

pub const XAEAD_NONCE_SIZE: usize = 24;

pub type XAeadNonce = [u8; XAEAD_NONCE_SIZE];

pub type XAeadKey = [u8; 32];

pub fn x_aead_encrypt(
    key: &XAeadKey,
    plaintext: &[u8],
    nonce: XAeadNonce,
    aad: Option<&[u8]>,
) -> Result<Vec<u8>, XAeadError> {
    let key = Key::from_slice(key);
    let nonce = XNonce::from_slice(&nonce);
    let mut ciphertext: Vec<u8> = Vec::from(plaintext);

    let cipher = XChaCha20Poly1305::new(key);
    cipher
        .encrypt_in_place(nonce, aad.unwrap_or_default(), &mut ciphertext)
        .map_err(XAeadError::Encrypt)?;

    Ok(ciphertext)
}

pub fn x_aead_decrypt(
    key: &XAeadKey,
    ciphertext_tag: &[u8],
    nonce: XAeadNonce,
    aad: Option<&[u8]>,
) -> Result<Vec<u8>, XAeadError> {
    let key = Key::from_slice(key);
    let nonce = XNonce::from_slice(&nonce);
    let mut plaintext: Vec<u8> = Vec::from(ciphertext_tag);

    let cipher = XChaCha20Poly1305::new(key);
    cipher
        .decrypt_in_place(nonce, aad.unwrap_or_default(), &mut plaintext)
        .map_err(XAeadError::Decrypt)?;

    Ok(plaintext)
}

/// Encrypts with a fresh random nonce which is prepended to the ciphertext.
pub fn seal(key: &XAeadKey, plaintext: &[u8], rng: &Rng) -> Result<Vec<u8>, XAeadError> {
    let nonce: XAeadNonce = rng.random_array()?;
    let ciphertext = x_aead_encrypt(key, plaintext, nonce, None)?;
    let mut sealed = Vec::with_capacity(XAEAD_NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypts bytes produced by `seal`.
pub fn open(key: &XAeadKey, sealed: &[u8]) -> Result<Vec<u8>, XAeadError> {
    if sealed.len() < XAEAD_NONCE_SIZE {
        return Err(XAeadError::TooShort(sealed.len()));
    }
    let (nonce, ciphertext) = sealed.split_at(XAEAD_NONCE_SIZE);
    let nonce: XAeadNonce = nonce
        .try_into()
        .map_err(|_| XAeadError::TooShort(sealed.len()))?;
    x_aead_decrypt(key, ciphertext, nonce, None)
}

#[derive(Debug, Error)]
pub enum XAeadError {
    #[error("could not encrypt with xchacha20poly1305 aead: {0}")]
    Encrypt(chacha20poly1305::Error),

    #[error("could not decrypt with xchacha20poly1305 aead: {0}")]
    Decrypt(chacha20poly1305::Error),

    #[error("sealed payload of {0} bytes is too short to contain a nonce")]
    TooShort(usize),

    #[error(transparent)]
    Rng(#[from] RngError),
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::crypto::Rng;

    use super::{XAeadError, XAeadKey, XAeadNonce, open, seal, x_aead_decrypt, x_aead_encrypt};

    #[test]
    fn encrypt_decrypt() {
        let rng = Rng::from_seed([1; 32]);

        let key: XAeadKey = rng.random_array().unwrap();
        let nonce: XAeadNonce = rng.random_array().unwrap();

        let ciphertext = x_aead_encrypt(&key, b"Hello, Panda!", nonce, None).unwrap();
        let plaintext = x_aead_decrypt(&key, &ciphertext, nonce, None).unwrap();

        assert_eq!(plaintext, b"Hello, Panda!");
    }

    #[test]
    fn sealed_with_wrong_key() {
        let rng = Rng::from_seed([1; 32]);

        let key: XAeadKey = rng.random_array().unwrap();
        let other_key: XAeadKey = rng.random_array().unwrap();

        let sealed = seal(&key, b"group blob", &rng).unwrap();
        assert_eq!(open(&key, &sealed).unwrap(), b"group blob");
        assert_matches!(open(&other_key, &sealed), Err(XAeadError::Decrypt(_)));
        assert_matches!(open(&key, &sealed[..10]), Err(XAeadError::TooShort(10)));
    }
}

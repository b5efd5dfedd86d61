//! AES-256-GCM authenticated encryption.
//!
//! Every call to [`encrypt`] draws a fresh 12-byte nonce from the OS RNG; the
//! nonce travels in the [`Envelope`] next to the ciphertext. The key is always
//! passed in by the caller, this module holds no state.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::envelope::Envelope;
use crate::error::CryptoError;
use crate::key::SharedKey;

/// Nonce size for AES-GCM.
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size.
pub const TAG_SIZE: usize = 16;

/// Wire name of the cipher, carried in `ENCRYPTED_MESSAGE`.
pub const ENCRYPTION_ALGORITHM: &str = "AES-256-GCM";

fn cipher_for(key: &SharedKey) -> Result<Aes256Gcm, CryptoError> {
    Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::InvalidKeyLength {
        expected: crate::key::KEY_SIZE,
        actual: key.as_bytes().len(),
    })
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
pub fn encrypt(key: &SharedKey, plaintext: &[u8]) -> Result<Envelope, CryptoError> {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher_for(key)?
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    Ok(Envelope { nonce, ciphertext })
}

/// Decrypt and authenticate `envelope`. Either the whole plaintext is
/// returned or [`CryptoError::Decryption`].
pub fn decrypt(key: &SharedKey, envelope: &Envelope) -> Result<Vec<u8>, CryptoError> {
    if envelope.ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::Decryption(format!(
            "ciphertext shorter than the {TAG_SIZE}-byte tag"
        )));
    }
    cipher_for(key)?
        .decrypt(Nonce::from_slice(&envelope.nonce), envelope.ciphertext.as_slice())
        .map_err(|_| CryptoError::Decryption("authentication tag mismatch".into()))
}

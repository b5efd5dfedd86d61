//! Symmetric session key.
//!
//! A [`SharedKey`] is the only thing the cipher adapter needs. Whether it came
//! out of ECDH or was handed over by the peer is recorded in [`KeyOrigin`] for
//! logging, but nothing downstream branches on it.

use std::fmt;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;

/// Number of SHA-256 bytes shown in a key fingerprint.
const FINGERPRINT_LEN: usize = 8;

/// How a [`SharedKey`] was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    /// Derived locally via P-256 ECDH.
    Derived,
    /// Imported from key bytes supplied by the peer.
    Imported,
}

impl fmt::Display for KeyOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Derived => f.write_str("ecdh"),
            Self::Imported => f.write_str("direct"),
        }
    }
}

/// A 256-bit AES-GCM key. Key bytes are zeroized on drop.
#[derive(Clone)]
pub struct SharedKey {
    bytes: Zeroizing<[u8; KEY_SIZE]>,
    origin: KeyOrigin,
}

impl SharedKey {
    pub(crate) fn new(bytes: Zeroizing<[u8; KEY_SIZE]>, origin: KeyOrigin) -> Self {
        Self { bytes, origin }
    }

    /// Build a key from a byte slice that must be exactly [`KEY_SIZE`] long.
    pub fn from_slice(bytes: &[u8], origin: KeyOrigin) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = Zeroizing::new([0u8; KEY_SIZE]);
        arr.copy_from_slice(bytes);
        Ok(Self::new(arr, origin))
    }

    pub const fn origin(&self) -> KeyOrigin {
        self.origin
    }

    /// Short hex fingerprint (truncated SHA-256) that is safe to log.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.bytes.as_ref());
        hex::encode(&digest[..FINGERPRINT_LEN])
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl PartialEq for SharedKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes[..].ct_eq(&other.bytes[..]).into()
    }
}

impl Eq for SharedKey {}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedKey")
            .field("origin", &self.origin)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

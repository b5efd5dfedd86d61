//! `SealDrop` E2E Encryption Library
//!
//! Cryptographic building blocks for a relay-mediated file channel where the
//! relay only ever sees ciphertext.
//!
//! ## Crypto primitives
//!
//! - **Key agreement**: ephemeral P-256 ECDH, or direct import of a
//!   peer-supplied AES key
//! - **Encryption**: AES-256-GCM, 12-byte random nonce per message
//! - **Envelopes**: one canonical `Envelope`, two accepted wire encodings
//!   (byte arrays, base64 text)

pub mod cipher;
pub mod envelope;
pub mod error;
pub mod exchange;
pub mod key;

pub use cipher::{ENCRYPTION_ALGORITHM, NONCE_SIZE, TAG_SIZE, decrypt, encrypt};
pub use envelope::{Envelope, EnvelopeEncoding, OpenedEnvelope, WireEnvelope};
pub use error::CryptoError;
#[cfg(any(test, feature = "test-utils"))]
pub use exchange::{random_direct_key, test_key_pair};
pub use exchange::{
    ALGORITHM_ECDH_P256, DirectKeyMaterial, KeyDerivation, KeyPair, derive_shared_key,
    generate_local_key_material, import_direct_key,
};
pub use key::{KEY_SIZE, KeyOrigin, SharedKey};

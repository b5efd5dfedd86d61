//! Crypto error types.

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Key agreement failed: {0}")]
    KeyAgreement(String),

    #[error("Unsupported key agreement algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonceLength { expected: usize, actual: usize },

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),
}

impl CryptoError {
    /// Whether this error belongs to the decryption family: an authentication
    /// failure or an envelope that could not be parsed into nonce + ciphertext.
    pub const fn is_decryption_error(&self) -> bool {
        matches!(
            self,
            Self::Decryption(_) | Self::MalformedEnvelope(_) | Self::InvalidNonceLength { .. }
        )
    }
}

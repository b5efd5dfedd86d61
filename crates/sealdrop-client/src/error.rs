//! Client error types.

use sealdrop_crypto::CryptoError;
use sealdrop_proto::ProtoError;

use crate::handshake::HandshakeState;

/// Failures of the relay connection itself. The session is unusable after
/// any of these; no reconnect is attempted.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect to relay {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out connecting to relay {addr} after {secs}s")]
    ConnectTimeout { addr: String, secs: u64 },

    #[error("Relay connection closed")]
    Closed,

    #[error("Relay frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("Relay I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to frame relay message: {0}")]
    Frame(#[from] ProtoError),
}

/// Errors raised while driving a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Malformed peer key or unsupported algorithm. The session stays in
    /// `KeyExchanging` until the fallback fires or a usable key arrives.
    #[error("Key agreement failed: {0}")]
    KeyAgreement(#[source] CryptoError),

    /// The offending message is dropped; the session continues.
    #[error("Decryption failed: {0}")]
    Decryption(#[source] CryptoError),

    /// Plaintext did not match the payload schema. Dropped.
    #[error("Payload rejected: {0}")]
    PayloadFormat(#[source] ProtoError),

    #[error("Session not ready (state: {0})")]
    NotReady(HandshakeState),

    #[error("Unexpected {msg_type} message in state {state}")]
    UnexpectedMessage {
        msg_type: String,
        state: HandshakeState,
    },

    #[error("Session closed")]
    Closed,
}

impl SessionError {
    /// Whether the session can keep running after this error.
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Transport(_) | Self::Closed)
    }
}

/// Why one file in a batch could not be sent.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Failed to read file: {0}")]
    Read(#[from] std::io::Error),

    #[error("File is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },

    #[error("Failed to encode payload: {0}")]
    Encode(#[from] ProtoError),

    #[error("Failed to encrypt payload: {0}")]
    Encrypt(#[from] CryptoError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// A file send failed. Files before it were delivered; files after it were
/// never attempted.
#[derive(Debug, thiserror::Error)]
#[error("Failed to send file #{index} ({filename}): {cause}")]
pub struct SendFailure {
    /// Position in the batch, starting at 0.
    pub index: usize,
    pub filename: String,
    #[source]
    pub cause: TransferError,
}

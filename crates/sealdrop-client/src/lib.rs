//! `SealDrop` Client
//!
//! End-to-end encrypted file drop between two peers that only share an
//! untrusted relay:
//! - `handshake`: the session state machine (create/join, key exchange,
//!   fallback, re-keying)
//! - `session`: async driver tying the state machine to a relay transport
//! - `transfer`: ordered, fail-fast file sending and the received ledger
//! - `relay`: the transport seam plus NDJSON-over-TCP and in-memory relays
//!
//! Keys exchanged here give confidentiality and integrity against the relay.
//! They do not authenticate the peer: anyone holding the invitation token,
//! or able to inject a direct key, is trusted.

pub mod error;
pub mod handshake;
pub mod relay;
pub mod session;
pub mod transfer;

pub use error::{SendFailure, SessionError, TransferError, TransportError};
pub use handshake::{EncryptionState, Handshake, HandshakeState, KeyInfo, KeySource, Role};
pub use relay::{MemoryRelay, MemoryTransport, NdjsonTransport, RelayTransport};
pub use session::{ClientSession, Invitation, SessionEvent, SessionSettings, frame_limit_for};
pub use transfer::{
    FileHandle, LedgerEntry, ReceivedFile, ReceivedLedger, TransferProgress, format_file_size,
};

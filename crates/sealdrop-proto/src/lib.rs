//! `SealDrop` Protocol
//!
//! Wire formats shared by every `SealDrop` peer:
//! - `messages`: the relay message sum type and its NDJSON line framing
//! - `payload`: the plaintext carried inside encrypted messages

pub mod error;
pub mod messages;
pub mod payload;

pub use error::{ProtoError, Result};
pub use messages::{
    CreateInvitation, EncryptedMessage, InvitationCreated, JoinByToken, JoinedSession,
    KeyExchange, KeyMaterial, MSG_CREATE_INVITATION, MSG_ENCRYPTED_MESSAGE,
    MSG_INVITATION_CREATED, MSG_JOIN_BY_TOKEN, MSG_JOINED_SESSION, MSG_KEY_EXCHANGE, PARTY_NAME,
    RelayMessage, parse_line, parse_value, to_line,
};
pub use payload::{FilePayload, PAYLOAD_FILE_DATA, Payload, decode_payload, encode_payload};

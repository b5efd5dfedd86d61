//! Relay messages.
//!
//! Every message is a JSON object with a `type` discriminator. Known types
//! decode into [`RelayMessage`] variants; anything else is kept as
//! [`RelayMessage::Unknown`] so the caller can log it (tolerant reader).

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use sealdrop_crypto::{ALGORITHM_ECDH_P256, CryptoError, ENCRYPTION_ALGORITHM, WireEnvelope};

use crate::error::{ProtoError, Result};

pub const MSG_CREATE_INVITATION: &str = "CREATE_INVITATION";
pub const MSG_INVITATION_CREATED: &str = "INVITATION_CREATED";
pub const MSG_JOIN_BY_TOKEN: &str = "JOIN_BY_TOKEN";
pub const MSG_JOINED_SESSION: &str = "JOINED_SESSION";
pub const MSG_KEY_EXCHANGE: &str = "KEY_EXCHANGE";
pub const MSG_ENCRYPTED_MESSAGE: &str = "ENCRYPTED_MESSAGE";

/// `party` value this implementation announces in `KEY_EXCHANGE`.
pub const PARTY_NAME: &str = "rust";

/// One message exchanged with the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayMessage {
    CreateInvitation(CreateInvitation),
    InvitationCreated(InvitationCreated),
    JoinByToken(JoinByToken),
    JoinedSession(JoinedSession),
    KeyExchange(KeyExchange),
    EncryptedMessage(EncryptedMessage),
    /// A message whose `type` this peer does not understand.
    #[serde(skip)]
    Unknown { msg_type: String, payload: Value },
}

impl RelayMessage {
    /// The wire `type` string.
    pub fn type_name(&self) -> &str {
        match self {
            Self::CreateInvitation(_) => MSG_CREATE_INVITATION,
            Self::InvitationCreated(_) => MSG_INVITATION_CREATED,
            Self::JoinByToken(_) => MSG_JOIN_BY_TOKEN,
            Self::JoinedSession(_) => MSG_JOINED_SESSION,
            Self::KeyExchange(_) => MSG_KEY_EXCHANGE,
            Self::EncryptedMessage(_) => MSG_ENCRYPTED_MESSAGE,
            Self::Unknown { msg_type, .. } => msg_type,
        }
    }
}

/// Ask the relay to open a session and issue a shareable token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInvitation {
    pub expires_in_minutes: u32,
    pub intent: String,
    pub capabilities: Vec<String>,
}

/// Relay acknowledgment of [`CreateInvitation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationCreated {
    #[serde(deserialize_with = "string_or_number")]
    pub session_id: String,
    pub token: String,
}

/// Join an existing session with a token shared out of band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinByToken {
    pub token: String,
    pub intent: String,
    pub capabilities: Vec<String>,
}

/// Relay acknowledgment of [`JoinByToken`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinedSession {
    #[serde(deserialize_with = "string_or_number")]
    pub session_id: String,
}

/// Key material from one peer: either an ECDH public key or a direct key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
    /// Base64 AES key from peers that skip ECDH.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party: Option<String>,
}

/// What a [`KeyExchange`] asks the receiver to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMaterial<'a> {
    /// Import this base64 key directly.
    Direct(&'a str),
    /// Run ECDH against this SEC1 public key.
    Ecdh(&'a [u8]),
}

impl KeyExchange {
    /// Our own ECDH announcement.
    pub fn ecdh(public_key: Vec<u8>) -> Self {
        Self {
            public_key: Some(public_key),
            algorithm: Some(ALGORITHM_ECDH_P256.to_string()),
            key: None,
            party: Some(PARTY_NAME.to_string()),
        }
    }

    /// A direct-key announcement.
    pub fn direct(key_base64: impl Into<String>) -> Self {
        Self {
            key: Some(key_base64.into()),
            ..Self::default()
        }
    }

    /// Classify the message. A direct `key` wins over `public_key`; a public
    /// key without `algorithm` is taken to be `ECDH-P256`.
    pub fn material(&self) -> std::result::Result<KeyMaterial<'_>, CryptoError> {
        if let Some(key) = self.key.as_deref() {
            return Ok(KeyMaterial::Direct(key));
        }
        let public_key = self.public_key.as_deref().ok_or_else(|| {
            CryptoError::KeyAgreement("KEY_EXCHANGE carries neither `key` nor `public_key`".into())
        })?;
        match self.algorithm.as_deref() {
            None => Ok(KeyMaterial::Ecdh(public_key)),
            Some(alg) if alg.eq_ignore_ascii_case(ALGORITHM_ECDH_P256) => {
                Ok(KeyMaterial::Ecdh(public_key))
            }
            Some(other) => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// Ciphertext wrapper. `encrypted_payload` stays raw JSON until decryption
/// time, where its encoding is detected per message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    pub encrypted_payload: Value,
    pub message_type: String,
    pub encryption_algorithm: String,
}

impl EncryptedMessage {
    pub fn new(envelope: &WireEnvelope, message_type: impl Into<String>) -> Self {
        Self {
            encrypted_payload: envelope.to_value(),
            message_type: message_type.into(),
            encryption_algorithm: ENCRYPTION_ALGORITHM.to_string(),
        }
    }

    /// Detect the envelope encoding of this message.
    pub fn envelope(&self) -> std::result::Result<WireEnvelope, CryptoError> {
        WireEnvelope::from_value(&self.encrypted_payload)
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

/// Parse a single NDJSON line from the relay.
pub fn parse_line(line: &str) -> Result<RelayMessage> {
    let raw: Value = serde_json::from_str(line)?;
    parse_value(raw)
}

/// Parse a JSON value into a relay message.
pub fn parse_value(raw: Value) -> Result<RelayMessage> {
    let msg_type = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtoError::MessageFormat("Missing 'type' field".into()))?
        .to_string();

    match msg_type.as_str() {
        MSG_CREATE_INVITATION | MSG_INVITATION_CREATED | MSG_JOIN_BY_TOKEN
        | MSG_JOINED_SESSION | MSG_KEY_EXCHANGE | MSG_ENCRYPTED_MESSAGE => {
            serde_json::from_value(raw).map_err(|e| {
                ProtoError::MessageFormat(format!("invalid {msg_type} message: {e}"))
            })
        }
        _ => Ok(RelayMessage::Unknown {
            msg_type,
            payload: raw,
        }),
    }
}

/// Serialize a message as one NDJSON line (without the trailing newline).
pub fn to_line(message: &RelayMessage) -> Result<String> {
    match message {
        RelayMessage::Unknown { payload, .. } => Ok(serde_json::to_string(payload)?),
        other => Ok(serde_json::to_string(other)?),
    }
}

//! Plaintext payload codec.
//!
//! Payloads are JSON objects tagged by `type`. `FILE_DATA` carries one whole
//! file with its bytes as an array of byte values. Any other tag is passed
//! through untouched so newer payload kinds do not break older peers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ProtoError, Result};

/// Payload tag for a whole-file transfer.
pub const PAYLOAD_FILE_DATA: &str = "FILE_DATA";

/// One file, carried whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePayload {
    pub filename: String,
    pub size: u64,
    pub data: Vec<u8>,
}

impl FilePayload {
    pub fn new(filename: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            size: data.len() as u64,
            data,
        }
    }

    fn check_size(&self) -> Result<()> {
        if self.data.len() as u64 == self.size {
            Ok(())
        } else {
            Err(ProtoError::PayloadFormat(format!(
                "`{}`: data length {} does not match size {}",
                self.filename,
                self.data.len(),
                self.size
            )))
        }
    }
}

/// Decoded plaintext of an encrypted message.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    File(FilePayload),
    /// A payload kind this peer does not interpret. `body` excludes `type`.
    Other {
        payload_type: String,
        body: Map<String, Value>,
    },
}

impl Payload {
    pub fn payload_type(&self) -> &str {
        match self {
            Self::File(_) => PAYLOAD_FILE_DATA,
            Self::Other { payload_type, .. } => payload_type,
        }
    }
}

#[derive(Serialize)]
struct FileDataRef<'a> {
    filename: &'a str,
    data: &'a [u8],
    size: u64,
    #[serde(rename = "type")]
    kind: &'static str,
}

/// Serialize a payload to plaintext bytes.
pub fn encode_payload(payload: &Payload) -> Result<Vec<u8>> {
    match payload {
        Payload::File(file) => {
            file.check_size()?;
            Ok(serde_json::to_vec(&FileDataRef {
                filename: &file.filename,
                data: &file.data,
                size: file.size,
                kind: PAYLOAD_FILE_DATA,
            })?)
        }
        Payload::Other { payload_type, body } => {
            let mut obj = body.clone();
            obj.insert("type".into(), Value::String(payload_type.clone()));
            Ok(serde_json::to_vec(&Value::Object(obj))?)
        }
    }
}

/// Parse plaintext bytes into a payload.
pub fn decode_payload(bytes: &[u8]) -> Result<Payload> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| ProtoError::PayloadFormat(format!("plaintext is not JSON: {e}")))?;
    let Value::Object(mut obj) = value else {
        return Err(ProtoError::PayloadFormat("payload is not an object".into()));
    };

    let payload_type = match obj.remove("type") {
        Some(Value::String(t)) => t,
        Some(_) => return Err(ProtoError::PayloadFormat("`type` is not a string".into())),
        None => return Err(ProtoError::PayloadFormat("missing `type`".into())),
    };

    if payload_type != PAYLOAD_FILE_DATA {
        return Ok(Payload::Other {
            payload_type,
            body: obj,
        });
    }

    for field in ["filename", "size", "data"] {
        if !obj.contains_key(field) {
            return Err(ProtoError::PayloadFormat(format!(
                "FILE_DATA missing `{field}`"
            )));
        }
    }
    let file: FilePayload = serde_json::from_value(Value::Object(obj))
        .map_err(|e| ProtoError::PayloadFormat(format!("invalid FILE_DATA: {e}")))?;
    file.check_size()?;
    Ok(Payload::File(file))
}

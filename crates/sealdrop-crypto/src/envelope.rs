//! Ciphertext envelopes and their two wire encodings.
//!
//! Peers serialize byte buffers differently. Browser peers send
//! `{iv: [u8...], data: [u8...]}`; others send
//! `{iv: "<base64>", ciphertext: "<base64>", key?: "<base64>"}`, optionally
//! bundling a replacement key. Both forms parse into the same [`Envelope`]
//! and the encoding is detected per message.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cipher::NONCE_SIZE;
use crate::error::CryptoError;
use crate::exchange::{DirectKeyMaterial, import_direct_key};
use crate::key::SharedKey;

/// Canonical in-memory envelope: nonce plus ciphertext (tag appended).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Build an envelope from a nonce slice of unchecked length.
    pub fn from_parts(nonce: &[u8], ciphertext: Vec<u8>) -> Result<Self, CryptoError> {
        let nonce: [u8; NONCE_SIZE] = nonce.try_into().map_err(|_| CryptoError::InvalidNonceLength {
            expected: NONCE_SIZE,
            actual: nonce.len(),
        })?;
        Ok(Self { nonce, ciphertext })
    }
}

/// Which encoding to use for outbound envelopes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeEncoding {
    /// Arrays of byte values (`iv` / `data`).
    #[default]
    Bytes,
    /// Base64 strings (`iv` / `ciphertext`).
    Base64,
}

impl std::str::FromStr for EnvelopeEncoding {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bytes" | "array" => Ok(Self::Bytes),
            "base64" => Ok(Self::Base64),
            other => Err(CryptoError::MalformedEnvelope(format!(
                "unknown envelope encoding: {other}"
            ))),
        }
    }
}

/// An envelope exactly as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum WireEnvelope {
    Bytes {
        iv: Vec<u8>,
        data: Vec<u8>,
    },
    Base64 {
        iv: String,
        ciphertext: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        key: Option<String>,
    },
}

/// A decoded envelope plus the replacement key it carried, if any.
#[derive(Debug)]
pub struct OpenedEnvelope {
    pub envelope: Envelope,
    /// Key bundled with the ciphertext. Must be installed before decrypting
    /// this same envelope.
    pub rekey: Option<SharedKey>,
}

impl WireEnvelope {
    /// Encode a canonical envelope in the requested wire form.
    pub fn encode(envelope: &Envelope, encoding: EnvelopeEncoding) -> Self {
        match encoding {
            EnvelopeEncoding::Bytes => Self::Bytes {
                iv: envelope.nonce.to_vec(),
                data: envelope.ciphertext.clone(),
            },
            EnvelopeEncoding::Base64 => Self::Base64 {
                iv: STANDARD.encode(envelope.nonce),
                ciphertext: STANDARD.encode(&envelope.ciphertext),
                key: None,
            },
        }
    }

    /// Detect the encoding of a raw JSON envelope.
    ///
    /// String `iv` and string `ciphertext` select the base64 form; anything
    /// else must be the byte-array form.
    pub fn from_value(value: &Value) -> Result<Self, CryptoError> {
        let obj = value
            .as_object()
            .ok_or_else(|| CryptoError::MalformedEnvelope("envelope is not an object".into()))?;

        if let (Some(Value::String(iv)), Some(Value::String(ciphertext))) =
            (obj.get("iv"), obj.get("ciphertext"))
        {
            let key = match obj.get("key") {
                None | Some(Value::Null) => None,
                Some(Value::String(k)) => Some(k.clone()),
                Some(_) => {
                    return Err(CryptoError::MalformedEnvelope(
                        "inline key is not a string".into(),
                    ));
                }
            };
            return Ok(Self::Base64 {
                iv: iv.clone(),
                ciphertext: ciphertext.clone(),
                key,
            });
        }

        let iv = byte_array(obj.get("iv"), "iv")?;
        let data = byte_array(obj.get("data"), "data")?;
        Ok(Self::Bytes { iv, data })
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Bytes { iv, data } => serde_json::json!({ "iv": iv, "data": data }),
            Self::Base64 {
                iv,
                ciphertext,
                key,
            } => {
                let mut v = serde_json::json!({ "iv": iv, "ciphertext": ciphertext });
                if let (Some(k), Some(map)) = (key, v.as_object_mut()) {
                    map.insert("key".into(), Value::String(k.clone()));
                }
                v
            }
        }
    }

    /// Decode into the canonical envelope, importing any bundled key.
    pub fn open(self) -> Result<OpenedEnvelope, CryptoError> {
        match self {
            Self::Bytes { iv, data } => Ok(OpenedEnvelope {
                envelope: Envelope::from_parts(&iv, data)?,
                rekey: None,
            }),
            Self::Base64 {
                iv,
                ciphertext,
                key,
            } => {
                let nonce = decode_b64(&iv, "iv")?;
                let ciphertext = decode_b64(&ciphertext, "ciphertext")?;
                let rekey = key
                    .as_deref()
                    .map(|k| {
                        import_direct_key(DirectKeyMaterial::Base64(k)).map_err(|e| {
                            CryptoError::MalformedEnvelope(format!("inline key rejected: {e}"))
                        })
                    })
                    .transpose()?;
                Ok(OpenedEnvelope {
                    envelope: Envelope::from_parts(&nonce, ciphertext)?,
                    rekey,
                })
            }
        }
    }
}

fn byte_array(value: Option<&Value>, field: &str) -> Result<Vec<u8>, CryptoError> {
    let value =
        value.ok_or_else(|| CryptoError::MalformedEnvelope(format!("missing field `{field}`")))?;
    Vec::<u8>::deserialize(value)
        .map_err(|e| CryptoError::MalformedEnvelope(format!("`{field}` is not a byte array: {e}")))
}

/// Surrounding whitespace is ignored, as for direct keys.
fn decode_b64(text: &str, field: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| CryptoError::MalformedEnvelope(format!("`{field}` is not base64: {e}")))
}

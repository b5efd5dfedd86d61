//! Key agreement.
//!
//! Two paths lead to a [`SharedKey`]:
//!
//! - P-256 ECDH: each side generates an ephemeral keypair, ships the raw
//!   (uncompressed SEC1) public point to the peer, and derives the AES key
//!   from the shared x-coordinate.
//! - Direct import: some peers skip ECDH and send a ready-made AES key
//!   (base64). That key is imported as-is.
//!
//! Neither path performs I/O.

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use hkdf::Hkdf;
use p256::PublicKey;
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::key::{KEY_SIZE, KeyOrigin, SharedKey};

/// Algorithm label carried in `KEY_EXCHANGE` messages.
pub const ALGORITHM_ECDH_P256: &str = "ECDH-P256";

/// Length of an uncompressed SEC1 P-256 point.
pub const P256_PUBLIC_KEY_LEN: usize = 65;

/// HKDF salt for domain separation (RFC 5869).
const HKDF_SALT: &[u8] = b"sealdrop-e2e-hkdf-salt-v1";

/// HKDF info string for the AES-256-GCM session key.
const HKDF_INFO: &[u8] = b"sealdrop-aes-256-gcm-v1";

/// Turns the raw ECDH shared secret into an AES-256 key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyDerivation {
    /// Use the 32-byte shared x-coordinate directly. Matches WebCrypto's
    /// `deriveKey` with an `AES-GCM` / 256 target, so browser peers agree.
    #[default]
    Raw,
    /// HKDF-SHA256 over the shared secret. Both peers must be configured alike.
    HkdfSha256,
}

impl FromStr for KeyDerivation {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(Self::Raw),
            "hkdf-sha256" | "hkdf_sha256" | "hkdf" => Ok(Self::HkdfSha256),
            other => Err(CryptoError::KeyDerivationFailed(format!(
                "unknown key derivation mode: {other}"
            ))),
        }
    }
}

/// Ephemeral P-256 keypair. The private half never leaves this struct.
pub struct KeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh ephemeral keypair from the OS RNG.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Uncompressed SEC1 encoding of the public key (65 bytes).
    pub fn public_bytes(&self) -> Vec<u8> {
        self.public.to_encoded_point(false).as_bytes().to_vec()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public_bytes()))
            .finish_non_exhaustive()
    }
}

/// Generate local key material: the keypair plus its exportable public bytes.
pub fn generate_local_key_material() -> (KeyPair, Vec<u8>) {
    let pair = KeyPair::generate();
    let public = pair.public_bytes();
    (pair, public)
}

/// Derive the shared AES key from our keypair and the peer's public point.
///
/// Fails with [`CryptoError::KeyAgreement`] if the peer bytes are not a valid
/// SEC1 encoding of a point on P-256.
pub fn derive_shared_key(
    local: &KeyPair,
    peer_public: &[u8],
    derivation: KeyDerivation,
) -> Result<SharedKey, CryptoError> {
    if peer_public.is_empty() {
        return Err(CryptoError::KeyAgreement("empty peer public key".into()));
    }
    let peer = PublicKey::from_sec1_bytes(peer_public).map_err(|_| {
        CryptoError::KeyAgreement(format!(
            "peer public key is not a valid P-256 point ({} bytes)",
            peer_public.len()
        ))
    })?;

    let shared = local.secret.diffie_hellman(&peer);
    let mut ikm = Zeroizing::new([0u8; KEY_SIZE]);
    ikm.copy_from_slice(shared.raw_secret_bytes().as_slice());

    let key = match derivation {
        KeyDerivation::Raw => ikm,
        KeyDerivation::HkdfSha256 => hkdf_derive(&ikm)?,
    };
    Ok(SharedKey::new(key, KeyOrigin::Derived))
}

fn hkdf_derive(ikm: &[u8; KEY_SIZE]) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), ikm);
    let mut okm = Zeroizing::new([0u8; KEY_SIZE]);
    hk.expand(HKDF_INFO, &mut okm[..])
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(okm)
}

/// Key bytes handed over by a peer that does not run ECDH.
#[derive(Debug, Clone, Copy)]
pub enum DirectKeyMaterial<'a> {
    /// Standard base64 text, as sent on the wire.
    Base64(&'a str),
    /// Already-decoded key bytes.
    Raw(&'a [u8]),
}

/// Import a peer-supplied AES-256 key, bypassing ECDH.
pub fn import_direct_key(material: DirectKeyMaterial<'_>) -> Result<SharedKey, CryptoError> {
    match material {
        DirectKeyMaterial::Raw(bytes) => SharedKey::from_slice(bytes, KeyOrigin::Imported),
        DirectKeyMaterial::Base64(text) => {
            let bytes = Zeroizing::new(
                STANDARD
                    .decode(text.trim())
                    .map_err(|e| CryptoError::KeyAgreement(format!("invalid base64 key: {e}")))?,
            );
            SharedKey::from_slice(&bytes, KeyOrigin::Imported)
        }
    }
}

/// Derive matching keys for two freshly generated keypairs.
#[cfg(any(test, feature = "test-utils"))]
pub fn test_key_pair() -> Result<(SharedKey, SharedKey), CryptoError> {
    let (a, a_pub) = generate_local_key_material();
    let (b, b_pub) = generate_local_key_material();
    Ok((
        derive_shared_key(&a, &b_pub, KeyDerivation::Raw)?,
        derive_shared_key(&b, &a_pub, KeyDerivation::Raw)?,
    ))
}

/// Random 32-byte key, base64 encoded, as a direct-key peer would send it.
#[cfg(any(test, feature = "test-utils"))]
pub fn random_direct_key() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

//! Handshake state machine.
//!
//! `Idle -> Connecting -> AwaitingSessionAck -> KeyExchanging -> Ready`, plus
//! `Closed` from anywhere. The machine does no I/O: it consumes relay
//! messages and fallback-timer expiries and returns [`Effect`]s for the
//! driver to carry out. It is the only owner of the key pair and the shared
//! key; the cipher and the transfer sequencer get the current key as a
//! parameter.

use std::fmt;

use tracing::{debug, info, warn};

use sealdrop_crypto::{
    CryptoError, DirectKeyMaterial, KeyDerivation, KeyOrigin, KeyPair, SharedKey, WireEnvelope,
    decrypt, derive_shared_key, generate_local_key_material, import_direct_key,
};
use sealdrop_proto::{
    CreateInvitation, EncryptedMessage, JoinByToken, KeyExchange, KeyMaterial, Payload,
    RelayMessage, decode_payload,
};

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    Connecting,
    AwaitingSessionAck,
    KeyExchanging,
    Ready,
    Closed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::AwaitingSessionAck => "awaiting_session_ack",
            Self::KeyExchanging => "key_exchanging",
            Self::Ready => "ready",
            Self::Closed => "closed",
        })
    }
}

/// Progress of key agreement, tracked separately from the session state:
/// a session can be `Ready` through the fallback while no key exists yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionState {
    NotStarted,
    KeyGenerated,
    AwaitingPeerKey,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Creator,
    Joiner,
}

/// What moved the session into `Ready` or replaced its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// A `KEY_EXCHANGE` from the peer.
    PeerKey,
    /// A replacement key bundled into an `ENCRYPTED_MESSAGE`.
    InlineKey,
    /// The fallback timer expired first.
    Fallback,
}

/// Loggable summary of a shared key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub origin: KeyOrigin,
    pub fingerprint: String,
}

impl From<&SharedKey> for KeyInfo {
    fn from(key: &SharedKey) -> Self {
        Self {
            origin: key.origin(),
            fingerprint: key.fingerprint(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeEvent {
    /// The relay acknowledged our create/join. `token` is set for creators.
    SessionEstablished {
        session_id: String,
        token: Option<String>,
    },
    /// Entered `Ready`. Emitted once per session.
    Ready {
        source: KeySource,
        key: Option<KeyInfo>,
    },
    /// A new key replaced (or, after a keyless fallback, first supplied)
    /// the session key while already `Ready`.
    KeyUpdated { source: KeySource, key: KeyInfo },
    /// A decrypted, decoded inbound payload.
    Payload(Payload),
}

/// Identifies one arming of the fallback timer. Expiries carrying an older
/// token are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackToken(u64);

/// Work the driver must perform on behalf of the machine.
#[derive(Debug)]
pub enum Effect {
    Send(RelayMessage),
    ArmFallback(FallbackToken),
    CancelFallback,
    Emit(HandshakeEvent),
}

#[derive(Debug, Default)]
struct Fallback {
    generation: u64,
    pending: bool,
    fired: bool,
}

impl Fallback {
    fn arm(&mut self) -> Option<FallbackToken> {
        if self.pending || self.fired {
            return None;
        }
        self.generation += 1;
        self.pending = true;
        Some(FallbackToken(self.generation))
    }

    fn cancel(&mut self) -> bool {
        std::mem::take(&mut self.pending)
    }

    fn fire(&mut self, token: FallbackToken) -> bool {
        if self.pending && token.0 == self.generation {
            self.pending = false;
            self.fired = true;
            true
        } else {
            false
        }
    }
}

/// Peer key material that arrived while we were still waiting for the
/// relay's acknowledgment.
enum EarlyKey {
    Direct(SharedKey),
    Ecdh(Vec<u8>),
}

pub struct Handshake {
    state: HandshakeState,
    encryption: EncryptionState,
    role: Option<Role>,
    session_id: Option<String>,
    token: Option<String>,
    key_pair: Option<KeyPair>,
    shared_key: Option<SharedKey>,
    early_key: Option<EarlyKey>,
    derivation: KeyDerivation,
    fallback: Fallback,
    ready_entries: u32,
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("state", &self.state)
            .field("encryption", &self.encryption)
            .field("role", &self.role)
            .field("session_id", &self.session_id)
            .field("shared_key", &self.shared_key)
            .finish_non_exhaustive()
    }
}

impl Handshake {
    pub fn new(derivation: KeyDerivation) -> Self {
        Self {
            state: HandshakeState::Idle,
            encryption: EncryptionState::NotStarted,
            role: None,
            session_id: None,
            token: None,
            key_pair: None,
            shared_key: None,
            early_key: None,
            derivation,
            fallback: Fallback::default(),
            ready_entries: 0,
        }
    }

    pub const fn state(&self) -> HandshakeState {
        self.state
    }

    pub const fn encryption_state(&self) -> EncryptionState {
        self.encryption
    }

    pub const fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Invitation token issued to a creator.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub const fn shared_key(&self) -> Option<&SharedKey> {
        self.shared_key.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.state == HandshakeState::Ready
    }

    /// How many times `Ready` has been entered. Never exceeds 1.
    pub const fn ready_entries(&self) -> u32 {
        self.ready_entries
    }

    pub const fn fallback_fired(&self) -> bool {
        self.fallback.fired
    }

    /// The transport is being opened.
    pub fn connecting(&mut self) {
        if self.state == HandshakeState::Idle {
            self.state = HandshakeState::Connecting;
        }
    }

    /// Start a new session as the inviting side.
    pub fn begin_create(&mut self, request: CreateInvitation) -> Result<RelayMessage, SessionError> {
        self.begin(Role::Creator, sealdrop_proto::MSG_CREATE_INVITATION)?;
        Ok(RelayMessage::CreateInvitation(request))
    }

    /// Join an existing session with a token obtained out of band.
    pub fn begin_join(&mut self, request: JoinByToken) -> Result<RelayMessage, SessionError> {
        self.begin(Role::Joiner, sealdrop_proto::MSG_JOIN_BY_TOKEN)?;
        Ok(RelayMessage::JoinByToken(request))
    }

    fn begin(&mut self, role: Role, msg_type: &str) -> Result<(), SessionError> {
        match self.state {
            HandshakeState::Idle | HandshakeState::Connecting => {
                self.state = HandshakeState::AwaitingSessionAck;
                self.role = Some(role);
                debug!(?role, "Session requested");
                Ok(())
            }
            HandshakeState::Closed => Err(SessionError::Closed),
            state => Err(SessionError::UnexpectedMessage {
                msg_type: msg_type.to_string(),
                state,
            }),
        }
    }

    /// Our public key went out; we now wait for the peer's.
    pub fn key_announced(&mut self) {
        if self.encryption == EncryptionState::KeyGenerated {
            self.encryption = EncryptionState::AwaitingPeerKey;
        }
    }

    /// Feed one inbound relay message.
    pub fn handle(&mut self, message: RelayMessage) -> Result<Vec<Effect>, SessionError> {
        if self.state == HandshakeState::Closed {
            return Err(SessionError::Closed);
        }
        match message {
            RelayMessage::InvitationCreated(ack) => self.on_session_ack(
                Role::Creator,
                sealdrop_proto::MSG_INVITATION_CREATED,
                ack.session_id,
                Some(ack.token),
            ),
            RelayMessage::JoinedSession(ack) => self.on_session_ack(
                Role::Joiner,
                sealdrop_proto::MSG_JOINED_SESSION,
                ack.session_id,
                None,
            ),
            RelayMessage::KeyExchange(kx) => self.on_key_exchange(&kx),
            RelayMessage::EncryptedMessage(msg) => self.on_encrypted(&msg),
            RelayMessage::CreateInvitation(_) => {
                Err(self.unexpected(sealdrop_proto::MSG_CREATE_INVITATION))
            }
            RelayMessage::JoinByToken(_) => Err(self.unexpected(sealdrop_proto::MSG_JOIN_BY_TOKEN)),
            RelayMessage::Unknown { msg_type, .. } => Err(self.unexpected(&msg_type)),
        }
    }

    /// The fallback timer armed with `token` expired.
    pub fn fallback_elapsed(&mut self, token: FallbackToken) -> Vec<Effect> {
        if self.state == HandshakeState::Closed || !self.fallback.fire(token) {
            debug!(?token, "Ignoring stale fallback expiry");
            return Vec::new();
        }
        let key = self.shared_key.as_ref().map(KeyInfo::from);
        if key.is_none() {
            warn!(
                session_id = self.session_id.as_deref().unwrap_or_default(),
                "No peer key before fallback; entering ready without a shared key"
            );
        }
        if self.enter_ready() {
            info!(
                session_id = self.session_id.as_deref().unwrap_or_default(),
                "Key exchange fallback fired"
            );
            vec![Effect::Emit(HandshakeEvent::Ready {
                source: KeySource::Fallback,
                key,
            })]
        } else {
            Vec::new()
        }
    }

    /// The key to encrypt outbound payloads with. Only available in `Ready`.
    pub fn outbound_key(&self) -> Result<&SharedKey, SessionError> {
        match self.state {
            HandshakeState::Ready => self.shared_key.as_ref().ok_or_else(|| {
                SessionError::KeyAgreement(CryptoError::KeyAgreement(
                    "no shared key established with the peer".into(),
                ))
            }),
            HandshakeState::Closed => Err(SessionError::Closed),
            state => Err(SessionError::NotReady(state)),
        }
    }

    /// Move to `Closed` and drop all key material.
    pub fn close(&mut self) -> Vec<Effect> {
        if self.state == HandshakeState::Closed {
            return Vec::new();
        }
        info!(
            session_id = self.session_id.as_deref().unwrap_or_default(),
            from = %self.state,
            "Session closed"
        );
        self.state = HandshakeState::Closed;
        self.key_pair = None;
        self.shared_key = None;
        self.early_key = None;
        if self.fallback.cancel() {
            vec![Effect::CancelFallback]
        } else {
            Vec::new()
        }
    }

    fn unexpected(&self, msg_type: &str) -> SessionError {
        SessionError::UnexpectedMessage {
            msg_type: msg_type.to_string(),
            state: self.state,
        }
    }

    fn on_session_ack(
        &mut self,
        role: Role,
        msg_type: &str,
        session_id: String,
        token: Option<String>,
    ) -> Result<Vec<Effect>, SessionError> {
        if self.state != HandshakeState::AwaitingSessionAck || self.role != Some(role) {
            return Err(self.unexpected(msg_type));
        }
        info!(session_id = %session_id, ?role, "Session established");
        self.session_id = Some(session_id.clone());
        self.token.clone_from(&token);

        let mut effects = vec![Effect::Emit(HandshakeEvent::SessionEstablished {
            session_id,
            token,
        })];
        effects.extend(self.enter_key_exchanging());
        if let Some(early) = self.early_key.take() {
            effects.extend(self.apply_early_key(early));
        }
        Ok(effects)
    }

    fn enter_key_exchanging(&mut self) -> Vec<Effect> {
        let (pair, public) = generate_local_key_material();
        debug!(?pair, "Generated ephemeral key pair");
        self.key_pair = Some(pair);
        self.encryption = EncryptionState::KeyGenerated;
        self.state = HandshakeState::KeyExchanging;

        let mut effects = vec![Effect::Send(RelayMessage::KeyExchange(KeyExchange::ecdh(
            public,
        )))];
        if let Some(token) = self.fallback.arm() {
            effects.push(Effect::ArmFallback(token));
        }
        effects
    }

    fn on_key_exchange(&mut self, kx: &KeyExchange) -> Result<Vec<Effect>, SessionError> {
        match self.state {
            HandshakeState::Idle | HandshakeState::Connecting => {
                return Err(self.unexpected(sealdrop_proto::MSG_KEY_EXCHANGE));
            }
            HandshakeState::AwaitingSessionAck => return self.hold_early_key(kx),
            _ => {}
        }

        let key = match kx.material().map_err(SessionError::KeyAgreement)? {
            KeyMaterial::Direct(encoded) => import_direct_key(DirectKeyMaterial::Base64(encoded)),
            KeyMaterial::Ecdh(peer_public) => match &self.key_pair {
                Some(pair) => derive_shared_key(pair, peer_public, self.derivation),
                None => Err(CryptoError::KeyAgreement("no local key pair".into())),
            },
        }
        .map_err(SessionError::KeyAgreement)?;

        Ok(self.accept_peer_key(key))
    }

    /// Validate and keep a key sent before our session was acknowledged. A
    /// direct key is imported now; an ECDH key waits for our key pair.
    fn hold_early_key(&mut self, kx: &KeyExchange) -> Result<Vec<Effect>, SessionError> {
        let early = match kx.material().map_err(SessionError::KeyAgreement)? {
            KeyMaterial::Direct(encoded) => EarlyKey::Direct(
                import_direct_key(DirectKeyMaterial::Base64(encoded))
                    .map_err(SessionError::KeyAgreement)?,
            ),
            KeyMaterial::Ecdh(peer_public) => EarlyKey::Ecdh(peer_public.to_vec()),
        };
        debug!(
            direct = matches!(early, EarlyKey::Direct(_)),
            "Peer key arrived before session ack; holding it"
        );
        self.early_key = Some(early);
        Ok(Vec::new())
    }

    fn apply_early_key(&mut self, early: EarlyKey) -> Vec<Effect> {
        let key = match early {
            EarlyKey::Direct(key) => Ok(key),
            EarlyKey::Ecdh(peer_public) => match &self.key_pair {
                Some(pair) => derive_shared_key(pair, &peer_public, self.derivation),
                None => Err(CryptoError::KeyAgreement("no local key pair".into())),
            },
        };
        match key {
            Ok(key) => self.accept_peer_key(key),
            Err(e) => {
                warn!(
                    session_id = self.session_id.as_deref().unwrap_or_default(),
                    error = %e,
                    "Discarding early peer key"
                );
                Vec::new()
            }
        }
    }

    fn accept_peer_key(&mut self, key: SharedKey) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.fallback.cancel() {
            effects.push(Effect::CancelFallback);
        }
        effects.extend(self.install_key(key, KeySource::PeerKey));
        effects
    }

    fn on_encrypted(&mut self, msg: &EncryptedMessage) -> Result<Vec<Effect>, SessionError> {
        if self.state != HandshakeState::Ready {
            return Err(SessionError::NotReady(self.state));
        }
        let opened = msg
            .envelope()
            .and_then(WireEnvelope::open)
            .map_err(SessionError::Decryption)?;

        let mut effects = Vec::new();
        if let Some(rekey) = opened.rekey {
            effects.extend(self.install_key(rekey, KeySource::InlineKey));
        }
        let key = self.shared_key.as_ref().ok_or_else(|| {
            SessionError::Decryption(CryptoError::Decryption(
                "no shared key established".into(),
            ))
        })?;
        let plaintext = decrypt(key, &opened.envelope).map_err(SessionError::Decryption)?;
        let payload = decode_payload(&plaintext).map_err(SessionError::PayloadFormat)?;
        debug!(
            message_type = %msg.message_type,
            payload_type = payload.payload_type(),
            bytes = plaintext.len(),
            "Decrypted message"
        );
        effects.push(Effect::Emit(HandshakeEvent::Payload(payload)));
        Ok(effects)
    }

    fn install_key(&mut self, key: SharedKey, source: KeySource) -> Vec<Effect> {
        let info = KeyInfo::from(&key);
        self.shared_key = Some(key);
        self.encryption = EncryptionState::Ready;

        if self.enter_ready() {
            info!(
                session_id = self.session_id.as_deref().unwrap_or_default(),
                origin = %info.origin,
                fingerprint = %info.fingerprint,
                ?source,
                "Encryption ready"
            );
            vec![Effect::Emit(HandshakeEvent::Ready {
                source,
                key: Some(info),
            })]
        } else {
            info!(
                session_id = self.session_id.as_deref().unwrap_or_default(),
                origin = %info.origin,
                fingerprint = %info.fingerprint,
                ?source,
                "Session key replaced"
            );
            vec![Effect::Emit(HandshakeEvent::KeyUpdated { source, key: info })]
        }
    }

    /// Idempotent: returns `true` only on the first entry.
    fn enter_ready(&mut self) -> bool {
        if self.state == HandshakeState::Ready {
            return false;
        }
        self.state = HandshakeState::Ready;
        self.ready_entries += 1;
        true
    }
}

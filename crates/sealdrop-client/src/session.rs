//! Session driver.
//!
//! [`ClientSession`] wraps one [`Handshake`] and one transport. Every input
//! (a relay message or the fallback timer) goes through `&mut self`, so the
//! handshake never sees two inputs at once; the timer and the relay receive
//! race inside a single `tokio::select!`.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tokio_stream::Stream;
use tracing::{debug, error, info, warn};

use sealdrop_core::Config;
use sealdrop_core::config::InvitationConfig;
use sealdrop_crypto::{EnvelopeEncoding, KeyDerivation};
use sealdrop_proto::{
    CreateInvitation, JoinByToken, MSG_ENCRYPTED_MESSAGE, MSG_KEY_EXCHANGE, Payload, ProtoError,
    RelayMessage,
};

use crate::error::{SendFailure, SessionError, TransportError};
use crate::handshake::{
    Effect, EncryptionState, FallbackToken, Handshake, HandshakeEvent, HandshakeState, KeyInfo,
    KeySource,
};
use crate::relay::{NdjsonTransport, RelayTransport};
use crate::transfer::{self, FileHandle, ReceivedFile, ReceivedLedger, TransferProgress};

/// Per-session knobs, usually taken from [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub fallback_timeout: Duration,
    pub key_derivation: KeyDerivation,
    pub outbound_encoding: EnvelopeEncoding,
    pub max_file_bytes: u64,
    pub invitation: InvitationConfig,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            fallback_timeout: config.handshake.fallback_timeout(),
            key_derivation: config.handshake.key_derivation,
            outbound_encoding: config.handshake.outbound_encoding,
            max_file_bytes: config.transfer.max_file_bytes,
            invitation: config.invitation.clone(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What the relay issued for a newly created session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    pub session_id: String,
    /// Share this with the peer out of band.
    pub token: String,
}

#[derive(Debug)]
pub enum SessionEvent {
    SessionEstablished {
        session_id: String,
        token: Option<String>,
    },
    /// The session entered `Ready`. `key` is `None` when the fallback fired
    /// before any key material arrived.
    EncryptionReady {
        source: KeySource,
        key: Option<KeyInfo>,
    },
    KeyUpdated {
        source: KeySource,
        key: KeyInfo,
    },
    FileReceived(ReceivedFile),
    /// A decrypted payload of a type other than `FILE_DATA`.
    PayloadReceived(Payload),
    /// An inbound message was dropped. The session continues.
    MessageRejected {
        msg_type: String,
        error: SessionError,
    },
    Closed,
}

enum Input {
    Relay(Result<Option<RelayMessage>, TransportError>),
    Fallback(FallbackToken),
}

pub struct ClientSession<T> {
    transport: T,
    handshake: Handshake,
    settings: SessionSettings,
    fallback_deadline: Option<(FallbackToken, Instant)>,
    ledger: ReceivedLedger,
    pending: VecDeque<SessionEvent>,
}

impl ClientSession<NdjsonTransport> {
    /// Connect to the NDJSON relay named in `config`.
    pub async fn connect(config: &Config) -> Result<Self, SessionError> {
        let mut handshake = Handshake::new(config.handshake.key_derivation);
        handshake.connecting();
        let transport = NdjsonTransport::connect(
            &config.relay.addr,
            config.relay.connect_timeout(),
            frame_limit_for(config.transfer.max_file_bytes),
        )
        .await?;
        Ok(Self::with_handshake(
            transport,
            handshake,
            SessionSettings::from_config(config),
        ))
    }
}

impl<T: RelayTransport> ClientSession<T> {
    /// Wrap an already-open transport.
    pub fn new(transport: T, settings: SessionSettings) -> Self {
        let mut handshake = Handshake::new(settings.key_derivation);
        handshake.connecting();
        Self::with_handshake(transport, handshake, settings)
    }

    fn with_handshake(transport: T, handshake: Handshake, settings: SessionSettings) -> Self {
        Self {
            transport,
            handshake,
            settings,
            fallback_deadline: None,
            ledger: ReceivedLedger::new(),
            pending: VecDeque::new(),
        }
    }

    pub const fn state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub const fn encryption_state(&self) -> EncryptionState {
        self.handshake.encryption_state()
    }

    pub const fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    pub fn session_id(&self) -> Option<&str> {
        self.handshake.session_id()
    }

    pub const fn ledger(&self) -> &ReceivedLedger {
        &self.ledger
    }

    pub const fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Open a new session and wait for the relay's invitation token.
    pub async fn create(&mut self) -> Result<Invitation, SessionError> {
        let inv = &self.settings.invitation;
        let request = self.handshake.begin_create(CreateInvitation {
            expires_in_minutes: inv.expires_in_minutes,
            intent: inv.create_intent.clone(),
            capabilities: inv.create_capabilities.clone(),
        })?;
        self.send_or_close(request).await?;

        let (session_id, token) = self.await_session_ack().await?;
        Ok(Invitation {
            session_id,
            token: token.unwrap_or_default(),
        })
    }

    /// Join the session behind `token`. Returns the session id.
    pub async fn join(&mut self, token: &str) -> Result<String, SessionError> {
        let inv = &self.settings.invitation;
        let request = self.handshake.begin_join(JoinByToken {
            token: token.to_string(),
            intent: inv.join_intent.clone(),
            capabilities: inv.join_capabilities.clone(),
        })?;
        self.send_or_close(request).await?;

        let (session_id, _) = self.await_session_ack().await?;
        Ok(session_id)
    }

    /// Peer traffic that races ahead of the ack is left queued, in order, for
    /// [`next_event`](Self::next_event). Any other message the relay sends
    /// instead of the ack is a refusal and closes the session.
    async fn await_session_ack(&mut self) -> Result<(String, Option<String>), SessionError> {
        let mut deferred = Vec::new();
        let outcome = loop {
            match self.next_event().await {
                Ok(SessionEvent::SessionEstablished { session_id, token }) => {
                    break Ok((session_id, token));
                }
                Ok(SessionEvent::MessageRejected { msg_type, error })
                    if !is_peer_traffic(&msg_type) =>
                {
                    warn!(msg_type = %msg_type, error = %error, "Session request refused");
                    self.mark_closed();
                    break Err(error);
                }
                Ok(SessionEvent::Closed) => break Err(SessionError::Closed),
                Ok(other) => {
                    debug!(?other, "Event before session ack");
                    deferred.push(other);
                }
                Err(e) => break Err(e),
            }
        };
        for event in deferred.into_iter().rev() {
            self.pending.push_front(event);
        }
        outcome
    }

    /// Drive the session until it is `Ready`: a peer key arrived or the
    /// fallback fired. Events seen on the way stay queued for
    /// [`next_event`](Self::next_event).
    pub async fn wait_ready(&mut self) -> Result<(), SessionError> {
        self.pump_until(Handshake::is_ready).await
    }

    /// Like [`wait_ready`](Self::wait_ready) but also requires a shared key,
    /// so a keyless fallback keeps waiting for a late `KEY_EXCHANGE`.
    pub async fn wait_for_key(&mut self) -> Result<(), SessionError> {
        self.pump_until(|hs| hs.is_ready() && hs.shared_key().is_some())
            .await
    }

    async fn pump_until(&mut self, done: impl Fn(&Handshake) -> bool) -> Result<(), SessionError> {
        loop {
            if done(&self.handshake) {
                return Ok(());
            }
            if self.handshake.state() == HandshakeState::Closed {
                return Err(SessionError::Closed);
            }
            self.pump().await?;
        }
    }

    /// Process inputs until something worth reporting happens.
    pub async fn next_event(&mut self) -> Result<SessionEvent, SessionError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            if self.handshake.state() == HandshakeState::Closed {
                return Ok(SessionEvent::Closed);
            }
            self.pump().await?;
        }
    }

    /// Take every event queued so far without touching the relay.
    pub fn drain_events(&mut self) -> impl Iterator<Item = SessionEvent> + '_ {
        self.pending.drain(..)
    }

    /// Send `files` in order. See [`transfer::send_all`].
    pub fn send_files(
        &mut self,
        files: Vec<FileHandle>,
    ) -> impl Stream<Item = Result<TransferProgress, SendFailure>> + '_ {
        transfer::send_all(
            &mut self.transport,
            &self.handshake,
            files,
            self.settings.outbound_encoding,
            self.settings.max_file_bytes,
        )
    }

    /// Close the session and the relay connection. Key material is dropped.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        self.mark_closed();
        self.transport.close().await?;
        Ok(())
    }

    /// Handle exactly one input: a relay message, relay EOF, or the timer.
    async fn pump(&mut self) -> Result<(), SessionError> {
        let input = match self.fallback_deadline {
            Some((token, deadline)) => tokio::select! {
                received = self.transport.recv() => Input::Relay(received),
                () = tokio::time::sleep_until(deadline) => Input::Fallback(token),
            },
            None => Input::Relay(self.transport.recv().await),
        };

        let effects = match input {
            Input::Fallback(token) => {
                self.fallback_deadline = None;
                self.handshake.fallback_elapsed(token)
            }
            Input::Relay(Ok(Some(message))) => {
                let msg_type = message.type_name().to_string();
                match self.handshake.handle(message) {
                    Ok(effects) => effects,
                    Err(error) if error.is_recoverable() => {
                        warn!(
                            session_id = self.handshake.session_id().unwrap_or_default(),
                            msg_type = %msg_type,
                            state = %self.handshake.state(),
                            error = %error,
                            "Dropped inbound message"
                        );
                        self.pending
                            .push_back(SessionEvent::MessageRejected { msg_type, error });
                        return Ok(());
                    }
                    Err(error) => {
                        self.mark_closed();
                        return Err(error);
                    }
                }
            }
            Input::Relay(Ok(None)) => {
                self.mark_closed();
                self.pending.push_back(SessionEvent::Closed);
                return Ok(());
            }
            Input::Relay(Err(e)) => {
                error!(error = %e, "Relay transport failed");
                self.mark_closed();
                return Err(e.into());
            }
        };

        if let Err(e) = self.apply(effects).await {
            self.mark_closed();
            return Err(e);
        }
        Ok(())
    }

    async fn apply(&mut self, effects: Vec<Effect>) -> Result<(), SessionError> {
        for effect in effects {
            match effect {
                Effect::Send(message) => {
                    let announces_key = matches!(message, RelayMessage::KeyExchange(_));
                    self.transport.send(message).await?;
                    if announces_key {
                        self.handshake.key_announced();
                    }
                }
                Effect::ArmFallback(token) => {
                    debug!(timeout = ?self.settings.fallback_timeout, "Fallback armed");
                    self.fallback_deadline =
                        Some((token, Instant::now() + self.settings.fallback_timeout));
                }
                Effect::CancelFallback => {
                    debug!("Fallback cancelled");
                    self.fallback_deadline = None;
                }
                Effect::Emit(event) => {
                    let event = self.surface(event);
                    self.pending.push_back(event);
                }
            }
        }
        Ok(())
    }

    fn surface(&mut self, event: HandshakeEvent) -> SessionEvent {
        match event {
            HandshakeEvent::SessionEstablished { session_id, token } => {
                SessionEvent::SessionEstablished { session_id, token }
            }
            HandshakeEvent::Ready { source, key } => SessionEvent::EncryptionReady { source, key },
            HandshakeEvent::KeyUpdated { source, key } => SessionEvent::KeyUpdated { source, key },
            HandshakeEvent::Payload(Payload::File(file))
                if file.size > self.settings.max_file_bytes =>
            {
                warn!(
                    session_id = self.handshake.session_id().unwrap_or_default(),
                    file = %file.filename,
                    size = file.size,
                    limit = self.settings.max_file_bytes,
                    "Dropped oversized file"
                );
                SessionEvent::MessageRejected {
                    msg_type: MSG_ENCRYPTED_MESSAGE.to_string(),
                    error: SessionError::PayloadFormat(ProtoError::PayloadFormat(format!(
                        "`{}` is {} bytes, limit is {}",
                        file.filename, file.size, self.settings.max_file_bytes
                    ))),
                }
            }
            HandshakeEvent::Payload(Payload::File(file)) => {
                let received = self.ledger.record(file);
                info!(
                    session_id = self.handshake.session_id().unwrap_or_default(),
                    file = %received.filename,
                    size = %transfer::format_file_size(received.size()),
                    "File received"
                );
                SessionEvent::FileReceived(received)
            }
            HandshakeEvent::Payload(other) => {
                info!(payload_type = other.payload_type(), "Payload received");
                SessionEvent::PayloadReceived(other)
            }
        }
    }

    async fn send_or_close(&mut self, message: RelayMessage) -> Result<(), SessionError> {
        if let Err(e) = self.transport.send(message).await {
            self.mark_closed();
            return Err(e.into());
        }
        Ok(())
    }

    fn mark_closed(&mut self) {
        self.handshake.close();
        self.fallback_deadline = None;
    }
}

/// Messages a peer sends through the relay, as opposed to the relay's replies.
fn is_peer_traffic(msg_type: &str) -> bool {
    msg_type == MSG_KEY_EXCHANGE || msg_type == MSG_ENCRYPTED_MESSAGE
}

/// Longest relay line accepted for a session whose files are capped at
/// `max_file_bytes`. Plaintext in the integer-array encoding costs up to four
/// bytes per file byte inside the payload and four more per payload byte in
/// the envelope, so the line is bounded at sixteen times the file plus
/// headroom for field names and the filename.
pub fn frame_limit_for(max_file_bytes: u64) -> usize {
    const HEADROOM: usize = 64 * 1024;
    usize::try_from(max_file_bytes)
        .unwrap_or(usize::MAX)
        .saturating_mul(16)
        .saturating_add(HEADROOM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_limit_covers_integer_array_expansion() {
        assert_eq!(frame_limit_for(1024), 16 * 1024 + 64 * 1024);
        assert_eq!(frame_limit_for(u64::MAX), usize::MAX);
    }

    #[test]
    fn only_peer_messages_count_as_peer_traffic() {
        assert!(is_peer_traffic(MSG_KEY_EXCHANGE));
        assert!(is_peer_traffic(MSG_ENCRYPTED_MESSAGE));
        assert!(!is_peer_traffic("ERROR"));
        assert!(!is_peer_traffic(sealdrop_proto::MSG_JOINED_SESSION));
    }
}

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Integration tests use unwrap for brevity

//! End-to-end session tests over the in-memory relay.
//!
//! Time is paused, so the 3 s key exchange fallback is deterministic: the
//! clock only moves when every participant is blocked.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tokio_stream::StreamExt;

use sealdrop_client::{
    ClientSession, EncryptionState, FileHandle, HandshakeState, KeySource, MemoryRelay,
    MemoryTransport, ReceivedFile, RelayTransport, SendFailure, SessionError, SessionEvent,
    SessionSettings, TransferError, TransferProgress, TransportError,
};
use sealdrop_crypto::{
    DirectKeyMaterial, EnvelopeEncoding, KeyDerivation, KeyOrigin, KeyPair, SharedKey,
    WireEnvelope, decrypt, derive_shared_key, encrypt, import_direct_key, random_direct_key,
};
use sealdrop_proto::{
    CreateInvitation, EncryptedMessage, FilePayload, JoinByToken, JoinedSession, KeyExchange,
    PAYLOAD_FILE_DATA, Payload, RelayMessage, decode_payload, encode_payload,
};

type Session = ClientSession<MemoryTransport>;
type SendResult = Result<TransferProgress, SendFailure>;

fn settings() -> SessionSettings {
    SessionSettings::default()
}

/// Creator and joiner sessions on one relay, both `Ready`.
async fn ready_pair(
    relay: &MemoryRelay,
    creator: SessionSettings,
    joiner: SessionSettings,
) -> (Session, Session) {
    let mut a = ClientSession::new(relay.connect(), creator);
    let mut b = ClientSession::new(relay.connect(), joiner);

    let invitation = a.create().await.unwrap();
    let (ra, rb) = tokio::join!(a.wait_ready(), async {
        b.join(&invitation.token).await?;
        b.wait_ready().await
    });
    ra.unwrap();
    rb.unwrap();
    (a, b)
}

async fn next_file(session: &mut Session) -> ReceivedFile {
    loop {
        match session.next_event().await.unwrap() {
            SessionEvent::FileReceived(file) => return file,
            SessionEvent::Closed => panic!("session closed before a file arrived"),
            _ => {}
        }
    }
}

async fn send(session: &mut Session, files: Vec<FileHandle>) -> Vec<SendResult> {
    session.send_files(files).collect().await
}

/// A relay client that speaks the protocol by hand.
struct RawPeer {
    transport: MemoryTransport,
}

impl RawPeer {
    fn new(relay: &MemoryRelay) -> Self {
        Self {
            transport: relay.connect(),
        }
    }

    async fn recv(&mut self) -> RelayMessage {
        self.transport.recv().await.unwrap().expect("relay closed")
    }

    async fn create(&mut self) -> String {
        self.transport
            .send(RelayMessage::CreateInvitation(CreateInvitation {
                expires_in_minutes: 30,
                intent: "send_files".into(),
                capabilities: vec![],
            }))
            .await
            .unwrap();
        match self.recv().await {
            RelayMessage::InvitationCreated(ack) => ack.token,
            other => panic!("expected INVITATION_CREATED, got {other:?}"),
        }
    }

    /// Join and return the creator's announced public key.
    async fn join(&mut self, token: &str) -> Vec<u8> {
        self.transport
            .send(RelayMessage::JoinByToken(JoinByToken {
                token: token.into(),
                intent: "receive_files".into(),
                capabilities: vec![],
            }))
            .await
            .unwrap();
        assert!(matches!(self.recv().await, RelayMessage::JoinedSession(_)));
        self.peer_public_key().await
    }

    async fn peer_public_key(&mut self) -> Vec<u8> {
        match self.recv().await {
            RelayMessage::KeyExchange(kx) => kx.public_key.expect("no public key"),
            other => panic!("expected KEY_EXCHANGE, got {other:?}"),
        }
    }

    async fn send(&mut self, message: RelayMessage) {
        self.transport.send(message).await.unwrap();
    }

    async fn send_file(
        &mut self,
        key: &SharedKey,
        name: &str,
        data: &[u8],
        inline_key: Option<String>,
    ) {
        let payload = Payload::File(FilePayload::new(name, data.to_vec()));
        let plaintext = encode_payload(&payload).unwrap();
        let envelope = encrypt(key, &plaintext).unwrap();
        let mut wire = WireEnvelope::encode(&envelope, EnvelopeEncoding::Base64);
        if let WireEnvelope::Base64 { key, .. } = &mut wire {
            *key = inline_key;
        }
        self.send(RelayMessage::EncryptedMessage(EncryptedMessage::new(
            &wire,
            PAYLOAD_FILE_DATA,
        )))
        .await;
    }

    async fn recv_file(&mut self, key: &SharedKey) -> FilePayload {
        let RelayMessage::EncryptedMessage(msg) = self.recv().await else {
            panic!("expected ENCRYPTED_MESSAGE");
        };
        let opened = msg.envelope().unwrap().open().unwrap();
        let plaintext = decrypt(key, &opened.envelope).unwrap();
        match decode_payload(&plaintext).unwrap() {
            Payload::File(file) => file,
            other => panic!("expected FILE_DATA, got {other:?}"),
        }
    }
}

/// Replays a fixed list of relay messages, then stays silent.
struct ScriptedRelay {
    script: VecDeque<RelayMessage>,
}

impl ScriptedRelay {
    fn new(script: impl IntoIterator<Item = RelayMessage>) -> Self {
        Self {
            script: script.into_iter().collect(),
        }
    }
}

impl RelayTransport for ScriptedRelay {
    async fn send(&mut self, _message: RelayMessage) -> Result<(), TransportError> {
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<RelayMessage>, TransportError> {
        match self.script.pop_front() {
            Some(message) => Ok(Some(message)),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

fn sealed_file(key: &SharedKey, name: &str, data: &[u8]) -> RelayMessage {
    let payload = Payload::File(FilePayload::new(name, data.to_vec()));
    let envelope = encrypt(key, &encode_payload(&payload).unwrap()).unwrap();
    let wire = WireEnvelope::encode(&envelope, EnvelopeEncoding::Base64);
    RelayMessage::EncryptedMessage(EncryptedMessage::new(&wire, PAYLOAD_FILE_DATA))
}

#[tokio::test(start_paused = true)]
async fn ecdh_peers_agree_on_one_key() {
    let relay = MemoryRelay::new();
    let (mut a, mut b) = ready_pair(&relay, settings(), settings()).await;

    let ka = a.handshake().shared_key().unwrap();
    assert_eq!(Some(ka), b.handshake().shared_key());
    assert_eq!(ka.origin(), KeyOrigin::Derived);
    let fingerprint = ka.fingerprint();

    for session in [&a, &b] {
        assert_eq!(session.state(), HandshakeState::Ready);
        assert_eq!(session.encryption_state(), EncryptionState::Ready);
        assert_eq!(session.handshake().ready_entries(), 1);
        assert!(!session.handshake().fallback_fired());
    }

    let SessionEvent::EncryptionReady { source, key } = a.next_event().await.unwrap() else {
        panic!("creator did not report readiness");
    };
    assert_eq!(source, KeySource::PeerKey);
    assert_eq!(key.unwrap().fingerprint, fingerprint);

    let sent = send(&mut a, vec![FileHandle::memory("a.txt", b"hello".to_vec())]).await;
    assert_eq!(sent.len(), 1);
    assert!(sent[0].as_ref().unwrap().is_last());

    let file = next_file(&mut b).await;
    assert_eq!(file.filename, "a.txt");
    assert_eq!(file.data, b"hello");
    assert_eq!(b.ledger().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn fallback_never_fires_once_ready() {
    let relay = MemoryRelay::new();
    let (mut a, _b) = ready_pair(&relay, settings(), settings()).await;
    assert!(matches!(
        a.next_event().await.unwrap(),
        SessionEvent::EncryptionReady { .. }
    ));

    let idle = tokio::time::timeout(Duration::from_secs(10), a.next_event()).await;
    assert!(idle.is_err());
    assert_eq!(a.handshake().ready_entries(), 1);
    assert!(!a.handshake().fallback_fired());
}

#[tokio::test(start_paused = true)]
async fn hkdf_on_both_sides_interoperates() {
    let relay = MemoryRelay::new();
    let hkdf = SessionSettings {
        key_derivation: KeyDerivation::HkdfSha256,
        ..settings()
    };
    let (mut a, mut b) = ready_pair(&relay, hkdf.clone(), hkdf).await;
    assert_eq!(a.handshake().shared_key(), b.handshake().shared_key());

    send(&mut a, vec![FileHandle::memory("k.bin", vec![1, 2, 3])]).await;
    assert_eq!(next_file(&mut b).await.data, vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn mismatched_derivation_is_rejected_per_message() {
    let relay = MemoryRelay::new();
    let hkdf = SessionSettings {
        key_derivation: KeyDerivation::HkdfSha256,
        ..settings()
    };
    let (mut a, mut b) = ready_pair(&relay, settings(), hkdf).await;
    assert_ne!(a.handshake().shared_key(), b.handshake().shared_key());

    send(&mut a, vec![FileHandle::memory("x", b"x".to_vec())]).await;
    loop {
        match b.next_event().await.unwrap() {
            SessionEvent::MessageRejected { error, .. } => {
                assert!(matches!(error, SessionError::Decryption(_)));
                break;
            }
            SessionEvent::FileReceived(_) => panic!("decrypted under the wrong key"),
            _ => {}
        }
    }
    assert_eq!(b.state(), HandshakeState::Ready);
    assert!(b.ledger().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cross_encodings_decode_both_ways() {
    let relay = MemoryRelay::new();
    let base64 = SessionSettings {
        outbound_encoding: EnvelopeEncoding::Base64,
        ..settings()
    };
    let (mut a, mut b) = ready_pair(&relay, base64, settings()).await;

    send(&mut a, vec![FileHandle::memory("to-b", b"from a".to_vec())]).await;
    send(&mut b, vec![FileHandle::memory("to-a", b"from b".to_vec())]).await;

    assert_eq!(next_file(&mut b).await.data, b"from a");
    assert_eq!(next_file(&mut a).await.data, b"from b");
}

#[tokio::test(start_paused = true)]
async fn batch_stops_at_first_failure() {
    let relay = MemoryRelay::new();
    let (mut a, mut b) = ready_pair(&relay, settings(), settings()).await;
    let dir = tempfile::tempdir().unwrap();

    let results = send(
        &mut a,
        vec![
            FileHandle::memory("one.txt", b"1".to_vec()),
            FileHandle::Path(dir.path().join("missing.txt")),
            FileHandle::memory("three.txt", b"3".to_vec()),
        ],
    )
    .await;

    assert_eq!(results.len(), 2);
    let first = results[0].as_ref().unwrap();
    assert_eq!((first.index, first.completed, first.total), (0, 1, 3));
    let failure = results[1].as_ref().unwrap_err();
    assert_eq!(failure.index, 1);
    assert_eq!(failure.filename, "missing.txt");
    assert!(matches!(failure.cause, TransferError::Read(_)));

    assert_eq!(next_file(&mut b).await.filename, "one.txt");
    a.close().await.unwrap();
    loop {
        match b.next_event().await.unwrap() {
            SessionEvent::FileReceived(file) => panic!("{} sent after a failure", file.filename),
            SessionEvent::Closed => break,
            _ => {}
        }
    }
    assert_eq!(b.ledger().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn send_before_ready_is_refused() {
    let relay = MemoryRelay::new();
    let mut a = ClientSession::new(relay.connect(), settings());
    a.create().await.unwrap();
    assert_eq!(a.state(), HandshakeState::KeyExchanging);

    let results = send(&mut a, vec![FileHandle::memory("early", b"e".to_vec())]).await;
    assert_eq!(results.len(), 1);
    let failure = results[0].as_ref().unwrap_err();
    assert!(matches!(
        failure.cause,
        TransferError::Session(SessionError::NotReady(HandshakeState::KeyExchanging))
    ));
}

#[tokio::test(start_paused = true)]
async fn unknown_token_fails_join() {
    let relay = MemoryRelay::new();
    let mut b = ClientSession::new(relay.connect(), settings());
    let err = b.join("does-not-exist").await.unwrap_err();
    assert!(
        matches!(&err, SessionError::UnexpectedMessage { msg_type, .. } if msg_type == "ERROR"),
        "{err:?}"
    );
    assert!(b.session_id().is_none());
    assert_eq!(b.state(), HandshakeState::Closed);
}

#[tokio::test(start_paused = true)]
async fn peer_traffic_ahead_of_join_ack_is_kept() {
    let direct = random_direct_key();
    let key = import_direct_key(DirectKeyMaterial::Base64(&direct)).unwrap();
    let relay = ScriptedRelay::new([
        sealed_file(&key, "too-early.txt", b"x"),
        RelayMessage::KeyExchange(KeyExchange::direct(direct.clone())),
        RelayMessage::JoinedSession(JoinedSession {
            session_id: "s-9".into(),
        }),
    ]);
    let mut b = ClientSession::new(relay, settings());

    assert_eq!(b.join("tok").await.unwrap(), "s-9");
    assert_eq!(b.state(), HandshakeState::Ready);
    b.wait_for_key().await.unwrap();
    assert_eq!(b.handshake().shared_key(), Some(&key));
    assert_eq!(b.handshake().ready_entries(), 1);

    match b.next_event().await.unwrap() {
        SessionEvent::MessageRejected { msg_type, error } => {
            assert_eq!(msg_type, "ENCRYPTED_MESSAGE");
            assert!(matches!(error, SessionError::NotReady(_)));
        }
        other => panic!("expected the early message to be rejected, got {other:?}"),
    }
    let SessionEvent::EncryptionReady { source, key: info } = b.next_event().await.unwrap() else {
        panic!("joiner did not report readiness");
    };
    assert_eq!(source, KeySource::PeerKey);
    assert_eq!(info.unwrap().fingerprint, key.fingerprint());

    // The fallback was withdrawn along with the early key.
    let idle = tokio::time::timeout(Duration::from_secs(10), b.next_event()).await;
    assert!(idle.is_err());
    assert!(!b.handshake().fallback_fired());
}

#[tokio::test(start_paused = true)]
async fn oversized_inbound_file_is_dropped() {
    let relay = MemoryRelay::new();
    let small = SessionSettings {
        max_file_bytes: 4,
        ..settings()
    };
    let (mut a, mut b) = ready_pair(&relay, settings(), small).await;

    let sent = send(
        &mut a,
        vec![
            FileHandle::memory("big.bin", vec![7; 10]),
            FileHandle::memory("ok.txt", b"ok".to_vec()),
        ],
    )
    .await;
    assert!(sent.iter().all(Result::is_ok));

    loop {
        match b.next_event().await.unwrap() {
            SessionEvent::MessageRejected { msg_type, error } => {
                assert_eq!(msg_type, "ENCRYPTED_MESSAGE");
                assert!(matches!(error, SessionError::PayloadFormat(_)), "{error:?}");
                break;
            }
            SessionEvent::FileReceived(file) => panic!("{} should have been dropped", file.filename),
            _ => {}
        }
    }
    assert_eq!(next_file(&mut b).await.filename, "ok.txt");
    assert_eq!(b.ledger().len(), 1);
    assert_eq!(b.ledger().total_bytes(), 2);
}

#[tokio::test(start_paused = true)]
async fn queued_events_drain_without_touching_the_relay() {
    let relay = MemoryRelay::new();
    let (mut a, _b) = ready_pair(&relay, settings(), settings()).await;

    let drained: Vec<_> = a.drain_events().collect();
    assert!(
        drained
            .iter()
            .any(|e| matches!(e, SessionEvent::EncryptionReady { source: KeySource::PeerKey, .. })),
        "{drained:?}"
    );
    assert_eq!(a.drain_events().count(), 0);
}

#[tokio::test(start_paused = true)]
async fn fallback_fires_once_at_three_seconds_then_late_key_rekeys() {
    let relay = MemoryRelay::new();
    let mut a = ClientSession::new(relay.connect(), settings());
    let invitation = a.create().await.unwrap();
    let started = Instant::now();

    let mut peer = RawPeer::new(&relay);
    let creator_public = peer.join(&invitation.token).await;

    let early = tokio::time::timeout(Duration::from_millis(2999), a.wait_ready()).await;
    assert!(early.is_err());
    assert_eq!(a.state(), HandshakeState::KeyExchanging);
    assert!(!a.handshake().fallback_fired());

    a.wait_ready().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(3000));
    assert_eq!(a.state(), HandshakeState::Ready);
    assert_eq!(a.encryption_state(), EncryptionState::AwaitingPeerKey);
    assert!(a.handshake().fallback_fired());
    let SessionEvent::EncryptionReady { source, key } = a.next_event().await.unwrap() else {
        panic!("no readiness event");
    };
    assert_eq!(source, KeySource::Fallback);
    assert!(key.is_none());

    let keyless = send(&mut a, vec![FileHandle::memory("nope", b"n".to_vec())]).await;
    assert!(matches!(
        keyless[0].as_ref().unwrap_err().cause,
        TransferError::Session(SessionError::KeyAgreement(_))
    ));

    let pair = KeyPair::generate();
    peer.send(RelayMessage::KeyExchange(KeyExchange::ecdh(pair.public_bytes())))
        .await;
    let SessionEvent::KeyUpdated { source, key } = a.next_event().await.unwrap() else {
        panic!("late key not reported");
    };
    assert_eq!(source, KeySource::PeerKey);
    assert_eq!(a.handshake().ready_entries(), 1);

    let peer_key = derive_shared_key(&pair, &creator_public, KeyDerivation::Raw).unwrap();
    assert_eq!(key.fingerprint, peer_key.fingerprint());

    send(&mut a, vec![FileHandle::memory("late.txt", b"late".to_vec())]).await;
    let file = peer.recv_file(&peer_key).await;
    assert_eq!(file.filename, "late.txt");
    assert_eq!(file.data, b"late");
}

#[tokio::test(start_paused = true)]
async fn direct_key_peer_and_per_message_rejection() {
    let relay = MemoryRelay::new();
    let mut peer = RawPeer::new(&relay);
    let token = peer.create().await;

    let mut b = ClientSession::new(relay.connect(), settings());
    b.join(&token).await.unwrap();
    let joiner_public = peer.peer_public_key().await;
    assert_eq!(joiner_public.len(), 65);

    let direct = random_direct_key();
    let key = import_direct_key(DirectKeyMaterial::Base64(&direct)).unwrap();
    peer.send(RelayMessage::KeyExchange(KeyExchange::direct(direct.clone())))
        .await;
    b.wait_ready().await.unwrap();
    assert_eq!(b.handshake().shared_key(), Some(&key));
    assert_eq!(b.handshake().shared_key().unwrap().origin(), KeyOrigin::Imported);

    peer.send_file(&key, "first.txt", b"1", None).await;
    let wrong = import_direct_key(DirectKeyMaterial::Base64(&random_direct_key())).unwrap();
    peer.send_file(&wrong, "forged.txt", b"?", None).await;
    peer.send_file(&key, "second.txt", b"2", None).await;

    assert_eq!(next_file(&mut b).await.filename, "first.txt");
    match b.next_event().await.unwrap() {
        SessionEvent::MessageRejected { msg_type, error } => {
            assert_eq!(msg_type, "ENCRYPTED_MESSAGE");
            assert!(matches!(error, SessionError::Decryption(_)));
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(next_file(&mut b).await.filename, "second.txt");
    assert_eq!(b.ledger().len(), 2);
    assert_eq!(b.ledger().total_bytes(), 2);

    // Outbound traffic now uses the direct key.
    send(&mut b, vec![FileHandle::memory("reply", b"ok".to_vec())]).await;
    assert_eq!(peer.recv_file(&key).await.data, b"ok");
}

#[tokio::test(start_paused = true)]
async fn inline_key_replaces_session_key() {
    let relay = MemoryRelay::new();
    let mut peer = RawPeer::new(&relay);
    let token = peer.create().await;

    let mut b = ClientSession::new(relay.connect(), settings());
    b.join(&token).await.unwrap();
    peer.peer_public_key().await;
    let first = random_direct_key();
    peer.send(RelayMessage::KeyExchange(KeyExchange::direct(first)))
        .await;
    b.wait_ready().await.unwrap();

    let rotated = random_direct_key();
    let rotated_key = import_direct_key(DirectKeyMaterial::Base64(&rotated)).unwrap();
    peer.send_file(&rotated_key, "rotated.txt", b"r", Some(rotated))
        .await;

    assert!(matches!(
        b.next_event().await.unwrap(),
        SessionEvent::EncryptionReady { .. }
    ));
    let SessionEvent::KeyUpdated { source, .. } = b.next_event().await.unwrap() else {
        panic!("inline key not installed");
    };
    assert_eq!(source, KeySource::InlineKey);
    assert_eq!(next_file(&mut b).await.filename, "rotated.txt");
    assert_eq!(b.handshake().shared_key(), Some(&rotated_key));
}

#[tokio::test(start_paused = true)]
async fn peer_departure_closes_session_and_drops_key() {
    let relay = MemoryRelay::new();
    let (mut a, mut b) = ready_pair(&relay, settings(), settings()).await;

    a.close().await.unwrap();
    assert_eq!(a.state(), HandshakeState::Closed);
    assert!(a.handshake().shared_key().is_none());

    loop {
        if matches!(b.next_event().await.unwrap(), SessionEvent::Closed) {
            break;
        }
    }
    assert_eq!(b.state(), HandshakeState::Closed);
    assert!(b.handshake().shared_key().is_none());
    assert!(matches!(b.wait_ready().await, Err(SessionError::Closed)));

    let results = send(&mut b, vec![FileHandle::memory("gone", b"g".to_vec())]).await;
    assert!(matches!(
        results[0].as_ref().unwrap_err().cause,
        TransferError::Session(SessionError::Closed)
    ));
    assert_eq!(relay.session_count(), 0);
}

//! In-process relay.
//!
//! Pairs a creator and a joiner by invitation token, acknowledges
//! `CREATE_INVITATION` / `JOIN_BY_TOKEN`, and forwards `KEY_EXCHANGE` and
//! `ENCRYPTED_MESSAGE` to the other participant. Messages sent before the
//! peer joined are buffered and drained to the joiner on arrival.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use sealdrop_proto::{InvitationCreated, JoinedSession, RelayMessage};

use super::RelayTransport;
use crate::error::TransportError;

/// `type` of the error notice sent back for a bad join.
pub const MSG_RELAY_ERROR: &str = "ERROR";

type ConnId = u64;

struct Connection {
    tx: mpsc::UnboundedSender<RelayMessage>,
    token: Option<String>,
}

struct Session {
    session_id: String,
    creator: ConnId,
    joiner: Option<ConnId>,
    /// Creator traffic sent before anyone joined.
    backlog: VecDeque<RelayMessage>,
}

#[derive(Default)]
struct RelayState {
    next_id: u64,
    connections: HashMap<ConnId, Connection>,
    sessions: HashMap<String, Session>,
}

/// Shared handle to one in-process relay. Clones refer to the same relay.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new client connection.
    pub fn connect(&self) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.connections.insert(id, Connection { tx, token: None });
        debug!(conn = id, "Memory relay connection opened");
        MemoryTransport {
            id,
            relay: self.clone(),
            rx,
            closed: false,
        }
    }

    /// Number of sessions the relay currently knows about.
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn route(&self, from: ConnId, message: RelayMessage) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.connections.contains_key(&from) {
            return Err(TransportError::Closed);
        }
        match message {
            RelayMessage::CreateInvitation(req) => {
                state.next_id += 1;
                let n = state.next_id;
                let token = format!("tok-{n:06}");
                let session_id = format!("mem-{n}");
                state.sessions.insert(
                    token.clone(),
                    Session {
                        session_id: session_id.clone(),
                        creator: from,
                        joiner: None,
                        backlog: VecDeque::new(),
                    },
                );
                if let Some(conn) = state.connections.get_mut(&from) {
                    conn.token = Some(token.clone());
                }
                info!(
                    session_id = %session_id,
                    intent = %req.intent,
                    expires_in_minutes = req.expires_in_minutes,
                    "Invitation created"
                );
                deliver(
                    &state,
                    from,
                    RelayMessage::InvitationCreated(InvitationCreated { session_id, token }),
                );
            }
            RelayMessage::JoinByToken(req) => {
                let Some(session) = state.sessions.get_mut(&req.token) else {
                    warn!(conn = from, "Join with unknown token");
                    deliver(&state, from, relay_error("invalid or expired token"));
                    return Ok(());
                };
                if session.joiner.is_some() {
                    warn!(session_id = %session.session_id, "Session already has a joiner");
                    deliver(&state, from, relay_error("session is full"));
                    return Ok(());
                }
                session.joiner = Some(from);
                let session_id = session.session_id.clone();
                let backlog: Vec<RelayMessage> = session.backlog.drain(..).collect();
                if let Some(conn) = state.connections.get_mut(&from) {
                    conn.token = Some(req.token);
                }
                info!(session_id = %session_id, buffered = backlog.len(), "Peer joined");
                deliver(
                    &state,
                    from,
                    RelayMessage::JoinedSession(JoinedSession { session_id }),
                );
                for message in backlog {
                    deliver(&state, from, message);
                }
            }
            message @ (RelayMessage::KeyExchange(_) | RelayMessage::EncryptedMessage(_)) => {
                forward(&mut state, from, message);
            }
            RelayMessage::InvitationCreated(_)
            | RelayMessage::JoinedSession(_)
            | RelayMessage::Unknown { .. } => {
                warn!(
                    conn = from,
                    msg_type = message.type_name(),
                    "Relay ignoring message a client may not send"
                );
            }
        }
        Ok(())
    }

    fn disconnect(&self, id: ConnId) {
        let mut state = self.lock();
        let Some(conn) = state.connections.remove(&id) else {
            return;
        };
        let Some(token) = conn.token else {
            return;
        };
        // Removing the peer's connection drops the only sender feeding its
        // queue; the peer sees end of stream once the queue drains.
        if let Some(session) = state.sessions.remove(&token) {
            let peer = if session.creator == id {
                session.joiner
            } else {
                Some(session.creator)
            };
            if let Some(peer) = peer.and_then(|p| state.connections.remove(&p)) {
                debug!(session_id = %session.session_id, "Closing peer of departed client");
                drop(peer);
            }
            info!(session_id = %session.session_id, "Session ended");
        }
    }
}

fn relay_error(message: &str) -> RelayMessage {
    RelayMessage::Unknown {
        msg_type: MSG_RELAY_ERROR.to_string(),
        payload: json!({ "type": MSG_RELAY_ERROR, "message": message }),
    }
}

fn deliver(state: &RelayState, to: ConnId, message: RelayMessage) {
    if let Some(conn) = state.connections.get(&to) {
        if conn.tx.send(message).is_err() {
            debug!(conn = to, "Receiver dropped; message discarded");
        }
    }
}

fn forward(state: &mut RelayState, from: ConnId, message: RelayMessage) {
    let Some(token) = state.connections.get(&from).and_then(|c| c.token.clone()) else {
        warn!(conn = from, msg_type = message.type_name(), "No session; dropping");
        return;
    };
    let Some(session) = state.sessions.get_mut(&token) else {
        warn!(conn = from, msg_type = message.type_name(), "Session gone; dropping");
        return;
    };
    let peer = if session.creator == from {
        session.joiner
    } else {
        Some(session.creator)
    };
    match peer {
        Some(peer) => deliver(state, peer, message),
        None => {
            debug!(
                session_id = %session.session_id,
                msg_type = message.type_name(),
                "Peer not joined; buffering"
            );
            session.backlog.push_back(message);
        }
    }
}

/// A client connection to a [`MemoryRelay`].
pub struct MemoryTransport {
    id: ConnId,
    relay: MemoryRelay,
    rx: mpsc::UnboundedReceiver<RelayMessage>,
    closed: bool,
}

impl RelayTransport for MemoryTransport {
    async fn send(&mut self, message: RelayMessage) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.relay.route(self.id, message)
    }

    async fn recv(&mut self) -> Result<Option<RelayMessage>, TransportError> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            self.relay.disconnect(self.id);
        }
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        if !self.closed {
            self.relay.disconnect(self.id);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use sealdrop_proto::{CreateInvitation, JoinByToken, KeyExchange};

    use super::*;

    fn create() -> RelayMessage {
        RelayMessage::CreateInvitation(CreateInvitation {
            expires_in_minutes: 30,
            intent: "send_files".into(),
            capabilities: vec![],
        })
    }

    fn join(token: &str) -> RelayMessage {
        RelayMessage::JoinByToken(JoinByToken {
            token: token.into(),
            intent: "receive_files".into(),
            capabilities: vec![],
        })
    }

    async fn created_token(t: &mut MemoryTransport) -> String {
        match t.recv().await.unwrap().unwrap() {
            RelayMessage::InvitationCreated(ack) => ack.token,
            other => panic!("expected INVITATION_CREATED, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pairs_and_forwards() {
        let relay = MemoryRelay::new();
        let mut a = relay.connect();
        let mut b = relay.connect();

        a.send(create()).await.unwrap();
        let token = created_token(&mut a).await;
        b.send(join(&token)).await.unwrap();
        assert!(matches!(
            b.recv().await.unwrap().unwrap(),
            RelayMessage::JoinedSession(_)
        ));

        b.send(RelayMessage::KeyExchange(KeyExchange::ecdh(vec![4])))
            .await
            .unwrap();
        assert!(matches!(
            a.recv().await.unwrap().unwrap(),
            RelayMessage::KeyExchange(_)
        ));
        assert_eq!(relay.session_count(), 1);
    }

    #[tokio::test]
    async fn buffers_creator_traffic_until_join() {
        let relay = MemoryRelay::new();
        let mut a = relay.connect();
        a.send(create()).await.unwrap();
        let token = created_token(&mut a).await;
        a.send(RelayMessage::KeyExchange(KeyExchange::ecdh(vec![4, 4])))
            .await
            .unwrap();

        let mut b = relay.connect();
        b.send(join(&token)).await.unwrap();
        assert!(matches!(
            b.recv().await.unwrap().unwrap(),
            RelayMessage::JoinedSession(_)
        ));
        let RelayMessage::KeyExchange(kx) = b.recv().await.unwrap().unwrap() else {
            panic!("buffered KEY_EXCHANGE not delivered");
        };
        assert_eq!(kx.public_key, Some(vec![4, 4]));
    }

    #[tokio::test]
    async fn bad_token_gets_error_notice() {
        let relay = MemoryRelay::new();
        let mut b = relay.connect();
        b.send(join("nope")).await.unwrap();
        let msg = b.recv().await.unwrap().unwrap();
        assert_eq!(msg.type_name(), MSG_RELAY_ERROR);
    }

    #[tokio::test]
    async fn third_party_cannot_join() {
        let relay = MemoryRelay::new();
        let mut a = relay.connect();
        a.send(create()).await.unwrap();
        let token = created_token(&mut a).await;
        let mut b = relay.connect();
        let mut c = relay.connect();
        b.send(join(&token)).await.unwrap();
        c.send(join(&token)).await.unwrap();
        assert_eq!(c.recv().await.unwrap().unwrap().type_name(), MSG_RELAY_ERROR);
    }

    #[tokio::test]
    async fn closing_one_side_ends_the_peer_stream() {
        let relay = MemoryRelay::new();
        let mut a = relay.connect();
        a.send(create()).await.unwrap();
        let token = created_token(&mut a).await;
        let mut b = relay.connect();
        b.send(join(&token)).await.unwrap();
        b.recv().await.unwrap();

        a.close().await.unwrap();
        assert!(b.recv().await.unwrap().is_none());
        assert!(matches!(
            a.send(create()).await,
            Err(TransportError::Closed)
        ));
        assert_eq!(relay.session_count(), 0);
    }
}

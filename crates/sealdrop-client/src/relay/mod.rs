//! Relay transports.
//!
//! The relay is an external collaborator. The session driver only needs a
//! way to send one message, receive the next one, and hang up.

pub mod memory;
pub mod ndjson;

pub use memory::{MemoryRelay, MemoryTransport};
pub use ndjson::NdjsonTransport;

use sealdrop_proto::RelayMessage;

use crate::error::TransportError;

/// A connection to the relay carrying typed messages.
///
/// `recv` must be cancel safe: the session driver races it against the
/// fallback timer and drops the losing future.
#[allow(async_fn_in_trait)]
pub trait RelayTransport {
    async fn send(&mut self, message: RelayMessage) -> Result<(), TransportError>;

    /// Next message from the relay, or `None` once the relay hung up.
    async fn recv(&mut self) -> Result<Option<RelayMessage>, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

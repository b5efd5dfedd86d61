//! Newline-delimited JSON over a byte stream (TCP in production).

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

use sealdrop_proto::{RelayMessage, parse_line, to_line};

use super::RelayTransport;
use crate::error::TransportError;

/// One JSON relay message per line. Inbound lines longer than the frame
/// limit end the connection.
pub struct NdjsonTransport<S = TcpStream> {
    peer: String,
    lines: FramedRead<ReadHalf<S>, LinesCodec>,
    max_frame_bytes: usize,
    writer: WriteHalf<S>,
}

impl NdjsonTransport<TcpStream> {
    /// Open a TCP connection to the relay at `addr`.
    pub async fn connect(
        addr: &str,
        timeout: Duration,
        max_frame_bytes: usize,
    ) -> Result<Self, TransportError> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(TransportError::Connect {
                    addr: addr.to_string(),
                    source,
                });
            }
            Err(_) => {
                return Err(TransportError::ConnectTimeout {
                    addr: addr.to_string(),
                    secs: timeout.as_secs(),
                });
            }
        };
        stream.set_nodelay(true)?;
        info!(relay = %addr, "Connected to relay");
        Ok(Self::new(addr, stream, max_frame_bytes))
    }
}

impl<S: AsyncRead + AsyncWrite> NdjsonTransport<S> {
    /// Wrap an already-open stream. `peer` is only used in log lines.
    pub fn new(peer: impl Into<String>, stream: S, max_frame_bytes: usize) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            peer: peer.into(),
            lines: FramedRead::new(reader, LinesCodec::new_with_max_length(max_frame_bytes)),
            max_frame_bytes,
            writer,
        }
    }
}

impl<S: AsyncRead + AsyncWrite> RelayTransport for NdjsonTransport<S> {
    async fn send(&mut self, message: RelayMessage) -> Result<(), TransportError> {
        let mut line = to_line(&message)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        debug!(relay = %self.peer, msg_type = message.type_name(), "Sent");
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<RelayMessage>, TransportError> {
        loop {
            let line = match self.lines.next().await {
                Some(Ok(line)) => line,
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    error!(
                        relay = %self.peer,
                        limit = self.max_frame_bytes,
                        "Relay frame exceeds limit"
                    );
                    return Err(TransportError::FrameTooLarge {
                        limit: self.max_frame_bytes,
                    });
                }
                Some(Err(LinesCodecError::Io(e))) => return Err(e.into()),
                None => {
                    info!(relay = %self.peer, "Relay closed the connection");
                    return Ok(None);
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_line(line) {
                Ok(message) => {
                    debug!(relay = %self.peer, msg_type = message.type_name(), "Received");
                    return Ok(Some(message));
                }
                Err(e) => {
                    warn!(relay = %self.peer, error = %e, "Skipping malformed relay frame");
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

//! File transfer sequencer.
//!
//! Outbound, [`send_all`] turns an ordered list of files into one
//! `ENCRYPTED_MESSAGE` per file, strictly in order, and stops at the first
//! failure. Inbound, [`ReceivedLedger`] records every delivered file.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_stream::stream;
use tokio_stream::Stream;
use tracing::{info, warn};

use sealdrop_crypto::{EnvelopeEncoding, SharedKey, WireEnvelope, encrypt};
use sealdrop_proto::{
    EncryptedMessage, FilePayload, PAYLOAD_FILE_DATA, Payload, RelayMessage, encode_payload,
};

use crate::error::{SendFailure, TransferError};
use crate::handshake::Handshake;
use crate::relay::RelayTransport;

/// A file selected for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileHandle {
    /// Read from disk when its turn comes.
    Path(PathBuf),
    /// Already in memory.
    Memory { name: String, data: Vec<u8> },
}

impl FileHandle {
    pub fn memory(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self::Memory {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Name announced to the peer: the final path component only.
    pub fn name(&self) -> String {
        match self {
            Self::Path(path) => path
                .file_name()
                .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned()),
            Self::Memory { name, .. } => name.clone(),
        }
    }

    /// Load the whole file, refusing anything above `max_bytes`.
    pub async fn load(self, max_bytes: u64) -> Result<FilePayload, TransferError> {
        let name = self.name();
        let data = match self {
            Self::Path(path) => {
                let size = tokio::fs::metadata(&path).await?.len();
                if size > max_bytes {
                    return Err(TransferError::TooLarge {
                        size,
                        limit: max_bytes,
                    });
                }
                tokio::fs::read(&path).await?
            }
            Self::Memory { data, .. } => data,
        };
        let size = data.len() as u64;
        if size > max_bytes {
            return Err(TransferError::TooLarge {
                size,
                limit: max_bytes,
            });
        }
        Ok(FilePayload::new(name, data))
    }
}

impl From<PathBuf> for FileHandle {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

/// Progress after one file was handed to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    /// Position of the file just sent, starting at 0.
    pub index: usize,
    pub filename: String,
    pub size: u64,
    /// Files sent so far, including this one.
    pub completed: usize,
    pub total: usize,
}

impl TransferProgress {
    /// `completed / total`, in `0.0..=1.0`.
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }

    pub fn is_last(&self) -> bool {
        self.completed == self.total
    }
}

/// Encrypt one payload into an `ENCRYPTED_MESSAGE`.
pub fn seal_payload(
    key: &SharedKey,
    encoding: EnvelopeEncoding,
    payload: &Payload,
) -> Result<RelayMessage, TransferError> {
    let plaintext = encode_payload(payload)?;
    let envelope = encrypt(key, &plaintext)?;
    Ok(RelayMessage::EncryptedMessage(EncryptedMessage::new(
        &WireEnvelope::encode(&envelope, encoding),
        PAYLOAD_FILE_DATA,
    )))
}

/// Send `files` in order, yielding progress after each one.
///
/// Lazy: nothing is read or sent until the stream is polled. The first
/// failure is yielded as [`SendFailure`] and ends the stream; later files are
/// never touched. The key is looked up from `handshake` per file.
pub fn send_all<'a, T: RelayTransport>(
    transport: &'a mut T,
    handshake: &'a Handshake,
    files: Vec<FileHandle>,
    encoding: EnvelopeEncoding,
    max_file_bytes: u64,
) -> impl Stream<Item = Result<TransferProgress, SendFailure>> + 'a {
    stream! {
        let total = files.len();
        for (index, file) in files.into_iter().enumerate() {
            let filename = file.name();
            match send_one(transport, handshake, file, encoding, max_file_bytes).await {
                Ok(size) => {
                    info!(file = %filename, index, total, size = %format_file_size(size), "File sent");
                    yield Ok(TransferProgress {
                        index,
                        filename,
                        size,
                        completed: index + 1,
                        total,
                    });
                }
                Err(cause) => {
                    warn!(
                        file = %filename,
                        index,
                        skipped = total - index - 1,
                        error = %cause,
                        "File send failed; stopping"
                    );
                    yield Err(SendFailure { index, filename, cause });
                    return;
                }
            }
        }
    }
}

async fn send_one<T: RelayTransport>(
    transport: &mut T,
    handshake: &Handshake,
    file: FileHandle,
    encoding: EnvelopeEncoding,
    max_file_bytes: u64,
) -> Result<u64, TransferError> {
    let key = handshake.outbound_key()?;
    let payload = file.load(max_file_bytes).await?;
    let size = payload.size;
    let message = seal_payload(key, encoding, &Payload::File(payload))?;
    transport
        .send(message)
        .await
        .map_err(crate::error::SessionError::from)?;
    Ok(size)
}

/// A completed inbound file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Peer-supplied name reduced to a bare file name.
    pub filename: String,
    pub data: Vec<u8>,
    pub received_at: SystemTime,
}

impl ReceivedFile {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Write the file into `dir`, creating the directory if needed.
    pub async fn save_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(&self.filename);
        tokio::fs::write(&path, &self.data).await?;
        Ok(path)
    }
}

/// One line of the received-files ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub filename: String,
    pub size: u64,
    pub received_at: SystemTime,
}

/// Append-only record of files received in this session.
#[derive(Debug, Default)]
pub struct ReceivedLedger {
    entries: Vec<LedgerEntry>,
}

impl ReceivedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an inbound file payload and materialize it for the caller.
    pub fn record(&mut self, payload: FilePayload) -> ReceivedFile {
        let received = ReceivedFile {
            filename: sanitize_filename(&payload.filename),
            data: payload.data,
            received_at: SystemTime::now(),
        };
        self.entries.push(LedgerEntry {
            filename: received.filename.clone(),
            size: received.size(),
            received_at: received.received_at,
        });
        received
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }
}

/// Reduce a peer-supplied name to its last path component. Separators of
/// either platform are honoured; empty, `.` and `..` become `unnamed`.
pub fn sanitize_filename(name: &str) -> String {
    let last = name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .trim()
        .replace('\0', "");
    match last.as_str() {
        "" | "." | ".." => "unnamed".to_string(),
        _ => last,
    }
}

/// Human-readable size, 1024-based, two decimals: `1.5 KB`, `0 Bytes`.
#[allow(clippy::cast_precision_loss)]
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 Bytes".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let text = format!("{value:.2}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    format!("{text} {}", UNITS[unit])
}

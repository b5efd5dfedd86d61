//! `SealDrop` CLI
//!
//! `sealdrop create [FILES]...` opens a session, prints the invitation token
//! and sends the files once a shared key is in place.
//! `sealdrop join <TOKEN>` joins that session and saves every received file.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use sealdrop_client::{ClientSession, FileHandle, SessionEvent, format_file_size};
use sealdrop_core::config::load_config;
use sealdrop_core::tracing_init::{default_filter, init_tracing};

#[derive(Parser, Debug)]
#[command(name = "sealdrop")]
#[command(version, about = "End-to-end encrypted file drop over an untrusted relay", long_about = None)]
struct Cli {
    /// Relay address (host:port)
    #[arg(long, global = true)]
    relay: Option<String>,

    /// Key exchange fallback timeout in milliseconds
    #[arg(long, global = true)]
    fallback_ms: Option<u64>,

    /// Directory received files are written to
    #[arg(long, global = true)]
    download_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "SEALDROP_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a session and send files to whoever joins it
    Create {
        /// Files to send, in order
        files: Vec<PathBuf>,
    },
    /// Join a session and receive files
    Join {
        /// Invitation token printed by `sealdrop create`
        token: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cwd = std::env::current_dir()?;
    let mut config = load_config(Some(&cwd))?;
    if let Some(relay) = cli.relay {
        config.relay.addr = relay;
    }
    if let Some(ms) = cli.fallback_ms {
        config.handshake.fallback_timeout_ms = ms;
    }
    if let Some(dir) = cli.download_dir {
        config.transfer.download_dir = dir;
    }
    config.validate()?;

    init_tracing(&default_filter(&config.relay.log_level), cli.log_json);
    info!(version = env!("CARGO_PKG_VERSION"), relay = %config.relay.addr, "Starting sealdrop");

    let mut session = ClientSession::connect(&config).await?;
    let result = match cli.command {
        Command::Create { files } => run_create(&mut session, files).await,
        Command::Join { token } => run_join(&mut session, &token, &config.transfer.download_dir).await,
    };
    if let Err(e) = session.close().await {
        warn!(error = %e, "Error closing session");
    }
    result
}

async fn run_create<T: sealdrop_client::RelayTransport>(
    session: &mut ClientSession<T>,
    files: Vec<PathBuf>,
) -> anyhow::Result<()> {
    let invitation = session.create().await?;
    report(&format!("Invitation token: {}", invitation.token));
    report("Waiting for the peer to join...");

    session.wait_for_key().await?;
    for event in session.drain_events() {
        match event {
            SessionEvent::EncryptionReady { source, key } => report(&format!(
                "Encryption ready ({source:?}{})",
                key.map(|k| format!(", key {}", k.fingerprint))
                    .unwrap_or_default()
            )),
            SessionEvent::KeyUpdated { key, .. } => {
                report(&format!("Session key changed to {}", key.fingerprint));
            }
            SessionEvent::MessageRejected { msg_type, error } => {
                warn!(msg_type = %msg_type, error = %error, "Message rejected");
            }
            other => debug!(?other, "Event while waiting for the peer"),
        }
    }
    if files.is_empty() {
        report("Encryption ready; no files to send");
        return Ok(());
    }

    let files = files.into_iter().map(FileHandle::from).collect();
    let sent = session.send_files(files);
    tokio::pin!(sent);
    while let Some(step) = sent.next().await {
        match step {
            Ok(progress) => report(&format!(
                "[{}/{}] sent {} ({})",
                progress.completed,
                progress.total,
                progress.filename,
                format_file_size(progress.size)
            )),
            Err(failure) => {
                error!(error = %failure, "Transfer aborted");
                return Err(failure.into());
            }
        }
    }
    Ok(())
}

async fn run_join<T: sealdrop_client::RelayTransport>(
    session: &mut ClientSession<T>,
    token: &str,
    download_dir: &std::path::Path,
) -> anyhow::Result<()> {
    let session_id = session.join(token).await?;
    report(&format!("Joined session {session_id}"));

    loop {
        match session.next_event().await? {
            SessionEvent::EncryptionReady { source, key } => match key {
                Some(key) => report(&format!(
                    "Encryption ready ({source:?}, key {})",
                    key.fingerprint
                )),
                None => report("Encryption ready without a shared key; waiting for the peer"),
            },
            SessionEvent::KeyUpdated { key, .. } => {
                report(&format!("Session key changed to {}", key.fingerprint));
            }
            SessionEvent::FileReceived(file) => {
                let path = file.save_to(download_dir).await?;
                report(&format!(
                    "Received {} ({}) -> {}",
                    file.filename,
                    format_file_size(file.size()),
                    path.display()
                ));
            }
            SessionEvent::PayloadReceived(payload) => {
                info!(payload_type = payload.payload_type(), "Ignoring non-file payload");
            }
            SessionEvent::MessageRejected { msg_type, error } => {
                warn!(msg_type = %msg_type, error = %error, "Message rejected");
            }
            SessionEvent::SessionEstablished { .. } => {}
            SessionEvent::Closed => break,
        }
    }

    let ledger = session.ledger();
    report(&format!(
        "Session ended: {} file(s), {}",
        ledger.len(),
        format_file_size(ledger.total_bytes())
    ));
    for entry in ledger.entries() {
        report(&format!("  {} ({})", entry.filename, format_file_size(entry.size)));
    }
    Ok(())
}

#[allow(clippy::print_stdout)]
fn report(line: &str) {
    println!("{line}");
}

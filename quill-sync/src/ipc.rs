//! JSON Lines transport over the worker's stdin/stdout pipes.
//!
//! - Writer: an unbounded channel drained by a task that writes one line per
//!   message and flushes immediately.
//! - Reader: a line reader that decodes each non-empty line.
//!
//! Generic over `AsyncRead`/`AsyncWrite` so both ends can be driven over
//! `tokio::io::duplex` in tests.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::message::{decode_line, Incoming, Message, ProtocolError};

/// Set by the host on the worker's environment; its absence means the
/// process was not started by a host and has no IPC channel.
pub const IPC_CHANNEL_ENV: &str = "QUILL_IPC_CHANNEL";

/// Whether this process was spawned by a host with an IPC channel attached.
pub fn attached_to_parent() -> bool {
    std::env::var_os(IPC_CHANNEL_ENV).is_some()
}

/// Spawn the writer task. Dropping every sender ends the task after the
/// queued messages are flushed.
pub fn spawn_writer<W>(writer: W) -> (mpsc::UnboundedSender<Message>, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(writer_task(rx, writer));
    (tx, handle)
}

async fn writer_task<W>(mut rx: mpsc::UnboundedReceiver<Message>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        let mut line = match msg.encode() {
            Ok(line) => line,
            Err(e) => {
                log::error!("Dropping unserializable {} message #{}: {e}", msg.kind(), msg.id);
                continue;
            }
        };
        line.push('\n');

        if let Err(e) = writer.write_all(line.as_bytes()).await {
            log::warn!("IPC write failed: {e}");
            break;
        }
        if let Err(e) = writer.flush().await {
            log::warn!("IPC flush failed: {e}");
            break;
        }
    }
    log::debug!("IPC writer task exiting");
}

/// Line-oriented message reader.
pub struct IpcReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> IpcReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Next decoded frame, or `None` once the peer closed the pipe.
    pub async fn next(&mut self) -> Option<Result<Incoming, ProtocolError>> {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => return Some(decode_line(&line)),
                Ok(None) => return None,
                Err(e) => {
                    log::warn!("IPC read failed: {e}");
                    return None;
                }
            }
        }
    }
}

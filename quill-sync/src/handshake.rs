//! Ping/pong handshake bookkeeping and the gated outbox.
//!
//! Each end must both *receive* a `ping` and *receive* a `pong` before the
//! handshake is complete. Until then the [`Outbox`] only lets through the
//! kinds it was built to allow (always `ping`, `pong`, `error`) and drops
//! everything else with a warning.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::message::{Message, MessageBody, MessageEncoder, MessageKind, ProtocolError};

/// Which halves of the handshake this end has observed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub ping_received: bool,
    pub pong_received: bool,
}

impl Handshake {
    pub fn is_complete(&self) -> bool {
        self.ping_received && self.pong_received
    }
}

/// Kinds the worker may send before the handshake completes.
pub const WORKER_PRE_HANDSHAKE: &[MessageKind] =
    &[MessageKind::Ping, MessageKind::Pong, MessageKind::Error];

/// The host may additionally request shutdown at any time.
pub const HOST_PRE_HANDSHAKE: &[MessageKind] = &[
    MessageKind::Ping,
    MessageKind::Pong,
    MessageKind::Error,
    MessageKind::Shutdown,
];

/// Stamps and queues outgoing messages, enforcing the handshake gate.
#[derive(Clone)]
pub struct Outbox {
    encoder: Arc<MessageEncoder>,
    tx: mpsc::UnboundedSender<Message>,
    state: Arc<watch::Sender<Handshake>>,
    allowed_early: &'static [MessageKind],
}

impl Outbox {
    pub fn new(tx: mpsc::UnboundedSender<Message>, allowed_early: &'static [MessageKind]) -> Self {
        let (state, _) = watch::channel(Handshake::default());
        Self {
            encoder: Arc::new(MessageEncoder::new()),
            tx,
            state: Arc::new(state),
            allowed_early,
        }
    }

    pub fn handshake(&self) -> Handshake {
        *self.state.borrow()
    }

    pub fn mark_ping_received(&self) -> Handshake {
        self.update(|h| h.ping_received = true)
    }

    pub fn mark_pong_received(&self) -> Handshake {
        self.update(|h| h.pong_received = true)
    }

    /// Force completion, for peers that proved liveness out of band.
    pub fn mark_complete(&self) -> Handshake {
        self.update(|h| {
            h.ping_received = true;
            h.pong_received = true;
        })
    }

    fn update(&self, change: impl FnOnce(&mut Handshake)) -> Handshake {
        self.state.send_if_modified(|h| {
            let before = *h;
            change(h);
            before != *h
        });
        self.handshake()
    }

    /// Wait until both halves of the handshake have been observed.
    pub async fn wait_complete(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so this cannot fail.
        let _ = rx.wait_for(Handshake::is_complete).await;
    }

    /// Stamp and queue `body`.
    ///
    /// Returns `Ok(false)` when the message was dropped by the handshake gate
    /// and `Err` when the IPC channel is gone.
    pub fn send(&self, body: MessageBody) -> Result<bool, ProtocolError> {
        let kind = body.kind();
        if !self.handshake().is_complete() && !self.allowed_early.contains(&kind) {
            log::warn!("Dropping outgoing {kind} message: handshake not complete");
            return Ok(false);
        }

        let msg = self.encoder.encode(body);
        log::trace!("IPC send {kind} #{}", msg.id);
        self.tx.send(msg).map_err(|_| ProtocolError::ChannelClosed)?;
        Ok(true)
    }
}

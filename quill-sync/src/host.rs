//! Host side of the IPC channel.
//!
//! The controller mirrors the worker's handshake: it pings on start, answers
//! `ping` with `pong`, and once both halves are observed sends `initialize`
//! exactly once with a fresh bearer token. It answers the worker's
//! `getProjects` from the throttled directory cache and multiplexes its own
//! `getProjects` calls through [`ProjectRequests`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::BridgeConfig;
use crate::deferred::DeferredError;
use crate::directory::{CredentialProvider, DirectoryCache};
use crate::handshake::{Handshake, Outbox, HOST_PRE_HANDSHAKE};
use crate::ipc::{spawn_writer, IpcReader};
use crate::message::{Incoming, InitializeParams, Message, MessageBody, ProtocolError};
use crate::process::WorkerExit;
use crate::projects::ProjectRequests;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOptions {
    pub stale_after: Duration,
    pub request_timeout: Duration,
    pub http_base_url: String,
    pub ws_base_url: String,
    /// The port the control plane is actually listening on.
    pub control_plane_port: u16,
}

impl From<&BridgeConfig> for HostOptions {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            stale_after: config.stale_after,
            request_timeout: config.request_timeout,
            http_base_url: config.http_base_url.clone(),
            ws_base_url: config.ws_base_url.clone(),
            control_plane_port: config.control_plane_port,
        }
    }
}

impl Default for HostOptions {
    fn default() -> Self {
        Self::from(&BridgeConfig::default())
    }
}

struct HostShared {
    outbox: Outbox,
    projects: ProjectRequests,
    directory: Arc<DirectoryCache>,
    credentials: Arc<dyn CredentialProvider>,
    options: HostOptions,
    initialize_sent: AtomicBool,
    closed: watch::Sender<bool>,
}

impl HostShared {
    fn send(&self, body: MessageBody) {
        if let Err(e) = self.outbox.send(body) {
            log::warn!("Host could not send: {e}");
        }
    }

    fn on_handshake_progress(self: &Arc<Self>) {
        if !self.outbox.handshake().is_complete() {
            return;
        }
        if self.initialize_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Handshake with worker complete; sending initialize");

        let shared = self.clone();
        tokio::spawn(async move {
            let auth_token = match shared.credentials.bearer_token().await {
                Ok(token) => token,
                Err(e) => {
                    log::error!("No credentials for the worker: {e}");
                    shared.send(MessageBody::Shutdown {
                        reason: Some(format!("no credentials: {e}")),
                    });
                    return;
                }
            };
            shared.send(MessageBody::Initialize(InitializeParams {
                auth_token,
                http_base_url: shared.options.http_base_url.clone(),
                ws_base_url: shared.options.ws_base_url.clone(),
                control_plane_port: shared.options.control_plane_port,
            }));
        });
    }

    fn dispatch(self: &Arc<Self>, msg: Message) {
        let kind = msg.kind();
        if kind.expires() && msg.is_stale(self.options.stale_after) {
            log::warn!("Discarding stale {kind} message #{} from worker", msg.id);
            return;
        }
        log::trace!("IPC recv {kind} #{}", msg.id);

        match msg.body {
            MessageBody::Ping => {
                self.outbox.mark_ping_received();
                self.send(MessageBody::Pong);
                self.on_handshake_progress();
            }
            MessageBody::Pong => {
                self.outbox.mark_pong_received();
                self.on_handshake_progress();
            }
            MessageBody::GetProjects => {
                let shared = self.clone();
                tokio::spawn(async move {
                    let snapshot = shared.directory.get_available_projects(false).await;
                    shared.send(MessageBody::ProjectResults {
                        projects: snapshot.ids(),
                    });
                });
            }
            MessageBody::ProjectResults { projects } => {
                self.projects.resolve(projects);
            }
            MessageBody::Error { message, stack } => {
                log::warn!("Worker reported an error: {message}");
                if let Some(stack) = stack {
                    log::debug!("Worker error stack: {stack}");
                }
            }
            MessageBody::Initialize(_) => {
                log::warn!("Worker sent initialize #{}", msg.id);
                self.send(MessageBody::error("initialize is only sent by the host"));
            }
            MessageBody::Shutdown { reason } => {
                let reason = reason.as_deref().unwrap_or("no reason");
                log::info!("Worker announced shutdown: {reason}");
            }
        }
    }
}

async fn read_loop<R>(shared: Arc<HostShared>, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = IpcReader::new(reader);
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Incoming::Message(msg)) => shared.dispatch(msg),
            Ok(Incoming::Unknown { type_name, id }) => {
                log::warn!("Ignoring worker message #{id:?} of unknown type {type_name:?}");
            }
            Err(e) => {
                log::warn!("Protocol error from worker: {e}");
                shared.send(MessageBody::error(e.to_string()));
            }
        }
    }
    log::info!("Worker IPC channel closed");
    shared.projects.abandon("worker channel closed");
    shared.closed.send_replace(true);
}

/// Drives the host half of the protocol over a worker's pipes.
pub struct HostController {
    shared: Arc<HostShared>,
    closed: watch::Receiver<bool>,
    reader: JoinHandle<()>,
}

impl HostController {
    /// Start reading from `reader` and send the opening `ping`.
    pub fn start<R, W>(
        reader: R,
        writer: W,
        directory: Arc<DirectoryCache>,
        credentials: Arc<dyn CredentialProvider>,
        options: HostOptions,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, _writer) = spawn_writer(writer);
        let outbox = Outbox::new(tx, HOST_PRE_HANDSHAKE);
        let (closed_tx, closed) = watch::channel(false);
        let shared = Arc::new(HostShared {
            projects: ProjectRequests::new(outbox.clone(), options.request_timeout),
            outbox,
            directory,
            credentials,
            options,
            initialize_sent: AtomicBool::new(false),
            closed: closed_tx,
        });

        shared.send(MessageBody::Ping);
        let reader = tokio::spawn(read_loop(shared.clone(), reader));
        Self {
            shared,
            closed,
            reader,
        }
    }

    pub fn handshake(&self) -> Handshake {
        self.shared.outbox.handshake()
    }

    /// Whether the handshake completed within `timeout`.
    pub async fn wait_handshake(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.shared.outbox.wait_complete())
            .await
            .is_ok()
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.initialize_sent.load(Ordering::SeqCst)
    }

    /// Ask the worker for its project ids. Concurrent callers share one
    /// round trip.
    pub async fn get_projects(&self) -> Result<Vec<String>, DeferredError> {
        self.shared.projects.request().await
    }

    /// Ask the worker to exit gracefully. Allowed before the handshake.
    pub fn shutdown(&self, reason: &str) -> Result<bool, ProtocolError> {
        log::info!("Requesting worker shutdown: {reason}");
        self.shared.outbox.send(MessageBody::Shutdown {
            reason: Some(reason.to_string()),
        })
    }

    /// Record that the worker process is gone and fail whatever waits on it.
    pub fn worker_exited(&self, exit: WorkerExit) {
        if !exit.is_graceful() {
            log::error!("Worker failed: {exit}");
        }
        self.shared.projects.abandon(&format!("worker exited: {exit}"));
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the worker closed its end of the channel.
    pub async fn wait_closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|c| *c).await;
    }
}

impl Drop for HostController {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

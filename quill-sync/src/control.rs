//! Host control plane: where a worker registers the capabilities the host
//! may invoke.
//!
//! A local WebSocket carrying JSON text frames:
//! ```text
//! worker ── register{id, capabilities} ──▶ host
//! worker ◀── registered{id} ───────────── host
//! worker ◀── invoke{id, capability, params} host
//! worker ── reply{id, result | error} ───▶ host
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::deferred::{Deferred, DeferredError};

/// Control-plane frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ControlFrame {
    Register {
        id: u64,
        capabilities: Vec<String>,
    },
    Registered {
        id: u64,
    },
    Invoke {
        id: u64,
        capability: String,
        #[serde(default)]
        params: Value,
    },
    Reply {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ControlFrame {
    fn to_ws(&self) -> Result<WsMessage, ControlError> {
        let text =
            serde_json::to_string(self).map_err(|e| ControlError::Serialization(e.to_string()))?;
        Ok(WsMessage::Text(text.into()))
    }

    fn from_ws(msg: &WsMessage) -> Option<Result<Self, ControlError>> {
        match msg {
            WsMessage::Text(text) => Some(
                serde_json::from_str(text.as_str())
                    .map_err(|e| ControlError::Serialization(e.to_string())),
            ),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ControlError {
    #[error("failed to bind control plane: {0}")]
    Bind(String),
    #[error("failed to reach control plane: {0}")]
    Connect(String),
    #[error("control plane timed out after {0:?}")]
    Timeout(Duration),
    #[error("no worker connected to the control plane")]
    NotConnected,
    #[error("capability {0} is not registered")]
    Unregistered(String),
    #[error("capability failed: {0}")]
    Remote(String),
    #[error("control request failed: {0}")]
    Request(DeferredError),
    #[error("control frame error: {0}")]
    Serialization(String),
    #[error("control connection closed")]
    Closed,
}

impl From<DeferredError> for ControlError {
    fn from(err: DeferredError) -> Self {
        match err {
            DeferredError::Timeout(d) => ControlError::Timeout(d),
            DeferredError::Rejected(reason) => ControlError::Remote(reason),
            DeferredError::Abandoned => ControlError::Request(DeferredError::Abandoned),
        }
    }
}

/// Why a capability invocation failed on the worker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    #[error("unknown capability {0}")]
    Unknown(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("{0}")]
    Failed(String),
}

/// The worker's callable surface.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    /// Names registered with the host.
    fn capabilities(&self) -> Vec<String>;

    async fn invoke(&self, capability: &str, params: Value) -> Result<Value, CapabilityError>;
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn reject_all(pending: &Mutex<HashMap<u64, Deferred<Value>>>, reason: &str) {
    for (_, reply) in locked(pending).drain() {
        reply.reject(reason);
    }
}

/// Drain `rx` into the sink until either side closes.
async fn write_frames<S>(mut sink: S, mut rx: mpsc::UnboundedReceiver<WsMessage>)
where
    S: futures_util::Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(frame) = rx.recv().await {
        if let Err(e) = sink.send(frame).await {
            log::warn!("Control plane write failed: {e}");
            break;
        }
    }
    let _ = sink.close().await;
}

// ── Host side ───────────────────────────────────────────────

#[derive(Default)]
struct ServerShared {
    next_id: AtomicU64,
    out: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    pending: Mutex<HashMap<u64, Deferred<Value>>>,
}

/// The host end of the control plane. Serves one worker at a time; a new
/// connection replaces the previous one.
pub struct ControlPlaneServer {
    port: u16,
    request_timeout: Duration,
    shared: Arc<ServerShared>,
    registered: watch::Receiver<Option<Vec<String>>>,
    accept_task: JoinHandle<()>,
}

impl ControlPlaneServer {
    /// Bind `127.0.0.1:port` (0 = ephemeral) and start accepting.
    pub async fn bind(port: u16, request_timeout: Duration) -> Result<Self, ControlError> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| ControlError::Bind(e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| ControlError::Bind(e.to_string()))?
            .port();
        log::info!("Control plane listening on 127.0.0.1:{port}");

        let shared = Arc::new(ServerShared::default());
        let (registered_tx, registered) = watch::channel(None);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            shared.clone(),
            registered_tx,
            request_timeout,
        ));

        Ok(Self {
            port,
            request_timeout,
            shared,
            registered,
            accept_task,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Capabilities registered by the connected worker.
    pub fn capabilities(&self) -> Vec<String> {
        self.registered.borrow().clone().unwrap_or_default()
    }

    pub fn is_registered(&self) -> bool {
        self.registered.borrow().is_some()
    }

    /// Wait until a worker has registered.
    pub async fn wait_registered(&self, timeout: Duration) -> Result<Vec<String>, ControlError> {
        let mut rx = self.registered.clone();
        let registered = match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(caps)) => Ok((*caps).clone().unwrap_or_default()),
            Ok(Err(_)) => Err(ControlError::Closed),
            Err(_) => Err(ControlError::Timeout(timeout)),
        };
        registered
    }

    /// Invoke a registered worker capability and await its reply.
    pub async fn invoke(&self, capability: &str, params: Value) -> Result<Value, ControlError> {
        if !self.capabilities().iter().any(|c| c == capability) {
            return Err(ControlError::Unregistered(capability.to_string()));
        }
        let out = locked(&self.shared.out).clone().ok_or(ControlError::NotConnected)?;

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let reply = Deferred::with_timeout(self.request_timeout);
        locked(&self.shared.pending).insert(id, reply.clone());

        let frame = ControlFrame::Invoke {
            id,
            capability: capability.to_string(),
            params,
        };
        log::debug!("Invoking worker capability {capability} (#{id})");
        if out.send(frame.to_ws()?).is_err() {
            locked(&self.shared.pending).remove(&id);
            return Err(ControlError::Closed);
        }

        let result = reply.wait().await;
        locked(&self.shared.pending).remove(&id);
        result.map_err(ControlError::from)
    }
}

impl Drop for ControlPlaneServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

type Upgraded = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

/// Accepts TCP connections and upgrades each one in its own task; a client
/// that never finishes the WebSocket handshake holds up nobody else.
async fn accept_loop(
    listener: TcpListener,
    shared: Arc<ServerShared>,
    registered: watch::Sender<Option<Vec<String>>>,
    upgrade_timeout: Duration,
) {
    let registered = Arc::new(registered);
    let (upgraded_tx, mut upgraded_rx) = mpsc::unbounded_channel::<(Upgraded, SocketAddr)>();
    let mut current: Option<JoinHandle<()>> = None;
    loop {
        let (ws, addr) = tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        log::error!("Control plane accept failed: {e}");
                        break;
                    }
                };
                let upgraded_tx = upgraded_tx.clone();
                tokio::spawn(async move {
                    let upgrade = tokio_tungstenite::accept_async(stream);
                    match tokio::time::timeout(upgrade_timeout, upgrade).await {
                        Ok(Ok(ws)) => {
                            let _ = upgraded_tx.send((ws, addr));
                        }
                        Ok(Err(e)) => log::warn!("Control plane handshake from {addr} failed: {e}"),
                        Err(_) => log::warn!("Control plane handshake from {addr} timed out"),
                    }
                });
                continue;
            }
            Some(upgraded) = upgraded_rx.recv() => upgraded,
        };
        if let Some(previous) = current.take() {
            log::warn!("New control plane connection from {addr} replaces the previous worker");
            previous.abort();
            reject_all(&shared.pending, "worker replaced");
        }
        log::info!("Worker connected to control plane from {addr}");

        let (sink, stream) = ws.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        *locked(&shared.out) = Some(out_tx.clone());
        registered.send_replace(None);

        let shared = shared.clone();
        let registered = registered.clone();
        current = Some(tokio::spawn(async move {
            let writer = tokio::spawn(write_frames(sink, out_rx));
            serve_worker(stream, &shared, &registered, &out_tx).await;
            writer.abort();
            *locked(&shared.out) = None;
            registered.send_replace(None);
            reject_all(&shared.pending, "worker disconnected from control plane");
            log::info!("Worker left the control plane");
        }));
    }
}

async fn serve_worker<S>(
    mut stream: S,
    shared: &ServerShared,
    registered: &watch::Sender<Option<Vec<String>>>,
    out: &mpsc::UnboundedSender<WsMessage>,
) where
    S: Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(WsMessage::Close(_)) => break,
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Control plane read failed: {e}");
                break;
            }
        };
        let frame = match ControlFrame::from_ws(&msg) {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                log::warn!("Ignoring malformed control frame: {e}");
                continue;
            }
            None => continue,
        };
        match frame {
            ControlFrame::Register { id, capabilities } => {
                log::info!("Worker registered capabilities: {}", capabilities.join(", "));
                registered.send_replace(Some(capabilities));
                if let Ok(ack) = (ControlFrame::Registered { id }).to_ws() {
                    let _ = out.send(ack);
                }
            }
            ControlFrame::Reply { id, result, error } => {
                let Some(reply) = locked(&shared.pending).remove(&id) else {
                    log::debug!("Reply #{id} has no pending invocation");
                    continue;
                };
                match error {
                    Some(reason) => reply.reject(reason),
                    None => reply.resolve(result.unwrap_or(Value::Null)),
                };
            }
            ControlFrame::Invoke { id, capability, .. } => {
                log::warn!("Worker tried to invoke host capability {capability}");
                let refusal = ControlFrame::Reply {
                    id,
                    result: None,
                    error: Some("the host exposes no capabilities".to_string()),
                };
                if let Ok(frame) = refusal.to_ws() {
                    let _ = out.send(frame);
                }
            }
            ControlFrame::Registered { .. } => {
                log::debug!("Unexpected registered frame from worker")
            }
        }
    }
}

// ── Worker side ─────────────────────────────────────────────

/// The worker end of the control plane.
pub struct ControlPlaneClient {
    out: mpsc::UnboundedSender<WsMessage>,
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<u64, Deferred<Value>>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ControlPlaneClient {
    /// Connect to the host's control plane on `127.0.0.1:port`. Invocations
    /// are served by `handler` from then on.
    pub async fn connect(
        port: u16,
        handler: Arc<dyn CapabilityHandler>,
        timeout: Duration,
    ) -> Result<Self, ControlError> {
        let url = format!("ws://127.0.0.1:{port}");
        let (ws, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str()))
            .await
            .map_err(|_| ControlError::Timeout(timeout))?
            .map_err(|e| ControlError::Connect(e.to_string()))?;
        log::info!("Connected to control plane at {url}");

        let (sink, mut stream) = ws.split();
        let (out, out_rx) = mpsc::unbounded_channel();
        let pending: Arc<Mutex<HashMap<u64, Deferred<Value>>>> = Arc::default();

        let writer = tokio::spawn(write_frames(sink, out_rx));
        let reader = {
            let pending = pending.clone();
            let out = out.clone();
            tokio::spawn(async move {
                while let Some(Ok(msg)) = stream.next().await {
                    if matches!(msg, WsMessage::Close(_)) {
                        break;
                    }
                    match ControlFrame::from_ws(&msg) {
                        Some(Ok(ControlFrame::Registered { id })) => {
                            if let Some(reply) = locked(&pending).remove(&id) {
                                reply.resolve(Value::Null);
                            }
                        }
                        Some(Ok(ControlFrame::Invoke { id, capability, params })) => {
                            let handler = handler.clone();
                            let out = out.clone();
                            tokio::spawn(async move {
                                let reply = match handler.invoke(&capability, params).await {
                                    Ok(result) => ControlFrame::Reply {
                                        id,
                                        result: Some(result),
                                        error: None,
                                    },
                                    Err(e) => {
                                        log::warn!("Capability {capability} failed: {e}");
                                        ControlFrame::Reply {
                                            id,
                                            result: None,
                                            error: Some(e.to_string()),
                                        }
                                    }
                                };
                                if let Ok(frame) = reply.to_ws() {
                                    let _ = out.send(frame);
                                }
                            });
                        }
                        Some(Ok(other)) => log::debug!("Unexpected control frame {other:?}"),
                        Some(Err(e)) => log::warn!("Ignoring malformed control frame: {e}"),
                        None => {}
                    }
                }
                log::warn!("Control plane connection closed");
                reject_all(&pending, "control plane closed");
            })
        };

        Ok(Self {
            out,
            next_id: AtomicU64::new(0),
            pending,
            tasks: vec![reader, writer],
        })
    }

    /// Register `capabilities` and wait for the host's acknowledgement.
    pub async fn register(
        &self,
        capabilities: Vec<String>,
        timeout: Duration,
    ) -> Result<(), ControlError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let ack = Deferred::with_timeout(timeout);
        locked(&self.pending).insert(id, ack.clone());

        let frame = ControlFrame::Register { id, capabilities }.to_ws()?;
        if self.out.send(frame).is_err() {
            locked(&self.pending).remove(&id);
            return Err(ControlError::Closed);
        }
        let result = ack.wait().await;
        locked(&self.pending).remove(&id);
        result.map(|_| ()).map_err(ControlError::from)
    }

    pub fn is_open(&self) -> bool {
        !self.out.is_closed()
    }
}

impl Drop for ControlPlaneClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl CapabilityHandler for Echo {
        fn capabilities(&self) -> Vec<String> {
            vec!["echo".to_string(), "fail".to_string()]
        }

        async fn invoke(&self, capability: &str, params: Value) -> Result<Value, CapabilityError> {
            match capability {
                "echo" => Ok(params),
                "fail" => Err(CapabilityError::Failed("boom".into())),
                other => Err(CapabilityError::Unknown(other.to_string())),
            }
        }
    }

    #[test]
    fn test_frame_wire_shape() {
        let frame = ControlFrame::Invoke {
            id: 3,
            capability: "getProject".into(),
            params: json!({"projectId": "p1"}),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["kind"], "invoke");
        assert_eq!(value["capability"], "getProject");

        let reply: ControlFrame =
            serde_json::from_str(r#"{"kind":"reply","id":3,"error":"x"}"#).unwrap();
        assert_eq!(reply, ControlFrame::Reply { id: 3, result: None, error: Some("x".into()) });
    }

    #[tokio::test]
    async fn test_register_and_invoke_round_trip() {
        let server = ControlPlaneServer::bind(0, Duration::from_secs(2)).await.unwrap();
        let handler: Arc<dyn CapabilityHandler> = Arc::new(Echo);
        let client =
            ControlPlaneClient::connect(server.port(), handler.clone(), Duration::from_secs(2))
                .await
                .unwrap();

        assert_eq!(
            server.invoke("echo", json!(1)).await,
            Err(ControlError::Unregistered("echo".into()))
        );

        client.register(handler.capabilities(), Duration::from_secs(2)).await.unwrap();
        let caps = server.wait_registered(Duration::from_secs(2)).await.unwrap();
        assert_eq!(caps, vec!["echo", "fail"]);

        assert_eq!(server.invoke("echo", json!({"a": 1})).await, Ok(json!({"a": 1})));
        assert_eq!(
            server.invoke("fail", Value::Null).await,
            Err(ControlError::Remote("boom".into()))
        );
    }

    #[tokio::test]
    async fn test_stalled_handshake_does_not_block_worker() {
        let server = ControlPlaneServer::bind(0, Duration::from_secs(5)).await.unwrap();
        // Connects but never sends the upgrade request.
        let _silent = tokio::net::TcpStream::connect(("127.0.0.1", server.port())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let handler: Arc<dyn CapabilityHandler> = Arc::new(Echo);
        let client = tokio::time::timeout(
            Duration::from_secs(2),
            ControlPlaneClient::connect(server.port(), handler.clone(), Duration::from_secs(2)),
        )
        .await
        .expect("upgrade not blocked by the silent client")
        .unwrap();
        client.register(handler.capabilities(), Duration::from_secs(2)).await.unwrap();
        assert_eq!(
            server.wait_registered(Duration::from_secs(2)).await.unwrap(),
            vec!["echo", "fail"]
        );
        assert_eq!(server.invoke("echo", json!("hi")).await, Ok(json!("hi")));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let result =
            ControlPlaneClient::connect(port, Arc::new(Echo), Duration::from_secs(2)).await;
        assert!(matches!(result, Err(ControlError::Connect(_))));
    }

    #[tokio::test]
    async fn test_wait_registered_times_out() {
        let server = ControlPlaneServer::bind(0, Duration::from_secs(1)).await.unwrap();
        let err = server.wait_registered(Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err, ControlError::Timeout(Duration::from_millis(50)));
    }
}

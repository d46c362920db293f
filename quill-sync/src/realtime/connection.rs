//! Realtime backend connection manager.
//!
//! Owns at most one WebSocket to the document backend and the cache of
//! documents subscribed over it. Everything is per instance; a worker
//! creates one manager and passes it to whoever needs document access.
//!
//! ```text
//!  Absent ──connect──▶ Connecting ──dial ok──▶ Open(Session)
//!    ▲                     │                        │
//!    └──dial failed────────┘                        │
//!    └──────────────disconnect──────────────────────┘
//! ```
//!
//! The document cache lives inside the [`Session`], so a reconnect always
//! starts with an empty cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::BridgeConfig;
use crate::deferred::{Deferred, DeferredError};

use super::broadcast::RoomManager;
use super::document::{ChapterRef, DocumentHandle, DocumentKey, ProjectMeta};
use super::wire::{DocMessage, DocMessageKind, WireError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Realtime manager errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConnectionError {
    #[error("not connected to the realtime backend")]
    NotConnected,
    #[error("connecting to the realtime backend failed: {0}")]
    Connect(DeferredError),
    #[error("invalid realtime endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request failed: {0}")]
    Request(DeferredError),
    #[error("backend rejected request: {0}")]
    Backend(String),
    #[error("reference not found: {0}")]
    ReferenceNotFound(String),
    #[error("malformed document {key}: {reason}")]
    MalformedDocument { key: String, reason: String },
    #[error("document {0} is not subscribed on this connection")]
    NotSubscribed(String),
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl ConnectionError {
    fn from_reply(err: DeferredError) -> Self {
        match err {
            DeferredError::Rejected(reason) => ConnectionError::Backend(reason),
            other => ConnectionError::Request(other),
        }
    }
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    /// Open, but the transport reported an error or closed after settling.
    Degraded,
}

/// Deadlines applied by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTimeouts {
    pub connect: Duration,
    pub subscribe: Duration,
    pub request: Duration,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self::from(&BridgeConfig::default())
    }
}

impl From<&BridgeConfig> for ConnectionTimeouts {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            connect: config.connect_timeout,
            subscribe: config.subscribe_timeout,
            request: config.request_timeout,
        }
    }
}

enum Link {
    Absent,
    Connecting {
        attempt: Deferred<Arc<Session>>,
        generation: u64,
        task: JoinHandle<()>,
    },
    Open(Arc<Session>),
}

/// Single-connection manager for the realtime backend.
pub struct ConnectionManager {
    timeouts: ConnectionTimeouts,
    link: Mutex<Link>,
    generation: AtomicU64,
}

impl ConnectionManager {
    pub fn new(timeouts: ConnectionTimeouts) -> Self {
        Self {
            timeouts,
            link: Mutex::new(Link::Absent),
            generation: AtomicU64::new(0),
        }
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        match &*self.link() {
            Link::Absent => ConnectionState::Disconnected,
            Link::Connecting { .. } => ConnectionState::Connecting,
            Link::Open(session) if session.shared.degraded.load(Ordering::Acquire) => {
                ConnectionState::Degraded
            }
            Link::Open(_) => ConnectionState::Open,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), ConnectionState::Open | ConnectionState::Degraded)
    }

    /// Open the backend connection.
    ///
    /// Concurrent callers share one attempt; once open this returns
    /// immediately. A failed attempt leaves the manager disconnected so a
    /// later call can retry.
    pub async fn connect(&self, endpoint: &str, credential: &str) -> Result<(), ConnectionError> {
        let (attempt, generation) = {
            let mut link = self.link();
            match &*link {
                Link::Open(_) => return Ok(()),
                Link::Connecting {
                    attempt,
                    generation,
                    ..
                } => (attempt.clone(), *generation),
                Link::Absent => {
                    let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                    let attempt = Deferred::with_timeout(self.timeouts.connect);
                    log::info!("Connecting to realtime backend at {endpoint}");
                    let task = tokio::spawn(dial(
                        endpoint.to_string(),
                        credential.to_string(),
                        attempt.clone(),
                    ));
                    *link = Link::Connecting {
                        attempt: attempt.clone(),
                        generation,
                        task,
                    };
                    (attempt, generation)
                }
            }
        };

        let outcome = attempt.wait().await;

        let mut link = self.link();
        let current = matches!(&*link, Link::Connecting { generation: g, .. } if *g == generation);
        match outcome {
            Ok(session) => {
                if current {
                    *link = Link::Open(session);
                    log::info!("Realtime backend connection open");
                    Ok(())
                } else if matches!(&*link, Link::Open(s) if Arc::ptr_eq(s, &session)) {
                    Ok(())
                } else {
                    // Superseded by a disconnect while we waited.
                    session.abort();
                    Err(ConnectionError::Closed)
                }
            }
            Err(e) => {
                if current {
                    let failed = std::mem::replace(&mut *link, Link::Absent);
                    if let Link::Connecting { task, .. } = failed {
                        task.abort();
                    }
                    log::error!("Realtime backend connection failed: {e}");
                }
                Err(ConnectionError::Connect(e))
            }
        }
    }

    /// Tear down the connection and drop every cached document. A no-op
    /// when nothing is connected; cancels an in-flight attempt.
    pub async fn disconnect(&self) {
        let previous = std::mem::replace(&mut *self.link(), Link::Absent);
        match previous {
            Link::Absent => log::debug!("Disconnect requested with no realtime connection"),
            Link::Connecting { attempt, task, .. } => {
                task.abort();
                attempt.reject("disconnected while connecting");
                log::info!("Cancelled in-flight realtime connection attempt");
            }
            Link::Open(session) => {
                session.close().await;
                log::info!("Realtime backend connection closed");
            }
        }
    }

    fn session(&self) -> Result<Arc<Session>, ConnectionError> {
        match &*self.link() {
            Link::Open(session) => Ok(session.clone()),
            _ => Err(ConnectionError::NotConnected),
        }
    }

    /// Fetch and subscribe to a document, or return the cached handle.
    ///
    /// Concurrent requests for one key share a single subscribe. Failures
    /// are returned to every waiter and not cached.
    pub async fn get_document(&self, key: DocumentKey) -> Result<DocumentHandle, ConnectionError> {
        let session = self.session()?;
        session.document(key, self.timeouts.subscribe).await
    }

    pub async fn get_project(&self, project_id: &str) -> Result<DocumentHandle, ConnectionError> {
        self.get_document(DocumentKey::project(project_id)).await
    }

    /// Metadata of an existing project document.
    pub async fn project_meta(&self, project_id: &str) -> Result<ProjectMeta, ConnectionError> {
        let handle = self.get_project(project_id).await?;
        if !handle.exists() {
            return Err(ConnectionError::ReferenceNotFound(format!("project {project_id}")));
        }
        handle
            .project_meta()
            .map_err(|e| ConnectionError::MalformedDocument {
                key: handle.key().to_string(),
                reason: e.to_string(),
            })
    }

    /// Chapter text document. The chapter must be listed in the project's
    /// metadata; otherwise nothing is fetched.
    pub async fn get_chapter(
        &self,
        chapter: &ChapterRef,
    ) -> Result<DocumentHandle, ConnectionError> {
        let meta = self.project_meta(&chapter.project_id).await?;
        if !meta.has_chapter(chapter.book, chapter.chapter) {
            return Err(ConnectionError::ReferenceNotFound(chapter.to_string()));
        }
        self.get_document(DocumentKey::Chapter(chapter.clone())).await
    }

    /// Submit a merge patch against a cached handle's current version.
    /// Returns the new document version.
    pub async fn submit_change(
        &self,
        handle: &DocumentHandle,
        patch: Value,
    ) -> Result<u64, ConnectionError> {
        let session = self.session()?;
        session.submit(handle, patch, self.timeouts.request).await
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(ConnectionTimeouts::default())
    }
}

async fn dial(endpoint: String, credential: String, attempt: Deferred<Arc<Session>>) {
    match open_session(&endpoint, &credential).await {
        Ok(session) => {
            if !attempt.resolve(session.clone()) {
                log::debug!("Connection attempt settled before dial finished; closing");
                session.abort();
            }
        }
        Err(e) => {
            attempt.reject(e.to_string());
        }
    }
}

async fn open_session(endpoint: &str, credential: &str) -> Result<Arc<Session>, ConnectionError> {
    let mut request = endpoint
        .into_client_request()
        .map_err(|e| ConnectionError::InvalidEndpoint(e.to_string()))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {credential}")).map_err(|_| {
        ConnectionError::InvalidEndpoint("credential is not a valid header value".into())
    })?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    let (ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| ConnectionError::Transport(e.to_string()))?;
    let (sink, stream) = ws.split();

    let shared = Arc::new(SessionShared::default());
    let (out, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_frames(sink, out_rx));
    let reader = tokio::spawn(read_frames(stream, shared.clone()));

    Ok(Arc::new(Session {
        out,
        shared,
        reader,
        writer,
    }))
}

enum PendingReply {
    Subscribe {
        key: DocumentKey,
        reply: Deferred<DocumentHandle>,
    },
    Submit {
        handle: DocumentHandle,
        patch: Value,
        reply: Deferred<u64>,
    },
}

impl PendingReply {
    fn reject(self, reason: &str) {
        match self {
            PendingReply::Subscribe { reply, .. } => {
                reply.reject(reason);
            }
            PendingReply::Submit { reply, .. } => {
                reply.reject(reason);
            }
        }
    }
}

enum DocSlot {
    Loading(Deferred<DocumentHandle>),
    Ready(DocumentHandle),
}

/// State shared between a session's callers and its reader task.
#[derive(Default)]
struct SessionShared {
    next_request: AtomicU64,
    pending: Mutex<HashMap<u64, PendingReply>>,
    /// Room name → handle, for routing remote ops
    live: Mutex<HashMap<String, DocumentHandle>>,
    docs: Mutex<HashMap<DocumentKey, DocSlot>>,
    degraded: AtomicBool,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionShared {
    fn request_id(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn reject_all(&self, reason: &str) {
        let pending: Vec<PendingReply> = locked(&self.pending).drain().map(|(_, p)| p).collect();
        for p in pending {
            p.reject(reason);
        }
    }

    fn route(&self, msg: DocMessage) {
        let room = RoomManager::room_name(&msg.collection, &msg.doc_id);
        match msg.kind {
            DocMessageKind::Snapshot => {
                let Some(PendingReply::Subscribe { key, reply }) = self.take(msg.request_id) else {
                    log::warn!("Unsolicited snapshot for {room}");
                    return;
                };
                match msg.json_payload() {
                    Ok(data) => {
                        let handle = DocumentHandle::new(key, msg.version, data);
                        locked(&self.live).insert(room, handle.clone());
                        reply.resolve(handle);
                    }
                    Err(e) => {
                        reply.reject(format!("malformed snapshot for {room}: {e}"));
                    }
                }
            }
            DocMessageKind::Ack => {
                let Some(PendingReply::Submit {
                    handle,
                    patch,
                    reply,
                }) = self.take(msg.request_id)
                else {
                    log::warn!("Unsolicited ack for {room}");
                    return;
                };
                handle.apply_local(msg.version, &patch);
                reply.resolve(msg.version);
            }
            DocMessageKind::Error => {
                let reason = msg.error_reason();
                match self.take(msg.request_id) {
                    Some(pending) => pending.reject(&reason),
                    None => log::warn!("Backend error for {room}: {reason}"),
                }
            }
            DocMessageKind::Op => {
                let Some(handle) = locked(&self.live).get(&room).cloned() else {
                    log::debug!("Op for unsubscribed document {room}");
                    return;
                };
                match msg.json_payload() {
                    Ok(patch) => {
                        if handle.apply_remote(msg.version, patch) {
                            log::trace!("Applied remote op to {room} (v{})", msg.version);
                        }
                    }
                    Err(e) => log::warn!("Malformed op for {room}: {e}"),
                }
            }
            DocMessageKind::Pong => log::trace!("Backend pong"),
            other => log::debug!("Ignoring unexpected {other:?} from backend"),
        }
    }

    fn take(&self, request_id: u64) -> Option<PendingReply> {
        locked(&self.pending).remove(&request_id)
    }
}

/// One open transport plus everything subscribed over it.
struct Session {
    out: mpsc::UnboundedSender<WsMessage>,
    shared: Arc<SessionShared>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Session {
    fn send(&self, msg: &DocMessage) -> Result<(), ConnectionError> {
        let frame = WsMessage::Binary(msg.encode()?.into());
        self.out.send(frame).map_err(|_| ConnectionError::Closed)
    }

    async fn document(
        &self,
        key: DocumentKey,
        timeout: Duration,
    ) -> Result<DocumentHandle, ConnectionError> {
        let (slot, owner) = {
            let mut docs = locked(&self.shared.docs);
            match docs.get(&key) {
                Some(DocSlot::Ready(handle)) => return Ok(handle.clone()),
                Some(DocSlot::Loading(slot)) => (slot.clone(), false),
                None => {
                    let slot = Deferred::with_timeout(timeout);
                    docs.insert(key.clone(), DocSlot::Loading(slot.clone()));
                    (slot, true)
                }
            }
        };

        let mut request_id = None;
        if owner {
            let id = self.shared.request_id();
            locked(&self.shared.pending).insert(
                id,
                PendingReply::Subscribe {
                    key: key.clone(),
                    reply: slot.clone(),
                },
            );
            log::debug!("Subscribing to {key}");
            if let Err(e) = self.send(&DocMessage::subscribe(id, key.collection(), &key.doc_id())) {
                slot.reject(e.to_string());
            }
            request_id = Some(id);
        }

        let outcome = slot.wait().await;

        {
            let mut docs = locked(&self.shared.docs);
            let ours = matches!(docs.get(&key), Some(DocSlot::Loading(s)) if s.same_as(&slot));
            if ours {
                match &outcome {
                    Ok(handle) => {
                        docs.insert(key.clone(), DocSlot::Ready(handle.clone()));
                    }
                    Err(_) => {
                        docs.remove(&key);
                    }
                }
            }
        }

        outcome.map_err(|e| {
            if let Some(id) = request_id {
                self.shared.take(id);
                log::warn!("Subscribing to {key} failed: {e}");
            }
            ConnectionError::from_reply(e)
        })
    }

    async fn submit(
        &self,
        handle: &DocumentHandle,
        patch: Value,
        timeout: Duration,
    ) -> Result<u64, ConnectionError> {
        let key = handle.key().clone();
        let cached = matches!(
            locked(&self.shared.docs).get(&key),
            Some(DocSlot::Ready(h)) if h.same_as(handle)
        );
        if !cached {
            return Err(ConnectionError::NotSubscribed(key.to_string()));
        }

        let id = self.shared.request_id();
        let doc_id = key.doc_id();
        let msg = DocMessage::submit(id, key.collection(), &doc_id, handle.version(), &patch)?;
        let reply = Deferred::with_timeout(timeout);
        locked(&self.shared.pending).insert(
            id,
            PendingReply::Submit {
                handle: handle.clone(),
                patch,
                reply: reply.clone(),
            },
        );
        if let Err(e) = self.send(&msg) {
            self.shared.take(id);
            return Err(e);
        }

        reply.wait().await.map_err(|e| {
            self.shared.take(id);
            ConnectionError::from_reply(e)
        })
    }

    async fn close(&self) {
        let _ = self.out.send(WsMessage::Close(None));
        self.shared.reject_all("connection closed");
        locked(&self.shared.live).clear();
        let slots: Vec<DocSlot> = locked(&self.shared.docs).drain().map(|(_, s)| s).collect();
        for slot in slots {
            if let DocSlot::Loading(pending) = slot {
                pending.reject("connection closed");
            }
        }
        // Give the writer a moment to flush the close frame.
        let _ = tokio::time::timeout(Duration::from_millis(250), async {
            while !self.writer.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        self.abort();
    }

    fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.abort();
    }
}

async fn write_frames(
    mut sink: SplitSink<WsStream, WsMessage>,
    mut rx: mpsc::UnboundedReceiver<WsMessage>,
) {
    while let Some(frame) = rx.recv().await {
        let closing = matches!(frame, WsMessage::Close(_));
        if let Err(e) = sink.send(frame).await {
            log::warn!("Realtime transport write failed: {e}");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_frames(mut stream: SplitStream<WsStream>, shared: Arc<SessionShared>) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(WsMessage::Binary(data))) => match DocMessage::decode(&data) {
                Ok(msg) => shared.route(msg),
                Err(e) => log::warn!("Undecodable backend frame: {e}"),
            },
            Some(Ok(WsMessage::Close(_))) | None => break "closed by backend".to_string(),
            Some(Ok(_)) => {}
            Some(Err(e)) => break e.to_string(),
        }
    };
    // The connection already settled; a later failure is only logged.
    log::warn!("Realtime connection degraded: {reason}");
    shared.degraded.store(true, Ordering::Release);
    shared.reject_all(&format!("connection lost: {reason}"));
}

//! In-memory reference document server.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (collection/doc_id) ── BroadcastGroup
//! Client B ──┘            │
//!                         └── StoredDoc { version, data }
//! ```
//!
//! Each connection authenticates with a bearer token during the WebSocket
//! upgrade, then subscribes to documents and submits JSON merge patches
//! against a base version. Accepted patches are acked to the submitter and
//! fanned out as ops to every other subscriber.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::broadcast::RoomManager;
use super::document::apply_merge_patch;
use super::wire::{DocMessage, DocMessageKind};

#[derive(Debug, Clone)]
pub struct DocServerConfig {
    pub bind_addr: String,
    /// Bearer token clients must present; `None` accepts any client.
    pub auth_token: Option<String>,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for DocServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            auth_token: None,
            broadcast_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    /// Subscribe requests served
    pub subscriptions: u64,
    /// Submits accepted
    pub submits: u64,
    pub conflicts: u64,
}

#[derive(Debug, Clone)]
struct StoredDoc {
    version: u64,
    data: Value,
}

type Documents = Arc<RwLock<HashMap<String, StoredDoc>>>;

/// The reference document server.
pub struct DocServer {
    config: DocServerConfig,
    docs: Documents,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl DocServer {
    pub fn new(config: DocServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            docs: Arc::new(RwLock::new(HashMap::new())),
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DocServerConfig::default())
    }

    /// Store `data` as version 1 of a document, replacing any previous one.
    pub async fn seed(&self, collection: &str, doc_id: &str, data: Value) {
        let room = RoomManager::room_name(collection, doc_id);
        self.docs.write().await.insert(room, StoredDoc { version: 1, data });
    }

    /// Seed from `{"<collection>": {"<doc id>": <document>, ...}, ...}`.
    /// Returns the number of documents stored.
    pub async fn seed_from_json(&self, seed: &Value) -> usize {
        let Some(collections) = seed.as_object() else {
            log::warn!("Document seed is not a JSON object; nothing loaded");
            return 0;
        };
        let mut count = 0;
        for (collection, docs) in collections {
            let Some(docs) = docs.as_object() else {
                log::warn!("Seed collection {collection} is not an object; skipped");
                continue;
            };
            for (doc_id, data) in docs {
                self.seed(collection, doc_id, data.clone()).await;
                count += 1;
            }
        }
        log::info!("Seeded {count} documents");
        count
    }

    /// Current version and snapshot of a document, if stored.
    pub async fn document(&self, collection: &str, doc_id: &str) -> Option<(u64, Value)> {
        let room = RoomManager::room_name(collection, doc_id);
        self.docs
            .read()
            .await
            .get(&room)
            .map(|d| (d.version, d.data.clone()))
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Document server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let conn = Connection {
                id: Uuid::new_v4(),
                addr,
                docs: self.docs.clone(),
                rooms: self.rooms.clone(),
                stats: self.stats.clone(),
                subscriptions: HashMap::new(),
            };
            let auth_token = self.config.auth_token.clone();
            tokio::spawn(async move {
                if let Err(e) = conn.run(stream, auth_token).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

fn bearer_matches(request: &Request, expected: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected)
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("invalid bearer token".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

type ConnError = Box<dyn std::error::Error + Send + Sync>;

/// One client connection.
struct Connection {
    id: Uuid,
    addr: SocketAddr,
    docs: Documents,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
    /// Room name → task forwarding that room's ops to this client
    subscriptions: HashMap<String, JoinHandle<()>>,
}

impl Connection {
    async fn run(mut self, stream: TcpStream, auth_token: Option<String>) -> Result<(), ConnError> {
        let mut authorized = true;
        let check = |request: &Request, response: Response| {
            if bearer_matches(request, auth_token.as_deref()) {
                Ok(response)
            } else {
                authorized = false;
                Err(unauthorized())
            }
        };
        let accepted = tokio_tungstenite::accept_hdr_async(stream, check).await;
        let ws_stream = match accepted {
            Ok(ws) => ws,
            Err(e) => {
                if !authorized {
                    log::warn!("Rejected connection from {}: invalid bearer token", self.addr);
                    self.stats.write().await.rejected_handshakes += 1;
                    return Ok(());
                }
                return Err(e.into());
            }
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("Document client {} connected from {}", self.id, self.addr);

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Ops from other clients, forwarded by the per-room tasks
        let (ops_tx, mut ops_rx) = mpsc::unbounded_channel::<Arc<Vec<u8>>>();

        let result: Result<(), ConnError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let request = match DocMessage::decode(&data) {
                                    Ok(request) => request,
                                    Err(e) => {
                                        let addr = self.addr;
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        continue;
                                    }
                                };
                                if let Some(reply) = self.handle(request, &ops_tx).await? {
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Document client {} disconnected", self.id);
                                return Ok(());
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {}: {e}", self.addr);
                                return Ok(());
                            }
                            Some(Ok(_)) => {}
                        }
                    }
                    Some(frame) = ops_rx.recv() => {
                        ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                    }
                }
            }
        }
        .await;

        self.cleanup().await;
        result
    }

    async fn handle(
        &mut self,
        request: DocMessage,
        ops_tx: &mpsc::UnboundedSender<Arc<Vec<u8>>>,
    ) -> Result<Option<DocMessage>, ConnError> {
        let reply = match request.kind {
            DocMessageKind::Subscribe => Some(self.subscribe(&request, ops_tx).await?),
            DocMessageKind::Unsubscribe => {
                let room = RoomManager::room_name(&request.collection, &request.doc_id);
                self.unsubscribe(&room).await;
                None
            }
            DocMessageKind::Submit => Some(self.submit(&request).await?),
            DocMessageKind::Ping => Some(DocMessage::pong()),
            other => {
                log::debug!("Unexpected {other:?} from client {}", self.id);
                Some(DocMessage::error(
                    request.request_id,
                    &request.collection,
                    &request.doc_id,
                    &format!("unexpected message kind {other:?}"),
                ))
            }
        };
        Ok(reply)
    }

    async fn subscribe(
        &mut self,
        request: &DocMessage,
        ops_tx: &mpsc::UnboundedSender<Arc<Vec<u8>>>,
    ) -> Result<DocMessage, ConnError> {
        let room = RoomManager::room_name(&request.collection, &request.doc_id);

        // Join the room before reading the snapshot so no op falls between.
        if !self.subscriptions.contains_key(&room) {
            let group = self.rooms.get_or_create(&room).await;
            let rx = group.add_subscriber(self.id).await;
            let task = tokio::spawn(forward_ops(self.id, rx, ops_tx.clone()));
            self.subscriptions.insert(room.clone(), task);
        }

        let (version, data) = self
            .docs
            .read()
            .await
            .get(&room)
            .map(|d| (d.version, d.data.clone()))
            .unwrap_or((0, Value::Null));

        self.stats.write().await.subscriptions += 1;
        log::debug!("Client {} subscribed to {room} at version {version}", self.id);

        Ok(DocMessage::snapshot(
            request.request_id,
            &request.collection,
            &request.doc_id,
            version,
            &data,
        )?)
    }

    async fn submit(&mut self, request: &DocMessage) -> Result<DocMessage, ConnError> {
        let (collection, doc_id) = (request.collection.as_str(), request.doc_id.as_str());
        let patch = match request.json_payload() {
            Ok(patch) => patch,
            Err(e) => {
                let reason = e.to_string();
                return Ok(DocMessage::error(request.request_id, collection, doc_id, &reason));
            }
        };
        let room = RoomManager::room_name(collection, doc_id);

        let new_version = {
            let mut docs = self.docs.write().await;
            let doc = docs.entry(room.clone()).or_insert(StoredDoc {
                version: 0,
                data: Value::Null,
            });
            if doc.version != request.version {
                let current = doc.version;
                drop(docs);
                self.stats.write().await.conflicts += 1;
                return Ok(DocMessage::error(
                    request.request_id,
                    collection,
                    doc_id,
                    &format!("version conflict: base {} but current {current}", request.version),
                ));
            }
            apply_merge_patch(&mut doc.data, &patch);
            doc.version += 1;
            doc.version
        };

        self.stats.write().await.submits += 1;

        if let Some(group) = self.rooms.get(&room).await {
            let op = DocMessage::op(collection, doc_id, new_version, &patch)?;
            group.broadcast(self.id, Arc::new(op.encode()?));
        }

        Ok(DocMessage::ack(request.request_id, collection, doc_id, new_version))
    }

    async fn unsubscribe(&mut self, room: &str) {
        if let Some(task) = self.subscriptions.remove(room) {
            task.abort();
        }
        if let Some(group) = self.rooms.get(room).await {
            group.remove_subscriber(&self.id).await;
        }
        self.rooms.remove_if_empty(room).await;
    }

    async fn cleanup(&mut self) {
        let rooms: Vec<String> = self.subscriptions.keys().cloned().collect();
        for room in rooms {
            self.unsubscribe(&room).await;
        }
        let mut s = self.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }
}

async fn forward_ops(
    conn_id: Uuid,
    mut rx: broadcast::Receiver<super::broadcast::RoomFrame>,
    ops_tx: mpsc::UnboundedSender<Arc<Vec<u8>>>,
) {
    loop {
        match rx.recv().await {
            Ok((origin, _)) if origin == conn_id => continue,
            Ok((_, frame)) => {
                if ops_tx.send(frame).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("Client {conn_id} lagged by {n} ops");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

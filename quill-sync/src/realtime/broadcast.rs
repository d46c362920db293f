//! Per-document fan-out of ops to subscribed connections.
//!
//! Every subscriber of a document shares one tokio broadcast channel. Frames
//! carry the id of the connection that caused them so receivers can skip
//! their own ops.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// A pre-encoded frame and the connection that produced it.
pub type RoomFrame = (Uuid, Arc<Vec<u8>>);

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_subscribers: usize,
}

/// Subscribers of a single document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<RoomFrame>,
    subscribers: RwLock<HashSet<Uuid>>,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is how many frames a slow subscriber may fall behind before
    /// it starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscribers: RwLock::new(HashSet::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    pub async fn add_subscriber(&self, conn_id: Uuid) -> broadcast::Receiver<RoomFrame> {
        self.subscribers.write().await.insert(conn_id);
        self.sender.subscribe()
    }

    pub async fn remove_subscriber(&self, conn_id: &Uuid) -> bool {
        self.subscribers.write().await.remove(conn_id)
    }

    /// Send to every subscriber, the origin included; filtering is the
    /// receiver's job. Returns the number of receivers.
    pub fn broadcast(&self, origin: Uuid, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send((origin, encoded)).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn has_subscriber(&self, conn_id: &Uuid) -> bool {
        self.subscribers.read().await.contains(conn_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_subscribers: self.subscriber_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps document room names to broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Room name for a document.
    pub fn room_name(collection: &str, doc_id: &str) -> String {
        format!("{collection}/{doc_id}")
    }

    pub async fn get(&self, room: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room).cloned()
    }

    pub async fn get_or_create(&self, room: &str) -> Arc<BroadcastGroup> {
        if let Some(group) = self.get(room).await {
            return group;
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone()
    }

    pub async fn remove_if_empty(&self, room: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(group) = rooms.get(room) {
            if group.subscriber_count().await == 0 {
                rooms.remove(room);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

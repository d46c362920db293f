//! Cached realtime documents and their logical keys.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

pub const PROJECTS_COLLECTION: &str = "projects";
pub const TEXTS_COLLECTION: &str = "texts";

/// One chapter of one book of a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterRef {
    pub project_id: String,
    /// Canonical book number (1 = Genesis).
    pub book: u32,
    pub chapter: u32,
}

impl ChapterRef {
    pub fn new(project_id: impl Into<String>, book: u32, chapter: u32) -> Self {
        Self {
            project_id: project_id.into(),
            book,
            chapter,
        }
    }
}

impl fmt::Display for ChapterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} book {} chapter {}", self.project_id, self.book, self.chapter)
    }
}

/// Logical cache key of a realtime document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DocumentKey {
    Project { project_id: String },
    Chapter(ChapterRef),
}

impl DocumentKey {
    pub fn project(project_id: impl Into<String>) -> Self {
        DocumentKey::Project {
            project_id: project_id.into(),
        }
    }

    pub fn collection(&self) -> &'static str {
        match self {
            DocumentKey::Project { .. } => PROJECTS_COLLECTION,
            DocumentKey::Chapter(_) => TEXTS_COLLECTION,
        }
    }

    /// Backend document id.
    pub fn doc_id(&self) -> String {
        match self {
            DocumentKey::Project { project_id } => project_id.clone(),
            DocumentKey::Chapter(r) => format!("{}:{}:{}:target", r.project_id, r.book, r.chapter),
        }
    }

    pub fn matches(&self, collection: &str, doc_id: &str) -> bool {
        self.collection() == collection && self.doc_id() == doc_id
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection(), self.doc_id())
    }
}

/// Project document metadata: which books and chapters exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMeta {
    pub name: String,
    #[serde(default)]
    pub short_name: String,
    #[serde(default)]
    pub texts: Vec<TextInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextInfo {
    pub book_num: u32,
    #[serde(default)]
    pub chapters: Vec<ChapterInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterInfo {
    pub number: u32,
    #[serde(default)]
    pub last_verse: u32,
}

impl ProjectMeta {
    pub fn has_chapter(&self, book: u32, chapter: u32) -> bool {
        self.texts
            .iter()
            .filter(|t| t.book_num == book)
            .any(|t| t.chapters.iter().any(|c| c.number == chapter))
    }
}

/// A change applied to a document by another client.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    pub version: u64,
    pub patch: Value,
}

#[derive(Debug)]
struct DocState {
    version: u64,
    data: Value,
}

struct DocumentInner {
    key: DocumentKey,
    state: RwLock<DocState>,
    changes: broadcast::Sender<RemoteChange>,
}

/// Shared handle to a subscribed document.
///
/// Clones refer to the same document; the connection manager keeps it
/// current as remote ops arrive.
#[derive(Clone)]
pub struct DocumentHandle {
    inner: Arc<DocumentInner>,
}

impl fmt::Debug for DocumentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentHandle")
            .field("key", &self.inner.key)
            .field("version", &self.version())
            .finish()
    }
}

impl DocumentHandle {
    pub(crate) fn new(key: DocumentKey, version: u64, data: Value) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(DocumentInner {
                key,
                state: RwLock::new(DocState { version, data }),
                changes,
            }),
        }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.inner.key
    }

    pub fn version(&self) -> u64 {
        self.read(|s| s.version)
    }

    /// Current snapshot. `Null` for a document the backend has never stored.
    pub fn data(&self) -> Value {
        self.read(|s| s.data.clone())
    }

    pub fn exists(&self) -> bool {
        self.read(|s| !s.data.is_null())
    }

    /// Interpret the snapshot as project metadata.
    pub fn project_meta(&self) -> Result<ProjectMeta, serde_json::Error> {
        serde_json::from_value(self.data())
    }

    /// Receive changes made by other clients.
    pub fn changes(&self) -> broadcast::Receiver<RemoteChange> {
        self.inner.changes.subscribe()
    }

    /// Whether both handles refer to the same cached document.
    pub fn same_as(&self, other: &DocumentHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Apply a patch acknowledged by the backend for our own submit.
    pub(crate) fn apply_local(&self, version: u64, patch: &Value) {
        self.write(|s| {
            apply_merge_patch(&mut s.data, patch);
            s.version = version;
        });
    }

    /// Apply an op from another client. Ops at or below the current version
    /// are duplicates and ignored.
    pub(crate) fn apply_remote(&self, version: u64, patch: Value) -> bool {
        let applied = self.write(|s| {
            if version <= s.version {
                return false;
            }
            apply_merge_patch(&mut s.data, &patch);
            s.version = version;
            true
        });
        if applied {
            // No receivers is fine.
            let _ = self.inner.changes.send(RemoteChange { version, patch });
        }
        applied
    }

    fn read<R>(&self, f: impl FnOnce(&DocState) -> R) -> R {
        f(&self.inner.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write<R>(&self, f: impl FnOnce(&mut DocState) -> R) -> R {
        f(&mut self.inner.state.write().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Apply a JSON merge patch (RFC 7386) in place.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                apply_merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

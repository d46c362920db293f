//! Realtime document backend: wire codec, client-side connection manager and
//! the in-memory reference server used by tests and `serve-docs`.

pub mod broadcast;
pub mod connection;
pub mod document;
pub mod server;
pub mod wire;

pub use connection::{ConnectionError, ConnectionManager, ConnectionState, ConnectionTimeouts};
pub use document::{
    ChapterInfo, ChapterRef, DocumentHandle, DocumentKey, ProjectMeta, RemoteChange, TextInfo,
    PROJECTS_COLLECTION, TEXTS_COLLECTION,
};
pub use server::{DocServer, DocServerConfig, ServerStats};
pub use wire::{DocMessage, DocMessageKind, WireError};

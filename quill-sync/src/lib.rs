//! # quill-sync: host ↔ worker synchronization for Quill
//!
//! The host process forks a worker, proves liveness in both directions with
//! a ping/pong handshake, then hands the worker credentials so it can hold
//! the realtime document connection on the host's behalf.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   JSON Lines (stdin/stdout)   ┌──────────────────┐
//! │ HostController   │ ◄───────────────────────────► │ Worker           │
//! │ + DirectoryCache │                               │ (state machine)  │
//! └────────┬─────────┘                               └────────┬─────────┘
//!          │ ControlPlaneServer  ◄── register/invoke ──        │
//!          │                                                   ▼
//!          │                                         ┌──────────────────┐
//!          │                                         │ConnectionManager │
//!          │                                         └────────┬─────────┘
//!          ▼                                                  │ WebSocket
//!   REST directory                                            ▼ bincode
//!                                                    ┌──────────────────┐
//!                                                    │ DocServer        │
//!                                                    └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`deferred`]: one-shot values with a deadline, awaited by many
//! - [`message`], [`ipc`], [`handshake`]: the IPC protocol and its gate
//! - [`worker`], [`host`], [`process`]: both ends of the channel
//! - [`control`], [`capabilities`]: the host's callable view of the worker
//! - [`realtime`]: document connection manager and reference server
//! - [`directory`]: throttled project directory cache

pub mod capabilities;
pub mod config;
pub mod control;
pub mod deferred;
pub mod directory;
pub mod exit;
pub mod handshake;
pub mod host;
pub mod ipc;
pub mod message;
pub mod process;
pub mod projects;
pub mod realtime;
pub mod worker;

pub use config::BridgeConfig;
pub use control::{
    CapabilityError, CapabilityHandler, ControlError, ControlFrame, ControlPlaneClient,
    ControlPlaneServer,
};
pub use deferred::{Deferred, DeferredError};
pub use directory::{
    CredentialProvider, DirectoryCache, DirectoryError, DraftStatus, HttpProjectDirectory,
    ProjectDescriptor, ProjectDirectory, ProjectSnapshot, StaticToken,
};
pub use exit::{ExitCode, ProcessExit, RecordingExit, Terminate};
pub use handshake::{Handshake, Outbox};
pub use host::{HostController, HostOptions};
pub use message::{Incoming, InitializeParams, Message, MessageBody, MessageKind, ProtocolError};
pub use process::{WorkerExit, WorkerProcess};
pub use projects::ProjectRequests;
pub use realtime::{ConnectionError, ConnectionManager, DocServer, DocumentHandle, DocumentKey};
pub use worker::{
    LiveServices, ServiceError, Worker, WorkerHandle, WorkerOptions, WorkerServices, WorkerState,
};

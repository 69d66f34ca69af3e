//! # gridsync-collab — real-time document collaboration hub
//!
//! Clients connect over WebSocket to `/ws/<doc_id>`. Every client of a
//! document shares one in-memory session; edits are applied to the
//! session's workbook and relayed to everyone, and the workbook is written
//! back to storage when the last client leaves.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   JSON envelopes   ┌─────────────┐     ┌─────────────────┐
//! │ Client      │ ◄────────────────► │ HubServer   │ ──► │ SessionRegistry │
//! │ (browser)   │   WebSocket text   │ (accept)    │     │ doc_id → session│
//! └─────────────┘                    └─────────────┘     └────────┬────────┘
//!                                                                 │
//!                                          ┌──────────────────────┴──┐
//!                                          │ DocumentSession         │
//!                                          │ revision, workbook,     │
//!                                          │ clients, broadcaster    │
//!                                          └──────────┬──────────────┘
//!                                                     │ last leave
//!                                                     ▼
//!                                          ┌─────────────────────────┐
//!                                          │ PersistenceGateway      │
//!                                          └─────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON envelopes on the wire
//! - [`session`] — per-document state and the edit protocol
//! - [`connection`] — transports, mailboxes, read/write loops, fan-out
//! - [`registry`] — single-flight session creation
//! - [`server`] — TCP accept and upgrade routing
//! - [`storage`] — RocksDB and in-memory document stores
//! - [`config`] — defaults and environment overrides

pub mod config;
pub mod connection;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use config::{HubConfig, ServerConfig};
pub use connection::{
    attach, fan_out, ChannelTransport, ClientConnection, ConnectionTasks, FanoutReport,
    Transport, WsTransport,
};
pub use error::{HubError, StoreError};
pub use identity::{generate_client_id, generate_id, NameGenerator};
pub use protocol::{Envelope, EnvelopeKind, RosterEntry};
pub use registry::SessionRegistry;
pub use server::{document_id, on_connect, HubServer};
pub use session::{Departure, DocumentSession, EditEffect, EditOutcome, Joined};
pub use storage::{
    DocumentMetadata, DocumentRecord, DocumentStore, MemoryStore, PersistenceGateway,
    StoreConfig,
};

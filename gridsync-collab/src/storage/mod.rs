//! Persistence gateway for collaborative documents.
//!
//! Architecture:
//! ```text
//! ┌─────────────────┐  load_config (first join)   ┌──────────────────┐
//! │ SessionRegistry │ ──────────────────────────► │ PersistenceGateway│
//! └─────────────────┘                             │                  │
//! ┌─────────────────┐  save_config (last leaves)  │  DocumentStore   │
//! │ DocumentSession │ ──────────────────────────► │  (RocksDB)       │
//! └─────────────────┘                             │  MemoryStore     │
//!                                                 └──────────────────┘
//! ```
//!
//! Configs cross this boundary as JSON text; the session owns the parsed
//! form. Gateway calls are blocking and run on tokio's blocking pool.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, DocumentRecord, DocumentStore, StoreConfig};

pub use crate::error::StoreError;

/// Durable document storage consumed by the hub.
pub trait PersistenceGateway: Send + Sync + 'static {
    /// Whether `doc_id` names a stored document.
    fn document_exists(&self, doc_id: &str) -> Result<bool, StoreError>;

    /// Stored config JSON. `StoreError::NotFound` for unknown ids.
    fn load_config(&self, doc_id: &str) -> Result<String, StoreError>;

    /// Replace the stored config JSON of an existing document.
    fn save_config(&self, doc_id: &str, config: &str) -> Result<(), StoreError>;
}

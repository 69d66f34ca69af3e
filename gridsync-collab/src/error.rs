//! Hub and storage errors.

use gridsync_core::SchemaError;

/// Persistence gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Compression error: {0}")]
    CompressionError(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(#[from] SchemaError),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Errors surfaced by sessions, connections and the server.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Flush of document {doc_id} failed after {attempts} attempts: {source}")]
    Flush {
        doc_id: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("Mailbox of client {0} is full")]
    MailboxFull(String),

    #[error("Client {0} is disconnected")]
    ClientGone(String),

    #[error("Send to client {0} timed out")]
    SendTimeout(String),

    #[error("Transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Document schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents` — workbook config JSON (LZ4 compressed), keyed by doc id
//! - `metadata`  — bincode `DocumentMetadata`, keyed by doc id
//!
//! Both families are written in one `WriteBatch` so a document never has a
//! config without metadata or the other way round.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use gridsync_core::{DocumentKind, WorkbookConfig};

use super::{PersistenceGateway, StoreError};
use crate::identity::{generate_id, ID_LENGTH};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write (default: true, flushes are rare and must stick)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("gridsync_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Per-document bookkeeping stored next to the config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: String,
    pub kind: DocumentKind,
    /// Number of times the config has been written since creation
    pub version: u64,
    /// Uncompressed config size in bytes
    pub config_size: u64,
    /// Compressed config size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: &str, kind: DocumentKind) -> Self {
        let now = unix_now();
        Self {
            doc_id: doc_id.to_string(),
            kind,
            version: 0,
            config_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// A stored document as the CRUD layer sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRecord {
    pub doc_id: String,
    pub kind: DocumentKind,
    pub config: String,
}

/// RocksDB document store.
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened document store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed by us
        opts.set_compression_type(DBCompressionType::None);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    // ─── Documents ────────────────────────────────────────────────────

    /// Create a document with a fresh random id and a blank workbook.
    pub fn create_document(&self, kind: DocumentKind) -> Result<DocumentRecord, StoreError> {
        let doc_id = loop {
            let candidate = generate_id(ID_LENGTH);
            if !self.document_exists(&candidate)? {
                break candidate;
            }
        };
        let config = WorkbookConfig::blank(doc_id.clone(), kind).to_json()?;
        self.insert_document(&doc_id, kind, &config)?;
        log::info!("Created {kind} document {doc_id}");
        Ok(DocumentRecord { doc_id, kind, config })
    }

    /// Store a document under a caller-chosen id, replacing any existing one.
    pub fn insert_document(
        &self,
        doc_id: &str,
        kind: DocumentKind,
        config: &str,
    ) -> Result<DocumentMetadata, StoreError> {
        self.write_config(DocumentMetadata::new(doc_id, kind), config)
    }

    /// Load a document with its kind.
    pub fn load_document(&self, doc_id: &str) -> Result<DocumentRecord, StoreError> {
        let meta = self.load_metadata(doc_id)?;
        let config = self.read_config(doc_id)?;
        Ok(DocumentRecord {
            doc_id: meta.doc_id,
            kind: meta.kind,
            config,
        })
    }

    /// Replace a document's config wholesale after checking it parses.
    pub fn update_config(&self, doc_id: &str, config: &str) -> Result<DocumentMetadata, StoreError> {
        WorkbookConfig::from_json(config)?;
        let meta = self.load_metadata(doc_id)?;
        self.write_config(meta, config)
    }

    /// Delete a document and its metadata. `StoreError::NotFound` for
    /// unknown ids.
    pub fn delete_document(&self, doc_id: &str) -> Result<(), StoreError> {
        if !self.document_exists(doc_id)? {
            return Err(StoreError::NotFound(doc_id.to_string()));
        }
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_docs, doc_id.as_bytes());
        batch.delete_cf(cf_meta, doc_id.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, doc_id: &str) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(doc_id.to_string())),
        }
    }

    /// All document ids in key order.
    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut doc_ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|_| StoreError::DeserializationError("Invalid document key".into()))?;
            doc_ids.push(id);
        }
        Ok(doc_ids)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn write_config(
        &self,
        mut meta: DocumentMetadata,
        config: &str,
    ) -> Result<DocumentMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(config.as_bytes());
        meta.config_size = config.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.version += 1;
        meta.updated_at = unix_now();

        let key = meta.doc_id.as_bytes().to_vec();
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, &key, &compressed);
        batch.put_cf(cf_meta, &key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    fn read_config(&self, doc_id: &str) -> Result<String, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let compressed = self
            .db
            .get_cf(cf, doc_id.as_bytes())?
            .ok_or_else(|| StoreError::NotFound(doc_id.to_string()))?;
        let bytes = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| StoreError::DeserializationError(e.to_string()))
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl PersistenceGateway for DocumentStore {
    fn document_exists(&self, doc_id: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(cf, doc_id.as_bytes())?.is_some())
    }

    fn load_config(&self, doc_id: &str) -> Result<String, StoreError> {
        self.read_config(doc_id)
    }

    fn save_config(&self, doc_id: &str, config: &str) -> Result<(), StoreError> {
        let meta = self.load_metadata(doc_id)?;
        self.write_config(meta, config)?;
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

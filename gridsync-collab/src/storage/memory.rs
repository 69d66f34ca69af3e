//! In-process document store.
//!
//! Backs `GRIDSYNC_IN_MEMORY=1` runs and the test suites. Every successful
//! save is also appended to a log so callers can assert on flushes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{PersistenceGateway, StoreError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<String, String>>,
    saves: Mutex<Vec<(String, String)>>,
    failures_remaining: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or replace) a document.
    pub fn insert(&self, doc_id: impl Into<String>, config: impl Into<String>) {
        lock(&self.documents).insert(doc_id.into(), config.into());
    }

    /// Current stored config.
    pub fn get(&self, doc_id: &str) -> Option<String> {
        lock(&self.documents).get(doc_id).cloned()
    }

    /// Every successful save as `(doc_id, config)`, oldest first.
    pub fn saves(&self) -> Vec<(String, String)> {
        lock(&self.saves).clone()
    }

    pub fn save_count(&self, doc_id: &str) -> usize {
        lock(&self.saves).iter().filter(|(id, _)| id == doc_id).count()
    }

    /// Make the next `n` saves fail with a database error.
    pub fn fail_next_saves(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }
}

impl PersistenceGateway for MemoryStore {
    fn document_exists(&self, doc_id: &str) -> Result<bool, StoreError> {
        Ok(lock(&self.documents).contains_key(doc_id))
    }

    fn load_config(&self, doc_id: &str) -> Result<String, StoreError> {
        self.get(doc_id)
            .ok_or_else(|| StoreError::NotFound(doc_id.to_string()))
    }

    fn save_config(&self, doc_id: &str, config: &str) -> Result<(), StoreError> {
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::DatabaseError("injected save failure".into()));
        }

        let mut documents = lock(&self.documents);
        let slot = documents
            .get_mut(doc_id)
            .ok_or_else(|| StoreError::NotFound(doc_id.to_string()))?;
        *slot = config.to_string();
        lock(&self.saves).push((doc_id.to_string(), config.to_string()));
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_requires_existing_document() {
        let store = MemoryStore::new();
        assert!(matches!(store.save_config("x", "{}"), Err(StoreError::NotFound(_))));

        store.insert("x", "{}");
        store.save_config("x", r#"{"a":1}"#).unwrap();
        assert_eq!(store.load_config("x").unwrap(), r#"{"a":1}"#);
        assert_eq!(store.save_count("x"), 1);
    }

    #[test]
    fn test_injected_failures() {
        let store = MemoryStore::new();
        store.insert("x", "{}");
        store.fail_next_saves(2);

        assert!(store.save_config("x", "1").is_err());
        assert!(store.save_config("x", "2").is_err());
        store.save_config("x", "3").unwrap();

        assert_eq!(store.saves(), vec![("x".to_string(), "3".to_string())]);
    }
}

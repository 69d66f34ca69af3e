//! Process-wide map from document id to live session.
//!
//! Each id owns a `OnceCell` slot. Concurrent first joins for the same id
//! all wait on the same initialisation, so a document is loaded from storage
//! at most once per session lifetime and every joiner ends up in the same
//! session. Sessions are never evicted.

use std::collections::HashMap;
use std::sync::Arc;

use gridsync_core::WorkbookConfig;
use tokio::sync::{OnceCell, RwLock};

use crate::config::HubConfig;
use crate::error::{HubError, StoreError};
use crate::identity::NameGenerator;
use crate::session::DocumentSession;
use crate::storage::PersistenceGateway;

type Slot = Arc<OnceCell<Arc<DocumentSession>>>;

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Slot>>,
    gateway: Arc<dyn PersistenceGateway>,
    config: HubConfig,
    names: NameGenerator,
}

impl SessionRegistry {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, config: HubConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            gateway,
            config,
            names: NameGenerator::new(),
        }
    }

    /// Display name for the next connecting client.
    pub fn next_client_name(&self) -> &'static str {
        self.names.next_name()
    }

    /// Return the live session for `doc_id`, loading it on first use.
    ///
    /// Fails with `DocumentNotFound` when storage has no such document; the
    /// empty slot is dropped so a later attempt loads again.
    pub async fn get_or_create(&self, doc_id: &str) -> Result<Arc<DocumentSession>, HubError> {
        let slot = self.slot(doc_id).await;
        let result = slot
            .get_or_try_init(|| self.load_session(doc_id))
            .await
            .cloned();

        if result.is_err() {
            let mut sessions = self.sessions.write().await;
            let stale = sessions
                .get(doc_id)
                .is_some_and(|current| Arc::ptr_eq(current, &slot) && current.get().is_none());
            if stale {
                sessions.remove(doc_id);
            }
        }
        result
    }

    async fn slot(&self, doc_id: &str) -> Slot {
        if let Some(slot) = self.sessions.read().await.get(doc_id) {
            return slot.clone();
        }
        self.sessions
            .write()
            .await
            .entry(doc_id.to_string())
            .or_default()
            .clone()
    }

    async fn load_session(&self, doc_id: &str) -> Result<Arc<DocumentSession>, HubError> {
        let gateway = self.gateway.clone();
        let id = doc_id.to_string();
        let raw = match tokio::task::spawn_blocking(move || gateway.load_config(&id)).await? {
            Ok(raw) => raw,
            Err(StoreError::NotFound(_)) => return Err(HubError::DocumentNotFound(doc_id.into())),
            Err(e) => return Err(e.into()),
        };

        let workbook = match WorkbookConfig::from_json(&raw) {
            Ok(workbook) => workbook,
            Err(e) => {
                log::warn!("Stored config of {doc_id} is unreadable, starting empty: {e}");
                WorkbookConfig {
                    id: doc_id.to_string(),
                    ..WorkbookConfig::default()
                }
            }
        };

        log::info!("Opened session for {doc_id}");
        Ok(Arc::new(DocumentSession::new(
            doc_id,
            workbook,
            self.gateway.clone(),
            self.config.clone(),
        )))
    }

    /// Live session for `doc_id`, if one is open.
    pub async fn get(&self, doc_id: &str) -> Option<Arc<DocumentSession>> {
        let slot = self.sessions.read().await.get(doc_id)?.clone();
        slot.get().cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    /// Config JSON as clients should see it now: the live session's workbook
    /// when one is open, otherwise what storage holds.
    pub async fn live_config(&self, doc_id: &str) -> Result<String, HubError> {
        if let Some(session) = self.get(doc_id).await {
            return session.config_json().await;
        }
        let gateway = self.gateway.clone();
        let id = doc_id.to_string();
        match tokio::task::spawn_blocking(move || gateway.load_config(&id)).await? {
            Ok(raw) => Ok(raw),
            Err(StoreError::NotFound(_)) => Err(HubError::DocumentNotFound(doc_id.into())),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether storage knows `doc_id`.
    pub async fn document_exists(&self, doc_id: &str) -> Result<bool, HubError> {
        let gateway = self.gateway.clone();
        let id = doc_id.to_string();
        Ok(tokio::task::spawn_blocking(move || gateway.document_exists(&id)).await??)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ChannelTransport;
    use crate::storage::MemoryStore;
    use gridsync_core::DocumentKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts loads so tests can assert single-flight initialisation.
    struct CountingStore {
        inner: MemoryStore,
        loads: AtomicUsize,
    }

    impl PersistenceGateway for CountingStore {
        fn document_exists(&self, doc_id: &str) -> Result<bool, StoreError> {
            self.inner.document_exists(doc_id)
        }

        fn load_config(&self, doc_id: &str) -> Result<String, StoreError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            self.inner.load_config(doc_id)
        }

        fn save_config(&self, doc_id: &str, config: &str) -> Result<(), StoreError> {
            self.inner.save_config(doc_id, config)
        }
    }

    fn registry_with(doc_id: &str) -> (Arc<SessionRegistry>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let workbook = WorkbookConfig::blank(doc_id, DocumentKind::Sheet);
        store.insert(doc_id, workbook.to_json().unwrap());
        let registry = SessionRegistry::new(store.clone(), HubConfig::default());
        (Arc::new(registry), store)
    }

    #[tokio::test]
    async fn test_same_id_same_session() {
        let (registry, _store) = registry_with("doc-1");
        let a = registry.get_or_create("doc-1").await.unwrap();
        let b = registry.get_or_create("doc-1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_joins_load_once() {
        let store = CountingStore {
            inner: MemoryStore::new(),
            loads: AtomicUsize::new(0),
        };
        store.inner.insert("doc-1", "{}");
        let store = Arc::new(store);
        let registry = Arc::new(SessionRegistry::new(store.clone(), HubConfig::default()));

        let joins = (0..8).map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get_or_create("doc-1").await.unwrap() })
        });
        let sessions: Vec<_> = futures_util::future::join_all(joins)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_document() {
        let (registry, store) = registry_with("doc-1");
        let err = registry.get_or_create("missing").await.unwrap_err();
        assert!(matches!(err, HubError::DocumentNotFound(id) if id == "missing"));
        assert!(registry.get("missing").await.is_none());

        // A document created afterwards opens normally.
        store.insert("missing", "{}");
        assert!(registry.get_or_create("missing").await.is_ok());
    }

    #[tokio::test]
    async fn test_unreadable_config_starts_empty() {
        let (registry, store) = registry_with("doc-1");
        store.insert("broken", "[1, 2");
        let session = registry.get_or_create("broken").await.unwrap();
        let workbook = session.config_snapshot().await;
        assert_eq!(workbook.id, "broken");
        assert!(workbook.sheets.is_empty());
    }

    #[tokio::test]
    async fn test_live_config_prefers_open_session() {
        let (registry, _store) = registry_with("doc-1");
        let stored = registry.live_config("doc-1").await.unwrap();

        let session = registry.get_or_create("doc-1").await.unwrap();
        let (transport, _frames) = ChannelTransport::new();
        let joined = session.join(transport, "Emma").await.unwrap();
        let edit = r#"{"actionData":{"actionName":"SetRangeDataAction","sheetId":"sheet-01","cellValue":{"3":{"1":{"v":"x"}}}}}"#;
        session
            .apply_edit(joined.connection.id(), edit.into())
            .await
            .unwrap();

        let live = registry.live_config("doc-1").await.unwrap();
        assert_ne!(live, stored);
        let workbook = WorkbookConfig::from_json(&live).unwrap();
        assert_eq!(workbook.cell("sheet-01", 3, 1).unwrap()["v"], "x");

        assert!(matches!(
            registry.live_config("nope").await,
            Err(HubError::DocumentNotFound(_))
        ));
    }
}

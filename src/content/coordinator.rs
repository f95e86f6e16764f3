//! Composes the content index and the registered storage backends.
//!
//! The coordinator exclusively owns the index row and the backend
//! object for a given key: writes route through the selector, reads
//! route by the `backend_id` recorded in the index, and deletion removes
//! the index row first so a racing read observes a miss.

use metrics::{counter, histogram};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use super::index::ContentIndex;
use super::Content;
use crate::metrics::{
    BACKEND_DELETE_DURATION_SECONDS, BACKEND_DELETE_TOTAL, BACKEND_ERROR_TOTAL,
    BACKEND_READ_DURATION_SECONDS, BACKEND_READ_TOTAL, BACKEND_WRITE_DURATION_SECONDS,
    BACKEND_WRITE_TOTAL,
};
use crate::storage::{BackendSelector, StorageBackend};

/// Owns content storage: the metadata index plus the byte backends.
pub struct StorageCoordinator {
    index: ContentIndex,
    backends: HashMap<String, Arc<dyn StorageBackend>>,
    selector: BackendSelector,
}

impl StorageCoordinator {
    pub fn new(
        index: ContentIndex,
        backends: Vec<Arc<dyn StorageBackend>>,
        selector: BackendSelector,
    ) -> Self {
        Self {
            index,
            backends: backends
                .into_iter()
                .map(|backend| (backend.backend_id().to_string(), backend))
                .collect(),
            selector,
        }
    }

    /// Load the full record for `key`.
    ///
    /// Any miss or failure resolves to the empty sentinel: the index row
    /// may be gone, the backend unknown (error-counted), or the backend
    /// read may fail (logged and error-counted). Callers translate the
    /// sentinel into a 404.
    pub async fn load(&self, key: &str) -> Content {
        let meta = match self.index.get(key) {
            Ok(Some(meta)) => meta,
            Ok(None) => return Content::empty(),
            Err(_) => return Content::empty(),
        };

        let backend_id = meta.backend_id.clone().unwrap_or_default();
        let Some(backend) = self.backends.get(&backend_id) else {
            counter!(BACKEND_ERROR_TOTAL, "backend" => backend_id.clone(), "operation" => "load")
                .increment(1);
            error!("content '{key}' is stored in an unknown backend '{backend_id}'");
            return Content::empty();
        };

        info!("loading '{key}' from the '{backend_id}' backend");
        counter!(BACKEND_READ_TOTAL, "backend" => backend_id.clone()).increment(1);
        let start = Instant::now();

        let result = backend.load(key).await;
        histogram!(BACKEND_READ_DURATION_SECONDS, "backend" => backend_id.clone())
            .record(start.elapsed().as_secs_f64());

        match result {
            Ok(Some(content)) => content,
            Ok(None) => Content::empty(),
            Err(err) => {
                counter!(BACKEND_ERROR_TOTAL, "backend" => backend_id, "operation" => "load")
                    .increment(1);
                error!("error loading content for '{key}': {err:#}");
                Content::empty()
            }
        }
    }

    /// Persist a record: run the selector, stamp the backend id, upsert
    /// the index, then write the bytes. The index is updated before the
    /// backend write; a crash in between leaves an orphan the audit can
    /// detect.
    pub async fn save(&self, content: &mut Content) -> anyhow::Result<()> {
        let backend_id = self.selector.select(content).to_string();
        content.backend_id = Some(backend_id.clone());

        let backend = self
            .backends
            .get(&backend_id)
            .ok_or_else(|| anyhow::anyhow!("selector chose unregistered backend '{backend_id}'"))?;

        self.index.put(content)?;

        counter!(BACKEND_WRITE_TOTAL, "backend" => backend_id.clone()).increment(1);
        let start = Instant::now();
        let result = backend.save(content.clone()).await;
        histogram!(BACKEND_WRITE_DURATION_SECONDS, "backend" => backend_id.clone())
            .record(start.elapsed().as_secs_f64());

        result.map_err(|err| {
            counter!(BACKEND_ERROR_TOTAL, "backend" => backend_id, "operation" => "save")
                .increment(1);
            err
        })
    }

    /// Destroy a record. The index row is removed first (it is the
    /// source of truth), then the backend copy.
    pub async fn delete(&self, content: &Content) -> anyhow::Result<()> {
        self.index.remove(&content.key)?;

        let backend_id = content.backend_id.clone().unwrap_or_default();
        let Some(backend) = self.backends.get(&backend_id) else {
            counter!(BACKEND_ERROR_TOTAL, "backend" => backend_id.clone(), "operation" => "delete")
                .increment(1);
            error!(
                "cannot delete '{}' from unknown backend '{backend_id}'",
                content.key
            );
            return Ok(());
        };

        counter!(BACKEND_DELETE_TOTAL, "backend" => backend_id.clone()).increment(1);
        let start = Instant::now();
        let result = backend.delete(&content.key).await;
        histogram!(BACKEND_DELETE_DURATION_SECONDS, "backend" => backend_id.clone())
            .record(start.elapsed().as_secs_f64());

        result.map_err(|err| {
            counter!(BACKEND_ERROR_TOTAL, "backend" => backend_id, "operation" => "delete")
                .increment(1);
            err
        })
    }

    /// Delete many keys. Keys present in the index are deleted normally;
    /// with `force`, keys missing from the index are deleted from every
    /// backend (used to clear orphans). Returns the number of records
    /// actually deleted.
    pub async fn bulk_delete(&self, keys: &[String], force: bool) -> usize {
        let mut deleted = 0;

        for key in keys {
            match self.index.get(key) {
                Ok(Some(meta)) => {
                    if self.delete(&meta).await.is_ok() {
                        deleted += 1;
                    }
                }
                Ok(None) if force => {
                    let mut removed = false;
                    for backend in self.backends.values() {
                        match backend.delete(key).await {
                            Ok(()) => removed = true,
                            Err(err) => {
                                error!(
                                    "forced delete of '{key}' failed on the '{}' backend: {err:#}",
                                    backend.backend_id()
                                );
                            }
                        }
                    }
                    if removed {
                        deleted += 1;
                    }
                }
                Ok(None) => {}
                Err(_) => {}
            }
        }

        deleted
    }

    /// Delete everything the index reports as expired, then refresh the
    /// stored-content gauges. Never propagates errors; background tasks
    /// must not abort the scheduler.
    pub async fn run_invalidation_and_record_metrics(&self) {
        match self.index.get_expired() {
            Ok(expired) => {
                for content in expired {
                    info!("expired: {}", content.key);
                    if let Err(err) = self.delete(&content).await {
                        error!("error deleting expired content '{}': {err:#}", content.key);
                    }
                }
            }
            Err(err) => {
                error!("error querying expired content: {err:#}");
            }
        }

        if let Err(err) = self.index.record_metrics() {
            error!("error refreshing content metrics: {err:#}");
        }
    }

    /// Compare each backend's key listing against the index and report
    /// orphans (present in the backend, absent from the index).
    pub async fn audit(&self) {
        info!("[audit] starting audit...");

        for backend in self.backends.values() {
            let backend_id = backend.backend_id();

            info!("[audit] listing content for backend '{backend_id}'");
            let keys = match backend.list_keys().await {
                Ok(keys) => keys,
                Err(err) => {
                    error!("[audit] error listing keys for backend '{backend_id}': {err:#}");
                    continue;
                }
            };
            info!("[audit] found {} entries for backend '{backend_id}'", keys.len());

            let orphans: Vec<String> = keys
                .into_iter()
                .filter(|key| matches!(self.index.get(key), Ok(None)))
                .collect();

            info!(
                "[audit] found {} records that exist in the '{backend_id}' backend but not the index: {}",
                orphans.len(),
                orphans.join(",")
            );
        }

        info!("[audit] finished audit");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::now_millis;
    use crate::storage::backend::BoxFuture;
    use bytes::Bytes;
    use std::sync::Mutex;

    /// Minimal in-memory backend for exercising the coordinator.
    struct MemoryBackend {
        id: String,
        records: Mutex<HashMap<String, Content>>,
    }

    impl MemoryBackend {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                records: Mutex::new(HashMap::new()),
            })
        }

        fn contains(&self, key: &str) -> bool {
            self.records.lock().unwrap().contains_key(key)
        }
    }

    impl StorageBackend for MemoryBackend {
        fn backend_id(&self) -> &str {
            &self.id
        }

        fn load(&self, key: &str) -> BoxFuture<'_, anyhow::Result<Option<Content>>> {
            let key = key.to_string();
            Box::pin(async move {
                Ok(self.records.lock().unwrap().get(&key).cloned().map(|mut c| {
                    c.backend_id = Some(self.id.clone());
                    c
                }))
            })
        }

        fn save(&self, content: Content) -> BoxFuture<'_, anyhow::Result<()>> {
            Box::pin(async move {
                self.records
                    .lock()
                    .unwrap()
                    .insert(content.key.clone(), content);
                Ok(())
            })
        }

        fn delete(&self, key: &str) -> BoxFuture<'_, anyhow::Result<()>> {
            let key = key.to_string();
            Box::pin(async move {
                self.records.lock().unwrap().remove(&key);
                Ok(())
            })
        }

        fn list(&self) -> BoxFuture<'_, anyhow::Result<Vec<Content>>> {
            Box::pin(async move {
                Ok(self
                    .records
                    .lock()
                    .unwrap()
                    .values()
                    .map(|c| {
                        let mut meta = c.clone();
                        meta.content = Bytes::new();
                        meta
                    })
                    .collect())
            })
        }

        fn list_keys(&self) -> BoxFuture<'_, anyhow::Result<Vec<String>>> {
            Box::pin(async move { Ok(self.records.lock().unwrap().keys().cloned().collect()) })
        }
    }

    fn coordinator(backend: Arc<MemoryBackend>) -> StorageCoordinator {
        StorageCoordinator::new(
            ContentIndex::new(":memory:").unwrap(),
            vec![backend],
            BackendSelector::Static("mem".to_string()),
        )
    }

    fn sample(key: &str, expiry: Option<i64>) -> Content {
        Content::new(
            key.to_string(),
            "text/plain".to_string(),
            expiry,
            now_millis(),
            None,
            "gzip".to_string(),
            Bytes::from_static(b"payload"),
        )
    }

    #[tokio::test]
    async fn test_save_then_load_roundtrip() {
        let backend = MemoryBackend::new("mem");
        let coordinator = coordinator(backend.clone());

        let mut content = sample("abc1234", None);
        coordinator.save(&mut content).await.unwrap();
        assert_eq!(content.backend_id.as_deref(), Some("mem"));

        let loaded = coordinator.load("abc1234").await;
        assert!(!loaded.is_absent());
        assert_eq!(loaded.content.as_ref(), b"payload");
    }

    #[tokio::test]
    async fn test_load_miss_is_empty_sentinel() {
        let backend = MemoryBackend::new("mem");
        let coordinator = coordinator(backend);
        assert!(coordinator.load("missing").await.is_absent());
    }

    #[tokio::test]
    async fn test_load_refuses_unknown_backend() {
        let backend = MemoryBackend::new("mem");
        let coordinator = coordinator(backend);

        // simulate an index row pointing at a backend that is no longer registered
        let mut content = sample("orphan1", None);
        content.backend_id = Some("gone".to_string());
        coordinator.index.put(&content).unwrap();

        assert!(coordinator.load("orphan1").await.is_absent());
    }

    #[tokio::test]
    async fn test_delete_removes_index_and_backend() {
        let backend = MemoryBackend::new("mem");
        let coordinator = coordinator(backend.clone());

        let mut content = sample("abc1234", None);
        coordinator.save(&mut content).await.unwrap();
        coordinator.delete(&content).await.unwrap();

        assert!(coordinator.load("abc1234").await.is_absent());
        assert!(!backend.contains("abc1234"));
    }

    #[tokio::test]
    async fn test_bulk_delete_counts_deletions() {
        let backend = MemoryBackend::new("mem");
        let coordinator = coordinator(backend.clone());

        for key in ["aaa0001", "aaa0002"] {
            let mut content = sample(key, None);
            coordinator.save(&mut content).await.unwrap();
        }

        let keys = vec![
            "aaa0001".to_string(),
            "aaa0002".to_string(),
            "missing".to_string(),
        ];
        let deleted = coordinator.bulk_delete(&keys, false).await;
        assert_eq!(deleted, 2);
    }

    #[tokio::test]
    async fn test_bulk_delete_force_clears_orphans() {
        let backend = MemoryBackend::new("mem");
        let coordinator = coordinator(backend.clone());

        // write straight to the backend so the index has no row
        backend.save(sample("orphan1", None)).await.unwrap();

        assert_eq!(
            coordinator
                .bulk_delete(&["orphan1".to_string()], false)
                .await,
            0
        );
        assert!(backend.contains("orphan1"));

        assert_eq!(
            coordinator.bulk_delete(&["orphan1".to_string()], true).await,
            1
        );
        assert!(!backend.contains("orphan1"));
    }

    #[tokio::test]
    async fn test_size_routing_survives_restart() {
        use crate::storage::local::LocalDiskBackend;

        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("bytebin.db");
        let db_path = db_path.to_str().unwrap();

        let selector = || BackendSelector::IfSizeGt {
            threshold_bytes: 64,
            backend_id: "big".to_string(),
            next: Box::new(BackendSelector::Static("small".to_string())),
        };
        let backends = || -> Vec<Arc<dyn StorageBackend>> {
            vec![
                Arc::new(LocalDiskBackend::new("big", dir.path().join("big")).unwrap()),
                Arc::new(LocalDiskBackend::new("small", dir.path().join("small")).unwrap()),
            ]
        };

        {
            let coordinator = StorageCoordinator::new(
                ContentIndex::new(db_path).unwrap(),
                backends(),
                selector(),
            );

            let mut big = sample("bigkey1", None);
            big.set_content(Bytes::from(vec![0u8; 128]));
            coordinator.save(&mut big).await.unwrap();
            assert_eq!(big.backend_id.as_deref(), Some("big"));

            let mut small = sample("smkey01", None);
            coordinator.save(&mut small).await.unwrap();
            assert_eq!(small.backend_id.as_deref(), Some("small"));
        }

        // a fresh coordinator over the same index file routes reads to
        // the backend recorded at write time
        let coordinator = StorageCoordinator::new(
            ContentIndex::new(db_path).unwrap(),
            backends(),
            selector(),
        );
        assert_eq!(coordinator.load("bigkey1").await.content.len(), 128);
        assert_eq!(
            coordinator.load("smkey01").await.content.as_ref(),
            b"payload"
        );
    }

    #[tokio::test]
    async fn test_invalidation_deletes_expired_records() {
        let backend = MemoryBackend::new("mem");
        let coordinator = coordinator(backend.clone());

        let mut expired = sample("expired", Some(now_millis() - 1_000));
        coordinator.save(&mut expired).await.unwrap();
        let mut alive = sample("alive01", Some(now_millis() + 60_000));
        coordinator.save(&mut alive).await.unwrap();

        coordinator.run_invalidation_and_record_metrics().await;

        assert!(coordinator.load("expired").await.is_absent());
        assert!(!backend.contains("expired"));
        assert!(!coordinator.load("alive01").await.is_absent());
    }
}

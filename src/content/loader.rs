//! Responsible for loading content, optionally with caching.
//!
//! Both loader modes share a pending-submission map: POST registers the
//! in-flight future for a new key before returning 201, so a GET racing
//! the durable save joins that future instead of hitting the backend
//! before the bytes exist. Entries are pruned once the record's
//! save-completion signal fires.

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use moka::future::Cache;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::coordinator::StorageCoordinator;
use super::{Content, MEGABYTE_LENGTH};

/// A joinable in-flight submission.
pub type PendingContent = Shared<BoxFuture<'static, Content>>;

/// Wrap a future into a [`PendingContent`] handle that any number of
/// readers can await.
pub fn pending_content<F>(future: F) -> PendingContent
where
    F: Future<Output = Content> + Send + 'static,
{
    future.boxed().shared()
}

/// Loads content, optionally through a cache.
pub trait ContentLoader: Send + Sync + 'static {
    /// Record a newly submitted entry so concurrent readers observe it
    /// immediately. The entry is dropped from the pending set once its
    /// save signal fires.
    fn put(&self, key: String, future: PendingContent);

    /// Get an entry, loading through the storage coordinator as needed.
    /// Resolves to the empty sentinel when the key is unknown.
    fn get(&self, key: &str) -> BoxFuture<'static, Content>;

    /// Drop any cached state for the given keys.
    fn invalidate(&self, keys: &[String]) -> BoxFuture<'static, ()>;
}

/// Pick a loader implementation from the cache configuration: both knobs
/// positive means cached, anything else means direct.
pub fn create(
    storage: Arc<StorageCoordinator>,
    cache_expiry_mins: u64,
    cache_max_size_mb: u64,
) -> Arc<dyn ContentLoader> {
    if cache_expiry_mins > 0 && cache_max_size_mb > 0 {
        Arc::new(CachedContentLoader::new(
            storage,
            cache_expiry_mins,
            cache_max_size_mb,
        ))
    } else {
        Arc::new(DirectContentLoader::new(storage))
    }
}

// -- Pending submissions ------------------------------------------------------

#[derive(Default)]
struct PendingMap {
    inner: Mutex<HashMap<String, PendingContent>>,
}

impl PendingMap {
    fn insert(&self, key: String, future: PendingContent) {
        self.inner.lock().expect("pending mutex poisoned").insert(key, future);
    }

    fn get(&self, key: &str) -> Option<PendingContent> {
        self.inner.lock().expect("pending mutex poisoned").get(key).cloned()
    }

    fn remove(&self, key: &str) {
        self.inner.lock().expect("pending mutex poisoned").remove(key);
    }
}

// -- Cached mode --------------------------------------------------------------

/// A [`ContentLoader`] backed by an in-memory cache.
///
/// The cache is bounded by total byte weight and expires entries a
/// fixed time after their last access. Concurrent gets for the same
/// missing key share a single coordinator load.
pub struct CachedContentLoader {
    storage: Arc<StorageCoordinator>,
    cache: Cache<String, Content>,
    pending: Arc<PendingMap>,
}

impl CachedContentLoader {
    fn new(storage: Arc<StorageCoordinator>, cache_expiry_mins: u64, cache_max_size_mb: u64) -> Self {
        let cache = Cache::builder()
            .time_to_idle(Duration::from_secs(cache_expiry_mins * 60))
            .max_capacity(cache_max_size_mb * MEGABYTE_LENGTH)
            .weigher(|_key, content: &Content| {
                content.content.len().try_into().unwrap_or(u32::MAX)
            })
            .build();
        Self {
            storage,
            cache,
            pending: Arc::new(PendingMap::default()),
        }
    }
}

impl ContentLoader for CachedContentLoader {
    fn put(&self, key: String, future: PendingContent) {
        self.pending.insert(key.clone(), future.clone());

        // once the content exists, cache it; once it is durably saved,
        // the pending entry is no longer needed
        let cache = self.cache.clone();
        let pending = self.pending.clone();
        tokio::spawn(async move {
            let content = future.await;
            cache.insert(key.clone(), content.clone()).await;
            content.save_signal().wait().await;
            pending.remove(&key);
        });
    }

    fn get(&self, key: &str) -> BoxFuture<'static, Content> {
        let key = key.to_string();
        let pending = self.pending.get(&key);
        let cache = self.cache.clone();
        let storage = self.storage.clone();

        async move {
            if let Some(future) = pending {
                return future.await;
            }
            let loader_key = key.clone();
            cache
                .get_with(key, async move { storage.load(&loader_key).await })
                .await
        }
        .boxed()
    }

    fn invalidate(&self, keys: &[String]) -> BoxFuture<'static, ()> {
        let keys = keys.to_vec();
        let cache = self.cache.clone();
        let pending = self.pending.clone();
        async move {
            for key in &keys {
                pending.remove(key);
                cache.invalidate(key).await;
            }
        }
        .boxed()
    }
}

// -- Direct mode --------------------------------------------------------------

/// A [`ContentLoader`] that makes requests directly to the storage
/// coordinator with no caching. Only the pending-save map is consulted,
/// to prevent read-after-write races before the save signal fires.
pub struct DirectContentLoader {
    storage: Arc<StorageCoordinator>,
    pending: Arc<PendingMap>,
}

impl DirectContentLoader {
    fn new(storage: Arc<StorageCoordinator>) -> Self {
        Self {
            storage,
            pending: Arc::new(PendingMap::default()),
        }
    }
}

impl ContentLoader for DirectContentLoader {
    fn put(&self, key: String, future: PendingContent) {
        // record while the save is in progress, then immediately remove
        self.pending.insert(key.clone(), future.clone());

        let pending = self.pending.clone();
        tokio::spawn(async move {
            let content = future.await;
            content.save_signal().wait().await;
            pending.remove(&key);
        });
    }

    fn get(&self, key: &str) -> BoxFuture<'static, Content> {
        let key = key.to_string();
        let pending = self.pending.get(&key);
        let storage = self.storage.clone();

        async move {
            if let Some(future) = pending {
                return future.await;
            }
            storage.load(&key).await
        }
        .boxed()
    }

    fn invalidate(&self, keys: &[String]) -> BoxFuture<'static, ()> {
        let keys = keys.to_vec();
        let pending = self.pending.clone();
        async move {
            for key in &keys {
                pending.remove(key);
            }
        }
        .boxed()
    }
}

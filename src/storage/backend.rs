//! Abstract storage backend trait.
//!
//! Every byte store must implement [`StorageBackend`]. The trait uses
//! `async_trait`-style methods (manual desugaring with pinned futures)
//! so it stays object-safe behind `Arc<dyn StorageBackend>`.

use std::future::Future;
use std::pin::Pin;

use crate::content::Content;

/// Boxed future returned by backend methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Async contract for persisting content records.
pub trait StorageBackend: Send + Sync + 'static {
    /// The id reads are routed by. Must be stable across restarts: the
    /// index stores it per record.
    fn backend_id(&self) -> &str;

    /// Load the full record for `key`, or `None` when it does not exist.
    fn load(&self, key: &str) -> BoxFuture<'_, anyhow::Result<Option<Content>>>;

    /// Persist a record. Overwrites any previous record for the key.
    fn save(&self, content: Content) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Delete the record for `key`. Deleting a missing key is not an
    /// error; backend operations must be idempotent and safe to retry.
    fn delete(&self, key: &str) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Enumerate every stored record, metadata only (bytes absent but
    /// `content_length` populated). Used to rebuild the index.
    fn list(&self) -> BoxFuture<'_, anyhow::Result<Vec<Content>>>;

    /// Enumerate every stored key. Cheaper than [`list`](Self::list);
    /// used by the audit task.
    fn list_keys(&self) -> BoxFuture<'_, anyhow::Result<Vec<String>>>;
}

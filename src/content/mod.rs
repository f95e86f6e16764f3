//! The content record shared across the engine.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;

pub mod coordinator;
pub mod housekeeper;
pub mod index;
pub mod io;
pub mod loader;

/// Number of bytes in a megabyte.
pub const MEGABYTE_LENGTH: u64 = 1024 * 1024;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// One-shot signal fulfilled after the first durable write for a record
/// has completed (on success or failure).
///
/// The signal is created when the record is submitted and cloned with it;
/// a GET that races the save can wait on it instead of hitting the
/// backend before the bytes exist.
#[derive(Clone, Default)]
pub struct SaveSignal {
    inner: Arc<SaveSignalInner>,
}

#[derive(Default)]
struct SaveSignalInner {
    done: AtomicBool,
    notify: Notify,
}

impl SaveSignal {
    /// Mark the save as complete and wake any waiters.
    pub fn complete(&self) {
        self.inner.done.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_complete(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }

    /// Wait until [`complete`](Self::complete) has been called.
    pub async fn wait(&self) {
        // register interest before re-checking the flag, otherwise a
        // completion between the check and the await would be missed
        let notified = self.inner.notify.notified();
        if self.is_complete() {
            return;
        }
        notified.await;
    }
}

impl std::fmt::Debug for SaveSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveSignal")
            .field("done", &self.is_complete())
            .finish()
    }
}

/// Encapsulates a piece of content within the service.
#[derive(Debug, Clone)]
pub struct Content {
    /// Unique alphanumeric key. Empty for the absent sentinel.
    pub key: String,
    /// Media type of the stored bytes.
    pub content_type: String,
    /// Absolute expiry instant in epoch millis; `None` means never.
    pub expiry: Option<i64>,
    /// Last modification instant in epoch millis.
    pub last_modified: i64,
    /// Whether the record may be replaced via UPDATE.
    pub modifiable: bool,
    /// 32-char modification key, present iff `modifiable`.
    pub auth_key: Option<String>,
    /// Comma-joined transport encoding list (e.g. `gzip`).
    pub encoding: String,
    /// Id of the backend currently holding the bytes.
    pub backend_id: Option<String>,
    /// Byte length of the full content, even when `content` is absent.
    pub content_length: u64,
    /// The stored bytes. May be empty when only metadata was loaded.
    pub content: Bytes,

    save_signal: SaveSignal,
}

impl Content {
    pub fn new(
        key: String,
        content_type: String,
        expiry: Option<i64>,
        last_modified: i64,
        auth_key: Option<String>,
        encoding: String,
        content: Bytes,
    ) -> Self {
        Self {
            key,
            content_type,
            expiry,
            last_modified,
            modifiable: auth_key.is_some(),
            auth_key,
            encoding,
            backend_id: None,
            content_length: content.len() as u64,
            content,
            save_signal: SaveSignal::default(),
        }
    }

    /// The sentinel returned when a key resolves to nothing.
    pub fn empty() -> Self {
        Self {
            key: String::new(),
            content_type: "text/plain".to_string(),
            expiry: None,
            last_modified: 0,
            modifiable: false,
            auth_key: None,
            encoding: String::new(),
            backend_id: None,
            content_length: 0,
            content: Bytes::new(),
            save_signal: SaveSignal::default(),
        }
    }

    /// Whether this record is the absent sentinel (or otherwise
    /// unservable: no key or no bytes).
    pub fn is_absent(&self) -> bool {
        self.key.is_empty() || self.content.is_empty()
    }

    /// Whether the record's expiry instant has passed.
    pub fn should_expire(&self, now: i64) -> bool {
        matches!(self.expiry, Some(expiry) if expiry < now)
    }

    /// Replace the stored bytes, keeping `content_length` in sync.
    pub fn set_content(&mut self, content: Bytes) {
        self.content_length = content.len() as u64;
        self.content = content;
    }

    pub fn save_signal(&self) -> &SaveSignal {
        &self.save_signal
    }
}

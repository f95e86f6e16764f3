//! Periodic housekeeping: content expiry and metrics collection.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use super::coordinator::StorageCoordinator;

/// Default delay before the first run, so startup work settles first.
const WARMUP: Duration = Duration::from_secs(60);

/// Scans the index for expired entries on a fixed cadence, deletes them,
/// and refreshes the stored-content gauges.
pub struct Housekeeper {
    storage: Arc<StorageCoordinator>,
    period: Duration,
    warmup: Duration,
}

impl Housekeeper {
    pub fn new(storage: Arc<StorageCoordinator>, period_mins: u64) -> Self {
        Self {
            storage,
            period: Duration::from_secs(period_mins.max(1) * 60),
            warmup: WARMUP,
        }
    }

    #[cfg(test)]
    fn with_periods(storage: Arc<StorageCoordinator>, period: Duration, warmup: Duration) -> Self {
        Self {
            storage,
            period,
            warmup,
        }
    }

    /// Spawn the background task. Each run swallows its own errors; the
    /// schedule never aborts.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(self.warmup).await;

            let mut interval = tokio::time::interval(self.period);
            loop {
                interval.tick().await;
                debug!("running housekeeping");
                self.storage.run_invalidation_and_record_metrics().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::index::ContentIndex;
    use crate::content::{now_millis, Content};
    use crate::storage::local::LocalDiskBackend;
    use crate::storage::BackendSelector;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_housekeeper_deletes_expired_content() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalDiskBackend::new("local", dir.path().join("content")).unwrap();
        let storage = Arc::new(StorageCoordinator::new(
            ContentIndex::new(":memory:").unwrap(),
            vec![Arc::new(backend)],
            BackendSelector::Static("local".to_string()),
        ));

        let mut expired = Content::new(
            "expired".to_string(),
            "text/plain".to_string(),
            Some(now_millis() - 1_000),
            now_millis(),
            None,
            "gzip".to_string(),
            Bytes::from_static(b"x"),
        );
        storage.save(&mut expired).await.unwrap();

        let handle = Housekeeper::with_periods(
            storage.clone(),
            Duration::from_millis(50),
            Duration::from_millis(10),
        )
        .start();

        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort();

        assert!(storage.load("expired").await.is_absent());
    }
}

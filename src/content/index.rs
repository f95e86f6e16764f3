//! SQLite-backed content index.
//!
//! The index is a database storing metadata about the content held in
//! the backends. It is merely an index and can be regenerated at any
//! time from the raw data: the primary use is to track expiry times and
//! to determine which backend to read from when content isn't already
//! cached in memory. It also drives the stored-content metrics.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite
//! library is required. All methods are synchronous rusqlite calls
//! executed under a `Mutex`; callers run on the blocking-capable side
//! of the engine.

use metrics::{counter, gauge, histogram};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{error, info};

use super::{now_millis, Content};
use crate::metrics::{
    DB_ERROR_TOTAL, DB_TRANSACTION_DURATION_SECONDS, STORED_CONTENT_COUNT, STORED_CONTENT_SIZE,
};
use crate::storage::StorageBackend;

/// Durable keyed store of content metadata (without bytes).
pub struct ContentIndex {
    conn: Mutex<Connection>,
    /// (content_type, backend) label pairs seen by previous metric
    /// refreshes, so gauges are zeroed when their rows disappear.
    seen_labels: Mutex<HashSet<(String, String)>>,
}

impl ContentIndex {
    /// Open (or create) the database at `path` and initialise the schema.
    ///
    /// Passing `":memory:"` creates an in-memory database (useful for
    /// tests).
    pub fn new(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let index = Self {
            conn: Mutex::new(conn),
            seen_labels: Mutex::new(HashSet::new()),
        };
        index.apply_pragmas()?;
        index.init_db()?;
        Ok(index)
    }

    /// Open the index at `path`, rebuilding it from the backends' own
    /// listings when no database file exists yet.
    pub async fn initialise(
        path: &str,
        backends: &[Arc<dyn StorageBackend>],
    ) -> anyhow::Result<Self> {
        let exists = path == ":memory:" || Path::new(path).exists();
        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent() {
                // sqlite won't create the directory itself
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let index = Self::new(path)?;
        if !exists {
            info!("rebuilding index, this may take a while...");
            for backend in backends {
                match backend.list().await {
                    Ok(records) => index.put_all(&records)?,
                    Err(err) => {
                        error!(
                            "error rebuilding index for {} backend: {err:#}",
                            backend.backend_id()
                        );
                    }
                }
            }
        }
        Ok(index)
    }

    fn apply_pragmas(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("index mutex poisoned");
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(())
    }

    /// Create the table and indexes if they do not already exist.
    /// Idempotent, safe to run on every startup.
    fn init_db(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("index mutex poisoned");
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS content (
                key            TEXT PRIMARY KEY,
                content_type   TEXT NOT NULL,
                expiry         INTEGER,
                last_modified  INTEGER NOT NULL,
                modifiable     INTEGER NOT NULL DEFAULT 0,
                auth_key       TEXT,
                encoding       TEXT NOT NULL DEFAULT '',
                backend_id     TEXT NOT NULL,
                content_length INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_content_type
                ON content(content_type);
            CREATE INDEX IF NOT EXISTS idx_content_expiry
                ON content(expiry);
            ",
        )?;
        Ok(())
    }

    /// Run `f` under the connection lock, recording the transaction
    /// duration and counting errors under the given operation label.
    fn timed<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> anyhow::Result<T> {
        let start = Instant::now();
        let mut conn = self.conn.lock().expect("index mutex poisoned");
        let result = f(&mut conn);
        histogram!(DB_TRANSACTION_DURATION_SECONDS, "operation" => operation)
            .record(start.elapsed().as_secs_f64());

        result.map_err(|err| {
            counter!(DB_ERROR_TOTAL, "operation" => operation).increment(1);
            error!("error performing sql operation '{operation}': {err}");
            err.into()
        })
    }

    /// Insert or update the metadata row for a record.
    pub fn put(&self, content: &Content) -> anyhow::Result<()> {
        self.timed("put", |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO content
                 (key, content_type, expiry, last_modified, modifiable,
                  auth_key, encoding, backend_id, content_length)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    content.key,
                    content.content_type,
                    content.expiry,
                    content.last_modified,
                    content.modifiable,
                    content.auth_key,
                    content.encoding,
                    content.backend_id.as_deref().unwrap_or(""),
                    content.content_length,
                ],
            )?;
            Ok(())
        })
    }

    /// Get the metadata row for `key`.
    pub fn get(&self, key: &str) -> anyhow::Result<Option<Content>> {
        self.timed("get", |conn| {
            conn.query_row(
                "SELECT key, content_type, expiry, last_modified, modifiable,
                        auth_key, encoding, backend_id, content_length
                 FROM content WHERE key = ?1",
                params![key],
                row_to_content,
            )
            .optional()
        })
    }

    /// Bulk insert, used when rebuilding the index from a backend scan.
    pub fn put_all(&self, records: &[Content]) -> anyhow::Result<()> {
        self.timed("put_all", |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR REPLACE INTO content
                     (key, content_type, expiry, last_modified, modifiable,
                      auth_key, encoding, backend_id, content_length)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )?;
                for content in records {
                    stmt.execute(params![
                        content.key,
                        content.content_type,
                        content.expiry,
                        content.last_modified,
                        content.modifiable,
                        content.auth_key,
                        content.encoding,
                        content.backend_id.as_deref().unwrap_or(""),
                        content.content_length,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Remove the row for `key`. Removal from the index is the source of
    /// truth for deletion.
    pub fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.timed("remove", |conn| {
            conn.execute("DELETE FROM content WHERE key = ?1", params![key])?;
            Ok(())
        })
    }

    /// Rows with a finite expiry instant in the past.
    pub fn get_expired(&self) -> anyhow::Result<Vec<Content>> {
        self.timed("get_expired", |conn| {
            let mut stmt = conn.prepare(
                "SELECT key, content_type, expiry, last_modified, modifiable,
                        auth_key, encoding, backend_id, content_length
                 FROM content WHERE expiry IS NOT NULL AND expiry < ?1",
            )?;
            let rows = stmt.query_map(params![now_millis()], row_to_content)?;
            rows.collect()
        })
    }

    fn grouped(&self, operation: &'static str, agg: &str) -> anyhow::Result<GroupedStats> {
        self.timed(operation, |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT content_type, backend_id, {agg}
                 FROM content GROUP BY content_type, backend_id"
            ))?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    (row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                    row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                ))
            })?;
            rows.collect()
        })
    }

    /// Refresh the stored-content gauges from the index, grouped by
    /// (content type, backend). Labels seen on a previous refresh that
    /// no longer have rows are explicitly zeroed.
    pub fn record_metrics(&self) -> anyhow::Result<()> {
        let counts = self.grouped("count_stats", "count(*)")?;
        let sizes = self.grouped("size_stats", "sum(content_length)")?;

        let mut seen = self.seen_labels.lock().expect("labels mutex poisoned");
        for (content_type, backend) in seen.iter() {
            if !counts.contains_key(&(content_type.clone(), backend.clone())) {
                gauge!(STORED_CONTENT_COUNT, "type" => content_type.clone(), "backend" => backend.clone())
                    .set(0.0);
                gauge!(STORED_CONTENT_SIZE, "type" => content_type.clone(), "backend" => backend.clone())
                    .set(0.0);
            }
        }

        for ((content_type, backend), count) in &counts {
            gauge!(STORED_CONTENT_COUNT, "type" => content_type.clone(), "backend" => backend.clone())
                .set(*count as f64);
            seen.insert((content_type.clone(), backend.clone()));
        }
        for ((content_type, backend), size) in &sizes {
            gauge!(STORED_CONTENT_SIZE, "type" => content_type.clone(), "backend" => backend.clone())
                .set(*size as f64);
        }

        Ok(())
    }
}

type GroupedStats = HashMap<(String, String), i64>;

fn row_to_content(row: &rusqlite::Row<'_>) -> rusqlite::Result<Content> {
    let key: String = row.get(0)?;
    let content_type: String = row.get(1)?;
    let expiry: Option<i64> = row.get(2)?;
    let last_modified: i64 = row.get(3)?;
    let modifiable: bool = row.get(4)?;
    let auth_key: Option<String> = row.get(5)?;
    let encoding: String = row.get(6)?;
    let backend_id: String = row.get(7)?;
    let content_length: i64 = row.get(8)?;

    let mut content = Content::new(
        key,
        content_type,
        expiry,
        last_modified,
        auth_key,
        encoding,
        bytes::Bytes::new(),
    );
    content.modifiable = modifiable;
    content.backend_id = Some(backend_id);
    content.content_length = content_length as u64;
    Ok(content)
}

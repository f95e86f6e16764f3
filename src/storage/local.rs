//! Local filesystem storage backend.
//!
//! One flat file per key under a configurable directory, encoded with
//! the versioned binary codec in [`crate::content::io`].
//!
//! Writes go to a temp file then rename, so a crash mid-write never
//! leaves a half-written record under its final name. Truncated or
//! otherwise unreadable files are corrupt: they are logged, deleted and
//! treated as missing.

use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::PathBuf;
use tracing::{info, warn};

use super::backend::{BoxFuture, StorageBackend};
use crate::content::{io as content_io, Content};

/// Stores content records as flat files on the local filesystem.
pub struct LocalDiskBackend {
    backend_id: String,
    content_path: PathBuf,
}

impl LocalDiskBackend {
    /// Create a backend rooted at `content_path`, creating the directory
    /// (and the `.tmp` staging directory) if needed.
    pub fn new(backend_id: impl Into<String>, content_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let content_path = content_path.into();
        std::fs::create_dir_all(&content_path)?;
        std::fs::create_dir_all(content_path.join(".tmp"))?;
        Ok(Self {
            backend_id: backend_id.into(),
            content_path,
        })
    }

    fn resolve(&self, key: &str) -> PathBuf {
        // keys are validated as alphanumeric before they reach storage,
        // so a plain join cannot traverse out of the content dir
        self.content_path.join(key)
    }

    fn temp_path(&self) -> PathBuf {
        self.content_path
            .join(".tmp")
            .join(format!("tmp-{}", uuid::Uuid::new_v4()))
    }

    fn load_sync(&self, key: &str, skip_content: bool) -> anyhow::Result<Option<Content>> {
        let path = self.resolve(key);
        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        match content_io::read(&mut BufReader::new(file), skip_content) {
            Ok(mut content) => {
                content.backend_id = Some(self.backend_id.clone());
                Ok(Some(content))
            }
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                // corrupt record, remove it so it never turns up again
                warn!("corrupted content file '{key}', deleting");
                if let Err(err) = std::fs::remove_file(&path) {
                    warn!("failed to delete corrupted file '{key}': {err}");
                }
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn save_sync(&self, content: &Content) -> anyhow::Result<()> {
        let final_path = self.resolve(&content.key);
        let tmp_path = self.temp_path();

        {
            let file = std::fs::File::create(&tmp_path)?;
            let mut out = BufWriter::new(file);
            content_io::write(content, &mut out)?;
            out.flush()?;
            out.get_ref().sync_all()?;
        }

        if final_path.exists() {
            info!("content file '{}' already exists, replacing", content.key);
        }
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }
}

impl StorageBackend for LocalDiskBackend {
    fn backend_id(&self) -> &str {
        &self.backend_id
    }

    fn load(&self, key: &str) -> BoxFuture<'_, anyhow::Result<Option<Content>>> {
        let key = key.to_string();
        Box::pin(async move { self.load_sync(&key, false) })
    }

    fn save(&self, content: Content) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move { self.save_sync(&content) })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, anyhow::Result<()>> {
        let key = key.to_string();
        Box::pin(async move {
            match std::fs::remove_file(self.resolve(&key)) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err.into()),
            }
        })
    }

    fn list(&self) -> BoxFuture<'_, anyhow::Result<Vec<Content>>> {
        Box::pin(async move {
            let mut records = Vec::new();
            for entry in std::fs::read_dir(&self.content_path)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let Some(key) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                match self.load_sync(&key, true) {
                    Ok(Some(content)) => records.push(content),
                    Ok(None) => {}
                    Err(err) => {
                        warn!("exception occurred loading meta for '{key}': {err:#}");
                    }
                }
            }
            Ok(records)
        })
    }

    fn list_keys(&self) -> BoxFuture<'_, anyhow::Result<Vec<String>>> {
        Box::pin(async move {
            let mut keys = Vec::new();
            for entry in std::fs::read_dir(&self.content_path)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    if let Some(key) = entry.file_name().to_str() {
                        keys.push(key.to_string());
                    }
                }
            }
            Ok(keys)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::now_millis;
    use bytes::Bytes;

    fn test_backend() -> (tempfile::TempDir, LocalDiskBackend) {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let backend = LocalDiskBackend::new("local", dir.path()).expect("failed to create backend");
        (dir, backend)
    }

    fn sample(key: &str) -> Content {
        Content::new(
            key.to_string(),
            "text/plain".to_string(),
            Some(now_millis() + 60_000),
            now_millis(),
            None,
            "gzip".to_string(),
            Bytes::from_static(b"stored bytes"),
        )
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let (_dir, backend) = test_backend();
        backend.save(sample("abc1234")).await.unwrap();

        let loaded = backend.load("abc1234").await.unwrap().unwrap();
        assert_eq!(loaded.key, "abc1234");
        assert_eq!(loaded.content.as_ref(), b"stored bytes");
        assert_eq!(loaded.backend_id.as_deref(), Some("local"));
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let (_dir, backend) = test_backend();
        assert!(backend.load("nothere").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let (_dir, backend) = test_backend();
        backend.save(sample("abc1234")).await.unwrap();

        let mut replacement = sample("abc1234");
        replacement.set_content(Bytes::from_static(b"new bytes"));
        backend.save(replacement).await.unwrap();

        let loaded = backend.load("abc1234").await.unwrap().unwrap();
        assert_eq!(loaded.content.as_ref(), b"new bytes");
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_dir, backend) = test_backend();
        backend.save(sample("abc1234")).await.unwrap();
        backend.delete("abc1234").await.unwrap();
        assert!(backend.load("abc1234").await.unwrap().is_none());
        backend.delete("abc1234").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_returns_metadata_only() {
        let (_dir, backend) = test_backend();
        backend.save(sample("k1aaaaa")).await.unwrap();
        backend.save(sample("k2bbbbb")).await.unwrap();

        let mut records = backend.list().await.unwrap();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key, "k1aaaaa");
        assert!(records[0].content.is_empty());
        assert_eq!(records[0].content_length, b"stored bytes".len() as u64);
        assert_eq!(records[0].backend_id.as_deref(), Some("local"));
    }

    #[tokio::test]
    async fn test_list_keys() {
        let (_dir, backend) = test_backend();
        backend.save(sample("k1aaaaa")).await.unwrap();
        backend.save(sample("k2bbbbb")).await.unwrap();

        let mut keys = backend.list_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["k1aaaaa".to_string(), "k2bbbbb".to_string()]);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_deleted_and_reported_missing() {
        let (dir, backend) = test_backend();
        backend.save(sample("corrupt1")).await.unwrap();

        // truncate the file to force an unexpected EOF mid-record
        let path = dir.path().join("corrupt1");
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 6]).unwrap();

        assert!(backend.load("corrupt1").await.unwrap().is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_list_skips_corrupt_files() {
        let (dir, backend) = test_backend();
        backend.save(sample("goodkey")).await.unwrap();
        std::fs::write(dir.path().join("badkey1"), b"\x00\x00").unwrap();

        let records = backend.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "goodkey");
    }
}

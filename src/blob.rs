//! Blob storage for attachment files.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use crate::error::StoreError;

/// Object storage collaborator.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Write `data` at `path`, replacing anything already there.
    async fn put(&self, path: &str, data: Vec<u8>) -> Result<(), StoreError>;

    /// Remove the blob at `path`. Removing a missing blob is not an error.
    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    /// Whether a blob exists at `path`.
    async fn exists(&self, path: &str) -> Result<bool, StoreError>;
}

/// In-memory blob store.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    failing_deletes: RwLock<usize>,
}

impl MemoryFileStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` deletes fail with [`StoreError::Unavailable`].
    pub fn fail_next_deletes(&self, times: usize) {
        *self.failing_deletes.write() = times;
    }

    /// Contents of a blob.
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.blobs.read().get(path).cloned()
    }

    /// Number of stored blobs.
    pub fn count(&self) -> usize {
        self.blobs.read().len()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn put(&self, path: &str, data: Vec<u8>) -> Result<(), StoreError> {
        self.blobs.write().insert(path.to_string(), data);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        {
            let mut failing = self.failing_deletes.write();
            if *failing > 0 {
                *failing -= 1;
                return Err(StoreError::Unavailable("simulated blob outage".into()));
            }
        }
        self.blobs.write().remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        Ok(self.blobs.read().contains_key(path))
    }
}

/// Blob store rooted in a local directory.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    /// Store blobs under `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a relative blob path, refusing anything that escapes the root.
    fn resolve(&self, path: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(path);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe || path.is_empty() {
            return Err(StoreError::Unavailable(format!("refusing blob path '{}'", path)));
        }
        Ok(self.root.join(relative))
    }
}

fn io_error(err: std::io::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn put(&self, path: &str, data: Vec<u8>) -> Result<(), StoreError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        tokio::fs::write(&target, data).await.map_err(io_error)
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(e)),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        let target = self.resolve(path)?;
        tokio::fs::try_exists(&target).await.map_err(io_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_failures_run_out() {
        let store = MemoryFileStore::new();
        store.put("a/b.txt", b"hi".to_vec()).await.unwrap();
        store.fail_next_deletes(1);

        assert!(store.delete("a/b.txt").await.is_err());
        assert!(store.exists("a/b.txt").await.unwrap());
        store.delete("a/b.txt").await.unwrap();
        assert!(!store.exists("a/b.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_local_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());

        store
            .put("attachments/2025/01/02/abc.txt", b"content".to_vec())
            .await
            .unwrap();
        assert!(store.exists("attachments/2025/01/02/abc.txt").await.unwrap());

        store.delete("attachments/2025/01/02/abc.txt").await.unwrap();
        assert!(!store.exists("attachments/2025/01/02/abc.txt").await.unwrap());
        // Deleting again is fine.
        store.delete("attachments/2025/01/02/abc.txt").await.unwrap();
    }

    #[tokio::test]
    async fn test_local_store_rejects_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());
        assert!(store.put("../outside.txt", vec![]).await.is_err());
        assert!(store.put("/etc/passwd", vec![]).await.is_err());
    }
}

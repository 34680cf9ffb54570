//! Storage backends for persisted blobs.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use fs2::FileExt;
use parking_lot::Mutex;

use crate::error::StorageError;

/// Minimal key/value contract the persistence layer needs.
///
/// No transactionality is assumed.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set_item(&self, key: &str, value: String) -> Result<(), StorageError>;
}

/// In-memory storage. Clones share the same map.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    items: Arc<Mutex<HashMap<String, String>>>,
    writes: Arc<Mutex<usize>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current raw value, bypassing the async API.
    pub fn snapshot(&self, key: &str) -> Option<String> {
        self.items.lock().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        self.items.lock().insert(key.into(), value.into());
    }

    /// Number of `set_item` calls so far.
    pub fn write_count(&self) -> usize {
        *self.writes.lock()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.snapshot(key))
    }

    async fn set_item(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.items.lock().insert(key.to_string(), value);
        *self.writes.lock() += 1;
        Ok(())
    }
}

/// One JSON file per key under a directory.
///
/// Each write goes to a temp file that is renamed over the blob, under an
/// exclusive lock on a sibling `.lock` file.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", file))
    }
}

fn read_file(path: &Path) -> Result<Option<String>, StorageError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

fn write_file(path: &Path, value: &str) -> Result<(), StorageError> {
    let io_err = |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    // Writers serialize on a sibling lock file; the blob itself is only ever
    // replaced by rename, so readers see the old or the new content.
    let lock = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path.with_extension("lock"))
        .map_err(io_err)?;
    lock.lock_exclusive().map_err(io_err)?;
    let _unlock = scopeguard::guard(&lock, |lock| {
        let _ = FileExt::unlock(lock);
    });

    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp).map_err(io_err)?;
    file.write_all(value.as_bytes()).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

#[async_trait]
impl Storage for FileStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key);
        tokio::task::spawn_blocking(move || read_file(&path))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
    }

    async fn set_item(&self, key: &str, value: String) -> Result<(), StorageError> {
        let path = self.path_for(key);
        tokio::task::spawn_blocking(move || write_file(&path, &value))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn memory_storage_round_trip() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get_item("k").await.unwrap(), None);
        storage.set_item("k", "v".to_string()).await.unwrap();
        assert_eq!(storage.get_item("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(storage.write_count(), 1);
    }

    #[tokio::test]
    async fn file_storage_missing_key_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path());
        assert_eq!(storage.get_item("app").await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_storage_overwrites_shorter_value() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path().join("nested"));
        storage.set_item("app", "a much longer value".to_string()).await.unwrap();
        storage.set_item("app", "short".to_string()).await.unwrap();
        assert_eq!(storage.get_item("app").await.unwrap().as_deref(), Some("short"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn readers_never_see_a_partial_blob() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path());
        let blob = |fill: char| fill.to_string().repeat(1 << 20);
        storage.set_item("app", blob('a')).await.unwrap();

        let writer = {
            let storage = storage.clone();
            tokio::spawn(async move {
                for round in 0..20 {
                    let fill = if round % 2 == 0 { 'b' } else { 'a' };
                    storage.set_item("app", blob(fill)).await.unwrap();
                }
            })
        };
        while !writer.is_finished() {
            let seen = storage.get_item("app").await.unwrap().unwrap();
            assert_eq!(seen.len(), 1 << 20);
            assert!(seen == blob('a') || seen == blob('b'));
        }
        writer.await.unwrap();
        assert!(!temp_dir.path().join("app.tmp").exists());
    }

    #[test]
    fn keys_are_sanitized() {
        let storage = FileStorage::new("/tmp/x");
        assert_eq!(storage.path_for("a/b:c"), PathBuf::from("/tmp/x/a_b_c.json"));
    }
}

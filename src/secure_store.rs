//! SecureStore — durable key material persistence (SPEC_FULL §6): namespaced
//! byte blobs (CA cert/key, leaf cert/key), single-writer, coalesced flush
//! every 60s plus a mandatory flush on shutdown. Grounds the file-tree layout
//! and write-then-rename durability pattern on the teacher's config loader
//! (`config/mod.rs`), which already treats the filesystem as the source of
//! truth for durable state.

use crate::error::{ClusterError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[async_trait]
pub trait SecureStore: Send + Sync {
    async fn read(&self, namespace: &str, name: &str) -> Result<Option<Vec<u8>>>;
    async fn write(&self, namespace: &str, name: &str, bytes: Vec<u8>) -> Result<()>;
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
    /// Forces any buffered writes to durable storage. Called on a 60s
    /// interval by callers that hold a long-lived handle, and mandatorily
    /// during shutdown (SPEC_FULL §5).
    async fn flush(&self) -> Result<()>;
}

fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// File-tree-backed implementation: `<root>/<namespace>/<name>`. Writes go
/// through a single-writer `Mutex` and land via write-to-temp-then-rename so
/// a crash mid-write never leaves a torn file. Every write is durable
/// immediately (there is nothing to coalesce on a local filesystem); `flush`
/// is a no-op kept to satisfy the trait's shutdown contract.
pub struct FileSecureStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FileSecureStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            lock: Mutex::new(()),
        }
    }

    fn path_for(&self, namespace: &str, name: &str) -> PathBuf {
        self.root.join(namespace).join(name)
    }
}

#[async_trait]
impl SecureStore for FileSecureStore {
    async fn read(&self, namespace: &str, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(namespace, name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ClusterError::Storage(format!(
                "read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn write(&self, namespace: &str, name: &str, bytes: Vec<u8>) -> Result<()> {
        let _guard = self.lock.lock().await;
        let dir = self.root.join(namespace);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ClusterError::Storage(format!("mkdir {}: {e}", dir.display())))?;

        let final_path = dir.join(name);
        let tmp_path = dir.join(format!("{name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| ClusterError::Storage(format!("create {}: {e}", tmp_path.display())))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| ClusterError::Storage(format!("write {}: {e}", tmp_path.display())))?;
        file.sync_all()
            .await
            .map_err(|e| ClusterError::Storage(format!("fsync {}: {e}", tmp_path.display())))?;

        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| ClusterError::Storage(format!("rename {}: {e}", final_path.display())))?;

        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.path_for(namespace, name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ClusterError::Storage(format!(
                "delete {}: {e}",
                path.display()
            ))),
        }
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory double for tests: no filesystem, no durability, instant reads.
pub struct InMemorySecureStore {
    data: DashMap<String, Vec<u8>>,
}

impl InMemorySecureStore {
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Snapshot for assertions in tests that want to check what was written.
    pub fn snapshot(&self) -> HashMap<String, Vec<u8>> {
        self.data
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

impl Default for InMemorySecureStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecureStore for InMemorySecureStore {
    async fn read(&self, namespace: &str, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(&key(namespace, name)).map(|v| v.clone()))
    }

    async fn write(&self, namespace: &str, name: &str, bytes: Vec<u8>) -> Result<()> {
        self.data.insert(key(namespace, name), bytes);
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.data.remove(&key(namespace, name));
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Spawns a background task that calls `store.flush()` every 60s until
/// `shutdown` fires, then flushes once more before returning. Intended to be
/// awaited during the orchestrator's shutdown sequence.
pub fn spawn_periodic_flush(
    store: Arc<dyn SecureStore>,
    shutdown: Arc<tokio::sync::Notify>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = store.flush().await {
                        tracing::warn!(error = %e, "secure_store: periodic flush failed");
                    }
                }
                _ = shutdown.notified() => {
                    if let Err(e) = store.flush().await {
                        tracing::warn!(error = %e, "secure_store: shutdown flush failed");
                    }
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_round_trip() {
        let store = InMemorySecureStore::new();
        assert!(store.read("cert", "ca-cert.pem").await.unwrap().is_none());
        store
            .write("cert", "ca-cert.pem", b"hello".to_vec())
            .await
            .unwrap();
        assert_eq!(
            store.read("cert", "ca-cert.pem").await.unwrap().unwrap(),
            b"hello"
        );
        store.delete("cert", "ca-cert.pem").await.unwrap();
        assert!(store.read("cert", "ca-cert.pem").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_survives_a_reload() {
        let dir = std::env::temp_dir().join(format!("securestore-test-{}", uuid::Uuid::new_v4()));
        let store = FileSecureStore::new(dir.clone());
        store
            .write("cert", "leaf-cert.json", b"{}".to_vec())
            .await
            .unwrap();

        let reloaded = FileSecureStore::new(dir.clone());
        assert_eq!(
            reloaded
                .read("cert", "leaf-cert.json")
                .await
                .unwrap()
                .unwrap(),
            b"{}"
        );

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}

//! Local filesystem blob backend.
//!
//! Blobs are stored as flat files under a configurable root directory,
//! with the blob key used directly as the file name.
//!
//! All writes follow crash-only design: write to a temp file, fsync, then
//! hard-link into place.  The link fails if the key is already bound, which
//! makes `put` create-only without a separate existence check.

use bytes::Bytes;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use tokio::io::AsyncWriteExt;

use super::backend::{content_hash, BlobStore, StoredBlob};

/// Stores blobs on the local filesystem.
pub struct LocalBlobStore {
    /// Root directory for all stored blobs.
    root: PathBuf,
}

impl LocalBlobStore {
    /// Create a new `LocalBlobStore` rooted at `root`.
    ///
    /// The directory (and its `.tmp` staging area) is created if missing.
    /// Temp files left behind by a crash are swept on startup.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let tmp = root.join(".tmp");
        if tmp.exists() {
            std::fs::remove_dir_all(&tmp)?;
        }
        std::fs::create_dir_all(&tmp)?;
        Ok(Self { root })
    }

    /// Resolve a blob key to an absolute file path, rejecting keys that
    /// could escape the root directory.
    fn resolve(&self, key: &str) -> anyhow::Result<PathBuf> {
        if key.is_empty() || key.starts_with('.') {
            anyhow::bail!("Invalid blob key: {key:?}");
        }
        for component in Path::new(key).components() {
            if !matches!(component, Component::Normal(_)) {
                anyhow::bail!("Path traversal detected in blob key: {key}");
            }
        }
        Ok(self.root.join(key))
    }

    /// Generate a temp file path under .tmp/ for atomic writes.
    fn temp_path(&self) -> PathBuf {
        let id = uuid::Uuid::new_v4();
        self.root.join(".tmp").join(format!("tmp-{id}"))
    }
}

impl BlobStore for LocalBlobStore {
    fn put(
        &self,
        key: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let final_path = self.resolve(&key)?;
            if let Some(parent) = final_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let hash = content_hash(&data);

            // Crash-only: temp-fsync-link pattern.
            let tmp_path = self.temp_path();
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            drop(file);

            let linked = tokio::fs::hard_link(&tmp_path, &final_path).await;
            let _ = tokio::fs::remove_file(&tmp_path).await;
            match linked {
                Ok(()) => Ok(hash),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    anyhow::bail!("Blob key already bound: {key}")
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StoredBlob>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let path = self.resolve(&key)?;
            let data = match tokio::fs::read(&path).await {
                Ok(data) => Bytes::from(data),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    anyhow::bail!("Blob not found at key: {key}")
                }
                Err(e) => return Err(e.into()),
            };
            let content_hash = content_hash(&data);
            Ok(StoredBlob { data, content_hash })
        })
    }

    fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let path = self.resolve(&key)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                // Idempotent: a missing file is already deleted.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn exists(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let path = self.resolve(&key)?;
            Ok(tokio::fs::metadata(&path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, LocalBlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path().join("blobs")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_and_get_roundtrip() {
        let (_dir, store) = test_store();
        let hash = store
            .put("20260101000000_abc_a.png", Bytes::from("pixels"))
            .await
            .unwrap();
        let blob = store.get("20260101000000_abc_a.png").await.unwrap();
        assert_eq!(blob.data, Bytes::from("pixels"));
        assert_eq!(blob.content_hash, hash);
    }

    #[tokio::test]
    async fn test_put_refuses_bound_key() {
        let (_dir, store) = test_store();
        store.put("k1", Bytes::from("first")).await.unwrap();
        let err = store.put("k1", Bytes::from("second")).await.unwrap_err();
        assert!(err.to_string().contains("already bound"));
        // Original content untouched.
        assert_eq!(store.get("k1").await.unwrap().data, Bytes::from("first"));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_dir, store) = test_store();
        store.put("k1", Bytes::from("x")).await.unwrap();
        assert!(store.exists("k1").await.unwrap());
        store.delete("k1").await.unwrap();
        store.delete("k1").await.unwrap();
        assert!(!store.exists("k1").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_missing_fails() {
        let (_dir, store) = test_store();
        assert!(store.get("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let (_dir, store) = test_store();
        assert!(store.put("../escape", Bytes::from("x")).await.is_err());
        assert!(store.put("/etc/passwd", Bytes::from("x")).await.is_err());
        assert!(store.put(".tmp/sneaky", Bytes::from("x")).await.is_err());
    }

    #[tokio::test]
    async fn test_no_temp_files_left_after_put() {
        let (dir, store) = test_store();
        store.put("k1", Bytes::from("x")).await.unwrap();
        let leftovers = std::fs::read_dir(dir.path().join("blobs/.tmp"))
            .unwrap()
            .count();
        assert_eq!(leftovers, 0);
    }
}

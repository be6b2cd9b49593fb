//! In-memory blob backend.
//!
//! Blobs are held in a `tokio::sync::RwLock<HashMap<...>>`.  A configurable
//! limit (`max_size_bytes`) caps total stored bytes; writes beyond it fail
//! the same way an exhausted remote store would.

use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use super::backend::{content_hash, BlobStore, StoredBlob};

/// In-memory blob backend.
#[derive(Default)]
pub struct MemoryBlobStore {
    /// key -> data.
    blobs: tokio::sync::RwLock<HashMap<String, Bytes>>,
    /// Maximum bytes allowed.  0 means unlimited.
    max_size_bytes: u64,
}

impl MemoryBlobStore {
    /// Create an unbounded store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that refuses writes beyond `max_size_bytes` in total.
    pub fn with_limit(max_size_bytes: u64) -> Self {
        Self {
            blobs: tokio::sync::RwLock::new(HashMap::new()),
            max_size_bytes,
        }
    }

    /// Snapshot of all bound keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.blobs.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Total bytes currently stored.
    pub async fn stored_bytes(&self) -> u64 {
        self.blobs
            .read()
            .await
            .values()
            .map(|data| data.len() as u64)
            .sum()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(
        &self,
        key: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut blobs = self.blobs.write().await;
            if blobs.contains_key(&key) {
                anyhow::bail!("Blob key already bound: {key}");
            }
            if self.max_size_bytes > 0 {
                let current: u64 = blobs.values().map(|d| d.len() as u64).sum();
                let additional = data.len() as u64;
                if current + additional > self.max_size_bytes {
                    anyhow::bail!(
                        "Memory limit exceeded: current={current}, additional={additional}, max={}",
                        self.max_size_bytes
                    );
                }
            }
            let hash = content_hash(&data);
            blobs.insert(key, data);
            Ok(hash)
        })
    }

    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StoredBlob>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let blobs = self.blobs.read().await;
            match blobs.get(&key) {
                Some(data) => Ok(StoredBlob {
                    data: data.clone(),
                    content_hash: content_hash(data),
                }),
                None => anyhow::bail!("Blob not found at key: {key}"),
            }
        })
    }

    fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.blobs.write().await.remove(&key);
            Ok(())
        })
    }

    fn exists(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move { Ok(self.blobs.read().await.contains_key(&key)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_get_roundtrip() {
        let store = MemoryBlobStore::new();
        let hash = store.put("a", Bytes::from("hello world")).await.unwrap();
        let blob = store.get("a").await.unwrap();
        assert_eq!(blob.data, Bytes::from("hello world"));
        assert_eq!(blob.content_hash, hash);
    }

    #[tokio::test]
    async fn test_put_refuses_bound_key() {
        let store = MemoryBlobStore::new();
        store.put("a", Bytes::from("1")).await.unwrap();
        assert!(store.put("a", Bytes::from("2")).await.is_err());
    }

    #[tokio::test]
    async fn test_limit_exceeded() {
        let store = MemoryBlobStore::with_limit(8);
        store.put("a", Bytes::from("12345")).await.unwrap();
        let err = store.put("b", Bytes::from("67890")).await.unwrap_err();
        assert!(err.to_string().contains("Memory limit exceeded"));
        assert_eq!(store.keys().await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_frees_capacity() {
        let store = MemoryBlobStore::with_limit(8);
        store.put("a", Bytes::from("12345")).await.unwrap();
        store.delete("a").await.unwrap();
        store.delete("a").await.unwrap();
        store.put("b", Bytes::from("67890")).await.unwrap();
        assert_eq!(store.stored_bytes().await, 5);
    }
}

//! Abstract blob store trait.
//!
//! Every blob backend must implement [`BlobStore`].  Keys are opaque
//! strings minted by [`super::keys`]; a key is written once and never
//! rebound to different content, so `put` refuses an existing key.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::pin::Pin;

/// A stored blob's data plus its content hash.
#[derive(Debug, Clone)]
pub struct StoredBlob {
    /// Raw bytes of the blob.
    pub data: Bytes,
    /// Hex-encoded SHA-256 of `data`.
    pub content_hash: String,
}

/// Async blob storage contract.
pub trait BlobStore: Send + Sync + 'static {
    /// Write `data` under a fresh `key`, returning the content hash.
    /// Fails if the key is already bound.
    fn put(
        &self,
        key: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>>;

    /// Read the full blob at `key`.
    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StoredBlob>> + Send + '_>>;

    /// Delete the blob at `key`.  Deleting an absent key succeeds.
    fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Check whether a blob exists at `key`.
    fn exists(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;
}

/// Hex-encoded SHA-256 of `data`.
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

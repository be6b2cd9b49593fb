//! Shared test fixtures: a seeded store, fake collaborators and
//! fault-injecting blob stores.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Duration;
use tempfile::TempDir;
use tokio::sync::{Barrier, Notify};

use crate::accounts::{Accounts, BcryptHasher, PasswordHasher};
use crate::audit::{AuditAction, AuditLogger};
use crate::auth::{AuthGuard, Identity, JwtCodec};
use crate::catalog::Catalog;
use crate::codec::{ImageCodec, MediaCodec};
use crate::config::VersionAssignment;
use crate::deletion::DeletionOrchestrator;
use crate::enrichment::{Classifier, EnrichmentQueue, EnrichmentWorker, Label};
use crate::metadata::sqlite::SqliteMetadataStore;
use crate::metadata::store::{
    AssetId, AssetTarget, MetadataStore, NewUser, UserRecord, VersionCommit,
};
use crate::sharing::Sharing;
use crate::storage::backend::{BlobStore, StoredBlob};
use crate::storage::keys::generate_blob_key;
use crate::storage::memory::MemoryBlobStore;
use crate::versions::VersionManager;

pub(crate) const ADMIN_PASSWORD: &str = "admin-password";
pub(crate) const EDITOR_PASSWORD: &str = "editor-password";
pub(crate) const VIEWER_PASSWORD: &str = "viewer-password";

/// Cheapest bcrypt cost; keeps the suite fast.
const TEST_BCRYPT_COST: u32 = 4;

/// A seeded SQLite store in a temp dir, an in-memory blob store and one
/// user per seeded role.  Setting up writes no audit entries.
pub(crate) struct TestEnv {
    pub dir: TempDir,
    pub sqlite: Arc<SqliteMetadataStore>,
    pub store: Arc<dyn MetadataStore>,
    pub memory_blobs: Arc<MemoryBlobStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub guard: AuthGuard,
    pub admin: UserRecord,
    pub editor: UserRecord,
    pub viewer: UserRecord,
}

impl TestEnv {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.db");
        let sqlite = Arc::new(SqliteMetadataStore::new(path.to_str().unwrap()).unwrap());
        let hasher = BcryptHasher::new(TEST_BCRYPT_COST);
        sqlite
            .seed_defaults("Admin", "admin@example.com", &hasher.hash(ADMIN_PASSWORD).unwrap())
            .unwrap();
        let store: Arc<dyn MetadataStore> = sqlite.clone();

        let admin = store
            .get_user_by_email("admin@example.com")
            .await
            .unwrap()
            .unwrap();
        let editor = create_user(&store, &hasher, "editor@example.com", EDITOR_PASSWORD, "Editor").await;
        let viewer = create_user(&store, &hasher, "viewer@example.com", VIEWER_PASSWORD, "Viewer").await;

        let memory_blobs = Arc::new(MemoryBlobStore::new());
        let blobs: Arc<dyn BlobStore> = memory_blobs.clone();
        let guard = AuthGuard::new(
            store.clone(),
            Arc::new(JwtCodec::new("test-secret")),
            "Admin",
            Duration::minutes(30),
        );

        Self {
            dir,
            sqlite,
            store,
            memory_blobs,
            blobs,
            guard,
            admin,
            editor,
            viewer,
        }
    }

    pub async fn identity(&self, user: &UserRecord) -> Identity {
        self.guard.identity_for(user).await.unwrap()
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.dir.path().join("scratch")
    }

    pub fn codec(&self) -> Arc<dyn MediaCodec> {
        Arc::new(ImageCodec::new(32))
    }

    pub fn audit(&self) -> AuditLogger {
        AuditLogger::new(self.store.clone())
    }

    pub fn accounts(&self) -> Accounts {
        Accounts::new(
            self.store.clone(),
            self.guard.clone(),
            self.audit(),
            Arc::new(BcryptHasher::new(TEST_BCRYPT_COST)),
            "Viewer",
            Duration::minutes(30),
            Some(Duration::days(30)),
        )
    }

    pub fn versions(&self) -> VersionManager {
        self.versions_with(self.blobs.clone(), VersionAssignment::Serialized)
    }

    pub fn versions_with(
        &self,
        blobs: Arc<dyn BlobStore>,
        assignment: VersionAssignment,
    ) -> VersionManager {
        VersionManager::new(
            self.store.clone(),
            blobs,
            self.codec(),
            self.guard.clone(),
            None,
            self.scratch_dir(),
            1 << 20,
            assignment,
        )
        .unwrap()
    }

    pub fn deletion(&self) -> DeletionOrchestrator {
        DeletionOrchestrator::new(
            self.store.clone(),
            self.blobs.clone(),
            self.guard.clone(),
            self.audit(),
        )
    }

    pub fn catalog(&self) -> Catalog {
        Catalog::new(
            self.store.clone(),
            self.blobs.clone(),
            self.guard.clone(),
            "http://localhost:8080/",
        )
    }

    pub fn sharing(&self) -> Sharing {
        Sharing::new(self.store.clone(), self.guard.clone(), self.audit(), self.catalog())
    }

    /// Start an enrichment queue whose worker holds its own connection.
    pub fn enrichment_queue(&self, classifier: Arc<dyn Classifier>) -> EnrichmentQueue {
        let store: Arc<dyn MetadataStore> = Arc::new(self.sqlite.reopen().unwrap());
        let worker = EnrichmentWorker::new(store, self.blobs.clone(), classifier, 0.6);
        EnrichmentQueue::start(worker, 16)
    }

    /// Commit a one-version asset owned by the editor, bypassing the
    /// version manager.  Returns the asset id and its blob key.
    pub async fn seed_asset(&self, filename: &str) -> (AssetId, String) {
        let blob_key = generate_blob_key(filename);
        let data = Bytes::from_static(b"seed content");
        let content_hash = self.blobs.put(&blob_key, data.clone()).await.unwrap();
        let committed = self
            .store
            .commit_version(VersionCommit {
                target: AssetTarget::New {
                    filename: filename.to_string(),
                    content_type: "image/png".to_string(),
                    owner_id: self.editor.user_id,
                },
                version_number: 1,
                blob_key: blob_key.clone(),
                thumbnail_key: None,
                content_hash,
                filesize: data.len() as u64,
                resolution: "Unknown".to_string(),
                duration: None,
                encoding: "png".to_string(),
                actor_id: Some(self.editor.user_id),
                audit_action: AuditAction::Upload.to_string(),
            })
            .await
            .unwrap();
        (committed.asset.asset_id, blob_key)
    }
}

async fn create_user(
    store: &Arc<dyn MetadataStore>,
    hasher: &BcryptHasher,
    email: &str,
    password: &str,
    role: &str,
) -> UserRecord {
    let role = store.get_role_by_name(role).await.unwrap().unwrap();
    store
        .create_user(NewUser {
            email: email.to_string(),
            password_hash: hasher.hash(password).unwrap(),
            role_id: role.role_id,
        })
        .await
        .unwrap()
}

// ── Fake collaborators ──────────────────────────────────────────────

/// Returns the same labels for any content.
pub(crate) struct StaticClassifier {
    labels: Vec<Label>,
}

impl StaticClassifier {
    pub fn new(labels: &[(&str, f32)]) -> Self {
        Self {
            labels: labels
                .iter()
                .map(|(name, confidence)| Label {
                    name: name.to_string(),
                    confidence: *confidence,
                })
                .collect(),
        }
    }
}

impl Classifier for StaticClassifier {
    fn classify(
        &self,
        _data: Bytes,
        _content_type: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<Label>>> + Send + '_>> {
        Box::pin(async move { Ok(self.labels.clone()) })
    }
}

// ── Fault-injecting blob stores ─────────────────────────────────────

fn is_thumbnail(key: &str) -> bool {
    key.contains(".thumb.")
}

/// Wraps a blob store and fails selected operations.
pub(crate) struct FailingBlobStore {
    inner: Arc<dyn BlobStore>,
    fail_puts: bool,
    fail_thumbnail_puts: bool,
    fail_deletes: bool,
}

impl FailingBlobStore {
    /// Every put fails.
    pub fn failing_puts() -> Self {
        Self {
            inner: Arc::new(MemoryBlobStore::new()),
            fail_puts: true,
            fail_thumbnail_puts: false,
            fail_deletes: false,
        }
    }

    /// Primary puts succeed, thumbnail puts fail.
    pub fn failing_thumbnails(inner: Arc<dyn BlobStore>) -> Self {
        Self {
            inner,
            fail_puts: false,
            fail_thumbnail_puts: true,
            fail_deletes: false,
        }
    }

    /// Every delete fails.
    pub fn failing_deletes(inner: Arc<dyn BlobStore>) -> Self {
        Self {
            inner,
            fail_puts: false,
            fail_thumbnail_puts: false,
            fail_deletes: true,
        }
    }
}

impl BlobStore for FailingBlobStore {
    fn put(
        &self,
        key: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        if self.fail_puts || (self.fail_thumbnail_puts && is_thumbnail(key)) {
            let key = key.to_string();
            return Box::pin(async move { anyhow::bail!("injected put failure for {key}") });
        }
        self.inner.put(key, data)
    }

    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StoredBlob>> + Send + '_>> {
        self.inner.get(key)
    }

    fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        if self.fail_deletes {
            let key = key.to_string();
            return Box::pin(async move { anyhow::bail!("injected delete failure for {key}") });
        }
        self.inner.delete(key)
    }

    fn exists(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        self.inner.exists(key)
    }
}

/// Holds the first `parties` primary puts at a barrier until all of them
/// have arrived, so concurrent writers overlap deterministically.
pub(crate) struct GatedBlobStore {
    inner: Arc<dyn BlobStore>,
    barrier: Barrier,
    remaining: AtomicUsize,
}

impl GatedBlobStore {
    pub fn new(inner: Arc<dyn BlobStore>, parties: usize) -> Self {
        Self {
            inner,
            barrier: Barrier::new(parties),
            remaining: AtomicUsize::new(parties),
        }
    }
}

impl BlobStore for GatedBlobStore {
    fn put(
        &self,
        key: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let gated = !is_thumbnail(&key)
                && self
                    .remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
            if gated {
                self.barrier.wait().await;
            }
            self.inner.put(&key, data).await
        })
    }

    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StoredBlob>> + Send + '_>> {
        self.inner.get(key)
    }

    fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        self.inner.delete(key)
    }

    fn exists(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        self.inner.exists(key)
    }
}

/// Parks the first primary put until [`PausingBlobStore::resume`] is
/// called, so a test can change metadata while an upload sits between
/// staging and commit.
pub(crate) struct PausingBlobStore {
    inner: Arc<dyn BlobStore>,
    reached: Notify,
    resumed: Notify,
    armed: AtomicUsize,
}

impl PausingBlobStore {
    pub fn new(inner: Arc<dyn BlobStore>) -> Self {
        Self {
            inner,
            reached: Notify::new(),
            resumed: Notify::new(),
            armed: AtomicUsize::new(1),
        }
    }

    /// Wait until the paused put has arrived.
    pub async fn paused(&self) {
        self.reached.notified().await;
    }

    pub fn resume(&self) {
        self.resumed.notify_one();
    }
}

impl BlobStore for PausingBlobStore {
    fn put(
        &self,
        key: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let pause = !is_thumbnail(&key)
                && self
                    .armed
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
            if pause {
                self.reached.notify_one();
                self.resumed.notified().await;
            }
            self.inner.put(&key, data).await
        })
    }

    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StoredBlob>> + Send + '_>> {
        self.inner.get(key)
    }

    fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        self.inner.delete(key)
    }

    fn exists(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        self.inner.exists(key)
    }
}

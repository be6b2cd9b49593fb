//! mediavault: digital asset version and storage-consistency engine.
//!
//! Asset content lives in a [`storage::backend::BlobStore`]; everything
//! describing it lives in a [`metadata::store::MetadataStore`].  The
//! [`versions::VersionManager`] and [`deletion::DeletionOrchestrator`] keep
//! the two consistent under partial failure, and every security- or
//! content-relevant action lands in the [`audit`] ledger.
//!
//! [`Vault`] wires all components together from a [`config::Config`].

use std::sync::Arc;

use tracing::info;

pub mod accounts;
pub mod audit;
pub mod auth;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod deletion;
pub mod enrichment;
pub mod errors;
pub mod metadata;
pub mod metrics;
pub mod sharing;
pub mod storage;
pub mod telemetry;
pub mod versions;

#[cfg(test)]
mod testutil;

use crate::accounts::{Accounts, BcryptHasher, PasswordHasher};
use crate::audit::AuditLogger;
use crate::auth::{AuthGuard, JwtCodec};
use crate::catalog::Catalog;
use crate::codec::{ImageCodec, MediaCodec};
use crate::config::Config;
use crate::deletion::DeletionOrchestrator;
use crate::enrichment::{Classifier, EnrichmentQueue, EnrichmentWorker};
use crate::errors::DamResult;
use crate::metadata::sqlite::SqliteMetadataStore;
use crate::metadata::store::MetadataStore;
use crate::sharing::Sharing;
use crate::storage::backend::BlobStore;
use crate::storage::local::LocalBlobStore;
use crate::storage::memory::MemoryBlobStore;
use crate::versions::VersionManager;

/// All engine components, sharing one metadata store and one blob store.
pub struct Vault {
    pub config: Config,
    pub store: Arc<dyn MetadataStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub guard: AuthGuard,
    pub audit: AuditLogger,
    pub accounts: Accounts,
    pub versions: VersionManager,
    pub deletion: DeletionOrchestrator,
    pub catalog: Catalog,
    pub sharing: Sharing,
    enrichment: Option<EnrichmentQueue>,
}

impl Vault {
    /// Open the stores named in `config`, seed roles and the bootstrap
    /// administrator, and start the enrichment worker when a classifier is
    /// supplied and enrichment is enabled.  Without a `codec`, an
    /// [`ImageCodec`] sized by `uploads.thumbnail_max_edge` is used.  Must
    /// run inside a tokio runtime.
    pub async fn open(
        config: Config,
        codec: Option<Arc<dyn MediaCodec>>,
        classifier: Option<Arc<dyn Classifier>>,
    ) -> anyhow::Result<Self> {
        if config.observability.metrics {
            crate::metrics::init_metrics()?;
        }

        let sqlite = SqliteMetadataStore::new(&config.metadata.sqlite.path)?;
        info!("Metadata store initialized at {}", config.metadata.sqlite.path);

        let hasher: Arc<dyn PasswordHasher> = Arc::new(BcryptHasher::default());
        let auth = &config.auth;
        if sqlite
            .get_user_by_email(&auth.bootstrap_admin_email)
            .await?
            .is_none()
        {
            let password = auth.bootstrap_admin_password.clone();
            let hasher = hasher.clone();
            let hash = tokio::task::spawn_blocking(move || hasher.hash(&password)).await??;
            sqlite.seed_defaults(&auth.admin_role, &auth.bootstrap_admin_email, &hash)?;
            info!("Default roles and bootstrap administrator seeded");
        } else {
            sqlite.seed_defaults(&auth.admin_role, &auth.bootstrap_admin_email, "")?;
        }

        let enrichment_store = sqlite.reopen()?;
        let store: Arc<dyn MetadataStore> = Arc::new(sqlite);

        let blobs: Arc<dyn BlobStore> = match config.storage.backend.as_str() {
            "memory" => {
                let max = config.storage.memory.max_size_bytes;
                info!("Memory blob store initialized (max_size_bytes={max})");
                if max > 0 {
                    Arc::new(MemoryBlobStore::with_limit(max))
                } else {
                    Arc::new(MemoryBlobStore::new())
                }
            }
            "local" => {
                let root = &config.storage.local.root_dir;
                let backend = LocalBlobStore::new(root)?;
                info!("Local blob store initialized at {root}");
                Arc::new(backend)
            }
            other => anyhow::bail!("unknown storage.backend '{other}' (expected local or memory)"),
        };

        let guard = AuthGuard::new(
            store.clone(),
            Arc::new(JwtCodec::new(&auth.token_secret)),
            auth.admin_role.clone(),
            chrono::Duration::minutes(auth.token_ttl_minutes),
        );
        let audit = AuditLogger::new(store.clone());
        let accounts = Accounts::new(
            store.clone(),
            guard.clone(),
            audit.clone(),
            hasher,
            auth.default_role.clone(),
            chrono::Duration::minutes(auth.reset_token_ttl_minutes),
            auth.api_credential_ttl_days.map(chrono::Duration::days),
        );

        let enrichment = match classifier {
            Some(classifier) if config.enrichment.enabled => {
                let worker = EnrichmentWorker::new(
                    Arc::new(enrichment_store),
                    blobs.clone(),
                    classifier,
                    config.enrichment.confidence_threshold,
                );
                info!(
                    capacity = config.enrichment.queue_capacity,
                    "Enrichment worker started"
                );
                Some(EnrichmentQueue::start(worker, config.enrichment.queue_capacity))
            }
            _ => None,
        };

        let codec = codec.unwrap_or_else(|| {
            Arc::new(ImageCodec::new(config.uploads.thumbnail_max_edge))
        });
        let versions = VersionManager::new(
            store.clone(),
            blobs.clone(),
            codec,
            guard.clone(),
            enrichment.clone(),
            &config.uploads.scratch_dir,
            config.uploads.max_upload_bytes,
            config.versioning.assignment,
        )?;
        let deletion =
            DeletionOrchestrator::new(store.clone(), blobs.clone(), guard.clone(), audit.clone());
        let catalog = Catalog::new(
            store.clone(),
            blobs.clone(),
            guard.clone(),
            &config.catalog.public_base_url,
        );
        let sharing = Sharing::new(store.clone(), guard.clone(), audit.clone(), catalog.clone());

        Ok(Self {
            config,
            store,
            blobs,
            guard,
            audit,
            accounts,
            versions,
            deletion,
            catalog,
            sharing,
            enrichment,
        })
    }

    /// Remove expired share links, API credentials and reset tokens.
    pub async fn purge_expired_capabilities(&self) -> DamResult<u64> {
        let removed = self
            .store
            .purge_expired_capabilities(chrono::Utc::now())
            .await?;
        info!(removed, "expired capabilities purged");
        Ok(removed)
    }

    /// Wait for queued enrichment jobs to finish.
    pub async fn flush_enrichment(&self) {
        if let Some(queue) = &self.enrichment {
            queue.flush().await;
        }
    }

    /// Drain and stop background work.
    pub async fn shutdown(&self) {
        if let Some(queue) = &self.enrichment {
            queue.shutdown().await;
        }
        info!("mediavault shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credential;
    use crate::metadata::store::AssetFilter;
    use crate::testutil::StaticClassifier;

    fn test_config(dir: &tempfile::TempDir) -> Config {
        let yaml = format!(
            r#"
metadata:
  sqlite:
    path: "{root}/meta/metadata.db"
storage:
  backend: local
  local:
    root_dir: "{root}/blobs"
uploads:
  scratch_dir: "{root}/scratch"
auth:
  token_secret: "vault-test"
  bootstrap_admin_email: "root@example.com"
  bootstrap_admin_password: "root-password"
observability:
  metrics: false
"#,
            root = dir.path().display()
        );
        config::parse_config(&yaml).unwrap()
    }

    #[tokio::test]
    async fn test_vault_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open(
            test_config(&dir),
            None,
            Some(Arc::new(StaticClassifier::new(&[("Sunset", 0.99)]))),
        )
        .await
        .unwrap();

        let session = vault
            .accounts
            .login("root@example.com", "root-password")
            .await
            .unwrap();
        let admin = vault
            .guard
            .authenticate(&Credential::Bearer(session.bearer_token))
            .await
            .unwrap();

        let png = crate::codec::tests::png(20, 10);
        let committed = vault
            .versions
            .create_version(&admin, None, "sunset.png", "image/png", &png[..])
            .await
            .unwrap();
        let asset_id = committed.asset.asset_id;
        vault.flush_enrichment().await;

        let found = vault
            .catalog
            .search(&admin, AssetFilter::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].tags, vec!["sunset"]);
        assert_eq!(found[0].metadata.as_ref().unwrap().resolution, "20x10");

        let download = vault.catalog.download_latest(&admin, asset_id).await.unwrap();
        assert_eq!(download.data, png);

        vault.deletion.delete_asset(&admin, asset_id).await.unwrap();
        assert!(vault
            .catalog
            .search(&admin, AssetFilter::default())
            .await
            .unwrap()
            .is_empty());
        assert!(!vault.blobs.exists(&committed.version.blob_key).await.unwrap());

        let csv = vault.audit.export_csv(None).await.unwrap();
        assert!(csv.contains("LOGIN_SUCCESS"));
        assert!(csv.contains(&format!("DELETE_ASSET_{asset_id}")));

        vault.shutdown().await;
    }

    #[tokio::test]
    async fn test_vault_reopen_keeps_bootstrap_admin() {
        let dir = tempfile::tempdir().unwrap();
        let first = Vault::open(test_config(&dir), None, None)
            .await
            .unwrap();
        drop(first);
        let vault = Vault::open(test_config(&dir), None, None)
            .await
            .unwrap();
        vault
            .accounts
            .login("root@example.com", "root-password")
            .await
            .unwrap();
        assert_eq!(vault.purge_expired_capabilities().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_backend_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.storage.backend = "tape".to_string();
        assert!(Vault::open(config, None, None).await.is_err());
    }

    #[tokio::test]
    async fn test_default_codec_uses_configured_thumbnail_edge() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.uploads.thumbnail_max_edge = 4;
        let vault = Vault::open(config, None, None).await.unwrap();
        let session = vault
            .accounts
            .login("root@example.com", "root-password")
            .await
            .unwrap();
        let admin = vault
            .guard
            .authenticate(&Credential::Bearer(session.bearer_token))
            .await
            .unwrap();

        let png = crate::codec::tests::png(20, 10);
        let committed = vault
            .versions
            .create_version(&admin, None, "wide.png", "image/png", &png[..])
            .await
            .unwrap();
        let thumbnail_key = committed.version.thumbnail_key.unwrap();
        let thumbnail = vault.blobs.get(&thumbnail_key).await.unwrap();
        let preview = image::load_from_memory(&thumbnail.data).unwrap();
        assert_eq!((preview.width(), preview.height()), (4, 2));
    }
}

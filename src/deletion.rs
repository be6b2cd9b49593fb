//! Asset removal across both stores.
//!
//! The asset row and its latest version reference each other, so the
//! pointer is nulled in its own commit before the asset row goes.  Blob
//! deletes come first and are best-effort; a blob that survives is logged
//! and counted as an orphan.

use std::sync::Arc;

use tracing::{info, warn};

use crate::audit::{AuditAction, AuditLogger};
use crate::auth::{AuthGuard, Identity};
use crate::errors::{DamError, DamResult};
use crate::metadata::store::{AssetId, MetadataStore};
use crate::metrics::{record_asset_deleted, record_orphan_blob};
use crate::storage::backend::BlobStore;

/// What a deletion removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletionReport {
    pub versions: usize,
    pub blobs_removed: usize,
    pub blobs_orphaned: usize,
    /// False if the asset row was already gone when step 3 ran.
    pub row_removed: bool,
}

pub struct DeletionOrchestrator {
    store: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    guard: AuthGuard,
    audit: AuditLogger,
}

impl DeletionOrchestrator {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        guard: AuthGuard,
        audit: AuditLogger,
    ) -> Self {
        Self {
            store,
            blobs,
            guard,
            audit,
        }
    }

    /// Remove an asset, all its versions and their blobs.  The caller
    /// must own the asset or hold the administrative role.
    pub async fn delete_asset(
        &self,
        actor: &Identity,
        asset_id: AssetId,
    ) -> DamResult<DeletionReport> {
        let asset = self
            .store
            .get_asset(asset_id)
            .await?
            .ok_or_else(|| DamError::not_found(format!("asset {asset_id}")))?;
        if asset.owner_id != actor.user_id && !self.guard.is_admin(actor) {
            return Err(DamError::authorization("asset", "delete"));
        }

        let versions = self.store.list_versions(asset_id).await?;
        let mut blobs_removed = 0;
        let mut blobs_orphaned = 0;
        for version in &versions {
            let keys = std::iter::once(&version.blob_key).chain(version.thumbnail_key.as_ref());
            for key in keys {
                match self.blobs.delete(key).await {
                    Ok(()) => blobs_removed += 1,
                    Err(e) => {
                        blobs_orphaned += 1;
                        record_orphan_blob();
                        warn!(asset_id, blob_key = %key, error = %e, "blob delete failed, orphan left behind");
                    }
                }
            }
        }

        let row_removed = self.purge_asset_rows(asset_id).await?;
        self.audit
            .record(Some(actor.user_id), None, AuditAction::DeleteAsset(asset_id))
            .await?;
        record_asset_deleted();
        info!(
            asset_id,
            versions = versions.len(),
            blobs_removed,
            blobs_orphaned,
            "asset deleted"
        );

        Ok(DeletionReport {
            versions: versions.len(),
            blobs_removed,
            blobs_orphaned,
            row_removed,
        })
    }

    /// Null the latest pointer, then delete the asset row and everything
    /// cascading from it.  Safe to repeat; returns false once nothing is
    /// left to remove.
    pub async fn purge_asset_rows(&self, asset_id: AssetId) -> DamResult<bool> {
        self.store.clear_latest_version(asset_id).await?;
        Ok(self.store.delete_asset(asset_id).await?)
    }
}

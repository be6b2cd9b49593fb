//! Share links: opaque tokens granting read or download access to a fixed
//! set of assets, independent of roles.
//!
//! Expiry is checked on every access.  A link can never upload or delete.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::audit::{AuditAction, AuditLogger};
use crate::auth::{new_capability_token, AuthGuard, Identity, ASSET_RESOURCE};
use crate::catalog::{AssetView, Catalog, Download};
use crate::errors::{DamError, DamResult};
use crate::metadata::store::{AssetId, MetadataStore, NewShareLink, SharePermission, ShareLinkRecord};

/// What a share-link holder sees.
#[derive(Debug, Clone, Serialize)]
pub struct SharedView {
    pub permission: SharePermission,
    pub expires_at: Option<DateTime<Utc>>,
    pub assets: Vec<AssetView>,
}

pub struct Sharing {
    store: Arc<dyn MetadataStore>,
    guard: AuthGuard,
    audit: AuditLogger,
    catalog: Catalog,
}

impl Sharing {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        guard: AuthGuard,
        audit: AuditLogger,
        catalog: Catalog,
    ) -> Self {
        Self {
            store,
            guard,
            audit,
            catalog,
        }
    }

    /// Create a link over `asset_ids`.  `expires_in` of `None` never
    /// expires.
    pub async fn create_share_link(
        &self,
        actor: &Identity,
        asset_ids: &[AssetId],
        permission: SharePermission,
        expires_in: Option<Duration>,
    ) -> DamResult<ShareLinkRecord> {
        self.guard
            .require_permission(actor, ASSET_RESOURCE, "view")
            .await?;
        if asset_ids.is_empty() {
            return Err(DamError::validation("a share link needs at least one asset"));
        }
        if expires_in.is_some_and(|ttl| ttl <= Duration::zero()) {
            return Err(DamError::validation("share link lifetime must be positive"));
        }
        let mut ids = asset_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        for &asset_id in &ids {
            self.catalog.load_asset(asset_id).await?;
        }

        let link = self
            .store
            .create_share_link(NewShareLink {
                token: new_capability_token(),
                created_by: actor.user_id,
                expires_at: expires_in.map(|ttl| Utc::now() + ttl),
                permission,
                asset_ids: ids,
            })
            .await?;
        for &asset_id in &link.asset_ids {
            self.audit
                .record(Some(actor.user_id), Some(asset_id), AuditAction::Share)
                .await?;
        }
        info!(
            link_id = link.link_id,
            assets = link.asset_ids.len(),
            permission = permission.as_str(),
            "share link created"
        );
        Ok(link)
    }

    /// Resolve a token to the assets it covers.
    pub async fn open_share_link(&self, token: &str) -> DamResult<SharedView> {
        let link = self.resolve(token).await?;
        let mut assets = Vec::with_capacity(link.asset_ids.len());
        for &asset_id in &link.asset_ids {
            if let Some(asset) = self.store.get_asset(asset_id).await? {
                assets.push(self.catalog.asset_view(asset).await?);
            }
        }
        Ok(SharedView {
            permission: link.permission,
            expires_at: link.expires_at,
            assets,
        })
    }

    /// Latest content of one shared asset.  Only `downloadable` links may
    /// download.
    pub async fn download_shared(&self, token: &str, asset_id: AssetId) -> DamResult<Download> {
        let link = self.resolve(token).await?;
        if !link.asset_ids.contains(&asset_id) {
            return Err(DamError::not_found(format!("asset {asset_id} in share link")));
        }
        if link.permission != SharePermission::Downloadable {
            return Err(DamError::authorization("share", "download"));
        }
        let asset = self.catalog.load_asset(asset_id).await?;
        let download = self.catalog.read_latest(&asset).await?;
        self.audit
            .record(None, Some(asset_id), AuditAction::ShareDownload)
            .await?;
        Ok(download)
    }

    async fn resolve(&self, token: &str) -> DamResult<ShareLinkRecord> {
        let link = self
            .store
            .get_share_link(token)
            .await?
            .ok_or_else(|| DamError::not_found("share link"))?;
        if link.expires_at.is_some_and(|at| Utc::now() > at) {
            debug!(link_id = link.link_id, "expired share link presented");
            return Err(DamError::expired("share link"));
        }
        Ok(link)
    }
}

//! Read side: asset views, downloads, tags, categories and comments.
//!
//! Views carry URLs derived from the configured public base URL.  Stored
//! records never do.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use garde::Validate;
use serde::Serialize;
use tracing::{debug, warn};

use crate::auth::{AuthGuard, Identity, ASSET_RESOURCE};
use crate::enrichment::normalize_tag;
use crate::errors::{DamError, DamResult};
use crate::metadata::store::{
    AssetFilter, AssetId, AssetRecord, CommentRecord, MetadataStore, UserId, VersionId,
    VersionRecord,
};
use crate::storage::backend::BlobStore;

#[derive(Debug, Clone, Serialize)]
pub struct VersionView {
    pub version_id: VersionId,
    pub version_number: u32,
    pub created_at: DateTime<Utc>,
    pub download_url: String,
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetadataView {
    pub filesize: u64,
    pub resolution: String,
    pub duration: Option<String>,
    pub encoding: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssetView {
    pub asset_id: AssetId,
    pub filename: String,
    pub content_type: String,
    pub owner_id: UserId,
    pub latest_version: Option<VersionView>,
    pub metadata: Option<MetadataView>,
    pub tags: Vec<String>,
    pub categories: Vec<String>,
}

/// Content of one version, ready to hand to a caller.
#[derive(Debug, Clone)]
pub struct Download {
    pub filename: String,
    pub content_type: String,
    pub version_number: u32,
    pub data: Bytes,
}

#[derive(Debug, Validate)]
struct NewComment<'a> {
    #[garde(length(min = 1, max = 4000))]
    body: &'a str,
}

#[derive(Debug, Validate)]
struct Label<'a> {
    #[garde(length(min = 1, max = 64))]
    name: &'a str,
}

#[derive(Clone)]
pub struct Catalog {
    store: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    guard: AuthGuard,
    public_base_url: String,
}

impl Catalog {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        guard: AuthGuard,
        public_base_url: &str,
    ) -> Self {
        Self {
            store,
            blobs,
            guard,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn get_asset(&self, actor: &Identity, asset_id: AssetId) -> DamResult<AssetView> {
        self.require_view(actor).await?;
        let asset = self.load_asset(asset_id).await?;
        self.asset_view(asset).await
    }

    /// Filename substring and exact content-type search.
    pub async fn search(&self, actor: &Identity, filter: AssetFilter) -> DamResult<Vec<AssetView>> {
        self.require_view(actor).await?;
        let assets = self.store.list_assets(filter).await?;
        let mut views = Vec::with_capacity(assets.len());
        for asset in assets {
            views.push(self.asset_view(asset).await?);
        }
        Ok(views)
    }

    /// All versions, oldest first.
    pub async fn list_versions(
        &self,
        actor: &Identity,
        asset_id: AssetId,
    ) -> DamResult<Vec<VersionView>> {
        self.require_view(actor).await?;
        self.load_asset(asset_id).await?;
        let versions = self.store.list_versions(asset_id).await?;
        Ok(versions.iter().map(|v| self.version_view(v)).collect())
    }

    pub async fn download_latest(&self, actor: &Identity, asset_id: AssetId) -> DamResult<Download> {
        self.require_view(actor).await?;
        let asset = self.load_asset(asset_id).await?;
        self.read_latest(&asset).await
    }

    pub async fn download_version(
        &self,
        actor: &Identity,
        version_id: VersionId,
    ) -> DamResult<Download> {
        self.require_view(actor).await?;
        let version = self
            .store
            .get_version(version_id)
            .await?
            .ok_or_else(|| DamError::not_found(format!("version {version_id}")))?;
        let asset = self.load_asset(version.asset_id).await?;
        self.read_version(&asset, &version).await
    }

    /// Attach a tag by normalized name.  Returns false if it was already
    /// attached.
    pub async fn add_tag(&self, actor: &Identity, asset_id: AssetId, name: &str) -> DamResult<bool> {
        self.require_edit(actor).await?;
        let name = normalize_tag(name);
        Label { name: &name }.validate()?;
        self.load_asset(asset_id).await?;
        let tag = self.store.find_or_create_tag(&name).await?;
        let linked = self.store.link_tag(asset_id, tag.tag_id).await?;
        debug!(asset_id, tag = %name, linked, "tag added");
        Ok(linked)
    }

    /// Put the asset in a category.  Returns false if it already was.
    pub async fn assign_category(
        &self,
        actor: &Identity,
        asset_id: AssetId,
        name: &str,
    ) -> DamResult<bool> {
        self.require_edit(actor).await?;
        let name = name.trim();
        Label { name }.validate()?;
        self.load_asset(asset_id).await?;
        let category = self.store.find_or_create_category(name).await?;
        Ok(self
            .store
            .link_category(asset_id, category.category_id)
            .await?)
    }

    pub async fn add_comment(
        &self,
        actor: &Identity,
        asset_id: AssetId,
        body: &str,
    ) -> DamResult<CommentRecord> {
        self.require_view(actor).await?;
        let body = body.trim();
        NewComment { body }.validate()?;
        self.load_asset(asset_id).await?;
        Ok(self.store.add_comment(asset_id, actor.user_id, body).await?)
    }

    pub async fn list_comments(
        &self,
        actor: &Identity,
        asset_id: AssetId,
    ) -> DamResult<Vec<CommentRecord>> {
        self.require_view(actor).await?;
        self.load_asset(asset_id).await?;
        Ok(self.store.list_comments(asset_id).await?)
    }

    // ── Shared with the share-link surface ──────────────────────────

    pub(crate) async fn load_asset(&self, asset_id: AssetId) -> DamResult<AssetRecord> {
        self.store
            .get_asset(asset_id)
            .await?
            .ok_or_else(|| DamError::not_found(format!("asset {asset_id}")))
    }

    pub(crate) async fn asset_view(&self, asset: AssetRecord) -> DamResult<AssetView> {
        let latest_version = match asset.latest_version_id {
            Some(version_id) => self
                .store
                .get_version(version_id)
                .await?
                .map(|v| self.version_view(&v)),
            None => None,
        };
        let metadata = self
            .store
            .get_metadata(asset.asset_id)
            .await?
            .map(|m| MetadataView {
                filesize: m.filesize,
                resolution: m.resolution,
                duration: m.duration,
                encoding: m.encoding,
            });
        let tags = self
            .store
            .list_tags(asset.asset_id)
            .await?
            .into_iter()
            .map(|t| t.name)
            .collect();
        let categories = self
            .store
            .list_categories(asset.asset_id)
            .await?
            .into_iter()
            .map(|c| c.name)
            .collect();
        Ok(AssetView {
            asset_id: asset.asset_id,
            filename: asset.filename,
            content_type: asset.content_type,
            owner_id: asset.owner_id,
            latest_version,
            metadata,
            tags,
            categories,
        })
    }

    pub(crate) async fn read_latest(&self, asset: &AssetRecord) -> DamResult<Download> {
        let version_id = asset.latest_version_id.ok_or_else(|| {
            DamError::not_found(format!("asset {} has no content", asset.asset_id))
        })?;
        let version = self
            .store
            .get_version(version_id)
            .await?
            .ok_or_else(|| DamError::not_found(format!("version {version_id}")))?;
        self.read_version(asset, &version).await
    }

    async fn read_version(&self, asset: &AssetRecord, version: &VersionRecord) -> DamResult<Download> {
        let blob = match self.blobs.get(&version.blob_key).await {
            Ok(blob) => blob,
            Err(e) => {
                return Err(match self.blobs.exists(&version.blob_key).await {
                    Ok(false) => DamError::not_found(format!(
                        "content of version {}",
                        version.version_id
                    )),
                    _ => DamError::storage(e),
                })
            }
        };
        if blob.content_hash != version.content_hash {
            warn!(
                version_id = version.version_id,
                blob_key = %version.blob_key,
                "stored content does not match its recorded hash"
            );
            return Err(DamError::storage(format!(
                "content of version {} failed its integrity check",
                version.version_id
            )));
        }
        Ok(Download {
            filename: asset.filename.clone(),
            content_type: asset.content_type.clone(),
            version_number: version.version_number,
            data: blob.data,
        })
    }

    fn version_view(&self, version: &VersionRecord) -> VersionView {
        let base = format!(
            "{}/assets/{}/versions/{}",
            self.public_base_url, version.asset_id, version.version_id
        );
        VersionView {
            version_id: version.version_id,
            version_number: version.version_number,
            created_at: version.created_at,
            download_url: format!("{base}/content"),
            thumbnail_url: version
                .thumbnail_key
                .as_ref()
                .map(|_| format!("{base}/thumbnail")),
        }
    }

    async fn require_view(&self, actor: &Identity) -> DamResult<()> {
        self.guard
            .require_permission(actor, ASSET_RESOURCE, "view")
            .await
    }

    async fn require_edit(&self, actor: &Identity) -> DamResult<()> {
        self.guard
            .require_permission(actor, ASSET_RESOURCE, "upload")
            .await
    }
}

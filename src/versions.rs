//! Version manager: content write, metadata commit, pointer move.
//!
//! A new version is produced in three phases:
//!
//! 1. Stage the upload to a scratch file and probe it (best-effort).
//! 2. Write the primary blob and its thumbnail under fresh keys.
//! 3. Commit asset, version, metadata, pointer and audit entry in one
//!    metadata transaction.
//!
//! The blob store cannot join the transaction.  If phase 3 fails, the
//! blobs from phase 2 are deleted again; a blob that cannot be deleted is
//! logged and counted as an orphan.
//!
//! Version numbers are assigned according to [`VersionAssignment`].  The
//! store refuses any number that is not exactly the current maximum plus
//! one, so uncoordinated writers can lose but never corrupt the sequence.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::audit::AuditAction;
use crate::auth::{AuthGuard, Identity, ASSET_RESOURCE};
use crate::codec::{ImageOperation, MediaCodec, Probe, Thumbnail};
use crate::config::VersionAssignment;
use crate::enrichment::{EnrichmentJob, EnrichmentQueue};
use crate::errors::{DamError, DamResult};
use crate::metadata::store::{
    AssetId, AssetTarget, CommittedVersion, MetadataStore, VersionCommit,
};
use crate::metrics::{record_orphan_blob, record_version_conflict, record_version_created};
use crate::storage::backend::BlobStore;
use crate::storage::keys::{generate_blob_key, thumbnail_key};

/// Fallback encoding when the content type has no subtype.
const DEFAULT_ENCODING: &str = "bin";

/// An upload staged on local disk.  The file is removed on drop.
struct StagedUpload {
    file: tempfile::NamedTempFile,
    size: u64,
}

/// Creates asset versions.
pub struct VersionManager {
    store: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    codec: Arc<dyn MediaCodec>,
    guard: AuthGuard,
    enrichment: Option<EnrichmentQueue>,
    scratch_dir: PathBuf,
    max_upload_bytes: u64,
    assignment: VersionAssignment,
    /// Per-asset number-assignment locks, used in serialized mode.
    asset_locks: DashMap<AssetId, Arc<tokio::sync::Mutex<()>>>,
}

impl VersionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        codec: Arc<dyn MediaCodec>,
        guard: AuthGuard,
        enrichment: Option<EnrichmentQueue>,
        scratch_dir: impl Into<PathBuf>,
        max_upload_bytes: u64,
        assignment: VersionAssignment,
    ) -> anyhow::Result<Self> {
        let scratch_dir = scratch_dir.into();
        std::fs::create_dir_all(&scratch_dir)?;
        Ok(Self {
            store,
            blobs,
            codec,
            guard,
            enrichment,
            scratch_dir,
            max_upload_bytes,
            assignment,
            asset_locks: DashMap::new(),
        })
    }

    /// Write `content` as the next version of `asset_id`, or as version 1
    /// of a new asset when `asset_id` is `None`.
    ///
    /// For an existing asset, `filename` only feeds the blob key; the
    /// asset keeps the name it was created with.
    pub async fn create_version<R>(
        &self,
        actor: &Identity,
        asset_id: Option<AssetId>,
        filename: &str,
        content_type: &str,
        content: R,
    ) -> DamResult<CommittedVersion>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.guard
            .require_permission(actor, ASSET_RESOURCE, "upload")
            .await?;
        if filename.trim().is_empty() {
            return Err(DamError::validation("filename must not be empty"));
        }

        let existing = match asset_id {
            Some(id) => Some(
                self.store
                    .get_asset(id)
                    .await?
                    .ok_or_else(|| DamError::not_found(format!("asset {id}")))?,
            ),
            None => None,
        };
        // Snapshot used for unserialized numbering.
        let observed = existing
            .as_ref()
            .and_then(|a| a.latest_version_number)
            .unwrap_or(0);

        let staged = self.stage(content).await?;
        let probe = self.probe(&staged, content_type).await;

        // Phase 2: blobs.
        let data = tokio::fs::read(staged.file.path())
            .await
            .map_err(|e| DamError::Internal(e.into()))?;
        let blob_key = generate_blob_key(filename);
        let (content_hash, written) = self
            .write_blobs(&blob_key, Bytes::from(data), probe.thumbnail)
            .await?;
        let stored_bytes = staged.size;
        drop(staged);

        // Phase 3: metadata.
        let commit = VersionCommit {
            target: match &existing {
                Some(asset) => AssetTarget::Existing(asset.asset_id),
                None => AssetTarget::New {
                    filename: filename.to_string(),
                    content_type: content_type.to_string(),
                    owner_id: actor.user_id,
                },
            },
            version_number: 0,
            blob_key: blob_key.clone(),
            thumbnail_key: written.get(1).cloned(),
            content_hash,
            filesize: stored_bytes,
            resolution: probe.resolution,
            duration: probe.duration,
            encoding: encoding_of(content_type),
            actor_id: Some(actor.user_id),
            audit_action: String::new(),
        };

        let committed = match self.commit(commit, observed).await {
            Ok(committed) => committed,
            Err(e) => {
                let err = DamError::from(e);
                if matches!(err, DamError::Conflict { .. }) {
                    record_version_conflict();
                }
                warn!(?asset_id, blob_key = %blob_key, error = %err, "version commit failed, removing blobs");
                self.compensate(&written).await;
                return Err(err);
            }
        };

        let version = &committed.version;
        record_version_created(
            if version.version_number == 1 { "upload" } else { "update" },
            stored_bytes,
        );
        info!(
            asset_id = version.asset_id,
            version = version.version_number,
            blob_key = %version.blob_key,
            "version committed"
        );

        if let Some(queue) = &self.enrichment {
            if content_type.starts_with("image/") {
                queue.schedule(EnrichmentJob {
                    asset_id: version.asset_id,
                    blob_key: version.blob_key.clone(),
                    content_type: content_type.to_string(),
                });
            }
        }

        Ok(committed)
    }

    /// Apply an image edit to the asset's latest content, producing a new
    /// version.
    pub async fn apply_image_operation(
        &self,
        actor: &Identity,
        asset_id: AssetId,
        operation: ImageOperation,
    ) -> DamResult<CommittedVersion> {
        operation.validate()?;
        self.guard
            .require_permission(actor, ASSET_RESOURCE, "upload")
            .await?;
        let asset = self
            .store
            .get_asset(asset_id)
            .await?
            .ok_or_else(|| DamError::not_found(format!("asset {asset_id}")))?;
        if !asset.content_type.starts_with("image/") {
            return Err(DamError::validation(format!(
                "{} is not an image",
                asset.content_type
            )));
        }
        let version_id = asset
            .latest_version_id
            .ok_or_else(|| DamError::not_found(format!("latest version of asset {asset_id}")))?;
        let version = self
            .store
            .get_version(version_id)
            .await?
            .ok_or_else(|| DamError::not_found(format!("version {version_id}")))?;
        let blob = self
            .blobs
            .get(&version.blob_key)
            .await
            .map_err(DamError::storage)?;

        let codec = self.codec.clone();
        let edited = tokio::task::spawn_blocking(move || codec.transform(&blob.data, operation))
            .await
            .map_err(|e| DamError::Internal(e.into()))?
            .map_err(|e| DamError::validation(format!("image cannot be edited: {e}")))?;

        debug!(asset_id, ?operation, "image operation applied");
        self.create_version(
            actor,
            Some(asset_id),
            &asset.filename,
            &asset.content_type,
            &edited[..],
        )
        .await
    }

    /// Copy `content` into a scratch file, enforcing the size limit.
    async fn stage<R>(&self, content: R) -> DamResult<StagedUpload>
    where
        R: AsyncRead + Unpin + Send,
    {
        let file = tempfile::Builder::new()
            .prefix("upload-")
            .tempfile_in(&self.scratch_dir)
            .map_err(|e| DamError::Internal(e.into()))?;
        let handle = file.reopen().map_err(|e| DamError::Internal(e.into()))?;
        let mut writer = tokio::fs::File::from_std(handle);

        let mut limited = content.take(self.max_upload_bytes.saturating_add(1));
        let size = tokio::io::copy(&mut limited, &mut writer)
            .await
            .map_err(|e| DamError::Internal(e.into()))?;
        writer
            .flush()
            .await
            .map_err(|e| DamError::Internal(e.into()))?;
        if size > self.max_upload_bytes {
            return Err(DamError::validation(format!(
                "upload exceeds {} bytes",
                self.max_upload_bytes
            )));
        }
        Ok(StagedUpload { file, size })
    }

    /// Probe on the blocking pool.  Any failure degrades to an unknown
    /// resolution without a thumbnail.
    async fn probe(&self, staged: &StagedUpload, content_type: &str) -> Probe {
        let codec = self.codec.clone();
        let path = staged.file.path().to_path_buf();
        let content_type_owned = content_type.to_string();
        match tokio::task::spawn_blocking(move || codec.probe(&path, &content_type_owned)).await {
            Ok(Ok(probe)) => probe,
            Ok(Err(e)) => {
                warn!(content_type, error = %e, "codec probe failed, continuing without it");
                Probe::unknown()
            }
            Err(e) => {
                warn!(content_type, error = %e, "codec probe panicked, continuing without it");
                Probe::unknown()
            }
        }
    }

    /// Write the primary blob and optional thumbnail.  Returns the
    /// primary's content hash and the keys written, primary first.  On
    /// failure nothing written by this call is left behind.
    async fn write_blobs(
        &self,
        blob_key: &str,
        data: Bytes,
        thumbnail: Option<Thumbnail>,
    ) -> DamResult<(String, Vec<String>)> {
        let content_hash = match self.blobs.put(blob_key, data).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!(blob_key, error = %e, "primary blob write failed");
                return Err(DamError::storage(e));
            }
        };
        let mut written = vec![blob_key.to_string()];

        if let Some(thumb) = thumbnail {
            let key = thumbnail_key(blob_key, thumb.extension);
            if let Err(e) = self.blobs.put(&key, thumb.data).await {
                warn!(blob_key = %key, error = %e, "thumbnail write failed");
                self.compensate(&written).await;
                return Err(DamError::storage(e));
            }
            written.push(key);
        }
        Ok((content_hash, written))
    }

    /// Assign the version number and commit.
    async fn commit(
        &self,
        mut commit: VersionCommit,
        observed: u32,
    ) -> anyhow::Result<CommittedVersion> {
        let asset_id = match commit.target {
            AssetTarget::Existing(asset_id) => asset_id,
            AssetTarget::New { .. } => {
                commit.version_number = 1;
                commit.audit_action = AuditAction::for_version(1).to_string();
                return self.store.commit_version(commit).await;
            }
        };

        match self.assignment {
            VersionAssignment::Unserialized => {
                commit.version_number = observed + 1;
                commit.audit_action =
                    AuditAction::for_version(commit.version_number).to_string();
                self.store.commit_version(commit).await
            }
            VersionAssignment::Serialized => {
                let lock = Arc::clone(&self.asset_locks.entry(asset_id).or_default());
                let result = {
                    let _held = lock.lock().await;
                    let current = self.store.max_version_number(asset_id).await?;
                    commit.version_number = current.unwrap_or(0) + 1;
                    commit.audit_action =
                        AuditAction::for_version(commit.version_number).to_string();
                    self.store.commit_version(commit).await
                };
                drop(lock);
                self.asset_locks
                    .remove_if(&asset_id, |_, lock| Arc::strong_count(lock) == 1);
                result
            }
        }
    }

    /// Best-effort removal of blobs written by a failed call.
    async fn compensate(&self, keys: &[String]) {
        for key in keys {
            if let Err(e) = self.blobs.delete(key).await {
                record_orphan_blob();
                warn!(blob_key = %key, error = %e, "orphan blob left behind");
            }
        }
    }
}

/// Encoding label derived from a content type: the subtype, or `bin`.
fn encoding_of(content_type: &str) -> String {
    content_type
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_ENCODING)
        .to_string()
}

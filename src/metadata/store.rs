//! Abstract metadata store trait.
//!
//! Any relational backend must implement [`MetadataStore`].  The trait
//! uses manually desugared async methods (pinned boxed futures) so it can
//! be used as `Arc<dyn MetadataStore>`.
//!
//! Each method is one unit of work: implementations acquire their own
//! connection and transaction for the call and release both on every exit
//! path.  Multi-row mutations that must be atomic are single methods
//! (see [`MetadataStore::commit_version`]).

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;

pub type AssetId = i64;
pub type VersionId = i64;
pub type UserId = i64;
pub type RoleId = i64;

// ── Identity records ───────────────────────────────────────────────

/// A registered user.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub user_id: UserId,
    pub email: String,
    /// Opaque hash produced by the configured password hasher.
    pub password_hash: String,
    pub role_id: RoleId,
}

/// Input for [`MetadataStore::create_user`].
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password_hash: String,
    pub role_id: RoleId,
}

/// A named bundle of permissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleRecord {
    pub role_id: RoleId,
    pub name: String,
}

/// A single `resource:action` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PermissionRecord {
    pub resource: String,
    pub action: String,
}

// ── Capability records ─────────────────────────────────────────────

/// A long-lived API credential.  The token is stored verbatim.
#[derive(Debug, Clone)]
pub struct ApiCredentialRecord {
    pub token: String,
    pub user_id: UserId,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
}

/// Scope granted by a share link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SharePermission {
    /// View asset details only.
    Readonly,
    /// View and download content.
    Downloadable,
}

impl SharePermission {
    pub fn as_str(&self) -> &'static str {
        match self {
            SharePermission::Readonly => "readonly",
            SharePermission::Downloadable => "downloadable",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "readonly" => Some(SharePermission::Readonly),
            "downloadable" => Some(SharePermission::Downloadable),
            _ => None,
        }
    }
}

/// Input for [`MetadataStore::create_share_link`].
#[derive(Debug, Clone)]
pub struct NewShareLink {
    pub token: String,
    pub created_by: UserId,
    pub expires_at: Option<DateTime<Utc>>,
    pub permission: SharePermission,
    pub asset_ids: Vec<AssetId>,
}

/// A share link together with the assets it covers.
#[derive(Debug, Clone)]
pub struct ShareLinkRecord {
    pub link_id: i64,
    pub token: String,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub permission: SharePermission,
    pub asset_ids: Vec<AssetId>,
}

/// A one-time password reset token.
#[derive(Debug, Clone)]
pub struct ResetTokenRecord {
    pub token: String,
    pub user_id: UserId,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

// ── Asset records ──────────────────────────────────────────────────

/// A managed file.  `latest_version_number` is joined in from the row
/// the pointer references.
#[derive(Debug, Clone)]
pub struct AssetRecord {
    pub asset_id: AssetId,
    pub filename: String,
    pub content_type: String,
    pub owner_id: UserId,
    pub latest_version_id: Option<VersionId>,
    pub latest_version_number: Option<u32>,
}

/// An immutable numbered snapshot of an asset's content.
#[derive(Debug, Clone)]
pub struct VersionRecord {
    pub version_id: VersionId,
    pub asset_id: AssetId,
    pub version_number: u32,
    pub blob_key: String,
    pub thumbnail_key: Option<String>,
    /// Hex SHA-256 of the primary blob as written.
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Descriptive state of an asset's latest content.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRecord {
    pub asset_id: AssetId,
    pub filesize: u64,
    pub resolution: String,
    pub duration: Option<String>,
    pub encoding: String,
}

/// Which asset a version commit targets.
#[derive(Debug, Clone)]
pub enum AssetTarget {
    /// Insert a new asset row in the same transaction.
    New {
        filename: String,
        content_type: String,
        owner_id: UserId,
    },
    /// Append to an existing asset.
    Existing(AssetId),
}

/// Everything [`MetadataStore::commit_version`] writes atomically.
#[derive(Debug, Clone)]
pub struct VersionCommit {
    pub target: AssetTarget,
    /// Must equal the asset's current maximum plus one.
    pub version_number: u32,
    pub blob_key: String,
    pub thumbnail_key: Option<String>,
    pub content_hash: String,
    pub filesize: u64,
    pub resolution: String,
    pub duration: Option<String>,
    pub encoding: String,
    pub actor_id: Option<UserId>,
    pub audit_action: String,
}

/// Result of a successful commit.
#[derive(Debug, Clone)]
pub struct CommittedVersion {
    pub asset: AssetRecord,
    pub version: VersionRecord,
}

/// Search filter for [`MetadataStore::list_assets`].
#[derive(Debug, Clone, Default)]
pub struct AssetFilter {
    /// Substring match on the filename.
    pub filename_contains: Option<String>,
    /// Exact match on the content type.
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRecord {
    pub tag_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryRecord {
    pub category_id: i64,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct CommentRecord {
    pub comment_id: i64,
    pub asset_id: AssetId,
    pub user_id: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

// ── Audit records ──────────────────────────────────────────────────

/// Input for [`MetadataStore::append_audit`].
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub user_id: Option<UserId>,
    pub asset_id: Option<AssetId>,
    pub action: String,
}

/// One row of the append-only ledger.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub log_id: i64,
    pub user_id: Option<UserId>,
    pub asset_id: Option<AssetId>,
    pub action: String,
    pub timestamp: DateTime<Utc>,
    pub tampered: bool,
}

/// Window for [`MetadataStore::list_audit`], newest first.
#[derive(Debug, Clone)]
pub struct AuditQuery {
    pub since: Option<DateTime<Utc>>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            since: None,
            limit: 200,
            offset: 0,
        }
    }
}

// ── Trait ───────────────────────────────────────────────────────────

/// Async metadata store contract.
pub trait MetadataStore: Send + Sync + 'static {
    // ── Users & roles ───────────────────────────────────────────────

    /// Insert a user.  A duplicate email fails with a conflict.
    fn create_user(
        &self,
        user: NewUser,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<UserRecord>> + Send + '_>>;

    fn get_user(
        &self,
        user_id: UserId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<UserRecord>>> + Send + '_>>;

    fn get_user_by_email(
        &self,
        email: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<UserRecord>>> + Send + '_>>;

    /// Move a user to another role.  Returns false if the user is absent.
    fn set_user_role(
        &self,
        user_id: UserId,
        role_id: RoleId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    fn get_role(
        &self,
        role_id: RoleId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<RoleRecord>>> + Send + '_>>;

    fn get_role_by_name(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<RoleRecord>>> + Send + '_>>;

    /// The permission set bundled in a role.
    fn role_permissions(
        &self,
        role_id: RoleId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<PermissionRecord>>> + Send + '_>>;

    // ── Capabilities ────────────────────────────────────────────────

    fn put_api_credential(
        &self,
        record: ApiCredentialRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Exact-match lookup of an API credential token.
    fn get_api_credential(
        &self,
        token: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ApiCredentialRecord>>> + Send + '_>>;

    /// Revoke a credential owned by `user_id`.  Returns false if no such
    /// live credential exists.
    fn revoke_api_credential(
        &self,
        token: &str,
        user_id: UserId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    fn create_share_link(
        &self,
        link: NewShareLink,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ShareLinkRecord>> + Send + '_>>;

    fn get_share_link(
        &self,
        token: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ShareLinkRecord>>> + Send + '_>>;

    fn put_reset_token(
        &self,
        record: ResetTokenRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    fn get_reset_token(
        &self,
        token: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ResetTokenRecord>>> + Send + '_>>;

    /// Atomically mark an unused token as used and store the new password
    /// hash for its user.  Returns false if the token is absent or used.
    fn consume_reset_token(
        &self,
        token: &str,
        new_password_hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Delete share links, API credentials and reset tokens whose expiry
    /// is at or before `now`.  Returns the number of rows removed.
    fn purge_expired_capabilities(
        &self,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>>;

    // ── Assets & versions ───────────────────────────────────────────

    fn get_asset(
        &self,
        asset_id: AssetId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<AssetRecord>>> + Send + '_>>;

    fn list_assets(
        &self,
        filter: AssetFilter,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<AssetRecord>>> + Send + '_>>;

    fn get_version(
        &self,
        version_id: VersionId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<VersionRecord>>> + Send + '_>>;

    /// All versions of an asset in ascending number order.
    fn list_versions(
        &self,
        asset_id: AssetId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<VersionRecord>>> + Send + '_>>;

    /// Highest committed version number, or `None` if no version exists.
    fn max_version_number(
        &self,
        asset_id: AssetId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<u32>>> + Send + '_>>;

    /// In one transaction: create the asset if needed, insert the version,
    /// upsert metadata, move the latest pointer and append the audit entry.
    ///
    /// Refuses with a conflict if `version_number` is not exactly the
    /// current maximum plus one.
    fn commit_version(
        &self,
        commit: VersionCommit,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<CommittedVersion>> + Send + '_>>;

    fn get_metadata(
        &self,
        asset_id: AssetId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<MetadataRecord>>> + Send + '_>>;

    /// Null the latest-version pointer and commit.  Returns false if the
    /// asset is absent.
    fn clear_latest_version(
        &self,
        asset_id: AssetId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Delete the asset row and everything that cascades from it.  Audit
    /// rows keep existing with a null asset reference.  Returns false if
    /// the asset was already gone.
    fn delete_asset(
        &self,
        asset_id: AssetId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    // ── Tags, categories, comments ──────────────────────────────────

    fn find_or_create_tag(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<TagRecord>> + Send + '_>>;

    /// Associate a tag with an asset.  Returns false if already linked.
    fn link_tag(
        &self,
        asset_id: AssetId,
        tag_id: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    fn list_tags(
        &self,
        asset_id: AssetId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<TagRecord>>> + Send + '_>>;

    fn find_or_create_category(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<CategoryRecord>> + Send + '_>>;

    /// Associate a category with an asset.  Returns false if already linked.
    fn link_category(
        &self,
        asset_id: AssetId,
        category_id: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    fn list_categories(
        &self,
        asset_id: AssetId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<CategoryRecord>>> + Send + '_>>;

    fn add_comment(
        &self,
        asset_id: AssetId,
        user_id: UserId,
        body: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<CommentRecord>> + Send + '_>>;

    fn list_comments(
        &self,
        asset_id: AssetId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<CommentRecord>>> + Send + '_>>;

    // ── Audit ───────────────────────────────────────────────────────

    fn append_audit(
        &self,
        entry: NewAuditEntry,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<AuditEntry>> + Send + '_>>;

    fn list_audit(
        &self,
        query: AuditQuery,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<AuditEntry>>> + Send + '_>>;

    /// Up to `limit` entries with `log_id > after_id`, oldest first.
    /// Stable under concurrent appends, so a caller can walk the whole
    /// ledger by passing back the last id it saw.
    fn scan_audit(
        &self,
        after_id: i64,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<AuditEntry>>> + Send + '_>>;
}

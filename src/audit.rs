//! Append-only audit ledger.
//!
//! Entries are only ever inserted; nothing in the crate updates or deletes
//! an audit row.  When an asset is removed its entries survive with a null
//! asset reference.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::errors::{DamError, DamResult};
use crate::metadata::store::{AssetId, AuditEntry, AuditQuery, MetadataStore, NewAuditEntry, UserId};

/// Page size used when walking the ledger for export.
const EXPORT_PAGE: u32 = 500;

/// Header row of the CSV export.
pub const CSV_HEADER: [&str; 6] = ["log_id", "user_id", "asset_id", "action", "timestamp", "tampered"];

/// Action tags recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditAction {
    LoginSuccess,
    LoginFailed,
    MfaFailed,
    Upload,
    UpdateVersion(u32),
    Share,
    ShareDownload,
    DeleteAsset(AssetId),
    PasswordResetRequested,
    PasswordReset,
    ApiKeyIssued,
    ApiKeyRevoked,
    RoleChanged(UserId),
}

impl AuditAction {
    /// Tag for a committed version: `UPLOAD` for the first, otherwise
    /// `UPDATE_VERSION_v<n>`.
    pub fn for_version(version_number: u32) -> Self {
        if version_number == 1 {
            AuditAction::Upload
        } else {
            AuditAction::UpdateVersion(version_number)
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditAction::LoginSuccess => f.write_str("LOGIN_SUCCESS"),
            AuditAction::LoginFailed => f.write_str("LOGIN_FAILED"),
            AuditAction::MfaFailed => f.write_str("MFA_FAILED"),
            AuditAction::Upload => f.write_str("UPLOAD"),
            AuditAction::UpdateVersion(n) => write!(f, "UPDATE_VERSION_v{n}"),
            AuditAction::Share => f.write_str("SHARE"),
            AuditAction::ShareDownload => f.write_str("SHARE_DOWNLOAD"),
            AuditAction::DeleteAsset(id) => write!(f, "DELETE_ASSET_{id}"),
            AuditAction::PasswordResetRequested => f.write_str("PASSWORD_RESET_REQUESTED"),
            AuditAction::PasswordReset => f.write_str("PASSWORD_RESET"),
            AuditAction::ApiKeyIssued => f.write_str("API_KEY_ISSUED"),
            AuditAction::ApiKeyRevoked => f.write_str("API_KEY_REVOKED"),
            AuditAction::RoleChanged(user) => write!(f, "ROLE_CHANGED_{user}"),
        }
    }
}

/// Writes and reads the audit ledger.
#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn MetadataStore>,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// Append one entry.
    pub async fn record(
        &self,
        actor: Option<UserId>,
        asset: Option<AssetId>,
        action: AuditAction,
    ) -> DamResult<AuditEntry> {
        let entry = self
            .store
            .append_audit(NewAuditEntry {
                user_id: actor,
                asset_id: asset,
                action: action.to_string(),
            })
            .await?;
        debug!(log_id = entry.log_id, action = %entry.action, "audit entry appended");
        Ok(entry)
    }

    /// Newest-first window of the ledger.
    pub async fn recent(&self, query: AuditQuery) -> DamResult<Vec<AuditEntry>> {
        Ok(self.store.list_audit(query).await?)
    }

    /// Render the ledger (optionally from `since` onwards) as CSV, oldest
    /// entry first.  Null references become empty cells.
    pub async fn export_csv(&self, since: Option<DateTime<Utc>>) -> DamResult<String> {
        let mut entries: Vec<AuditEntry> = Vec::new();
        let mut after_id = 0;
        loop {
            let page = self.store.scan_audit(after_id, since, EXPORT_PAGE).await?;
            let done = (page.len() as u32) < EXPORT_PAGE;
            if let Some(last) = page.last() {
                after_id = last.log_id;
            }
            entries.extend(page);
            if done {
                break;
            }
        }

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(CSV_HEADER).map_err(|e| DamError::Internal(e.into()))?;
        for entry in &entries {
            writer
                .write_record([
                    entry.log_id.to_string(),
                    entry.user_id.map(|id| id.to_string()).unwrap_or_default(),
                    entry.asset_id.map(|id| id.to_string()).unwrap_or_default(),
                    entry.action.clone(),
                    entry.timestamp.to_rfc3339(),
                    entry.tampered.to_string(),
                ])
                .map_err(|e| DamError::Internal(e.into()))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| DamError::Internal(anyhow::anyhow!("csv flush failed: {e}")))?;
        String::from_utf8(bytes).map_err(|e| DamError::Internal(e.into()))
    }
}

//! SQLite-backed metadata store.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite
//! library is required.  All async trait methods are thin wrappers
//! around synchronous rusqlite calls executed under a `Mutex`.  Each call
//! takes the connection guard for its own duration only; a transaction
//! that is dropped without `commit()` rolls back.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::store::{
    ApiCredentialRecord, AssetFilter, AssetId, AssetRecord, AssetTarget, AuditEntry, AuditQuery,
    CategoryRecord, CommentRecord, CommittedVersion, MetadataRecord, MetadataStore, NewAuditEntry,
    NewShareLink, NewUser, PermissionRecord, ResetTokenRecord, RoleId, RoleRecord, SharePermission,
    ShareLinkRecord, TagRecord, UserId, UserRecord, VersionCommit, VersionId, VersionRecord,
};
use crate::errors::DamError;

/// Current schema version. Bumped when migrations are added.
const SCHEMA_VERSION: i64 = 1;

/// Roles created on every startup, with their `(resource, action)` grants.
const SEED_ROLES: &[(&str, &[(&str, &str)])] = &[
    (
        "Admin",
        &[("asset", "upload"), ("asset", "view"), ("asset", "delete")],
    ),
    ("Editor", &[("asset", "upload"), ("asset", "view")]),
    ("Viewer", &[("asset", "view")]),
];

const ASSET_SELECT: &str = "SELECT a.id, a.filename, a.content_type, a.owner_id,
            a.latest_version_id, v.version_number
     FROM assets a LEFT JOIN versions v ON v.id = a.latest_version_id";

const VERSION_SELECT: &str =
    "SELECT id, asset_id, version_number, blob_key, thumbnail_key, created_at, content_hash
     FROM versions";

/// Row counts tied to one asset id, used to verify deletion cascades.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetFootprint {
    pub assets: u64,
    pub versions: u64,
    pub metadata: u64,
    pub comments: u64,
    pub tag_links: u64,
    pub category_links: u64,
    pub share_links: u64,
    pub audit_entries: u64,
}

impl AssetFootprint {
    /// True when nothing but audit history could still mention the asset.
    pub fn is_clean(&self) -> bool {
        self.assets == 0
            && self.versions == 0
            && self.metadata == 0
            && self.comments == 0
            && self.tag_links == 0
            && self.category_links == 0
            && self.share_links == 0
    }
}

/// Metadata store backed by a single SQLite database file.
pub struct SqliteMetadataStore {
    /// Path the store was opened with; used by [`Self::reopen`].
    path: String,
    /// The database connection, guarded by a mutex for Send + Sync.
    conn: Mutex<Connection>,
}

impl SqliteMetadataStore {
    /// Open (or create) the database at `path` and initialize the schema.
    pub fn new(path: &str) -> anyhow::Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self {
            path: path.to_string(),
            conn: Mutex::new(conn),
        };
        store.apply_pragmas()?;
        store.init_db()?;
        Ok(store)
    }

    /// Open a second, independent connection to the same database file.
    ///
    /// Background work uses this so it never shares a connection (or a
    /// transaction) with request handling.  An `":memory:"` store has no
    /// file to share, so reopening it yields an unrelated empty database.
    pub fn reopen(&self) -> anyhow::Result<Self> {
        Self::new(&self.path)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn conn(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("metadata connection mutex poisoned"))
    }

    /// Apply recommended SQLite pragmas for performance and safety.
    fn apply_pragmas(&self) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(())
    }

    /// Create the required tables and indexes if they do not already exist.
    /// Idempotent; runs on every startup.
    fn init_db(&self) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_version (
                version    INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );

            -- Roles and permissions
            CREATE TABLE IF NOT EXISTS roles (
                id    INTEGER PRIMARY KEY AUTOINCREMENT,
                name  TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS permissions (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                resource  TEXT NOT NULL,
                action    TEXT NOT NULL,
                UNIQUE (resource, action)
            );

            CREATE TABLE IF NOT EXISTS role_permissions (
                role_id        INTEGER NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
                permission_id  INTEGER NOT NULL REFERENCES permissions(id) ON DELETE CASCADE,
                PRIMARY KEY (role_id, permission_id)
            );

            CREATE TABLE IF NOT EXISTS users (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                email          TEXT NOT NULL UNIQUE,
                password_hash  TEXT NOT NULL,
                role_id        INTEGER NOT NULL REFERENCES roles(id),
                created_at     TEXT NOT NULL
            );

            -- Assets and versions.  The latest pointer has no cascade
            -- action: it must be nulled before the version rows can go.
            CREATE TABLE IF NOT EXISTS assets (
                id                 INTEGER PRIMARY KEY AUTOINCREMENT,
                filename           TEXT NOT NULL,
                content_type       TEXT NOT NULL,
                owner_id           INTEGER NOT NULL REFERENCES users(id),
                latest_version_id  INTEGER REFERENCES versions(id),
                created_at         TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_assets_owner ON assets(owner_id);

            CREATE TABLE IF NOT EXISTS versions (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                asset_id        INTEGER NOT NULL REFERENCES assets(id) ON DELETE CASCADE,
                version_number  INTEGER NOT NULL,
                blob_key        TEXT NOT NULL UNIQUE,
                thumbnail_key   TEXT,
                content_hash    TEXT NOT NULL,
                created_at      TEXT NOT NULL,
                UNIQUE (asset_id, version_number)
            );

            CREATE TABLE IF NOT EXISTS metadata (
                asset_id    INTEGER PRIMARY KEY REFERENCES assets(id) ON DELETE CASCADE,
                filesize    INTEGER NOT NULL,
                resolution  TEXT NOT NULL,
                duration    TEXT,
                encoding    TEXT NOT NULL
            );

            -- Tags, categories, comments
            CREATE TABLE IF NOT EXISTS tags (
                id    INTEGER PRIMARY KEY AUTOINCREMENT,
                name  TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS asset_tags (
                asset_id  INTEGER NOT NULL REFERENCES assets(id) ON DELETE CASCADE,
                tag_id    INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                PRIMARY KEY (asset_id, tag_id)
            );

            CREATE TABLE IF NOT EXISTS categories (
                id    INTEGER PRIMARY KEY AUTOINCREMENT,
                name  TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS asset_categories (
                asset_id     INTEGER NOT NULL REFERENCES assets(id) ON DELETE CASCADE,
                category_id  INTEGER NOT NULL REFERENCES categories(id) ON DELETE CASCADE,
                PRIMARY KEY (asset_id, category_id)
            );

            CREATE TABLE IF NOT EXISTS comments (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                asset_id    INTEGER NOT NULL REFERENCES assets(id) ON DELETE CASCADE,
                user_id     INTEGER NOT NULL REFERENCES users(id),
                body        TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_comments_asset ON comments(asset_id);

            -- Audit ledger.  Rows outlive the assets they mention.
            CREATE TABLE IF NOT EXISTS audit_log (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id    INTEGER REFERENCES users(id) ON DELETE SET NULL,
                asset_id   INTEGER REFERENCES assets(id) ON DELETE SET NULL,
                action     TEXT NOT NULL,
                timestamp  TEXT NOT NULL,
                tampered   INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);

            -- Capabilities
            CREATE TABLE IF NOT EXISTS share_links (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                token       TEXT NOT NULL UNIQUE,
                created_by  INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at  TEXT NOT NULL,
                expires_at  TEXT,
                permission  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS share_assets (
                link_id   INTEGER NOT NULL REFERENCES share_links(id) ON DELETE CASCADE,
                asset_id  INTEGER NOT NULL REFERENCES assets(id) ON DELETE CASCADE,
                PRIMARY KEY (link_id, asset_id)
            );

            CREATE TABLE IF NOT EXISTS api_credentials (
                token       TEXT PRIMARY KEY,
                user_id     INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                label       TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                expires_at  TEXT,
                revoked     INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS password_reset_tokens (
                token       TEXT PRIMARY KEY,
                user_id     INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                expires_at  TEXT NOT NULL,
                used        INTEGER NOT NULL DEFAULT 0
            );
            ",
        )?;

        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            params![SCHEMA_VERSION, Utc::now()],
        )?;

        Ok(())
    }

    /// Seed roles, permissions and the bootstrap administrator.
    ///
    /// Idempotent: existing rows are left untouched, so the admin keeps
    /// whatever password it has after the first startup.
    pub fn seed_defaults(
        &self,
        admin_role: &str,
        admin_email: &str,
        admin_password_hash: &str,
    ) -> anyhow::Result<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        for (role, grants) in SEED_ROLES {
            tx.execute("INSERT OR IGNORE INTO roles (name) VALUES (?1)", params![role])?;
            for (resource, action) in grants.iter() {
                tx.execute(
                    "INSERT OR IGNORE INTO permissions (resource, action) VALUES (?1, ?2)",
                    params![resource, action],
                )?;
                tx.execute(
                    "INSERT OR IGNORE INTO role_permissions (role_id, permission_id)
                     SELECT r.id, p.id FROM roles r, permissions p
                     WHERE r.name = ?1 AND p.resource = ?2 AND p.action = ?3",
                    params![role, resource, action],
                )?;
            }
        }

        tx.execute(
            "INSERT OR IGNORE INTO roles (name) VALUES (?1)",
            params![admin_role],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO users (email, password_hash, role_id, created_at)
             SELECT ?1, ?2, id, ?3 FROM roles WHERE name = ?4",
            params![admin_email, admin_password_hash, Utc::now(), admin_role],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Count every row that references `asset_id`.
    pub fn asset_footprint(&self, asset_id: AssetId) -> anyhow::Result<AssetFootprint> {
        let conn = self.conn()?;
        let count = |sql: &str| -> anyhow::Result<u64> {
            let n: i64 = conn.query_row(sql, params![asset_id], |row| row.get(0))?;
            Ok(n as u64)
        };
        Ok(AssetFootprint {
            assets: count("SELECT COUNT(*) FROM assets WHERE id = ?1")?,
            versions: count("SELECT COUNT(*) FROM versions WHERE asset_id = ?1")?,
            metadata: count("SELECT COUNT(*) FROM metadata WHERE asset_id = ?1")?,
            comments: count("SELECT COUNT(*) FROM comments WHERE asset_id = ?1")?,
            tag_links: count("SELECT COUNT(*) FROM asset_tags WHERE asset_id = ?1")?,
            category_links: count("SELECT COUNT(*) FROM asset_categories WHERE asset_id = ?1")?,
            share_links: count("SELECT COUNT(*) FROM share_assets WHERE asset_id = ?1")?,
            audit_entries: count("SELECT COUNT(*) FROM audit_log WHERE asset_id = ?1")?,
        })
    }
}

// ── Row helpers ─────────────────────────────────────────────────────

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

/// Turn a unique-constraint failure into a typed conflict; pass anything
/// else through unchanged.
fn conflict_or(err: rusqlite::Error, message: impl FnOnce() -> String) -> anyhow::Error {
    if is_unique_violation(&err) {
        DamError::conflict(message()).into()
    } else {
        err.into()
    }
}

fn map_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        user_id: row.get(0)?,
        email: row.get(1)?,
        password_hash: row.get(2)?,
        role_id: row.get(3)?,
    })
}

fn map_asset_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AssetRecord> {
    Ok(AssetRecord {
        asset_id: row.get(0)?,
        filename: row.get(1)?,
        content_type: row.get(2)?,
        owner_id: row.get(3)?,
        latest_version_id: row.get(4)?,
        latest_version_number: row.get(5)?,
    })
}

fn map_version_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VersionRecord> {
    Ok(VersionRecord {
        version_id: row.get(0)?,
        asset_id: row.get(1)?,
        version_number: row.get(2)?,
        blob_key: row.get(3)?,
        thumbnail_key: row.get(4)?,
        created_at: row.get(5)?,
        content_hash: row.get(6)?,
    })
}

fn map_audit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    Ok(AuditEntry {
        log_id: row.get(0)?,
        user_id: row.get(1)?,
        asset_id: row.get(2)?,
        action: row.get(3)?,
        timestamp: row.get(4)?,
        tampered: row.get(5)?,
    })
}

fn map_credential_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApiCredentialRecord> {
    Ok(ApiCredentialRecord {
        token: row.get(0)?,
        user_id: row.get(1)?,
        label: row.get(2)?,
        created_at: row.get(3)?,
        expires_at: row.get(4)?,
        revoked: row.get(5)?,
    })
}

fn parse_permission(idx: usize, value: String) -> rusqlite::Result<SharePermission> {
    SharePermission::parse(&value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown share permission: {value}").into(),
        )
    })
}

fn load_share_assets(conn: &Connection, link_id: i64) -> rusqlite::Result<Vec<AssetId>> {
    let mut stmt =
        conn.prepare("SELECT asset_id FROM share_assets WHERE link_id = ?1 ORDER BY asset_id")?;
    let ids = stmt
        .query_map(params![link_id], |row| row.get(0))?
        .collect::<Result<Vec<AssetId>, _>>()?;
    Ok(ids)
}

fn load_asset(conn: &Connection, asset_id: AssetId) -> rusqlite::Result<Option<AssetRecord>> {
    conn.query_row(
        &format!("{ASSET_SELECT} WHERE a.id = ?1"),
        params![asset_id],
        map_asset_row,
    )
    .optional()
}

impl MetadataStore for SqliteMetadataStore {
    // ── Users & roles ───────────────────────────────────────────────

    fn create_user(
        &self,
        user: NewUser,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<UserRecord>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO users (email, password_hash, role_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user.email, user.password_hash, user.role_id, Utc::now()],
            )
            .map_err(|e| conflict_or(e, || format!("email {} is already registered", user.email)))?;
            Ok(UserRecord {
                user_id: conn.last_insert_rowid(),
                email: user.email,
                password_hash: user.password_hash,
                role_id: user.role_id,
            })
        })
    }

    fn get_user(
        &self,
        user_id: UserId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<UserRecord>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let user = conn
                .query_row(
                    "SELECT id, email, password_hash, role_id FROM users WHERE id = ?1",
                    params![user_id],
                    map_user_row,
                )
                .optional()?;
            Ok(user)
        })
    }

    fn get_user_by_email(
        &self,
        email: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<UserRecord>>> + Send + '_>> {
        let email = email.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let user = conn
                .query_row(
                    "SELECT id, email, password_hash, role_id FROM users WHERE email = ?1",
                    params![email],
                    map_user_row,
                )
                .optional()?;
            Ok(user)
        })
    }

    fn set_user_role(
        &self,
        user_id: UserId,
        role_id: RoleId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let changed = conn.execute(
                "UPDATE users SET role_id = ?1 WHERE id = ?2",
                params![role_id, user_id],
            )?;
            Ok(changed > 0)
        })
    }

    fn get_role(
        &self,
        role_id: RoleId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<RoleRecord>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let role = conn
                .query_row(
                    "SELECT id, name FROM roles WHERE id = ?1",
                    params![role_id],
                    |row| {
                        Ok(RoleRecord {
                            role_id: row.get(0)?,
                            name: row.get(1)?,
                        })
                    },
                )
                .optional()?;
            Ok(role)
        })
    }

    fn get_role_by_name(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<RoleRecord>>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let role = conn
                .query_row(
                    "SELECT id, name FROM roles WHERE name = ?1",
                    params![name],
                    |row| {
                        Ok(RoleRecord {
                            role_id: row.get(0)?,
                            name: row.get(1)?,
                        })
                    },
                )
                .optional()?;
            Ok(role)
        })
    }

    fn role_permissions(
        &self,
        role_id: RoleId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<PermissionRecord>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT p.resource, p.action
                 FROM role_permissions rp JOIN permissions p ON p.id = rp.permission_id
                 WHERE rp.role_id = ?1
                 ORDER BY p.resource, p.action",
            )?;
            let perms = stmt
                .query_map(params![role_id], |row| {
                    Ok(PermissionRecord {
                        resource: row.get(0)?,
                        action: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(perms)
        })
    }

    // ── Capabilities ────────────────────────────────────────────────

    fn put_api_credential(
        &self,
        record: ApiCredentialRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO api_credentials (token, user_id, label, created_at, expires_at, revoked)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.token,
                    record.user_id,
                    record.label,
                    record.created_at,
                    record.expires_at,
                    record.revoked,
                ],
            )
            .map_err(|e| conflict_or(e, || "API credential token collision".to_string()))?;
            Ok(())
        })
    }

    fn get_api_credential(
        &self,
        token: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ApiCredentialRecord>>> + Send + '_>>
    {
        let token = token.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let record = conn
                .query_row(
                    "SELECT token, user_id, label, created_at, expires_at, revoked
                     FROM api_credentials WHERE token = ?1",
                    params![token],
                    map_credential_row,
                )
                .optional()?;
            Ok(record)
        })
    }

    fn revoke_api_credential(
        &self,
        token: &str,
        user_id: UserId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let token = token.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let changed = conn.execute(
                "UPDATE api_credentials SET revoked = 1
                 WHERE token = ?1 AND user_id = ?2 AND revoked = 0",
                params![token, user_id],
            )?;
            Ok(changed > 0)
        })
    }

    fn create_share_link(
        &self,
        link: NewShareLink,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ShareLinkRecord>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;
            let created_at = Utc::now();
            tx.execute(
                "INSERT INTO share_links (token, created_by, created_at, expires_at, permission)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    link.token,
                    link.created_by,
                    created_at,
                    link.expires_at,
                    link.permission.as_str(),
                ],
            )
            .map_err(|e| conflict_or(e, || "share token collision".to_string()))?;
            let link_id = tx.last_insert_rowid();
            for asset_id in &link.asset_ids {
                tx.execute(
                    "INSERT OR IGNORE INTO share_assets (link_id, asset_id) VALUES (?1, ?2)",
                    params![link_id, asset_id],
                )?;
            }
            let asset_ids = load_share_assets(&tx, link_id)?;
            tx.commit()?;
            Ok(ShareLinkRecord {
                link_id,
                token: link.token,
                created_by: link.created_by,
                created_at,
                expires_at: link.expires_at,
                permission: link.permission,
                asset_ids,
            })
        })
    }

    fn get_share_link(
        &self,
        token: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ShareLinkRecord>>> + Send + '_>> {
        let token = token.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let link = conn
                .query_row(
                    "SELECT id, token, created_by, created_at, expires_at, permission
                     FROM share_links WHERE token = ?1",
                    params![token],
                    |row| {
                        Ok(ShareLinkRecord {
                            link_id: row.get(0)?,
                            token: row.get(1)?,
                            created_by: row.get(2)?,
                            created_at: row.get(3)?,
                            expires_at: row.get(4)?,
                            permission: parse_permission(5, row.get(5)?)?,
                            asset_ids: Vec::new(),
                        })
                    },
                )
                .optional()?;
            match link {
                Some(mut link) => {
                    link.asset_ids = load_share_assets(&conn, link.link_id)?;
                    Ok(Some(link))
                }
                None => Ok(None),
            }
        })
    }

    fn put_reset_token(
        &self,
        record: ResetTokenRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO password_reset_tokens (token, user_id, expires_at, used)
                 VALUES (?1, ?2, ?3, ?4)",
                params![record.token, record.user_id, record.expires_at, record.used],
            )
            .map_err(|e| conflict_or(e, || "reset token collision".to_string()))?;
            Ok(())
        })
    }

    fn get_reset_token(
        &self,
        token: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ResetTokenRecord>>> + Send + '_>> {
        let token = token.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let record = conn
                .query_row(
                    "SELECT token, user_id, expires_at, used
                     FROM password_reset_tokens WHERE token = ?1",
                    params![token],
                    |row| {
                        Ok(ResetTokenRecord {
                            token: row.get(0)?,
                            user_id: row.get(1)?,
                            expires_at: row.get(2)?,
                            used: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(record)
        })
    }

    fn consume_reset_token(
        &self,
        token: &str,
        new_password_hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let token = token.to_string();
        let new_password_hash = new_password_hash.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;
            let user_id: Option<UserId> = tx
                .query_row(
                    "SELECT user_id FROM password_reset_tokens WHERE token = ?1 AND used = 0",
                    params![token],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(user_id) = user_id else {
                return Ok(false);
            };
            tx.execute(
                "UPDATE password_reset_tokens SET used = 1 WHERE token = ?1",
                params![token],
            )?;
            tx.execute(
                "UPDATE users SET password_hash = ?1 WHERE id = ?2",
                params![new_password_hash, user_id],
            )?;
            tx.commit()?;
            Ok(true)
        })
    }

    fn purge_expired_capabilities(
        &self,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;
            let mut removed = tx.execute(
                "DELETE FROM share_links WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
            )?;
            removed += tx.execute(
                "DELETE FROM api_credentials WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
            )?;
            removed += tx.execute(
                "DELETE FROM password_reset_tokens WHERE expires_at <= ?1",
                params![now],
            )?;
            tx.commit()?;
            Ok(removed as u64)
        })
    }

    // ── Assets & versions ───────────────────────────────────────────

    fn get_asset(
        &self,
        asset_id: AssetId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<AssetRecord>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            Ok(load_asset(&conn, asset_id)?)
        })
    }

    fn list_assets(
        &self,
        filter: AssetFilter,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<AssetRecord>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!(
                "{ASSET_SELECT}
                 WHERE (?1 IS NULL OR instr(lower(a.filename), lower(?1)) > 0)
                   AND (?2 IS NULL OR a.content_type = ?2)
                 ORDER BY a.id"
            ))?;
            let assets = stmt
                .query_map(
                    params![filter.filename_contains, filter.content_type],
                    map_asset_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(assets)
        })
    }

    fn get_version(
        &self,
        version_id: VersionId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<VersionRecord>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let version = conn
                .query_row(
                    &format!("{VERSION_SELECT} WHERE id = ?1"),
                    params![version_id],
                    map_version_row,
                )
                .optional()?;
            Ok(version)
        })
    }

    fn list_versions(
        &self,
        asset_id: AssetId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<VersionRecord>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!(
                "{VERSION_SELECT} WHERE asset_id = ?1 ORDER BY version_number"
            ))?;
            let versions = stmt
                .query_map(params![asset_id], map_version_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(versions)
        })
    }

    fn max_version_number(
        &self,
        asset_id: AssetId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<u32>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let max: Option<u32> = conn.query_row(
                "SELECT MAX(version_number) FROM versions WHERE asset_id = ?1",
                params![asset_id],
                |row| row.get(0),
            )?;
            Ok(max)
        })
    }

    fn commit_version(
        &self,
        commit: VersionCommit,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<CommittedVersion>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;
            let now = Utc::now();

            let asset_id = match &commit.target {
                AssetTarget::New {
                    filename,
                    content_type,
                    owner_id,
                } => {
                    tx.execute(
                        "INSERT INTO assets (filename, content_type, owner_id, created_at)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![filename, content_type, owner_id, now],
                    )?;
                    tx.last_insert_rowid()
                }
                AssetTarget::Existing(asset_id) => {
                    let exists: bool = tx.query_row(
                        "SELECT EXISTS(SELECT 1 FROM assets WHERE id = ?1)",
                        params![asset_id],
                        |row| row.get(0),
                    )?;
                    if !exists {
                        return Err(DamError::not_found(format!("asset {asset_id}")).into());
                    }
                    *asset_id
                }
            };

            // Conditional commit: only the immediate successor is accepted.
            let current: Option<u32> = tx.query_row(
                "SELECT MAX(version_number) FROM versions WHERE asset_id = ?1",
                params![asset_id],
                |row| row.get(0),
            )?;
            let expected = current.unwrap_or(0) + 1;
            if commit.version_number != expected {
                return Err(DamError::conflict(format!(
                    "version {} of asset {asset_id} was refused; next version is {expected}",
                    commit.version_number
                ))
                .into());
            }

            tx.execute(
                "INSERT INTO versions
                    (asset_id, version_number, blob_key, thumbnail_key, content_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    asset_id,
                    commit.version_number,
                    commit.blob_key,
                    commit.thumbnail_key,
                    commit.content_hash,
                    now,
                ],
            )
            .map_err(|e| {
                conflict_or(e, || {
                    format!(
                        "version {} of asset {asset_id} already exists",
                        commit.version_number
                    )
                })
            })?;
            let version_id = tx.last_insert_rowid();

            tx.execute(
                "INSERT INTO metadata (asset_id, filesize, resolution, duration, encoding)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(asset_id) DO UPDATE SET
                    filesize = excluded.filesize,
                    resolution = excluded.resolution,
                    duration = excluded.duration,
                    encoding = excluded.encoding",
                params![
                    asset_id,
                    commit.filesize as i64,
                    commit.resolution,
                    commit.duration,
                    commit.encoding,
                ],
            )?;

            tx.execute(
                "UPDATE assets SET latest_version_id = ?1 WHERE id = ?2",
                params![version_id, asset_id],
            )?;

            tx.execute(
                "INSERT INTO audit_log (user_id, asset_id, action, timestamp, tampered)
                 VALUES (?1, ?2, ?3, ?4, 0)",
                params![commit.actor_id, asset_id, commit.audit_action, now],
            )?;

            let asset = load_asset(&tx, asset_id)?
                .ok_or_else(|| anyhow::anyhow!("asset {asset_id} vanished mid-transaction"))?;
            tx.commit()?;

            Ok(CommittedVersion {
                asset,
                version: VersionRecord {
                    version_id,
                    asset_id,
                    version_number: commit.version_number,
                    blob_key: commit.blob_key,
                    thumbnail_key: commit.thumbnail_key,
                    content_hash: commit.content_hash,
                    created_at: now,
                },
            })
        })
    }

    fn get_metadata(
        &self,
        asset_id: AssetId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<MetadataRecord>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let record = conn
                .query_row(
                    "SELECT asset_id, filesize, resolution, duration, encoding
                     FROM metadata WHERE asset_id = ?1",
                    params![asset_id],
                    |row| {
                        Ok(MetadataRecord {
                            asset_id: row.get(0)?,
                            filesize: row.get::<_, i64>(1)? as u64,
                            resolution: row.get(2)?,
                            duration: row.get(3)?,
                            encoding: row.get(4)?,
                        })
                    },
                )
                .optional()?;
            Ok(record)
        })
    }

    fn clear_latest_version(
        &self,
        asset_id: AssetId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let changed = conn.execute(
                "UPDATE assets SET latest_version_id = NULL WHERE id = ?1",
                params![asset_id],
            )?;
            Ok(changed > 0)
        })
    }

    fn delete_asset(
        &self,
        asset_id: AssetId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let removed = conn.execute("DELETE FROM assets WHERE id = ?1", params![asset_id])?;
            Ok(removed > 0)
        })
    }

    // ── Tags, categories, comments ──────────────────────────────────

    fn find_or_create_tag(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<TagRecord>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            conn.execute("INSERT OR IGNORE INTO tags (name) VALUES (?1)", params![name])?;
            let tag = conn.query_row(
                "SELECT id, name FROM tags WHERE name = ?1",
                params![name],
                |row| {
                    Ok(TagRecord {
                        tag_id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )?;
            Ok(tag)
        })
    }

    fn link_tag(
        &self,
        asset_id: AssetId,
        tag_id: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO asset_tags (asset_id, tag_id) VALUES (?1, ?2)",
                params![asset_id, tag_id],
            )?;
            Ok(inserted > 0)
        })
    }

    fn list_tags(
        &self,
        asset_id: AssetId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<TagRecord>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT t.id, t.name FROM asset_tags at JOIN tags t ON t.id = at.tag_id
                 WHERE at.asset_id = ?1 ORDER BY t.name",
            )?;
            let tags = stmt
                .query_map(params![asset_id], |row| {
                    Ok(TagRecord {
                        tag_id: row.get(0)?,
                        name: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tags)
        })
    }

    fn find_or_create_category(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<CategoryRecord>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            conn.execute(
                "INSERT OR IGNORE INTO categories (name) VALUES (?1)",
                params![name],
            )?;
            let category = conn.query_row(
                "SELECT id, name FROM categories WHERE name = ?1",
                params![name],
                |row| {
                    Ok(CategoryRecord {
                        category_id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )?;
            Ok(category)
        })
    }

    fn link_category(
        &self,
        asset_id: AssetId,
        category_id: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO asset_categories (asset_id, category_id) VALUES (?1, ?2)",
                params![asset_id, category_id],
            )?;
            Ok(inserted > 0)
        })
    }

    fn list_categories(
        &self,
        asset_id: AssetId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<CategoryRecord>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT c.id, c.name FROM asset_categories ac
                 JOIN categories c ON c.id = ac.category_id
                 WHERE ac.asset_id = ?1 ORDER BY c.name",
            )?;
            let categories = stmt
                .query_map(params![asset_id], |row| {
                    Ok(CategoryRecord {
                        category_id: row.get(0)?,
                        name: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(categories)
        })
    }

    fn add_comment(
        &self,
        asset_id: AssetId,
        user_id: UserId,
        body: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<CommentRecord>> + Send + '_>> {
        let body = body.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let created_at = Utc::now();
            conn.execute(
                "INSERT INTO comments (asset_id, user_id, body, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![asset_id, user_id, body, created_at],
            )?;
            Ok(CommentRecord {
                comment_id: conn.last_insert_rowid(),
                asset_id,
                user_id,
                body,
                created_at,
            })
        })
    }

    fn list_comments(
        &self,
        asset_id: AssetId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<CommentRecord>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT id, asset_id, user_id, body, created_at FROM comments
                 WHERE asset_id = ?1 ORDER BY id",
            )?;
            let comments = stmt
                .query_map(params![asset_id], |row| {
                    Ok(CommentRecord {
                        comment_id: row.get(0)?,
                        asset_id: row.get(1)?,
                        user_id: row.get(2)?,
                        body: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(comments)
        })
    }

    // ── Audit ───────────────────────────────────────────────────────

    fn append_audit(
        &self,
        entry: NewAuditEntry,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<AuditEntry>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let timestamp = Utc::now();
            conn.execute(
                "INSERT INTO audit_log (user_id, asset_id, action, timestamp, tampered)
                 VALUES (?1, ?2, ?3, ?4, 0)",
                params![entry.user_id, entry.asset_id, entry.action, timestamp],
            )?;
            Ok(AuditEntry {
                log_id: conn.last_insert_rowid(),
                user_id: entry.user_id,
                asset_id: entry.asset_id,
                action: entry.action,
                timestamp,
                tampered: false,
            })
        })
    }

    fn list_audit(
        &self,
        query: AuditQuery,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<AuditEntry>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT id, user_id, asset_id, action, timestamp, tampered FROM audit_log
                 WHERE (?1 IS NULL OR timestamp >= ?1)
                 ORDER BY id DESC
                 LIMIT ?2 OFFSET ?3",
            )?;
            let entries = stmt
                .query_map(
                    params![query.since, query.limit, query.offset],
                    map_audit_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
    }

    fn scan_audit(
        &self,
        after_id: i64,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<AuditEntry>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT id, user_id, asset_id, action, timestamp, tampered FROM audit_log
                 WHERE id > ?1 AND (?2 IS NULL OR timestamp >= ?2)
                 ORDER BY id ASC
                 LIMIT ?3",
            )?;
            let entries = stmt
                .query_map(params![after_id, since, limit], map_audit_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
    }
}

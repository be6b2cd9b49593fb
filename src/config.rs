//! Configuration loading and types for mediavault.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Every section has defaults, so an empty file is a
//! valid configuration for local development.

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Metadata store settings.
    #[serde(default)]
    pub metadata: MetadataConfig,

    /// Blob storage backend settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Upload staging settings.
    #[serde(default)]
    pub uploads: UploadConfig,

    /// Version-number assignment settings.
    #[serde(default)]
    pub versioning: VersioningConfig,

    /// Authentication / authorization settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Read-side view settings.
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Background enrichment settings.
    #[serde(default)]
    pub enrichment: EnrichmentConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Metadata store configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MetadataConfig {
    /// SQLite-specific configuration.
    #[serde(default)]
    pub sqlite: SqliteConfig,
}

/// SQLite-specific metadata configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_metadata_path")]
    pub path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: default_metadata_path(),
        }
    }
}

/// Blob storage backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend type: `local` or `memory`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Local storage configuration.
    #[serde(default)]
    pub local: LocalStorageConfig,

    /// Memory storage configuration.
    #[serde(default)]
    pub memory: MemoryStorageConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            local: LocalStorageConfig::default(),
            memory: MemoryStorageConfig::default(),
        }
    }
}

/// Local filesystem storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    /// Root directory for stored blobs.
    #[serde(default = "default_storage_root")]
    pub root_dir: String,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_storage_root(),
        }
    }
}

/// Memory storage backend configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MemoryStorageConfig {
    /// Maximum total size in bytes (0 = unlimited).
    #[serde(default)]
    pub max_size_bytes: u64,
}

/// Upload staging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Directory for scratch copies of incoming content.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: String,

    /// Maximum accepted upload size in bytes.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,

    /// Longest edge of generated thumbnails, in pixels.
    #[serde(default = "default_thumbnail_max_edge")]
    pub thumbnail_max_edge: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            scratch_dir: default_scratch_dir(),
            max_upload_bytes: default_max_upload_bytes(),
            thumbnail_max_edge: default_thumbnail_max_edge(),
        }
    }
}

/// How version numbers are assigned under concurrency.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VersionAssignment {
    /// Per-asset lock held from reading the current maximum to commit.
    #[default]
    Serialized,
    /// Number derived from the snapshot read at the start of the call.
    Unserialized,
}

/// Versioning configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct VersioningConfig {
    #[serde(default)]
    pub assignment: VersionAssignment,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for signed bearer tokens.
    #[serde(default = "default_token_secret")]
    pub token_secret: String,

    /// Bearer token lifetime in minutes.
    #[serde(default = "default_token_ttl_minutes")]
    pub token_ttl_minutes: i64,

    /// Password reset token lifetime in minutes.
    #[serde(default = "default_reset_token_ttl_minutes")]
    pub reset_token_ttl_minutes: i64,

    /// API credential lifetime in days; absent means no expiry.
    #[serde(default)]
    pub api_credential_ttl_days: Option<i64>,

    /// Role name treated as administrative.
    #[serde(default = "default_admin_role")]
    pub admin_role: String,

    /// Role assigned to self-registered users.
    #[serde(default = "default_default_role")]
    pub default_role: String,

    /// Administrator created on first startup.
    #[serde(default = "default_bootstrap_admin_email")]
    pub bootstrap_admin_email: String,

    /// Initial password of the bootstrap administrator.
    #[serde(default = "default_bootstrap_admin_password")]
    pub bootstrap_admin_password: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: default_token_secret(),
            token_ttl_minutes: default_token_ttl_minutes(),
            reset_token_ttl_minutes: default_reset_token_ttl_minutes(),
            api_credential_ttl_days: None,
            admin_role: default_admin_role(),
            default_role: default_default_role(),
            bootstrap_admin_email: default_bootstrap_admin_email(),
            bootstrap_admin_password: default_bootstrap_admin_password(),
        }
    }
}

/// Read-side view configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    /// Base URL used to derive download links in views.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            public_base_url: default_public_base_url(),
        }
    }
}

/// Background enrichment configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EnrichmentConfig {
    /// Whether uploads schedule auto-tagging jobs.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum classifier confidence for a label to become a tag.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    /// Bounded queue capacity; jobs beyond it are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: default_confidence_threshold(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Install the Prometheus recorder at startup.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_metadata_path() -> String {
    "./data/metadata.db".to_string()
}

fn default_storage_backend() -> String {
    "local".to_string()
}

fn default_storage_root() -> String {
    "./data/blobs".to_string()
}

fn default_scratch_dir() -> String {
    "./data/scratch".to_string()
}

fn default_max_upload_bytes() -> u64 {
    2_147_483_648 // 2 GiB
}

fn default_thumbnail_max_edge() -> u32 {
    256
}

fn default_token_secret() -> String {
    "change-me-mediavault-secret".to_string()
}

fn default_token_ttl_minutes() -> i64 {
    30
}

fn default_reset_token_ttl_minutes() -> i64 {
    15
}

fn default_admin_role() -> String {
    "Admin".to_string()
}

fn default_default_role() -> String {
    "Viewer".to_string()
}

fn default_bootstrap_admin_email() -> String {
    "admin@example.com".to_string()
}

fn default_bootstrap_admin_password() -> String {
    "change-me-admin".to_string()
}

fn default_public_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_confidence_threshold() -> f32 {
    0.6
}

fn default_queue_capacity() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_config(&contents)
}

/// Parse configuration from YAML text.  Empty input yields the defaults.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
}

//! Blob key generation.
//!
//! Keys look like `20261016093000_3f9c..._holiday.png`: a UTC timestamp,
//! 128 random bits, and a sanitized copy of the original file name.  The
//! random part alone makes collisions practically impossible; the rest is
//! for humans browsing the store.

use chrono::Utc;

/// Longest file-name suffix kept in a key.
const MAX_NAME_LEN: usize = 96;

/// Mint a fresh primary blob key for `filename`.
pub fn generate_blob_key(filename: &str) -> String {
    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    let suffix = uuid::Uuid::new_v4().simple();
    format!("{timestamp}_{suffix}_{}", sanitize_filename(filename))
}

/// Key of the derived thumbnail for a primary blob key.
pub fn thumbnail_key(blob_key: &str, extension: &str) -> String {
    format!("{blob_key}.thumb.{extension}")
}

/// Reduce a client-supplied name to `[A-Za-z0-9._-]`, without leading dots.
fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    let mut cleaned: String = cleaned.chars().take(MAX_NAME_LEN).collect();
    if cleaned.is_empty() {
        cleaned.push_str("blob");
    }
    cleaned
}

//! Prometheus metrics for mediavault.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`
//! and defines the metric names the engine records.  Until [`init_metrics`]
//! runs, the `counter!` calls scattered through the engine are no-ops.

use metrics::{counter, describe_counter, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

// -- Metric name constants ----------------------------------------------------

/// Versions committed (counter). Labels: kind (`upload` | `update`).
pub const VERSIONS_CREATED_TOTAL: &str = "mediavault_versions_created_total";

/// Version commits refused because the number was already taken (counter).
pub const VERSION_CONFLICTS_TOTAL: &str = "mediavault_version_conflicts_total";

/// Blobs left behind after a failed compensation (counter).
pub const ORPHAN_BLOBS_TOTAL: &str = "mediavault_orphan_blobs_total";

/// Assets removed by the deletion orchestrator (counter).
pub const ASSETS_DELETED_TOTAL: &str = "mediavault_assets_deleted_total";

/// Enrichment jobs by outcome (counter). Labels: outcome.
pub const ENRICHMENT_JOBS_TOTAL: &str = "mediavault_enrichment_jobs_total";

/// Rejected credentials (counter). Labels: reason.
pub const AUTH_FAILURES_TOTAL: &str = "mediavault_auth_failures_total";

/// Bytes written to the blob store, thumbnails included (counter).
pub const BYTES_STORED_TOTAL: &str = "mediavault_bytes_stored_total";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder and describe every metric.
/// Returns the existing handle when already installed.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    let handle = PROMETHEUS_HANDLE.get_or_init(|| handle);
    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    describe_counter!(VERSIONS_CREATED_TOTAL, "Asset versions committed");
    describe_counter!(
        VERSION_CONFLICTS_TOTAL,
        "Version commits refused because the number was already assigned"
    );
    describe_counter!(
        ORPHAN_BLOBS_TOTAL,
        "Blobs that could not be removed after a failed operation"
    );
    describe_counter!(ASSETS_DELETED_TOTAL, "Assets deleted");
    describe_counter!(ENRICHMENT_JOBS_TOTAL, "Enrichment jobs by outcome");
    describe_counter!(AUTH_FAILURES_TOTAL, "Rejected credentials by reason");
    describe_counter!(
        BYTES_STORED_TOTAL,
        Unit::Bytes,
        "Bytes written to the blob store"
    );
}

// -- Recording helpers --------------------------------------------------------

/// Count a committed version and the bytes it stored.
pub fn record_version_created(kind: &'static str, bytes: u64) {
    counter!(VERSIONS_CREATED_TOTAL, "kind" => kind).increment(1);
    counter!(BYTES_STORED_TOTAL).increment(bytes);
}

pub fn record_version_conflict() {
    counter!(VERSION_CONFLICTS_TOTAL).increment(1);
}

pub fn record_orphan_blob() {
    counter!(ORPHAN_BLOBS_TOTAL).increment(1);
}

pub fn record_asset_deleted() {
    counter!(ASSETS_DELETED_TOTAL).increment(1);
}

pub fn record_enrichment(outcome: &'static str) {
    counter!(ENRICHMENT_JOBS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_auth_failure(reason: &'static str) {
    counter!(AUTH_FAILURES_TOTAL, "reason" => reason).increment(1);
}

/// Render Prometheus exposition text, if the recorder is installed.
pub fn render() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

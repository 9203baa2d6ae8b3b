use std::net::SocketAddr;

use crate::model::SlotChange;
use crate::pipeline::ModificationStatus;

// ── Pipeline ─────────────────────────────────────────────────────

/// Counter: modification dispatches by resulting status. Labels: status.
pub const MODIFICATIONS_TOTAL: &str = "slotline_modifications_total";

/// Gauge: modifications waiting in the scheduler queue.
pub const QUEUE_DEPTH: &str = "slotline_queue_depth";

// ── Consolidation ────────────────────────────────────────────────

/// Counter: consolidations run against the store.
pub const CONSOLIDATIONS_TOTAL: &str = "slotline_consolidations_total";

/// Histogram: fetch + merge + persist duration in seconds.
pub const CONSOLIDATION_DURATION_SECONDS: &str = "slotline_consolidation_duration_seconds";

/// Counter: structural slot changes. Labels: change.
pub const SLOT_CHANGES_TOTAL: &str = "slotline_slot_changes_total";

// ── Cache ────────────────────────────────────────────────────────

/// Counter: day cache lookups. Labels: result (hit, miss, inactive).
pub const CACHE_LOOKUPS_TOTAL: &str = "slotline_cache_lookups_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

pub fn status_label(status: ModificationStatus) -> &'static str {
    match status {
        ModificationStatus::Pending => "pending",
        ModificationStatus::InProgress => "in_progress",
        ModificationStatus::Completed => "completed",
        ModificationStatus::Error => "error",
        ModificationStatus::Obsolete => "obsolete",
    }
}

pub fn record_changes(changes: &[SlotChange]) {
    for change in changes {
        if !matches!(change, SlotChange::Unchanged(_)) {
            metrics::counter!(SLOT_CHANGES_TOTAL, "change" => change.label()).increment(1);
        }
    }
}

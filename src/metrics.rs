// Prometheus metrics for quota decisions
//
// - Admission decisions by action and outcome (counter)
// - Recorded usage events by action (counter)
// - Ledger failures by operation (counter)
// - Unresolvable policies by action (counter)
// - Guard operation latency (histogram)

use lazy_static::lazy_static;
use prometheus::{Encoder, HistogramVec, IntCounterVec, Registry, TextEncoder};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    pub static ref QUOTA_DECISIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("quota_decisions_total", "Admission decisions made by the quota guard"),
        &["action", "outcome"]
    ).expect("Failed to create quota decisions metric");

    pub static ref QUOTA_EVENTS_RECORDED_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("quota_events_recorded_total", "Usage events appended to the ledger"),
        &["action"]
    ).expect("Failed to create recorded events metric");

    pub static ref QUOTA_STORAGE_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("quota_storage_errors_total", "Ledger failures seen by the quota guard"),
        &["operation"]
    ).expect("Failed to create storage errors metric");

    pub static ref QUOTA_CONFIGURATION_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("quota_configuration_errors_total", "Checks that hit a policy configuration error"),
        &["action"]
    ).expect("Failed to create configuration errors metric");

    pub static ref QUOTA_OPERATION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        prometheus::HistogramOpts::new("quota_operation_duration_seconds", "Duration of quota guard operations"),
        &["operation"]
    ).expect("Failed to create operation duration metric");
}

/// Register quota metrics - call once at startup
pub fn init() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(QUOTA_DECISIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUOTA_EVENTS_RECORDED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUOTA_STORAGE_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUOTA_CONFIGURATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUOTA_OPERATION_DURATION_SECONDS.clone()))?;
    Ok(())
}

/// Count one admission decision
pub fn record_decision(action: &str, outcome: &str) {
    QUOTA_DECISIONS_TOTAL
        .with_label_values(&[action, outcome])
        .inc();
}

/// Count one appended usage event
pub fn record_event(action: &str) {
    QUOTA_EVENTS_RECORDED_TOTAL.with_label_values(&[action]).inc();
}

/// Count one ledger failure
pub fn record_storage_error(operation: &str) {
    QUOTA_STORAGE_ERRORS_TOTAL
        .with_label_values(&[operation])
        .inc();
}

/// Count one policy configuration error
pub fn record_configuration_error(action: &str) {
    QUOTA_CONFIGURATION_ERRORS_TOTAL
        .with_label_values(&[action])
        .inc();
}

/// Start timing a guard operation; the timer observes on drop
pub fn start_timer(operation: &str) -> prometheus::HistogramTimer {
    QUOTA_OPERATION_DURATION_SECONDS
        .with_label_values(&[operation])
        .start_timer()
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}

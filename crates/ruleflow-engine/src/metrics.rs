//! Engine metrics.
//!
//! Recorded through the `metrics` facade. Without an installed recorder the
//! calls are no-ops; the daemon decides whether to export them.

use metrics::{counter, describe_counter, describe_gauge, gauge};

// ============================================================================
// Rule Metrics
// ============================================================================

/// Rules that became active.
pub const RULES_REGISTERED: &str = "ruleflow_rules_registered_total";

/// Rules that were stopped and removed.
pub const RULES_UNREGISTERED: &str = "ruleflow_rules_unregistered_total";

/// Rule documents that could not be activated.
pub const RULES_REJECTED: &str = "ruleflow_rules_rejected_total";

/// Currently active rules.
pub const ACTIVE_RULES: &str = "ruleflow_active_rules";

// ============================================================================
// Execution Metrics
// ============================================================================

/// Rule executions by outcome.
pub const EXECUTIONS: &str = "ruleflow_executions_total";

/// Events dropped because the completion marker was present.
pub const MARKER_HITS: &str = "ruleflow_marker_hits_total";

// ============================================================================
// Metric Registration
// ============================================================================

/// Registers all engine metric descriptions.
///
/// Call this once at application startup after initializing the metrics recorder.
pub fn register_metrics() {
    describe_counter!(RULES_REGISTERED, "Total rules activated");
    describe_counter!(RULES_UNREGISTERED, "Total rules removed");
    describe_counter!(RULES_REJECTED, "Total rule documents rejected");
    describe_gauge!(ACTIVE_RULES, "Rules with a live watcher");
    describe_counter!(EXECUTIONS, "Total rule executions by outcome");
    describe_counter!(MARKER_HITS, "Total events skipped by completion marker");
}

/// Records a rule activation.
pub fn record_rule_registered(action: &str) {
    counter!(RULES_REGISTERED, "action" => action.to_string()).increment(1);
}

/// Records a rule removal.
pub fn record_rule_unregistered() {
    counter!(RULES_UNREGISTERED).increment(1);
}

/// Records a rejected rule document.
pub fn record_rule_rejected(reason: &str) {
    counter!(RULES_REJECTED, "reason" => reason.to_string()).increment(1);
}

/// Records the number of active rules.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_rules(count: usize) {
    gauge!(ACTIVE_RULES).set(count as f64);
}

/// Records one execution.
pub fn record_execution(action: &str, outcome: &str) {
    counter!(
        EXECUTIONS,
        "action" => action.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Records an event skipped by its marker.
pub fn record_marker_hit() {
    counter!(MARKER_HITS).increment(1);
}

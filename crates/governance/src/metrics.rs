//! Metrics for governance events
//!
//! Counters and histograms via the `metrics` facade:
//!
//! - `governance_cache_events_total` (counter): label `result` (`hit`, `miss`, `expired`)
//! - `governance_requests_recorded_total` (counter)
//! - `governance_quota_refusals_total` (counter): label `window` (`daily`, `hourly`)
//! - `governance_retry_attempts_total` (counter): label `class`
//! - `governance_credential_rotations_total` (counter)
//! - `governance_pacing_wait_seconds` (histogram)
//!
//! The crate installs no recorder; without one these calls are no-ops.

/// Record a cache lookup outcome.
pub fn record_cache_event(result: &str) {
    metrics::counter!("governance_cache_events_total", "result" => result.to_string()).increment(1);
}

/// Record one admitted upstream request.
pub fn record_admitted_request() {
    metrics::counter!("governance_requests_recorded_total").increment(1);
}

/// Record a quota refusal against the window that triggered it.
pub fn record_quota_refusal(window: &str) {
    metrics::counter!("governance_quota_refusals_total", "window" => window.to_string())
        .increment(1);
}

/// Record a failed attempt with its classification label.
pub fn record_retry_attempt(class: &str) {
    metrics::counter!("governance_retry_attempts_total", "class" => class.to_string()).increment(1);
}

/// Record a credential rotation.
pub fn record_rotation() {
    metrics::counter!("governance_credential_rotations_total").increment(1);
}

/// Record how long a caller was paced before its call started.
pub fn record_pacing_wait(seconds: f64) {
    metrics::histogram!("governance_pacing_wait_seconds").record(seconds);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        // When no recorder is installed, metrics calls are no-ops.
        // This verifies the functions don't panic in test environments.
        record_cache_event("hit");
        record_admitted_request();
        record_quota_refusal("daily");
        record_retry_attempt("transient");
        record_rotation();
        record_pacing_wait(0.25);
    }
}

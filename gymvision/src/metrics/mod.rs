//! Recognition and quota metrics for Prometheus.
//!
//! Registered on the default registry and exposed alongside the HTTP metrics at
//! `/internal/metrics`.

use once_cell::sync::Lazy;
use prometheus::{Histogram, IntCounterVec, register_histogram, register_int_counter_vec};
use std::time::Duration;

/// Counter of finished recognition requests by outcome
static RECOGNITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gymvision_recognitions_total",
        "Total recognition requests by outcome",
        &["outcome"]
    )
    .expect("Failed to register gymvision_recognitions_total metric")
});

/// Counter of quota ledger events (reserved, exhausted, committed, released, stale_released, resolve_failed)
static QUOTA_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("gymvision_quota_events_total", "Total quota ledger events", &["event"])
        .expect("Failed to register gymvision_quota_events_total metric")
});

/// Histogram of classifier call latency, including timeouts
/// Buckets: 250ms to 60s
static CLASSIFIER_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "gymvision_classifier_duration_seconds",
        "Time spent waiting for the image classifier (seconds)",
        vec![0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 15.0, 30.0, 60.0]
    )
    .expect("Failed to register gymvision_classifier_duration_seconds metric")
});

/// Record the outcome of a recognition request
///
/// # Arguments
/// * `outcome` - One of `recognized`, `unrecognized`, `classifier_failed`, `quota_exhausted`,
///   `invalid_image`
pub fn record_recognition_outcome(outcome: &str) {
    RECOGNITIONS.with_label_values(&[outcome]).inc();
}

pub fn record_quota_event(event: &str) {
    QUOTA_EVENTS.with_label_values(&[event]).inc();
}

pub fn observe_classifier_duration(elapsed: Duration) {
    CLASSIFIER_DURATION_SECONDS.observe(elapsed.as_secs_f64());
}

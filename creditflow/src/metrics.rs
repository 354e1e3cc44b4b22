//! Payment pipeline metrics for Prometheus.
//!
//! The asynchronous paths (webhook, fulfillment job) are invisible to the
//! customer once they leave checkout, so these counters are how operators see
//! them.

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, TextEncoder, register_int_counter, register_int_counter_vec};

/// Orders created, by platform and initial status
static ORDERS_CREATED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "creditflow_orders_created_total",
        "Total orders created by the payment initiator",
        &["platform", "status"]
    )
    .expect("Failed to register creditflow_orders_created_total metric")
});

/// Payment initiation failures, by platform and error code
static PAYMENT_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "creditflow_payment_errors_total",
        "Total payment initiation failures",
        &["platform", "code"]
    )
    .expect("Failed to register creditflow_payment_errors_total metric")
});

/// Webhook deliveries, by outcome
static WEBHOOK_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "creditflow_webhook_events_total",
        "Total checkout webhook deliveries by outcome",
        &["outcome"]
    )
    .expect("Failed to register creditflow_webhook_events_total metric")
});

/// Verified webhooks that could not be matched to any order
static WEBHOOK_ORPHANED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "creditflow_webhook_orphaned_events_total",
        "Verified checkout events acknowledged without a matching order"
    )
    .expect("Failed to register creditflow_webhook_orphaned_events_total metric")
});

/// Fulfillment job runs, by terminal or retry outcome
static FULFILLMENT_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "creditflow_fulfillment_jobs_total",
        "Fulfillment job attempts by outcome",
        &["source", "outcome"]
    )
    .expect("Failed to register creditflow_fulfillment_jobs_total metric")
});

/// Credits added to balances, by source
static CREDITS_GRANTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "creditflow_credits_granted_total",
        "Total credits added to user balances",
        &["source"]
    )
    .expect("Failed to register creditflow_credits_granted_total metric")
});

pub fn record_order_created(platform: &str, status: &str) {
    ORDERS_CREATED.with_label_values(&[platform, status]).inc();
}

pub fn record_payment_error(platform: &str, code: &str) {
    PAYMENT_ERRORS.with_label_values(&[platform, code]).inc();
}

/// Record a webhook delivery outcome (`rejected`, `ignored`, `succeeded`, ...)
pub fn record_webhook_event(outcome: &str) {
    WEBHOOK_EVENTS.with_label_values(&[outcome]).inc();
}

pub fn record_webhook_orphaned() {
    WEBHOOK_ORPHANED.inc();
}

pub fn record_fulfillment_outcome(source: &str, outcome: &str) {
    FULFILLMENT_OUTCOMES.with_label_values(&[source, outcome]).inc();
}

/// Record credits added to a balance. Negative values are ignored.
pub fn record_credits_granted(source: &str, credits: i64) {
    CREDITS_GRANTED.with_label_values(&[source]).inc_by(credits.max(0) as u64);
}

/// Render the default registry in the Prometheus text format
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orphaned_counter_is_exported() {
        record_webhook_orphaned();
        record_credits_granted("checkout", 120);

        let text = render().unwrap();
        assert!(text.contains("creditflow_webhook_orphaned_events_total"));
        assert!(text.contains("creditflow_credits_granted_total{source=\"checkout\"}"));
    }
}

//! Prometheus metrics for the credit ledger
//!
//! # Metrics
//!
//! - `credit_ledger_requests_total{operation}` - Requests committed
//! - `credit_ledger_request_failures_total{operation}` - Requests rejected
//! - `credit_ledger_events_total{kind}` - Events published after commit
//! - `credit_ledger_gas_consumed` - Gas used per committed request
//!
//! Collectors live in a private [`Registry`] so several ledgers (or tests)
//! can run in one process.

use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Committed requests per operation
    pub requests_total: IntCounterVec,

    /// Failed requests per operation
    pub request_failures_total: IntCounterVec,

    /// Published events per kind
    pub events_total: IntCounterVec,

    /// Gas consumed per committed request
    pub gas_consumed: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let requests_total = IntCounterVec::new(
            Opts::new("credit_ledger_requests_total", "Requests committed"),
            &["operation"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_failures_total = IntCounterVec::new(
            Opts::new("credit_ledger_request_failures_total", "Requests rejected"),
            &["operation"],
        )?;
        registry.register(Box::new(request_failures_total.clone()))?;

        let events_total = IntCounterVec::new(
            Opts::new("credit_ledger_events_total", "Events published after commit"),
            &["kind"],
        )?;
        registry.register(Box::new(events_total.clone()))?;

        let gas_consumed = Histogram::with_opts(
            HistogramOpts::new("credit_ledger_gas_consumed", "Gas used per committed request")
                .buckets(vec![10.0, 20.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0]),
        )?;
        registry.register(Box::new(gas_consumed.clone()))?;

        Ok(Self {
            requests_total,
            request_failures_total,
            events_total,
            gas_consumed,
            registry,
        })
    }

    /// Record a committed request
    pub fn record_success(&self, operation: &str, gas: u64) {
        self.requests_total.with_label_values(&[operation]).inc();
        self.gas_consumed.observe(gas as f64);
    }

    /// Record a rejected request
    pub fn record_failure(&self, operation: &str) {
        self.request_failures_total.with_label_values(&[operation]).inc();
    }

    /// Record a published event
    pub fn record_event(&self, kind: &str) {
        self.events_total.with_label_values(&[kind]).inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_independent() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();

        first.record_success("retire", 20);
        assert_eq!(first.requests_total.with_label_values(&["retire"]).get(), 1);
        assert_eq!(second.requests_total.with_label_values(&["retire"]).get(), 0);
    }

    #[test]
    fn test_record_failure_and_events() {
        let metrics = Metrics::new().unwrap();
        metrics.record_failure("send");
        metrics.record_failure("send");
        metrics.record_event("transfer");

        assert_eq!(metrics.request_failures_total.with_label_values(&["send"]).get(), 2);
        assert_eq!(metrics.events_total.with_label_values(&["transfer"]).get(), 1);

        let families = metrics.registry().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "credit_ledger_request_failures_total"));
    }

    #[test]
    fn test_gas_histogram() {
        let metrics = Metrics::new().unwrap();
        metrics.record_success("cancel", 10);
        metrics.record_success("cancel", 30);
        assert_eq!(metrics.gas_consumed.get_sample_count(), 2);
        assert_eq!(metrics.gas_consumed.get_sample_sum(), 40.0);
    }
}

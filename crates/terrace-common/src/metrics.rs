//! Metrics for Terrace observability
//!
//! Controllers receive a [`MetricsSink`] at construction instead of reaching
//! for process-wide registries:
//! - Reconcile durations and outcomes per kind
//! - Execution units created per stage
//! - Condition transitions per type and reason

use std::time::Duration;

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

/// Sink for controller metrics
pub trait MetricsSink: Send + Sync {
    /// A reconciliation cycle finished
    ///
    /// `outcome` is one of `done`, `requeue`, `error`.
    fn reconcile_finished(&self, kind: &str, outcome: &str, duration: Duration);

    /// An execution unit was created for a stage
    fn unit_created(&self, kind: &str, stage: &str);

    /// A condition changed status, reason or message
    fn condition_transitioned(&self, kind: &str, condition: &str, reason: &str);

    /// A revision was deleted after expiring
    fn revision_expired(&self, plan: &str);
}

/// OpenTelemetry-backed sink
pub struct OtelMetrics {
    reconcile_duration: Histogram<f64>,
    reconcile_total: Counter<u64>,
    units_created: Counter<u64>,
    condition_transitions: Counter<u64>,
    revisions_expired: Counter<u64>,
}

impl OtelMetrics {
    /// Build instruments from the given meter
    pub fn new(meter: &Meter) -> Self {
        Self {
            reconcile_duration: meter
                .f64_histogram("terrace_reconcile_duration_seconds")
                .with_description("Duration of reconciliation cycles in seconds")
                .with_unit("s")
                .build(),
            reconcile_total: meter
                .u64_counter("terrace_reconcile_total")
                .with_description("Total reconciliation cycles by outcome")
                .with_unit("{cycles}")
                .build(),
            units_created: meter
                .u64_counter("terrace_execution_units_created_total")
                .with_description("Execution units created by stage")
                .with_unit("{units}")
                .build(),
            condition_transitions: meter
                .u64_counter("terrace_condition_transitions_total")
                .with_description("Condition transitions by type and reason")
                .with_unit("{transitions}")
                .build(),
            revisions_expired: meter
                .u64_counter("terrace_revisions_expired_total")
                .with_description("Revisions deleted after expiring")
                .with_unit("{revisions}")
                .build(),
        }
    }

    /// Build instruments from the global meter provider
    pub fn global() -> Self {
        Self::new(&opentelemetry::global::meter("terrace"))
    }
}

impl MetricsSink for OtelMetrics {
    fn reconcile_finished(&self, kind: &str, outcome: &str, duration: Duration) {
        let attrs = [
            KeyValue::new("kind", kind.to_string()),
            KeyValue::new("outcome", outcome.to_string()),
        ];
        self.reconcile_duration
            .record(duration.as_secs_f64(), &attrs);
        self.reconcile_total.add(1, &attrs);
    }

    fn unit_created(&self, kind: &str, stage: &str) {
        self.units_created.add(
            1,
            &[
                KeyValue::new("kind", kind.to_string()),
                KeyValue::new("stage", stage.to_string()),
            ],
        );
    }

    fn condition_transitioned(&self, kind: &str, condition: &str, reason: &str) {
        self.condition_transitions.add(
            1,
            &[
                KeyValue::new("kind", kind.to_string()),
                KeyValue::new("condition", condition.to_string()),
                KeyValue::new("reason", reason.to_string()),
            ],
        );
    }

    fn revision_expired(&self, plan: &str) {
        self.revisions_expired
            .add(1, &[KeyValue::new("plan", plan.to_string())]);
    }
}

/// Sink that drops everything
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn reconcile_finished(&self, _kind: &str, _outcome: &str, _duration: Duration) {}
    fn unit_created(&self, _kind: &str, _stage: &str) {}
    fn condition_transitioned(&self, _kind: &str, _condition: &str, _reason: &str) {}
    fn revision_expired(&self, _plan: &str) {}
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::domain::Outcome;

/// Metrics registry for the engine.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    /// Submissions accepted (new runs and coalesced duplicates)
    pub submissions_total: AtomicU64,

    /// Submissions attached to an in-flight run
    pub submissions_coalesced: AtomicU64,

    /// Submissions rejected by the per-org limit
    pub capacity_rejections: AtomicU64,

    /// Completed runs by outcome
    pub runs_eligible: AtomicU64,
    pub runs_ineligible: AtomicU64,
    pub runs_indeterminate: AtomicU64,

    /// Runs finalized as failed
    pub runs_failed: AtomicU64,

    /// Evaluation latency buckets (microseconds)
    pub latency_under_1ms: AtomicU64,
    pub latency_1_5ms: AtomicU64,
    pub latency_5_10ms: AtomicU64,
    pub latency_10_50ms: AtomicU64,
    pub latency_over_50ms: AtomicU64,

    /// Persistence
    pub persistence_retries: AtomicU64,
    pub persistence_failures: AtomicU64,

    /// Rule set publication
    pub rule_sets_published: AtomicU64,
    pub rule_set_rejections: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        MetricsRegistry::default()
    }

    /// Record an accepted submission.
    pub fn record_submission(&self, coalesced: bool) {
        self.submissions_total.fetch_add(1, Ordering::Relaxed);
        if coalesced {
            self.submissions_coalesced.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_capacity_rejection(&self) {
        self.capacity_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed run.
    pub fn record_outcome(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Eligible => &self.runs_eligible,
            Outcome::Ineligible => &self.runs_ineligible,
            Outcome::Indeterminate => &self.runs_indeterminate,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.runs_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record evaluation latency.
    pub fn record_latency(&self, start: Instant) {
        let micros = start.elapsed().as_micros() as u64;

        let bucket = if micros < 1_000 {
            &self.latency_under_1ms
        } else if micros < 5_000 {
            &self.latency_1_5ms
        } else if micros < 10_000 {
            &self.latency_5_10ms
        } else if micros < 50_000 {
            &self.latency_10_50ms
        } else {
            &self.latency_over_50ms
        };
        bucket.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persistence_retry(&self) {
        self.persistence_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persistence_failure(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publication(&self, success: bool) {
        if success {
            self.rule_sets_published.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rule_set_rejections.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        format!(
            r#"# HELP eligr_submissions_total Run submissions accepted
# TYPE eligr_submissions_total counter
eligr_submissions_total {}

# HELP eligr_submissions_coalesced_total Submissions attached to an in-flight run
# TYPE eligr_submissions_coalesced_total counter
eligr_submissions_coalesced_total {}

# HELP eligr_capacity_rejections_total Submissions rejected by the per-organization limit
# TYPE eligr_capacity_rejections_total counter
eligr_capacity_rejections_total {}

# HELP eligr_runs Finalized runs by outcome
# TYPE eligr_runs counter
eligr_runs{{outcome="eligible"}} {}
eligr_runs{{outcome="ineligible"}} {}
eligr_runs{{outcome="indeterminate"}} {}
eligr_runs{{outcome="failed"}} {}

# HELP eligr_evaluation_latency_bucket Evaluation latency histogram
# TYPE eligr_evaluation_latency_bucket counter
eligr_evaluation_latency_bucket{{le="0.001"}} {}
eligr_evaluation_latency_bucket{{le="0.005"}} {}
eligr_evaluation_latency_bucket{{le="0.01"}} {}
eligr_evaluation_latency_bucket{{le="0.05"}} {}
eligr_evaluation_latency_bucket{{le="+Inf"}} {}

# HELP eligr_persistence_retries_total Finalization writes retried
# TYPE eligr_persistence_retries_total counter
eligr_persistence_retries_total {}

# HELP eligr_persistence_failures_total Finalizations that exhausted retries
# TYPE eligr_persistence_failures_total counter
eligr_persistence_failures_total {}

# HELP eligr_rule_sets_published_total Rule sets published
# TYPE eligr_rule_sets_published_total counter
eligr_rule_sets_published_total {}

# HELP eligr_rule_set_rejections_total Rule set publications rejected
# TYPE eligr_rule_set_rejections_total counter
eligr_rule_set_rejections_total {}
"#,
            load(&self.submissions_total),
            load(&self.submissions_coalesced),
            load(&self.capacity_rejections),
            load(&self.runs_eligible),
            load(&self.runs_ineligible),
            load(&self.runs_indeterminate),
            load(&self.runs_failed),
            load(&self.latency_under_1ms),
            load(&self.latency_1_5ms),
            load(&self.latency_5_10ms),
            load(&self.latency_10_50ms),
            load(&self.latency_over_50ms),
            load(&self.persistence_retries),
            load(&self.persistence_failures),
            load(&self.rule_sets_published),
            load(&self.rule_set_rejections),
        )
    }
}

/// Records elapsed time into the latency buckets when dropped.
pub struct TimingGuard<'a> {
    registry: &'a MetricsRegistry,
    start: Instant,
}

impl<'a> TimingGuard<'a> {
    pub fn new(registry: &'a MetricsRegistry) -> Self {
        TimingGuard {
            registry,
            start: Instant::now(),
        }
    }
}

impl<'a> Drop for TimingGuard<'a> {
    fn drop(&mut self) {
        self.registry.record_latency(self.start);
    }
}

//! Run lifecycle: admission, deduplication, evaluation and finalization.

pub mod capacity;
pub mod fingerprint;
pub mod handle;
pub mod inflight;
pub mod retry;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::audit::AuditTrail;
use crate::domain::{Actor, Facts, OrgId, RuleSetVersion, Run, RunFailure, RunFilter, RunId, RunResult};
use crate::error::EngineError;
use crate::observability::{MetricsRegistry, TimingGuard};
use crate::rules::{evaluate, validate, EvaluationError, RuleSet, RuleSetDraft, ValidationError};
use crate::storage::{RunStore, StorageError};
use crate::tenant::{Pager, RunPages, TenantScope, TenantStore};

pub use capacity::{CapacityLimiter, CapacityPermit};
pub use fingerprint::{canonical_facts, fingerprint};
pub use handle::RunHandle;
pub use inflight::{Acquired, InFlightTable, LeaderLease};
pub use retry::RetryPolicy;

/// Tunables for [`RunManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunManagerConfig {
    /// Runs admitted but not finalized, per organization
    pub max_concurrent_runs_per_org: usize,
    /// Backoff for run and audit writes
    pub retry: RetryPolicy,
    /// Page size for lazy listings
    pub page_size: usize,
}

impl Default for RunManagerConfig {
    fn default() -> Self {
        RunManagerConfig {
            max_concurrent_runs_per_org: 8,
            retry: RetryPolicy::default(),
            page_size: 100,
        }
    }
}

struct Inner {
    tenants: TenantStore,
    audit: AuditTrail,
    inflight: InFlightTable,
    capacity: CapacityLimiter,
    config: RunManagerConfig,
    metrics: Arc<MetricsRegistry>,
}

/// Entry point for publishing rule sets and running evaluations.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RunManager {
    inner: Arc<Inner>,
}

impl RunManager {
    pub fn new(
        store: Arc<dyn RunStore>,
        config: RunManagerConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let tenants = TenantStore::new(store);
        let audit = AuditTrail::new(tenants.clone(), config.page_size);

        RunManager {
            inner: Arc::new(Inner {
                tenants,
                audit,
                inflight: InFlightTable::new(),
                capacity: CapacityLimiter::new(config.max_concurrent_runs_per_org),
                config,
                metrics,
            }),
        }
    }

    fn scope(&self, org: &OrgId) -> TenantScope {
        self.inner.tenants.scope(org)
    }

    /// Validate and publish a rule set version for `org`.
    ///
    /// Publishing identical content under an existing version is a no-op
    /// that returns the stored rule set; different content is a conflict.
    pub async fn publish_rule_set(
        &self,
        org: &OrgId,
        draft: RuleSetDraft,
    ) -> Result<RuleSet, EngineError> {
        let metrics = &self.inner.metrics;

        let rule_set = match validate(org, draft) {
            Ok(rule_set) => rule_set,
            Err(e) => {
                metrics.record_publication(false);
                warn!(org_id = %org, error = %e, "rule set rejected");
                return Err(e.into());
            }
        };

        let stored = self.scope(org).put_rule_set(&rule_set).await?;
        if stored.content_hash() != rule_set.content_hash() {
            metrics.record_publication(false);
            warn!(
                org_id = %org,
                version = %rule_set.version(),
                "version already published with different content"
            );
            return Err(ValidationError::VersionConflict {
                version: rule_set.version().to_string(),
            }
            .into());
        }

        metrics.record_publication(true);
        info!(
            org_id = %org,
            version = %stored.version(),
            rules = stored.rules().len(),
            content_hash = %stored.short_hash(),
            "rule set published"
        );
        Ok(stored)
    }

    pub async fn get_rule_set(
        &self,
        org: &OrgId,
        version: &RuleSetVersion,
    ) -> Result<RuleSet, EngineError> {
        self.scope(org)
            .get_rule_set(version)
            .await?
            .ok_or_else(|| EngineError::not_found("rule set", version))
    }

    /// Submit facts for evaluation against a published rule set.
    ///
    /// Returns as soon as the run is admitted. A submission identical to a
    /// run still in flight attaches to that run instead of starting another.
    pub async fn submit_run(
        &self,
        org: &OrgId,
        version: &RuleSetVersion,
        facts: Facts,
        actor: Actor,
    ) -> Result<RunHandle, EngineError> {
        if org.is_empty() {
            return Err(ValidationError::EmptyOrganization.into());
        }

        let scope = self.scope(org);
        let rule_set = scope
            .get_rule_set(version)
            .await?
            .ok_or_else(|| EngineError::not_found("rule set", version))?;
        rule_set.check_facts(&facts)?;

        let fp = fingerprint(org, version, &facts);
        let metrics = &self.inner.metrics;

        let acquired = self
            .inner
            .inflight
            .acquire(&fp, || self.inner.capacity.try_acquire(org));

        let lease = match acquired {
            Ok(Acquired::Leader(lease)) => lease,
            Ok(Acquired::Follower {
                run_id,
                result,
                mut recorded,
            }) => {
                // Hand out the handle only once the run can be read back. A
                // leader that fails to record it publishes the failure instead.
                let _ = recorded.wait_for(|stored| *stored).await;
                metrics.record_submission(true);
                debug!(org_id = %org, run_id = %run_id, fingerprint = %fp.short(), "attached to in-flight run");
                return Ok(RunHandle::new(run_id, org.clone(), fp, true, result));
            }
            Err(e) => {
                metrics.record_capacity_rejection();
                warn!(org_id = %org, error = %e, "submission rejected");
                return Err(e);
            }
        };
        metrics.record_submission(false);

        let mut run = Run::new(lease.run_id, org.clone(), version.clone(), fp.clone(), facts, actor);
        let handle = RunHandle::new(run.id, org.clone(), fp.clone(), false, lease.result.clone());

        if let Err(e) = self.begin(&scope, &mut run).await {
            error!(org_id = %org, run_id = %run.id, error = %e, "could not record run");
            let LeaderLease {
                publisher, permit, ..
            } = lease;
            drop(permit);
            self.inner.inflight.release(&fp, run.id);
            publisher.send_replace(Some(Err(RunFailure::Persistence {
                message: e.to_string(),
            })));
            return Err(e);
        }

        lease.recorded.send_replace(true);
        debug!(org_id = %org, run_id = %run.id, fingerprint = %fp.short(), "run admitted");

        let manager = self.clone();
        tokio::spawn(async move {
            manager.execute(scope, run, rule_set, lease).await;
        });

        Ok(handle)
    }

    /// Persist the run as pending, then as running.
    async fn begin(&self, scope: &TenantScope, run: &mut Run) -> Result<(), EngineError> {
        self.write_run(scope, run).await?;
        run.start()
            .map_err(|e| EngineError::Evaluation(e.to_string()))?;
        self.write_run(scope, run).await?;
        Ok(())
    }

    async fn execute(self, scope: TenantScope, run: Run, rule_set: RuleSet, lease: LeaderLease) {
        let LeaderLease {
            publisher, permit, ..
        } = lease;

        let evaluated = {
            let _timing = TimingGuard::new(&self.inner.metrics);
            std::panic::catch_unwind(AssertUnwindSafe(|| evaluate(&rule_set, &run.facts)))
        };

        let result: RunResult = match evaluated {
            Ok(Ok(decision)) => Ok(decision),
            Ok(Err(EvaluationError::MissingFact { rule, fact })) => {
                Err(RunFailure::MissingFact { rule, fact })
            }
            Ok(Err(e)) => Err(RunFailure::Evaluation {
                message: e.to_string(),
            }),
            Err(_) => Err(RunFailure::Evaluation {
                message: "evaluator panicked".to_string(),
            }),
        };

        let fp = run.fingerprint.clone();
        let run_id = run.id;
        let result = self.finalize(&scope, run, result).await;

        // Free the slot before waking waiters so a caller that resubmits
        // right after its result arrives is not rejected by its own run.
        drop(permit);
        self.inner.inflight.release(&fp, run_id);
        publisher.send_replace(Some(result));
    }

    /// Write the terminal run and its audit entry. When that cannot be done
    /// the run is recorded as failed with the persistence error instead.
    async fn finalize(&self, scope: &TenantScope, running: Run, result: RunResult) -> RunResult {
        let metrics = &self.inner.metrics;

        let mut finished = running.clone();
        let transition = match &result {
            Ok(decision) => finished.complete(decision.clone()),
            Err(failure) => finished.fail(failure.clone()),
        };
        if let Err(e) = transition {
            error!(run_id = %running.id, error = %e, "invalid run transition");
            metrics.record_failure();
            return Err(RunFailure::Evaluation {
                message: e.to_string(),
            });
        }

        match self.write_final(scope, &finished).await {
            Ok(()) => {
                match &result {
                    Ok(decision) => {
                        metrics.record_outcome(decision.outcome);
                        info!(
                            org_id = %finished.org_id,
                            run_id = %finished.id,
                            version = %finished.rule_set_version,
                            outcome = %decision.outcome,
                            "run completed"
                        );
                    }
                    Err(failure) => {
                        metrics.record_failure();
                        info!(
                            org_id = %finished.org_id,
                            run_id = %finished.id,
                            failure = %failure,
                            "run failed"
                        );
                    }
                }
                result
            }
            Err(e) => {
                metrics.record_persistence_failure();
                metrics.record_failure();
                error!(run_id = %running.id, error = %e, "finalization failed, retries exhausted");

                let failure = RunFailure::Persistence {
                    message: e.to_string(),
                };
                let mut failed = running;
                if failed.fail(failure.clone()).is_ok() {
                    if let Err(e) = self.write_final(scope, &failed).await {
                        error!(run_id = %failed.id, error = %e, "could not record persistence failure");
                    }
                }
                Err(failure)
            }
        }
    }

    async fn write_run(&self, scope: &TenantScope, run: &Run) -> Result<(), StorageError> {
        let metrics = &self.inner.metrics;
        self.inner
            .config
            .retry
            .run(
                || scope.put_run(run),
                |attempt, e| {
                    metrics.record_persistence_retry();
                    warn!(run_id = %run.id, attempt, error = %e, "run write failed, retrying");
                },
            )
            .await
    }

    async fn write_final(&self, scope: &TenantScope, run: &Run) -> Result<(), StorageError> {
        let metrics = &self.inner.metrics;
        let audit = &self.inner.audit;
        self.inner
            .config
            .retry
            .run(
                || audit.record_finalization(scope, run),
                |attempt, e| {
                    metrics.record_persistence_retry();
                    warn!(run_id = %run.id, attempt, error = %e, "finalization failed, retrying");
                },
            )
            .await
            .map(|_| ())
    }

    /// Fetch a run owned by `org`.
    pub async fn get_run(&self, org: &OrgId, id: RunId) -> Result<Run, EngineError> {
        self.scope(org)
            .get_run(id)
            .await?
            .ok_or_else(|| EngineError::not_found("run", id))
    }

    /// Lazy listing of `org`'s runs, oldest first.
    pub fn list_runs(&self, org: &OrgId, filter: RunFilter) -> Pager<RunPages> {
        self.scope(org).runs(filter, self.inner.config.page_size)
    }

    pub fn audit_trail(&self) -> &AuditTrail {
        &self.inner.audit
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.inner.metrics
    }

    pub fn config(&self) -> &RunManagerConfig {
        &self.inner.config
    }

    /// Runs admitted but not yet finalized, across all organizations.
    pub fn in_flight(&self) -> usize {
        self.inner.inflight.len()
    }

    /// Capacity slots held by `org`.
    pub fn running(&self, org: &OrgId) -> usize {
        self.inner.capacity.in_use(org)
    }

    /// Wait for in-flight runs to finish. Returns false on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.inner.inflight.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}

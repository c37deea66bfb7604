// src/storage/traits.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{AuditEntry, AuditFilter, OrgId, Run, RunFilter, RunId, RuleSetVersion};
use crate::rules::RuleSet;

use super::error::StorageError;

/// Position in a listing. Listings are ordered by `(at, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageCursor {
    pub at: DateTime<Utc>,
    pub id: Uuid,
}

impl PageCursor {
    pub fn for_run(run: &Run) -> Self {
        PageCursor {
            at: run.created_at,
            id: run.id.as_uuid(),
        }
    }

    pub fn for_audit(entry: &AuditEntry) -> Self {
        PageCursor {
            at: entry.recorded_at,
            id: entry.run_id.as_uuid(),
        }
    }
}

/// Result of an idempotent audit write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// An entry for this run already exists; nothing was written
    AlreadyRecorded,
}

/// Organization-scoped persistence for runs, rule sets and audit entries.
///
/// Every method takes the owning organization; implementations key all
/// data by `(org_id, entity id)` and never return another tenant's rows.
#[async_trait]
pub trait RunStore: Send + Sync {
    // Runs

    /// Insert or update a run. Rejects status regressions and any write to
    /// a run that is already terminal with `StorageError::Conflict`.
    async fn put_run(&self, org: &OrgId, run: &Run) -> Result<(), StorageError>;

    async fn get_run(&self, org: &OrgId, id: RunId) -> Result<Option<Run>, StorageError>;

    /// Runs matching `filter`, strictly after `after`, at most `limit`.
    async fn query_runs(
        &self,
        org: &OrgId,
        filter: &RunFilter,
        after: Option<PageCursor>,
        limit: usize,
    ) -> Result<Vec<Run>, StorageError>;

    // Rule sets

    /// Insert if `(org, version)` is absent. Returns whichever rule set is
    /// stored afterwards, so callers can detect content conflicts.
    async fn put_rule_set(&self, org: &OrgId, rule_set: &RuleSet) -> Result<RuleSet, StorageError>;

    async fn get_rule_set(
        &self,
        org: &OrgId,
        version: &RuleSetVersion,
    ) -> Result<Option<RuleSet>, StorageError>;

    // Audit

    /// Append an entry, idempotent by run id.
    async fn append_audit(&self, org: &OrgId, entry: &AuditEntry)
        -> Result<AppendOutcome, StorageError>;

    /// Store the terminal run and its audit entry as one atomic unit.
    ///
    /// Idempotent by run id: when an entry already exists, no second entry
    /// is written and `AlreadyRecorded` is returned. A stored run that is not
    /// yet terminal is still brought to `run`, so an entry never points at
    /// an unfinished run.
    async fn finalize_run(
        &self,
        org: &OrgId,
        run: &Run,
        entry: &AuditEntry,
    ) -> Result<AppendOutcome, StorageError>;

    async fn list_audit(
        &self,
        org: &OrgId,
        filter: &AuditFilter,
        after: Option<PageCursor>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>, StorageError>;
}

/// Reject writes that would move `existing` backwards or rewrite a final run.
pub(crate) fn check_progression(existing: &Run, next: &Run) -> Result<(), StorageError> {
    let (from, to) = (existing.status(), next.status());
    if from.is_terminal() || to.rank() < from.rank() {
        return Err(StorageError::Conflict(format!(
            "run {} cannot move from {} to {}",
            existing.id, from, to
        )));
    }
    Ok(())
}

use tracing::debug;

use crate::domain::{AuditEntry, AuditFilter, OrgId, Run};
use crate::storage::{AppendOutcome, StorageError};
use crate::tenant::{AuditPages, Pager, TenantScope, TenantStore};

/// Append-only provenance log of finalized runs.
///
/// There is no update or delete path; an entry written for a run is final.
#[derive(Clone)]
pub struct AuditTrail {
    tenants: TenantStore,
    page_size: usize,
}

impl AuditTrail {
    pub fn new(tenants: TenantStore, page_size: usize) -> Self {
        AuditTrail { tenants, page_size }
    }

    /// Append an entry. A second append for the same run is a no-op.
    pub async fn append(&self, entry: &AuditEntry) -> Result<AppendOutcome, StorageError> {
        let outcome = self.tenants.scope(&entry.org_id).append_audit(entry).await?;
        if outcome == AppendOutcome::AlreadyRecorded {
            debug!(org_id = %entry.org_id, run_id = %entry.run_id, "audit entry already recorded");
        }
        Ok(outcome)
    }

    /// Write a terminal run together with its audit entry.
    pub async fn record_finalization(
        &self,
        scope: &TenantScope,
        run: &Run,
    ) -> Result<AppendOutcome, StorageError> {
        let entry = AuditEntry::for_run(run).ok_or_else(|| {
            StorageError::Conflict(format!(
                "run {} is {} and cannot be finalized",
                run.id,
                run.status()
            ))
        })?;
        scope.finalize_run(run, &entry).await
    }

    /// Lazy listing of an organization's entries, oldest first.
    pub fn list_for(&self, org: &OrgId, filter: AuditFilter) -> Pager<AuditPages> {
        self.tenants.scope(org).audit(filter, self.page_size)
    }
}

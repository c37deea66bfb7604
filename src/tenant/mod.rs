pub mod pager;

pub use pager::{PageSource, Pager};

use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::{AuditEntry, AuditFilter, OrgId, Run, RunFilter, RunId, RuleSetVersion};
use crate::rules::RuleSet;
use crate::storage::{AppendOutcome, PageCursor, RunStore, StorageError};

/// Entry point to the run store. Every access goes through a
/// [`TenantScope`] bound to one organization.
#[derive(Clone)]
pub struct TenantStore {
    store: Arc<dyn RunStore>,
}

impl TenantStore {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        TenantStore { store }
    }

    pub fn scope(&self, org: &OrgId) -> TenantScope {
        TenantScope {
            org: org.clone(),
            store: self.store.clone(),
        }
    }
}

/// Store handle bound to one organization.
///
/// Reads only ever see that organization's keys; writes of entities owned
/// by another organization are rejected before reaching the store.
#[derive(Clone)]
pub struct TenantScope {
    org: OrgId,
    store: Arc<dyn RunStore>,
}

impl TenantScope {
    pub fn org(&self) -> &OrgId {
        &self.org
    }

    fn owns(&self, owner: &OrgId) -> Result<(), StorageError> {
        if owner != &self.org {
            return Err(StorageError::TenantMismatch {
                expected: self.org.to_string(),
                found: owner.to_string(),
            });
        }
        Ok(())
    }

    pub async fn put_run(&self, run: &Run) -> Result<(), StorageError> {
        self.owns(&run.org_id)?;
        self.store.put_run(&self.org, run).await
    }

    pub async fn get_run(&self, id: RunId) -> Result<Option<Run>, StorageError> {
        let run = self.store.get_run(&self.org, id).await?;
        Ok(run.filter(|r| r.org_id == self.org))
    }

    pub async fn query_runs(
        &self,
        filter: &RunFilter,
        after: Option<PageCursor>,
        limit: usize,
    ) -> Result<Vec<Run>, StorageError> {
        let mut runs = self.store.query_runs(&self.org, filter, after, limit).await?;
        runs.retain(|r| r.org_id == self.org);
        Ok(runs)
    }

    pub async fn put_rule_set(&self, rule_set: &RuleSet) -> Result<RuleSet, StorageError> {
        self.owns(rule_set.org_id())?;
        self.store.put_rule_set(&self.org, rule_set).await
    }

    pub async fn get_rule_set(
        &self,
        version: &RuleSetVersion,
    ) -> Result<Option<RuleSet>, StorageError> {
        let rule_set = self.store.get_rule_set(&self.org, version).await?;
        Ok(rule_set.filter(|rs| rs.org_id() == &self.org))
    }

    pub async fn append_audit(&self, entry: &AuditEntry) -> Result<AppendOutcome, StorageError> {
        self.owns(&entry.org_id)?;
        self.store.append_audit(&self.org, entry).await
    }

    pub async fn finalize_run(
        &self,
        run: &Run,
        entry: &AuditEntry,
    ) -> Result<AppendOutcome, StorageError> {
        self.owns(&run.org_id)?;
        self.owns(&entry.org_id)?;
        if entry.run_id != run.id {
            return Err(StorageError::Conflict(format!(
                "audit entry for run {} does not describe run {}",
                entry.run_id, run.id
            )));
        }
        self.store.finalize_run(&self.org, run, entry).await
    }

    pub async fn list_audit(
        &self,
        filter: &AuditFilter,
        after: Option<PageCursor>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>, StorageError> {
        let mut entries = self.store.list_audit(&self.org, filter, after, limit).await?;
        entries.retain(|e| e.org_id == self.org);
        Ok(entries)
    }

    /// Lazy listing of this organization's runs.
    pub fn runs(&self, filter: RunFilter, page_size: usize) -> Pager<RunPages> {
        Pager::new(
            RunPages {
                scope: self.clone(),
                filter,
            },
            page_size,
        )
    }

    /// Lazy listing of this organization's audit entries.
    pub fn audit(&self, filter: AuditFilter, page_size: usize) -> Pager<AuditPages> {
        Pager::new(
            AuditPages {
                scope: self.clone(),
                filter,
            },
            page_size,
        )
    }
}

pub struct RunPages {
    scope: TenantScope,
    filter: RunFilter,
}

#[async_trait]
impl PageSource for RunPages {
    type Item = Run;

    async fn fetch(&self, after: Option<PageCursor>, limit: usize) -> Result<Vec<Run>, StorageError> {
        self.scope.query_runs(&self.filter, after, limit).await
    }

    fn cursor(item: &Run) -> PageCursor {
        PageCursor::for_run(item)
    }
}

pub struct AuditPages {
    scope: TenantScope,
    filter: AuditFilter,
}

#[async_trait]
impl PageSource for AuditPages {
    type Item = AuditEntry;

    async fn fetch(
        &self,
        after: Option<PageCursor>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>, StorageError> {
        self.scope.list_audit(&self.filter, after, limit).await
    }

    fn cursor(item: &AuditEntry) -> PageCursor {
        PageCursor::for_audit(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Actor, Facts, Fingerprint};
    use crate::storage::InMemoryRunStore;

    fn run_for(org: &str, actor: &str) -> Run {
        Run::new(
            RunId::new(),
            OrgId::new(org),
            RuleSetVersion::new("v1"),
            Fingerprint::new("fp"),
            Facts::new(),
            Actor::new(actor),
        )
    }

    fn tenants() -> TenantStore {
        TenantStore::new(Arc::new(InMemoryRunStore::new()))
    }

    #[tokio::test]
    async fn test_scope_rejects_foreign_writes() {
        let tenants = tenants();
        let acme = tenants.scope(&OrgId::new("acme"));

        let err = acme.put_run(&run_for("globex", "a")).await.unwrap_err();
        assert!(matches!(err, StorageError::TenantMismatch { .. }));
    }

    #[tokio::test]
    async fn test_scope_hides_other_tenants() {
        let tenants = tenants();
        let acme = tenants.scope(&OrgId::new("acme"));
        let globex = tenants.scope(&OrgId::new("globex"));

        let run = run_for("acme", "a");
        acme.put_run(&run).await.unwrap();

        assert!(acme.get_run(run.id).await.unwrap().is_some());
        assert!(globex.get_run(run.id).await.unwrap().is_none());
        assert!(globex
            .runs(RunFilter::default(), 10)
            .collect(10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_runs_pager_filters_by_creator() {
        let tenants = tenants();
        let acme = tenants.scope(&OrgId::new("acme"));
        for actor in ["volunteer-1", "volunteer-2", "volunteer-1", "admin"] {
            acme.put_run(&run_for("acme", actor)).await.unwrap();
        }

        let mine = acme
            .runs(
                RunFilter {
                    created_by: Some(Actor::new("volunteer-1")),
                    ..Default::default()
                },
                1,
            )
            .collect(100)
            .await
            .unwrap();
        assert_eq!(mine.len(), 2);
        assert!(mine.iter().all(|r| r.actor.as_str() == "volunteer-1"));

        let all = acme.runs(RunFilter::default(), 3).collect(100).await.unwrap();
        assert_eq!(all.len(), 4);
    }
}

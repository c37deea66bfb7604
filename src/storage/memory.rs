// src/storage/memory.rs
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::watch;

use crate::domain::{AuditEntry, AuditFilter, OrgId, Run, RunFilter, RunId, RuleSetVersion};
use crate::rules::RuleSet;

use super::error::StorageError;
use super::traits::{check_progression, AppendOutcome, PageCursor, RunStore};

/// One tenant's slice of the store.
#[derive(Debug, Default)]
struct Partition {
    runs: HashMap<RunId, Run>,
    rule_sets: HashMap<RuleSetVersion, RuleSet>,
    audit: Vec<AuditEntry>,
    audited: HashSet<RunId>,
}

impl Partition {
    fn append(&mut self, entry: &AuditEntry) -> AppendOutcome {
        if !self.audited.insert(entry.run_id) {
            return AppendOutcome::AlreadyRecorded;
        }
        self.audit.push(entry.clone());
        AppendOutcome::Appended
    }
}

/// In-memory store for development and testing.
///
/// Data lives in per-organization partitions behind a single mutex, so
/// finalization is trivially atomic.
#[derive(Debug)]
pub struct InMemoryRunStore {
    partitions: Mutex<HashMap<OrgId, Partition>>,
    finalization_open: watch::Sender<bool>,
    run_writes_open: watch::Sender<bool>,
    failures_remaining: AtomicU32,
    finalize_attempts: AtomicU32,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        let (finalization_open, _) = watch::channel(true);
        let (run_writes_open, _) = watch::channel(true);
        InMemoryRunStore {
            partitions: Mutex::new(HashMap::new()),
            finalization_open,
            run_writes_open,
            failures_remaining: AtomicU32::new(0),
            finalize_attempts: AtomicU32::new(0),
        }
    }

    /// Hold every `finalize_run` call until `resume_finalization` (for testing).
    pub fn pause_finalization(&self) {
        self.finalization_open.send_replace(false);
    }

    /// Release held and future finalizations (for testing).
    pub fn resume_finalization(&self) {
        self.finalization_open.send_replace(true);
    }

    /// Hold every `put_run` call until `resume_run_writes` (for testing).
    pub fn pause_run_writes(&self) {
        self.run_writes_open.send_replace(false);
    }

    pub fn resume_run_writes(&self) {
        self.run_writes_open.send_replace(true);
    }

    /// Make the next `n` finalizations fail with a transient error (for testing).
    pub fn fail_next_finalizations(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Number of `finalize_run` calls seen so far (for assertions).
    pub fn finalize_attempts(&self) -> u32 {
        self.finalize_attempts.load(Ordering::SeqCst)
    }

    /// Audit entries of one organization in append order (for assertions).
    pub fn audit_entries(&self, org: &OrgId) -> Vec<AuditEntry> {
        self.partitions
            .lock()
            .get(org)
            .map(|p| p.audit.clone())
            .unwrap_or_default()
    }

    /// Number of stored runs of one organization (for assertions).
    pub fn run_count(&self, org: &OrgId) -> usize {
        self.partitions
            .lock()
            .get(org)
            .map_or(0, |p| p.runs.len())
    }
}

impl Default for InMemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

fn check_owner(org: &OrgId, found: &OrgId) -> Result<(), StorageError> {
    if org != found {
        return Err(StorageError::TenantMismatch {
            expected: org.to_string(),
            found: found.to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn put_run(&self, org: &OrgId, run: &Run) -> Result<(), StorageError> {
        check_owner(org, &run.org_id)?;

        let mut open = self.run_writes_open.subscribe();
        let _ = open.wait_for(|open| *open).await;

        let mut partitions = self.partitions.lock();
        let partition = partitions.entry(org.clone()).or_default();

        if let Some(existing) = partition.runs.get(&run.id) {
            check_progression(existing, run)?;
        }
        partition.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, org: &OrgId, id: RunId) -> Result<Option<Run>, StorageError> {
        Ok(self
            .partitions
            .lock()
            .get(org)
            .and_then(|p| p.runs.get(&id).cloned()))
    }

    async fn query_runs(
        &self,
        org: &OrgId,
        filter: &RunFilter,
        after: Option<PageCursor>,
        limit: usize,
    ) -> Result<Vec<Run>, StorageError> {
        let partitions = self.partitions.lock();
        let Some(partition) = partitions.get(org) else {
            return Ok(Vec::new());
        };

        let mut runs: Vec<&Run> = partition
            .runs
            .values()
            .filter(|r| filter.matches(r))
            .filter(|r| after.map_or(true, |c| PageCursor::for_run(r) > c))
            .collect();
        runs.sort_by_key(|r| PageCursor::for_run(r));

        Ok(runs.into_iter().take(limit).cloned().collect())
    }

    async fn put_rule_set(&self, org: &OrgId, rule_set: &RuleSet) -> Result<RuleSet, StorageError> {
        check_owner(org, rule_set.org_id())?;

        let mut partitions = self.partitions.lock();
        let stored = partitions
            .entry(org.clone())
            .or_default()
            .rule_sets
            .entry(rule_set.version().clone())
            .or_insert_with(|| rule_set.clone());
        Ok(stored.clone())
    }

    async fn get_rule_set(
        &self,
        org: &OrgId,
        version: &RuleSetVersion,
    ) -> Result<Option<RuleSet>, StorageError> {
        Ok(self
            .partitions
            .lock()
            .get(org)
            .and_then(|p| p.rule_sets.get(version).cloned()))
    }

    async fn append_audit(
        &self,
        org: &OrgId,
        entry: &AuditEntry,
    ) -> Result<AppendOutcome, StorageError> {
        check_owner(org, &entry.org_id)?;
        Ok(self
            .partitions
            .lock()
            .entry(org.clone())
            .or_default()
            .append(entry))
    }

    async fn finalize_run(
        &self,
        org: &OrgId,
        run: &Run,
        entry: &AuditEntry,
    ) -> Result<AppendOutcome, StorageError> {
        check_owner(org, &run.org_id)?;
        check_owner(org, &entry.org_id)?;

        let mut open = self.finalization_open.subscribe();
        let _ = open.wait_for(|open| *open).await;

        self.finalize_attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StorageError::Unavailable(
                "injected finalization failure".to_string(),
            ));
        }

        let mut partitions = self.partitions.lock();
        let partition = partitions.entry(org.clone()).or_default();

        if partition.audited.contains(&run.id) {
            // The entry may have been appended on its own; settle the run with it.
            let settled = partition
                .runs
                .get(&run.id)
                .is_some_and(|existing| existing.status().is_terminal());
            if !settled {
                partition.runs.insert(run.id, run.clone());
            }
            return Ok(AppendOutcome::AlreadyRecorded);
        }
        if let Some(existing) = partition.runs.get(&run.id) {
            check_progression(existing, run)?;
        }

        partition.runs.insert(run.id, run.clone());
        Ok(partition.append(entry))
    }

    async fn list_audit(
        &self,
        org: &OrgId,
        filter: &AuditFilter,
        after: Option<PageCursor>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>, StorageError> {
        let partitions = self.partitions.lock();
        let Some(partition) = partitions.get(org) else {
            return Ok(Vec::new());
        };

        let mut entries: Vec<&AuditEntry> = partition
            .audit
            .iter()
            .filter(|e| filter.matches(e))
            .filter(|e| after.map_or(true, |c| PageCursor::for_audit(e) > c))
            .collect();
        entries.sort_by_key(|e| PageCursor::for_audit(e));

        Ok(entries.into_iter().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Actor, Decision, Facts, Fingerprint, Outcome};
    use std::sync::Arc;
    use std::time::Duration;

    fn pending_run(org: &str) -> Run {
        Run::new(
            RunId::new(),
            OrgId::new(org),
            RuleSetVersion::new("v1"),
            Fingerprint::new("fp"),
            Facts::new().with("age", 70),
            Actor::new("tester"),
        )
    }

    fn finished(mut run: Run) -> (Run, AuditEntry) {
        run.start().unwrap();
        run.complete(Decision::new(Outcome::Eligible, vec![])).unwrap();
        let entry = AuditEntry::for_run(&run).unwrap();
        (run, entry)
    }

    #[tokio::test]
    async fn test_runs_are_partitioned_by_org() {
        let store = InMemoryRunStore::new();
        let acme = OrgId::new("acme");
        let globex = OrgId::new("globex");
        let run = pending_run("acme");

        store.put_run(&acme, &run).await.unwrap();

        assert!(store.get_run(&acme, run.id).await.unwrap().is_some());
        assert!(store.get_run(&globex, run.id).await.unwrap().is_none());

        let err = store.put_run(&globex, &run).await.unwrap_err();
        assert!(matches!(err, StorageError::TenantMismatch { .. }));
    }

    #[tokio::test]
    async fn test_put_run_rejects_regression() {
        let store = InMemoryRunStore::new();
        let org = OrgId::new("acme");
        let pending = pending_run("acme");
        let mut running = pending.clone();
        running.start().unwrap();

        store.put_run(&org, &pending).await.unwrap();
        store.put_run(&org, &running).await.unwrap();

        let err = store.put_run(&org, &pending).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
        assert_eq!(
            store.get_run(&org, pending.id).await.unwrap().unwrap().status(),
            crate::domain::RunStatus::Running
        );
    }

    #[tokio::test]
    async fn test_finalize_is_idempotent() {
        let store = InMemoryRunStore::new();
        let org = OrgId::new("acme");
        let (run, entry) = finished(pending_run("acme"));

        assert_eq!(
            store.finalize_run(&org, &run, &entry).await.unwrap(),
            AppendOutcome::Appended
        );
        assert_eq!(
            store.finalize_run(&org, &run, &entry).await.unwrap(),
            AppendOutcome::AlreadyRecorded
        );
        assert_eq!(store.audit_entries(&org).len(), 1);
        assert_eq!(
            store.append_audit(&org, &entry).await.unwrap(),
            AppendOutcome::AlreadyRecorded
        );
    }

    #[tokio::test]
    async fn test_finalize_settles_run_after_standalone_append() {
        let store = InMemoryRunStore::new();
        let org = OrgId::new("acme");
        let pending = pending_run("acme");
        let mut running = pending.clone();
        running.start().unwrap();
        store.put_run(&org, &pending).await.unwrap();
        store.put_run(&org, &running).await.unwrap();

        let (done, entry) = finished(pending);
        store.append_audit(&org, &entry).await.unwrap();

        assert_eq!(
            store.finalize_run(&org, &done, &entry).await.unwrap(),
            AppendOutcome::AlreadyRecorded
        );
        let stored = store.get_run(&org, done.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), crate::domain::RunStatus::Completed);
        assert_eq!(store.audit_entries(&org).len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure_writes_nothing() {
        let store = InMemoryRunStore::new();
        let org = OrgId::new("acme");
        let (run, entry) = finished(pending_run("acme"));

        store.fail_next_finalizations(1);
        let err = store.finalize_run(&org, &run, &entry).await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.get_run(&org, run.id).await.unwrap().is_none());
        assert!(store.audit_entries(&org).is_empty());

        store.finalize_run(&org, &run, &entry).await.unwrap();
        assert_eq!(store.finalize_attempts(), 2);
        assert_eq!(store.run_count(&org), 1);
        assert_eq!(store.audit_entries(&org).len(), 1);
    }

    #[tokio::test]
    async fn test_pause_holds_finalization() {
        let store = Arc::new(InMemoryRunStore::new());
        let org = OrgId::new("acme");
        let (run, entry) = finished(pending_run("acme"));

        store.pause_finalization();
        let task = {
            let store = store.clone();
            let org = org.clone();
            tokio::spawn(async move { store.finalize_run(&org, &run, &entry).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.audit_entries(&org).is_empty());

        store.resume_finalization();
        task.await.unwrap().unwrap();
        assert_eq!(store.audit_entries(&org).len(), 1);
    }

    #[tokio::test]
    async fn test_query_runs_pages_in_order() {
        let store = InMemoryRunStore::new();
        let org = OrgId::new("acme");
        for _ in 0..5 {
            store.put_run(&org, &pending_run("acme")).await.unwrap();
        }

        let first = store
            .query_runs(&org, &RunFilter::default(), None, 2)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);

        let cursor = PageCursor::for_run(&first[1]);
        let rest = store
            .query_runs(&org, &RunFilter::default(), Some(cursor), 10)
            .await
            .unwrap();
        assert_eq!(rest.len(), 3);
        assert!(rest.iter().all(|r| PageCursor::for_run(r) > cursor));
    }

    #[tokio::test]
    async fn test_put_rule_set_keeps_first() {
        use crate::rules::{validate, RuleSetDraft};

        let store = InMemoryRunStore::new();
        let org = OrgId::new("acme");
        let draft = |limit: u32| -> RuleSetDraft {
            serde_yaml::from_str(&format!(
                "version: v1\nmissing_facts: strict\nfacts: {{ age: number }}\nrules:\n  - {{ id: r, when: {{ check: {{ fact: age, gte: {limit} }} }} }}\n"
            ))
            .unwrap()
        };

        let first = validate(&org, draft(65)).unwrap();
        let second = validate(&org, draft(60)).unwrap();

        let stored = store.put_rule_set(&org, &first).await.unwrap();
        assert_eq!(stored.content_hash(), first.content_hash());

        let stored = store.put_rule_set(&org, &second).await.unwrap();
        assert_eq!(stored.content_hash(), first.content_hash());
    }
}

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::domain::OrgId;
use crate::error::EngineError;

/// Per-organization bound on runs that have been admitted but not finalized.
///
/// Admission never queues: when an organization is at its limit the
/// submission is rejected immediately.
pub struct CapacityLimiter {
    limit: usize,
    orgs: Mutex<HashMap<OrgId, Arc<Semaphore>>>,
}

/// Held by a run from admission until it is finalized.
#[derive(Debug)]
pub struct CapacityPermit {
    org: OrgId,
    _permit: OwnedSemaphorePermit,
}

impl CapacityPermit {
    pub fn org(&self) -> &OrgId {
        &self.org
    }
}

impl CapacityLimiter {
    pub fn new(limit: usize) -> Self {
        CapacityLimiter {
            limit,
            orgs: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn semaphore(&self, org: &OrgId) -> Arc<Semaphore> {
        self.orgs
            .lock()
            .entry(org.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.limit)))
            .clone()
    }

    /// Take a slot for `org` or fail with `CapacityExceeded`.
    pub fn try_acquire(&self, org: &OrgId) -> Result<CapacityPermit, EngineError> {
        self.semaphore(org)
            .try_acquire_owned()
            .map(|permit| CapacityPermit {
                org: org.clone(),
                _permit: permit,
            })
            .map_err(|_| EngineError::CapacityExceeded {
                org: org.clone(),
                limit: self.limit,
            })
    }

    /// Slots currently held by `org`.
    pub fn in_use(&self, org: &OrgId) -> usize {
        match self.orgs.lock().get(org) {
            Some(semaphore) => self.limit.saturating_sub(semaphore.available_permits()),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_is_per_org() {
        let limiter = CapacityLimiter::new(2);
        let acme = OrgId::new("acme");
        let globex = OrgId::new("globex");

        let _a1 = limiter.try_acquire(&acme).unwrap();
        let _a2 = limiter.try_acquire(&acme).unwrap();
        let err = limiter.try_acquire(&acme).unwrap_err();
        assert_eq!(
            err,
            EngineError::CapacityExceeded {
                org: acme.clone(),
                limit: 2
            }
        );

        // Another organization is unaffected
        let _g1 = limiter.try_acquire(&globex).unwrap();
        assert_eq!(limiter.in_use(&acme), 2);
        assert_eq!(limiter.in_use(&globex), 1);
    }

    #[test]
    fn test_dropping_permit_frees_slot() {
        let limiter = CapacityLimiter::new(1);
        let org = OrgId::new("acme");

        let permit = limiter.try_acquire(&org).unwrap();
        assert!(limiter.try_acquire(&org).is_err());

        drop(permit);
        assert_eq!(limiter.in_use(&org), 0);
        assert!(limiter.try_acquire(&org).is_ok());
    }

    #[test]
    fn test_zero_limit_rejects_everything() {
        let limiter = CapacityLimiter::new(0);
        assert!(limiter.try_acquire(&OrgId::new("acme")).is_err());
    }
}

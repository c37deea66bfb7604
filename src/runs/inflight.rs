use ahash::AHasher;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use tokio::sync::watch;

use crate::domain::{Fingerprint, RunId, RunResult};

use super::capacity::CapacityPermit;

/// Number of shards for the in-flight table.
/// Must be a power of 2 for fast modulo via bitwise AND.
const NUM_SHARDS: usize = 64;

struct Lease {
    run_id: RunId,
    result: watch::Receiver<Option<RunResult>>,
    recorded: watch::Receiver<bool>,
}

/// Everything the submitter that created a run needs to drive it.
pub struct LeaderLease {
    pub run_id: RunId,
    pub publisher: watch::Sender<Option<RunResult>>,
    pub result: watch::Receiver<Option<RunResult>>,
    /// Set once the run is stored; dropping it releases waiting followers
    pub recorded: watch::Sender<bool>,
    pub permit: CapacityPermit,
}

pub enum Acquired {
    /// No run in flight for the fingerprint; the caller owns a new one
    Leader(LeaderLease),
    /// Attached to the run already in flight
    Follower {
        run_id: RunId,
        result: watch::Receiver<Option<RunResult>>,
        recorded: watch::Receiver<bool>,
    },
}

/// Runs that are admitted but not yet finalized, keyed by fingerprint.
///
/// Fingerprints are distributed across shards so unrelated submissions
/// rarely contend on the same lock.
pub struct InFlightTable {
    shards: Vec<RwLock<HashMap<Fingerprint, Lease>>>,
}

impl InFlightTable {
    pub fn new() -> Self {
        let shards = (0..NUM_SHARDS)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();

        InFlightTable { shards }
    }

    /// Attach to the in-flight run for `fingerprint`, or admit a new one.
    ///
    /// `admit` runs under the shard's write lock, so two identical
    /// submissions can never both become leaders. A rejection from `admit`
    /// leaves the table untouched.
    pub fn acquire<E>(
        &self,
        fingerprint: &Fingerprint,
        admit: impl FnOnce() -> Result<CapacityPermit, E>,
    ) -> Result<Acquired, E> {
        let shard = &self.shards[self.shard_index(fingerprint)];

        // Fast path: attach with read lock
        {
            let read_guard = shard.read();
            if let Some(lease) = read_guard.get(fingerprint) {
                return Ok(follow(lease));
            }
        }

        let mut write_guard = shard.write();

        // Double-check after acquiring write lock
        if let Some(lease) = write_guard.get(fingerprint) {
            return Ok(follow(lease));
        }

        let permit = admit()?;
        let run_id = RunId::new();
        let (publisher, result) = watch::channel(None);
        let (recorded, recorded_rx) = watch::channel(false);

        write_guard.insert(
            fingerprint.clone(),
            Lease {
                run_id,
                result: result.clone(),
                recorded: recorded_rx,
            },
        );

        Ok(Acquired::Leader(LeaderLease {
            run_id,
            publisher,
            result,
            recorded,
            permit,
        }))
    }

    /// Forget the lease for `fingerprint` if it still belongs to `run_id`.
    pub fn release(&self, fingerprint: &Fingerprint, run_id: RunId) -> bool {
        let shard = &self.shards[self.shard_index(fingerprint)];
        let mut write_guard = shard.write();

        match write_guard.get(fingerprint) {
            Some(lease) if lease.run_id == run_id => {
                write_guard.remove(fingerprint);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.shards[self.shard_index(fingerprint)]
            .read()
            .contains_key(fingerprint)
    }

    /// Total runs in flight.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn shard_index(&self, fingerprint: &Fingerprint) -> usize {
        let mut hasher = AHasher::default();
        fingerprint.hash(&mut hasher);
        (hasher.finish() as usize) & (NUM_SHARDS - 1)
    }
}

impl Default for InFlightTable {
    fn default() -> Self {
        Self::new()
    }
}

fn follow(lease: &Lease) -> Acquired {
    Acquired::Follower {
        run_id: lease.run_id,
        result: lease.result.clone(),
        recorded: lease.recorded.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrgId;
    use crate::error::EngineError;
    use crate::runs::capacity::CapacityLimiter;

    fn admit(limiter: &CapacityLimiter) -> impl FnOnce() -> Result<CapacityPermit, EngineError> + '_ {
        move || limiter.try_acquire(&OrgId::new("acme"))
    }

    #[test]
    fn test_second_acquire_follows() {
        let table = InFlightTable::new();
        let limiter = CapacityLimiter::new(4);
        let fp = Fingerprint::new("abc");

        let leader = match table.acquire(&fp, admit(&limiter)).unwrap() {
            Acquired::Leader(lease) => lease,
            Acquired::Follower { .. } => panic!("expected leader"),
        };

        match table.acquire(&fp, admit(&limiter)).unwrap() {
            Acquired::Follower { run_id, .. } => assert_eq!(run_id, leader.run_id),
            Acquired::Leader(_) => panic!("expected follower"),
        }

        // Followers do not consume capacity
        assert_eq!(limiter.in_use(&OrgId::new("acme")), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_follower_sees_published_result() {
        let table = InFlightTable::new();
        let limiter = CapacityLimiter::new(1);
        let fp = Fingerprint::new("abc");

        let Ok(Acquired::Leader(leader)) = table.acquire(&fp, admit(&limiter)) else {
            panic!("expected leader");
        };
        let Ok(Acquired::Follower { result, .. }) = table.acquire(&fp, admit(&limiter)) else {
            panic!("expected follower");
        };

        leader
            .publisher
            .send_replace(Some(Ok(crate::domain::Decision::new(
                crate::domain::Outcome::Eligible,
                vec![],
            ))));
        assert!(matches!(&*result.borrow(), Some(Ok(_))));
    }

    #[tokio::test]
    async fn test_follower_waits_until_leader_records() {
        let table = InFlightTable::new();
        let limiter = CapacityLimiter::new(1);
        let fp = Fingerprint::new("abc");

        let Ok(Acquired::Leader(leader)) = table.acquire(&fp, admit(&limiter)) else {
            panic!("expected leader");
        };
        let Ok(Acquired::Follower { mut recorded, .. }) = table.acquire(&fp, admit(&limiter)) else {
            panic!("expected follower");
        };
        assert!(!*recorded.borrow());

        leader.recorded.send_replace(true);
        assert!(recorded.wait_for(|r| *r).await.is_ok());

        // A leader that gives up also releases its followers
        let fp = Fingerprint::new("def");
        let limiter = CapacityLimiter::new(1);
        let Ok(Acquired::Leader(leader)) = table.acquire(&fp, admit(&limiter)) else {
            panic!("expected leader");
        };
        let Ok(Acquired::Follower { mut recorded, .. }) = table.acquire(&fp, admit(&limiter)) else {
            panic!("expected follower");
        };
        drop(leader);
        assert!(recorded.wait_for(|r| *r).await.is_err());
    }

    #[test]
    fn test_rejected_admission_leaves_no_lease() {
        let table = InFlightTable::new();
        let limiter = CapacityLimiter::new(0);
        let fp = Fingerprint::new("abc");

        assert!(table.acquire(&fp, admit(&limiter)).is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn test_release_only_matching_run() {
        let table = InFlightTable::new();
        let limiter = CapacityLimiter::new(1);
        let fp = Fingerprint::new("abc");

        let Ok(Acquired::Leader(leader)) = table.acquire(&fp, admit(&limiter)) else {
            panic!("expected leader");
        };

        assert!(!table.release(&fp, RunId::new()));
        assert!(table.contains(&fp));
        assert!(table.release(&fp, leader.run_id));
        assert!(!table.contains(&fp));
    }
}

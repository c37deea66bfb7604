use std::time::Duration;
use tokio::sync::watch;

use crate::domain::{Decision, Fingerprint, OrgId, RunId, RunResult};
use crate::error::EngineError;

/// A submitter's view of a run.
///
/// Dropping the handle or giving up on [`wait_timeout`](Self::wait_timeout)
/// does not affect the run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    run_id: RunId,
    org_id: OrgId,
    fingerprint: Fingerprint,
    coalesced: bool,
    result: watch::Receiver<Option<RunResult>>,
}

impl RunHandle {
    pub(crate) fn new(
        run_id: RunId,
        org_id: OrgId,
        fingerprint: Fingerprint,
        coalesced: bool,
        result: watch::Receiver<Option<RunResult>>,
    ) -> Self {
        RunHandle {
            run_id,
            org_id,
            fingerprint,
            coalesced,
            result,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn org_id(&self) -> &OrgId {
        &self.org_id
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// True when the submission attached to a run already in flight.
    pub fn is_coalesced(&self) -> bool {
        self.coalesced
    }

    /// The result, if the run has been finalized.
    pub fn try_result(&self) -> Option<Result<Decision, EngineError>> {
        self.result
            .borrow()
            .clone()
            .map(|r| r.map_err(EngineError::from))
    }

    /// Wait for the run to be finalized.
    pub async fn wait(&mut self) -> Result<Decision, EngineError> {
        let outcome = match self.result.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };

        match outcome {
            Some(result) => result.map_err(EngineError::from),
            None => Err(EngineError::Evaluation(format!(
                "run {} ended without a result",
                self.run_id
            ))),
        }
    }

    /// Wait at most `timeout`. On expiry the caller gets `Cancelled` and
    /// may wait again; the run keeps going.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> Result<Decision, EngineError> {
        let run_id = self.run_id;
        tokio::time::timeout(timeout, self.wait())
            .await
            .unwrap_or(Err(EngineError::Cancelled { run_id }))
    }
}

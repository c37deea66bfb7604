use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::decision::Decision;
use super::facts::Facts;
use super::ids::{Actor, Fingerprint, OrgId, RuleSetVersion, RunId};

/// Lifecycle status of a run.
///
/// Transitions only move forward: pending → running → {completed, failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RunStatus {
    Pending = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
}

impl RunStatus {
    /// Position in the lifecycle. Both terminal states share the last rank.
    #[inline]
    pub fn rank(&self) -> u8 {
        match self {
            RunStatus::Pending => 0,
            RunStatus::Running => 1,
            RunStatus::Completed | RunStatus::Failed => 2,
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    /// Parse from string representation.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected status change.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("run {run_id} cannot move from {from} to {to}")]
pub struct TransitionError {
    pub run_id: RunId,
    pub from: RunStatus,
    pub to: RunStatus,
}

/// Why a run ended in `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunFailure {
    /// Strict missing-fact policy rejected the input
    MissingFact { rule: String, fact: String },

    /// The evaluator failed for another reason
    Evaluation { message: String },

    /// The final write could not be persisted
    Persistence { message: String },
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunFailure::MissingFact { rule, fact } => {
                write!(f, "rule `{}` requires missing fact `{}`", rule, fact)
            }
            RunFailure::Evaluation { message } => write!(f, "evaluation failed: {}", message),
            RunFailure::Persistence { message } => write!(f, "persistence failed: {}", message),
        }
    }
}

/// Outcome delivered to callers waiting on a run.
pub type RunResult = Result<Decision, RunFailure>;

/// One evaluation instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub org_id: OrgId,
    pub rule_set_version: RuleSetVersion,
    pub fingerprint: Fingerprint,
    pub facts: Facts,
    pub actor: Actor,
    pub created_at: DateTime<Utc>,

    status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    decision: Option<Decision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure: Option<RunFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Create a pending run.
    pub fn new(
        id: RunId,
        org_id: OrgId,
        rule_set_version: RuleSetVersion,
        fingerprint: Fingerprint,
        facts: Facts,
        actor: Actor,
    ) -> Self {
        Run {
            id,
            org_id,
            rule_set_version,
            fingerprint,
            facts,
            actor,
            created_at: Utc::now(),
            status: RunStatus::Pending,
            decision: None,
            failure: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn decision(&self) -> Option<&Decision> {
        self.decision.as_ref()
    }

    pub fn failure(&self) -> Option<&RunFailure> {
        self.failure.as_ref()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Final result, once the run is terminal.
    pub fn result(&self) -> Option<RunResult> {
        match (self.status, &self.decision, &self.failure) {
            (RunStatus::Completed, Some(decision), _) => Some(Ok(decision.clone())),
            (RunStatus::Failed, _, Some(failure)) => Some(Err(failure.clone())),
            _ => None,
        }
    }

    /// pending → running
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.advance(RunStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// running → completed
    pub fn complete(&mut self, decision: Decision) -> Result<(), TransitionError> {
        self.advance(RunStatus::Completed)?;
        self.decision = Some(decision);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// running → failed
    pub fn fail(&mut self, failure: RunFailure) -> Result<(), TransitionError> {
        self.advance(RunStatus::Failed)?;
        self.failure = Some(failure);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    fn advance(&mut self, next: RunStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                run_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Filters accepted by run listings. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFilter {
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub created_by: Option<Actor>,
    #[serde(default)]
    pub rule_set_version: Option<RuleSetVersion>,
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_before: Option<DateTime<Utc>>,
}

impl RunFilter {
    pub fn matches(&self, run: &Run) -> bool {
        self.status.map_or(true, |s| run.status() == s)
            && self.created_by.as_ref().map_or(true, |a| &run.actor == a)
            && self
                .rule_set_version
                .as_ref()
                .map_or(true, |v| &run.rule_set_version == v)
            && self.created_after.map_or(true, |t| run.created_at > t)
            && self.created_before.map_or(true, |t| run.created_at < t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::decision::Outcome;

    fn test_run() -> Run {
        Run::new(
            RunId::new(),
            OrgId::new("acme"),
            RuleSetVersion::new("v1"),
            Fingerprint::new("abc"),
            Facts::new().with("age", 70),
            Actor::new("caseworker-1"),
        )
    }

    #[test]
    fn test_forward_transitions() {
        let mut run = test_run();
        assert_eq!(run.status(), RunStatus::Pending);

        run.start().unwrap();
        assert_eq!(run.status(), RunStatus::Running);
        assert!(run.started_at().is_some());

        run.complete(Decision::new(Outcome::Eligible, vec![])).unwrap();
        assert_eq!(run.status(), RunStatus::Completed);
        assert!(run.completed_at().is_some());
        assert!(run.result().unwrap().is_ok());
    }

    #[test]
    fn test_transitions_never_regress() {
        let mut run = test_run();

        // Cannot skip running
        assert!(run.complete(Decision::new(Outcome::Eligible, vec![])).is_err());

        run.start().unwrap();
        assert!(run.start().is_err());

        run.fail(RunFailure::Evaluation {
            message: "boom".to_string(),
        })
        .unwrap();

        let err = run
            .complete(Decision::new(Outcome::Eligible, vec![]))
            .unwrap_err();
        assert_eq!(err.from, RunStatus::Failed);
        assert_eq!(err.to, RunStatus::Completed);
        assert_eq!(run.status(), RunStatus::Failed);
        assert!(run.decision().is_none());
    }

    #[test]
    fn test_status_rank_is_monotonic() {
        assert!(RunStatus::Pending.rank() < RunStatus::Running.rank());
        assert!(RunStatus::Running.rank() < RunStatus::Completed.rank());
        assert_eq!(RunStatus::Completed.rank(), RunStatus::Failed.rank());
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Failed));
    }

    #[test]
    fn test_filter_matches() {
        let mut run = test_run();
        run.start().unwrap();

        assert!(RunFilter::default().matches(&run));

        let by_actor = RunFilter {
            created_by: Some(Actor::new("caseworker-1")),
            ..Default::default()
        };
        assert!(by_actor.matches(&run));

        let other_actor = RunFilter {
            created_by: Some(Actor::new("volunteer-7")),
            ..Default::default()
        };
        assert!(!other_actor.matches(&run));

        let completed_only = RunFilter {
            status: Some(RunStatus::Completed),
            ..Default::default()
        };
        assert!(!completed_only.matches(&run));
    }

    #[test]
    fn test_run_serialization_roundtrip() {
        let mut run = test_run();
        run.start().unwrap();
        run.fail(RunFailure::MissingFact {
            rule: "age>=65".to_string(),
            fact: "age".to_string(),
        })
        .unwrap();

        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["failure"]["kind"], "missing_fact");

        let back: Run = serde_json::from_value(json).unwrap();
        assert_eq!(back, run);
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::decision::{Decision, Outcome};
use super::facts::Facts;
use super::ids::{Actor, Fingerprint, OrgId, RuleSetVersion, RunId};
use super::run::{Run, RunFailure, RunStatus};

/// Immutable provenance record written together with run finalization.
///
/// One entry per run; never edited or deleted once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub org_id: OrgId,
    pub run_id: RunId,
    pub rule_set_version: RuleSetVersion,
    pub fingerprint: Fingerprint,
    pub facts: Facts,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub actor: Actor,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Snapshot a finalized run. Returns `None` while the run is not terminal.
    pub fn for_run(run: &Run) -> Option<Self> {
        if !run.status().is_terminal() {
            return None;
        }

        Some(AuditEntry {
            org_id: run.org_id.clone(),
            run_id: run.id,
            rule_set_version: run.rule_set_version.clone(),
            fingerprint: run.fingerprint.clone(),
            facts: run.facts.clone(),
            status: run.status(),
            decision: run.decision().cloned(),
            failure: run.failure().cloned(),
            actor: run.actor.clone(),
            recorded_at: run.completed_at().unwrap_or_else(Utc::now),
        })
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.decision.as_ref().map(|d| d.outcome)
    }
}

/// Filters accepted by audit listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFilter {
    #[serde(default)]
    pub run_id: Option<RunId>,
    #[serde(default)]
    pub rule_set_version: Option<RuleSetVersion>,
    #[serde(default)]
    pub outcome: Option<Outcome>,
    #[serde(default)]
    pub status: Option<RunStatus>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.run_id.map_or(true, |id| entry.run_id == id)
            && self
                .rule_set_version
                .as_ref()
                .map_or(true, |v| &entry.rule_set_version == v)
            && self.outcome.map_or(true, |o| entry.outcome() == Some(o))
            && self.status.map_or(true, |s| entry.status == s)
    }
}

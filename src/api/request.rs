use chrono::DateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{Actor, AuditFilter, Outcome, RuleSetVersion, RunFilter, RunId, RunStatus};
use crate::storage::PageCursor;

use super::error::ApiError;

/// Header naming the caller on run submissions.
pub const ACTOR_HEADER: &str = "x-actor";

/// Largest page a listing request may ask for.
pub const MAX_LIMIT: usize = 1000;

/// Body of `POST /v1/orgs/:org_id/runs`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitRunRequest {
    pub rule_set_version: RuleSetVersion,

    /// Flat JSON object of facts
    pub facts: serde_json::Value,

    /// Wait for the decision instead of answering 202 right away
    #[serde(default = "default_wait")]
    pub wait: bool,
}

fn default_wait() -> bool {
    true
}

/// Query of `GET /v1/orgs/:org_id/runs`.
#[derive(Debug, Default, Deserialize)]
pub struct ListRunsQuery {
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub created_by: Option<Actor>,
    #[serde(default)]
    pub rule_set_version: Option<RuleSetVersion>,
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ListRunsQuery {
    pub fn filter(&self) -> RunFilter {
        RunFilter {
            status: self.status,
            created_by: self.created_by.clone(),
            rule_set_version: self.rule_set_version.clone(),
            ..Default::default()
        }
    }
}

/// Query of `GET /v1/orgs/:org_id/audit`.
#[derive(Debug, Default, Deserialize)]
pub struct ListAuditQuery {
    #[serde(default)]
    pub run_id: Option<RunId>,
    #[serde(default)]
    pub rule_set_version: Option<RuleSetVersion>,
    #[serde(default)]
    pub outcome: Option<Outcome>,
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ListAuditQuery {
    pub fn filter(&self) -> AuditFilter {
        AuditFilter {
            run_id: self.run_id,
            rule_set_version: self.rule_set_version.clone(),
            outcome: self.outcome,
            status: self.status,
        }
    }
}

/// Clamp a requested page size to `1..=MAX_LIMIT`.
pub fn page_limit(requested: Option<usize>, default: usize) -> usize {
    requested.unwrap_or(default).clamp(1, MAX_LIMIT)
}

/// Opaque cursor text: `<unix micros>.<uuid>`.
pub fn encode_cursor(cursor: &PageCursor) -> String {
    format!("{}.{}", cursor.at.timestamp_micros(), cursor.id)
}

pub fn decode_cursor(raw: &str) -> Result<PageCursor, ApiError> {
    let invalid = || ApiError::bad_request(format!("invalid cursor `{raw}`"));

    let (micros, id) = raw.split_once('.').ok_or_else(invalid)?;
    let micros: i64 = micros.parse().map_err(|_| invalid())?;
    let at = DateTime::from_timestamp_micros(micros).ok_or_else(invalid)?;
    let id = Uuid::parse_str(id).map_err(|_| invalid())?;

    Ok(PageCursor { at, id })
}

pub fn parse_run_id(raw: &str) -> Result<RunId, ApiError> {
    RunId::parse(raw).ok_or_else(|| ApiError::bad_request(format!("invalid run id `{raw}`")))
}

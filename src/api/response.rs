use serde::Serialize;

use crate::domain::{RunId, RunStatus};

/// Answer to a run submission that has no decision yet.
#[derive(Debug, Serialize)]
pub struct RunAcceptedResponse {
    pub run_id: RunId,
    pub status: RunStatus,

    /// The submission attached to an identical run already in flight
    pub coalesced: bool,
}

/// One page of a listing.
#[derive(Debug, Serialize)]
pub struct PageResponse<T> {
    pub items: Vec<T>,

    /// Pass back as `after` to fetch the next page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub runs_in_flight: usize,
}

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        ErrorResponse {
            error: error.into(),
            code: code.into(),
            run_id: None,
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        ErrorResponse::new(message, "INTERNAL_ERROR")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepted_response_serialization() {
        let run_id = RunId::new();
        let resp = RunAcceptedResponse {
            run_id,
            status: RunStatus::Running,
            coalesced: true,
        };

        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["coalesced"], true);
        assert_eq!(json["run_id"], run_id.to_string());
    }

    #[test]
    fn test_page_without_cursor_omits_field() {
        let page: PageResponse<u32> = PageResponse {
            items: vec![1, 2],
            next_cursor: None,
        };

        let json = serde_json::to_string(&page).unwrap();
        assert_eq!(json, r#"{"items":[1,2]}"#);
    }

    #[test]
    fn test_error_response() {
        let json = serde_json::to_value(ErrorResponse::new("run x not found", "NOT_FOUND")).unwrap();
        assert_eq!(json["code"], "NOT_FOUND");
        assert!(json.get("run_id").is_none());
    }
}

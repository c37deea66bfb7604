use thiserror::Error;

use crate::domain::{OrgId, RunFailure, RunId};
use crate::rules::{EvaluationError, ValidationError};
use crate::storage::StorageError;

/// Errors surfaced by the engine's public operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("rule `{rule}` requires missing fact `{fact}`")]
    MissingFact { rule: String, fact: String },

    #[error("evaluation failed: {0}")]
    Evaluation(String),

    #[error("organization {org} already has {limit} runs in progress")]
    CapacityExceeded { org: OrgId, limit: usize },

    /// The caller stopped waiting; the run itself carries on
    #[error("stopped waiting for run {run_id}")]
    Cancelled { run_id: RunId },

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        EngineError::Persistence(e.to_string())
    }
}

impl From<EvaluationError> for EngineError {
    fn from(e: EvaluationError) -> Self {
        match e {
            EvaluationError::MissingFact { rule, fact } => EngineError::MissingFact { rule, fact },
            other => EngineError::Evaluation(other.to_string()),
        }
    }
}

impl From<RunFailure> for EngineError {
    fn from(failure: RunFailure) -> Self {
        match failure {
            RunFailure::MissingFact { rule, fact } => EngineError::MissingFact { rule, fact },
            RunFailure::Evaluation { message } => EngineError::Evaluation(message),
            RunFailure::Persistence { message } => EngineError::Persistence(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_failure_mapping() {
        let err = EngineError::from(RunFailure::MissingFact {
            rule: "age>=65".to_string(),
            fact: "age".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "rule `age>=65` requires missing fact `age`"
        );

        let err = EngineError::from(StorageError::Unavailable("db down".to_string()));
        assert!(matches!(err, EngineError::Persistence(ref m) if m.contains("db down")));
    }

    #[test]
    fn test_evaluation_error_mapping() {
        let err = EngineError::from(EvaluationError::UnknownRule("x".to_string()));
        assert_eq!(err, EngineError::Evaluation("unknown rule `x`".to_string()));
    }
}

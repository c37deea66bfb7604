pub mod audit;
pub mod decision;
pub mod facts;
pub mod ids;
pub mod run;

pub use audit::{AuditEntry, AuditFilter};
pub use decision::{Advice, Confidence, ConsultedFact, Decision, Outcome, Reason, Truth};
pub use facts::{FactError, FactValue, Facts};
pub use ids::{Actor, Fingerprint, OrgId, RuleSetVersion, RunId};
pub use run::{Run, RunFailure, RunFilter, RunResult, RunStatus, TransitionError};

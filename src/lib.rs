pub mod api;
pub mod audit;
pub mod config;
pub mod domain;
pub mod error;
pub mod observability;
pub mod rules;
pub mod runs;
pub mod storage;
pub mod tenant;

pub use config::Config;
pub use domain::{Decision, Facts, OrgId, Outcome, Run, RunStatus};
pub use error::EngineError;
pub use rules::{evaluate, validate, RuleSet, RuleSetDraft};
pub use runs::{RunHandle, RunManager, RunManagerConfig};

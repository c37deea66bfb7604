pub mod evaluator;
pub mod guidance;
pub mod loader;
pub mod model;
pub mod validate;
pub mod watcher;

pub use evaluator::{evaluate, EvaluationError};
pub use guidance::{advise, Guidance, RuleGuidance};
pub use loader::{load_document, LoadError, RuleSetDocument, RuleSetLoader};
pub use model::{
    Bounds, Comparison, Expr, FactType, MissingFactPolicy, Rule, RuleSet, RuleSetDraft, Test,
};
pub use validate::{validate, ValidationError, MAX_NESTING_DEPTH};
pub use watcher::{RuleSetWatcher, SyncReport};

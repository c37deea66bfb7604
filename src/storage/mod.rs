// src/storage/mod.rs
pub mod error;
pub mod memory;
pub mod postgres;
pub mod traits;

pub use error::StorageError;
pub use memory::InMemoryRunStore;
pub use postgres::PostgresRunStore;
pub use traits::{AppendOutcome, PageCursor, RunStore};

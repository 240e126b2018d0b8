//! Adapters layer: concrete implementations of ports.
//!
//! - `sqlite`: rusqlite-backed query evaluator and dataset ingest
//! - `sanitize`: PII/secret filtering for log output

pub mod sanitize;
pub mod sqlite;

pub use sqlite::{SqliteEvaluator, StoreError};

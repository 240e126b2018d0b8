//! Query-evaluation port: the capability the gateway requires of a store.
//!
//! All three operations are read-only and deterministic with respect to
//! the database state. Implementations must bind literal values as
//! parameters, never interpolate them into SQL text.

use crate::domain::ParsedQuery;
use crate::domain::AggregateValue;

/// Errors surfaced by a store implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EvaluatorError {
    /// A referenced column is not in the schema allowlist. Raised before
    /// any SQL is formed.
    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    /// Transport-level failure: connection lost, database missing, table
    /// not yet created.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Read-only evaluation of parsed aggregate queries.
pub trait QueryEvaluator: Send + Sync {
    /// Number of rows matching the query's filters.
    ///
    /// # Errors
    /// Returns [`EvaluatorError::Unavailable`] on transport failure.
    fn count(&self, pq: &ParsedQuery) -> Result<i64, EvaluatorError>;

    /// Distinct non-null values of `column` within the cohort.
    ///
    /// # Errors
    /// Returns [`EvaluatorError::UnknownColumn`] if `column` is not
    /// allowlisted, [`EvaluatorError::Unavailable`] on transport failure.
    fn distinct_count(&self, pq: &ParsedQuery, column: &str) -> Result<i64, EvaluatorError>;

    /// Apply the query's aggregate over the cohort.
    ///
    /// Returns `None` when the cohort is empty and the aggregate is not
    /// COUNT (SQL NULL semantics).
    ///
    /// # Errors
    /// Returns [`EvaluatorError::Unavailable`] on transport failure.
    fn aggregate(&self, pq: &ParsedQuery) -> Result<Option<AggregateValue>, EvaluatorError>;
}

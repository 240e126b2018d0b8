//! # PrivacyGuard
//!
//! Privacy-preserving query gateway for a tabular medical dataset.
//!
//! The gateway stands between analyst-issued aggregate SQL and a backing
//! relational store, enforcing a k-anonymity / l-diversity policy:
//! - a restricted SQL parser accepts one aggregate query shape and
//!   rejects everything else
//! - a risk engine estimates cohort size (k) and sensitive-value
//!   diversity (l) and decides ALLOW / REWRITE / BLOCK
//! - a rewrite engine weakens risky queries by generalizing
//!   quasi-identifiers or dropping predicates, minimizing information loss
//! - a receipt ledger issues a canonically-serialized, hash-chained,
//!   Ed25519-signed record of every executed query
//!
//! ## Architecture
//!
//! The crate follows Hexagonal Architecture:
//! - `domain`: grammar, schema taxonomy, policy, analysis and receipt types
//! - `ports`: the query-evaluation capability required of a store
//! - `adapters`: SQLite evaluator, log sanitization
//! - `application`: risk engine, rewrite engine, receipt ledger, gateway

pub mod adapters;
pub mod application;
pub mod domain;
pub mod ports;

pub use application::QueryGateway;
pub use domain::{Analysis, Decision, Policy};

/// Result type for PrivacyGuard operations.
pub type Result<T> = std::result::Result<T, PrivacyGuardError>;

/// Main error type for PrivacyGuard.
#[derive(Debug, thiserror::Error)]
pub enum PrivacyGuardError {
    #[error("Query rejected: {0}")]
    NotAllowed(#[from] domain::NotAllowed),

    #[error("Store operation failed: {0}")]
    Evaluator(#[from] ports::EvaluatorError),

    #[error("Receipt operation failed: {0}")]
    Receipt(#[from] application::ReceiptError),

    #[error("Storage error: {0}")]
    Store(#[from] adapters::StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

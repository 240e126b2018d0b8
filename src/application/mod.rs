//! Application layer: services composing domain logic with ports.

mod gateway;
mod receipts;
mod rewrite;
mod risk;

pub use gateway::{
    AnalyzeOutcome, ExecuteOutcome, ExecuteStatus, QueryGateway, QueryResult, ResultRow,
};
pub use receipts::{IssueRequest, ReceiptError, ReceiptLedger, VerifyOutcome, PUBLIC_KEY_ID};
pub use rewrite::{
    information_loss, minimal_safe_rewrite, propose_rewrite, RewriteCandidate, RewriteProposal,
};
pub use risk::RiskEngine;

//! Domain layer: pure types and logic.
//!
//! Everything here is side-effect free: the query grammar, the schema
//! taxonomy, policy thresholds, risk-analysis types, and the receipt
//! envelope with its canonical encoding. Store access and signing-key
//! state live in `adapters` and `application`.

mod analysis;
pub mod parser;
mod policy;
mod query;
pub mod receipt;
pub mod schema;

pub use analysis::{Analysis, Decision, FactorCode, RiskFactor, RiskLevel, Severity};
pub use parser::{parse, NotAllowed};
pub use policy::Policy;
pub use query::{AggFn, AggTarget, AggregateValue, Filter, FilterOp, Literal, ParsedQuery};
pub use receipt::{Receipt, ReceiptDecision, ResultSummary};
pub use schema::PatientRecord;

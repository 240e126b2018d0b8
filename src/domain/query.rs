//! Typed form of an accepted aggregate query.

use serde::{Deserialize, Serialize};

/// Aggregate functions the restricted grammar accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggFn {
    Avg,
    Sum,
    Count,
    Min,
    Max,
}

impl AggFn {
    /// Parse a (case-insensitive) aggregate keyword.
    #[must_use]
    pub fn from_keyword(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "avg" => Some(Self::Avg),
            "sum" => Some(Self::Sum),
            "count" => Some(Self::Count),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            _ => None,
        }
    }

    /// SQL spelling, uppercase.
    #[must_use]
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Avg => "AVG",
            Self::Sum => "SUM",
            Self::Count => "COUNT",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }
}

impl std::fmt::Display for AggFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Comparison operators allowed in WHERE predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl FilterOp {
    /// SQL spelling.
    #[must_use]
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// A literal value on the right-hand side of a predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
}

/// One `column op literal` predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: Literal,
}

/// The aggregate target: a named column, or `*` (COUNT only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggTarget {
    Column(String),
    Star,
}

impl AggTarget {
    /// SQL spelling of the target.
    #[must_use]
    pub fn as_sql(&self) -> &str {
        match self {
            Self::Column(c) => c,
            Self::Star => "*",
        }
    }
}

/// A query accepted by the restricted parser.
///
/// Invariants upheld at construction: the aggregate target and every filter
/// column are allowlisted, `*` appears only under COUNT, and the table is
/// the fixed `patient_records`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedQuery {
    pub agg_fn: AggFn,
    pub agg_target: AggTarget,
    pub filters: Vec<Filter>,
}

impl ParsedQuery {
    /// Human-readable label for the computed metric, e.g. `AVG(chol)`.
    #[must_use]
    pub fn metric_label(&self) -> String {
        format!("{}({})", self.agg_fn.as_sql(), self.agg_target.as_sql())
    }
}

/// A single scalar produced by an aggregate.
///
/// MIN/MAX over a derived text column yield `Str`; everything else is
/// numeric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AggregateValue {
    Int(i64),
    Float(f64),
    Str(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agg_fn_keywords() {
        assert_eq!(AggFn::from_keyword("AVG"), Some(AggFn::Avg));
        assert_eq!(AggFn::from_keyword("count"), Some(AggFn::Count));
        assert_eq!(AggFn::from_keyword("median"), None);
    }

    #[test]
    fn test_metric_label() {
        let pq = ParsedQuery {
            agg_fn: AggFn::Count,
            agg_target: AggTarget::Star,
            filters: vec![],
        };
        assert_eq!(pq.metric_label(), "COUNT(*)");

        let pq = ParsedQuery {
            agg_fn: AggFn::Avg,
            agg_target: AggTarget::Column("chol".to_string()),
            filters: vec![],
        };
        assert_eq!(pq.metric_label(), "AVG(chol)");
    }

    #[test]
    fn test_literal_serializes_untagged() {
        let v = serde_json::to_value(Literal::Int(63)).expect("Should serialize");
        assert_eq!(v, serde_json::json!(63));
        let v = serde_json::to_value(Literal::Str("60-69".into())).expect("Should serialize");
        assert_eq!(v, serde_json::json!("60-69"));
    }
}

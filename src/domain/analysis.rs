//! Risk analysis types.
//!
//! An [`Analysis`] is the gateway's verdict on one query: cohort size and
//! diversity estimates, a 0-100 risk score, and the resulting decision.

use serde::{Deserialize, Serialize};

/// Coarse risk classification derived from the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Map a clamped risk score to its level.
    #[must_use]
    pub fn from_score(score: u32) -> Self {
        if score >= 70 {
            Self::High
        } else if score >= 35 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
        }
    }
}

/// What the policy engine decided for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Allow,
    Rewrite,
    Block,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "ALLOW"),
            Self::Rewrite => write!(f, "REWRITE"),
            Self::Block => write!(f, "BLOCK"),
        }
    }
}

/// Severity attached to a single risk factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Machine-readable factor codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FactorCode {
    SmallGroup,
    LowDiversity,
    ExactAgeSlice,
    SqlNotAllowed,
    DbNotReady,
}

/// One contributing signal in a risk assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub code: FactorCode,
    pub severity: Severity,
    pub evidence: serde_json::Value,
}

impl RiskFactor {
    #[must_use]
    pub fn new(code: FactorCode, severity: Severity, evidence: serde_json::Value) -> Self {
        Self {
            code,
            severity,
            evidence,
        }
    }
}

/// Full risk assessment for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    /// Cohort row count under the query's filters.
    pub k_est: i64,
    /// Distinct sensitive-bucket values in the cohort.
    pub l_est: i64,
    /// Clamped to [0, 100].
    pub risk_score: u32,
    pub risk_level: RiskLevel,
    pub decision: Decision,
    pub factors: Vec<RiskFactor>,
}

impl Analysis {
    /// Whether any factor carries the given code.
    #[must_use]
    pub fn has_factor(&self, code: FactorCode) -> bool {
        self.factors.iter().any(|f| f.code == code)
    }
}

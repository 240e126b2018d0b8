//! Risk engine: policy-driven privacy analysis of one query.
//!
//! Risk signals:
//! - k-anonymity proxy: cohort row count (`k_est`)
//! - l-diversity proxy: distinct `chol_level` buckets in the cohort (`l_est`)
//! - exact-age slicing raises the score to encourage generalization

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::json;

use crate::domain::schema::SENSITIVE_BUCKET_COLUMN;
use crate::domain::{
    parse, Analysis, Decision, FactorCode, NotAllowed, ParsedQuery, Policy, RiskFactor,
    RiskLevel, Severity,
};
use crate::ports::{EvaluatorError, QueryEvaluator};

fn exact_age_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bage\s*=\s*\d+\b").expect("Valid regex"))
}

/// Computes an [`Analysis`] for a query against a store.
///
/// Pure given the store's answers: the same query, policy, and store state
/// always produce the same analysis.
pub struct RiskEngine<E> {
    evaluator: Arc<E>,
}

impl<E> RiskEngine<E>
where
    E: QueryEvaluator,
{
    pub fn new(evaluator: Arc<E>) -> Self {
        Self { evaluator }
    }

    /// Parse and analyze. Parser rejections become a BLOCK analysis with a
    /// `SQL_NOT_ALLOWED` factor; they never escape as errors.
    pub fn analyze(&self, sql: &str, policy: &Policy) -> Analysis {
        match parse(sql) {
            Ok(pq) => self.analyze_parsed(sql, &pq, policy),
            Err(reason) => blocked_analysis(&reason),
        }
    }

    /// Analyze an already-parsed query. The raw SQL text is still needed
    /// for the exact-age-slice signal.
    pub fn analyze_parsed(&self, sql: &str, pq: &ParsedQuery, policy: &Policy) -> Analysis {
        let (k_est, l_est) = match self.estimates(pq) {
            Ok(pair) => pair,
            Err(EvaluatorError::UnknownColumn(column)) => {
                return blocked_analysis(&NotAllowed::UnknownColumn(column));
            }
            Err(EvaluatorError::Unavailable(reason)) => {
                tracing::warn!("Store unavailable during analysis: {reason}");
                return db_not_ready_analysis(&reason);
            }
        };

        let mut factors = Vec::new();
        let mut score: u32 = 0;

        // k-anonymity proxy
        if k_est < i64::from(policy.k_min) {
            factors.push(RiskFactor::new(
                FactorCode::SmallGroup,
                Severity::High,
                json!({"k_est": k_est, "k_min": policy.k_min}),
            ));
            score += 45;
        } else if k_est < 10 {
            factors.push(RiskFactor::new(
                FactorCode::SmallGroup,
                Severity::Medium,
                json!({"k_est": k_est, "k_min": policy.k_min}),
            ));
            score += 20;
        }

        // l-diversity proxy
        if l_est < i64::from(policy.l_min) {
            factors.push(RiskFactor::new(
                FactorCode::LowDiversity,
                Severity::Medium,
                json!({"l_est": l_est, "l_min": policy.l_min}),
            ));
            score += 20;
        }

        if exact_age_regex().is_match(sql) {
            factors.push(RiskFactor::new(
                FactorCode::ExactAgeSlice,
                Severity::Low,
                json!({}),
            ));
            score += 10;
        }

        let score = score.min(100);
        let risk_level = RiskLevel::from_score(score);

        let decision = if k_est < i64::from(policy.k_min)
            || l_est < i64::from(policy.l_min)
            || score >= 35
        {
            Decision::Rewrite
        } else {
            Decision::Allow
        };

        Analysis {
            k_est,
            l_est,
            risk_score: score,
            risk_level,
            decision,
            factors,
        }
    }

    fn estimates(&self, pq: &ParsedQuery) -> Result<(i64, i64), EvaluatorError> {
        let k_est = self.evaluator.count(pq)?;
        let l_est = self.evaluator.distinct_count(pq, SENSITIVE_BUCKET_COLUMN)?;
        Ok((k_est, l_est))
    }
}

fn blocked_analysis(reason: &NotAllowed) -> Analysis {
    Analysis {
        k_est: 0,
        l_est: 0,
        risk_score: 95,
        risk_level: RiskLevel::High,
        decision: Decision::Block,
        factors: vec![RiskFactor::new(
            FactorCode::SqlNotAllowed,
            Severity::High,
            json!({"reason": reason.to_string()}),
        )],
    }
}

fn db_not_ready_analysis(reason: &str) -> Analysis {
    Analysis {
        k_est: 0,
        l_est: 0,
        risk_score: 80,
        risk_level: RiskLevel::High,
        decision: Decision::Rewrite,
        factors: vec![RiskFactor::new(
            FactorCode::DbNotReady,
            Severity::High,
            json!({"reason": reason}),
        )],
    }
}

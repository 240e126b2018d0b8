//! Query gateway: compose parse, analysis, rewrite, execution, receipt.
//!
//! Three public operations mirror the external surface: `analyze` (no
//! receipt), `execute` (receipt on every executed query), and `verify`.
//! The receipt always embeds the analysis of the SQL that actually
//! executed, so a rewritten query is re-analyzed before issuance.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::domain::{
    parse, AggregateValue, Analysis, Decision, FactorCode, Policy, Receipt, ReceiptDecision,
    ResultSummary,
};
use crate::ports::QueryEvaluator;
use crate::PrivacyGuardError;

use super::receipts::{IssueRequest, ReceiptLedger, VerifyOutcome};
use super::rewrite::{minimal_safe_rewrite, propose_rewrite, RewriteCandidate};
use super::risk::RiskEngine;

/// Analysis plus an optional suggested rewrite.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeOutcome {
    #[serde(flatten)]
    pub analysis: Analysis,
    pub suggested_rewrite_sql: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecuteStatus {
    Ok,
    Blocked,
}

/// One row of an executed result.
#[derive(Debug, Clone, Serialize)]
pub struct ResultRow {
    pub metric: String,
    pub value: Option<AggregateValue>,
}

/// The executed result: a single aggregate row.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub rows: u32,
    pub data: Vec<ResultRow>,
}

/// Outcome of `execute`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteOutcome {
    pub status: ExecuteStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<QueryResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<Receipt>,
    pub analysis: Analysis,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ExecuteOutcome {
    fn blocked(analysis: Analysis, reason: Option<String>, final_sql: Option<String>) -> Self {
        Self {
            status: ExecuteStatus::Blocked,
            final_sql,
            result: None,
            receipt: None,
            analysis,
            reason,
        }
    }
}

/// The gateway service: one evaluator, one risk engine, one receipt chain.
pub struct QueryGateway<E>
where
    E: QueryEvaluator,
{
    evaluator: Arc<E>,
    risk: RiskEngine<E>,
    ledger: ReceiptLedger,
}

impl<E> QueryGateway<E>
where
    E: QueryEvaluator,
{
    pub fn new(evaluator: Arc<E>, ledger: ReceiptLedger) -> Self {
        let risk = RiskEngine::new(Arc::clone(&evaluator));
        Self {
            evaluator,
            risk,
            ledger,
        }
    }

    /// The receipt ledger (chain head access, out-of-band verification).
    #[must_use]
    pub fn ledger(&self) -> &ReceiptLedger {
        &self.ledger
    }

    /// Analyze a query without executing it. When policy demands a
    /// rewrite, the heuristic suggestion is attached. No receipt.
    pub fn analyze(&self, sql: &str, policy: &Policy) -> AnalyzeOutcome {
        let analysis = self.risk.analyze(sql, policy);
        tracing::debug!(
            "analyze: decision={} score={}",
            analysis.decision,
            analysis.risk_score
        );

        let suggested_rewrite_sql = (analysis.decision == Decision::Rewrite).then(|| {
            propose_rewrite(sql, &analysis, policy.enable_drop_predicate).rewritten_sql
        });

        AnalyzeOutcome {
            analysis,
            suggested_rewrite_sql,
        }
    }

    /// Run the minimal-IL lattice search for a query.
    pub fn search_rewrite(&self, sql: &str, policy: &Policy) -> RewriteCandidate {
        minimal_safe_rewrite(&self.risk, sql, policy)
    }

    /// Execute a query under policy, issuing a receipt for whatever ran.
    ///
    /// Blocked outcomes (parser rejection, declined rewrite) carry no
    /// receipt. A store failure during final execution propagates as an
    /// error and the receipt chain does not advance.
    ///
    /// # Errors
    /// Returns error if the store fails during execution or the receipt
    /// cannot be issued.
    pub fn execute(
        &self,
        sql: &str,
        accept_rewrite: bool,
        policy: &Policy,
    ) -> Result<ExecuteOutcome, PrivacyGuardError> {
        let raw_analysis = self.risk.analyze(sql, policy);

        if raw_analysis.decision == Decision::Block {
            return Ok(ExecuteOutcome::blocked(raw_analysis, None, None));
        }

        // An unreachable store yields a conservative REWRITE analysis; there
        // is nothing to execute against, so return it as-is.
        if raw_analysis.has_factor(FactorCode::DbNotReady) {
            return Ok(ExecuteOutcome::blocked(
                raw_analysis,
                Some("Store unavailable; query not executed".to_string()),
                None,
            ));
        }

        if raw_analysis.decision == Decision::Rewrite && !accept_rewrite {
            return Ok(ExecuteOutcome::blocked(
                raw_analysis,
                Some("Rewrite required by policy".to_string()),
                None,
            ));
        }

        let mut final_sql = sql.trim().to_string();
        let mut applied_rules: Vec<String> = Vec::new();
        if raw_analysis.decision == Decision::Rewrite && accept_rewrite {
            let proposal = propose_rewrite(sql, &raw_analysis, policy.enable_drop_predicate);
            final_sql = proposal.rewritten_sql;
            applied_rules = proposal.applied_rules;
        }

        // The rewritten query must itself pass the restricted grammar.
        let pq = match parse(&final_sql) {
            Ok(pq) => pq,
            Err(reason) => {
                return Ok(ExecuteOutcome::blocked(
                    raw_analysis,
                    Some(reason.to_string()),
                    Some(final_sql),
                ));
            }
        };

        let value = self.evaluator.aggregate(&pq)?;
        let metric = pq.metric_label();
        let result = QueryResult {
            rows: 1,
            data: vec![ResultRow {
                metric: metric.clone(),
                value,
            }],
        };

        // Receipts record the posture of what executed, not what was
        // submitted.
        let final_analysis = self.risk.analyze(&final_sql, policy);

        let rewritten = final_sql != sql.trim();
        let decision = if rewritten {
            ReceiptDecision::RewriteAndExecute
        } else {
            ReceiptDecision::from(raw_analysis.decision)
        };

        let receipt = self.ledger.issue(&IssueRequest {
            raw_sql: sql,
            rewritten_sql: rewritten.then_some(final_sql.as_str()),
            decision,
            analysis: &final_analysis,
            applied_rules: &applied_rules,
            result_summary: Some(ResultSummary {
                rows: result.rows,
                aggregates: vec![metric],
            }),
            policy,
        })?;

        Ok(ExecuteOutcome {
            status: ExecuteStatus::Ok,
            final_sql: Some(final_sql),
            result: Some(result),
            receipt: Some(receipt),
            analysis: final_analysis,
            reason: None,
        })
    }

    /// Verify a receipt produced by this gateway's key.
    #[must_use]
    pub fn verify(&self, receipt: &Value) -> VerifyOutcome {
        self.ledger.verify(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SqliteEvaluator;
    use crate::domain::schema::PatientRecord;

    fn gateway_with_rows(rows: &[(i64, i64, i64, i64)]) -> QueryGateway<SqliteEvaluator> {
        let store = SqliteEvaluator::in_memory().expect("Should create db");
        for &(age, sex, cp, chol) in rows {
            store
                .insert_record(&PatientRecord {
                    age,
                    sex,
                    cp,
                    trestbps: None,
                    chol,
                    fbs: None,
                    thalach: None,
                    target: None,
                })
                .expect("Should insert");
        }
        QueryGateway::new(Arc::new(store), ReceiptLedger::from_seed("gateway-test"))
    }

    fn diverse_rows(n: i64) -> Vec<(i64, i64, i64, i64)> {
        (0..n)
            .map(|i| (40 + (i % 30), i % 2, i % 5, 160 + (i * 7) % 120))
            .collect()
    }

    #[test]
    fn test_analyze_attaches_suggestion_only_on_rewrite() {
        let gateway = gateway_with_rows(&diverse_rows(40));

        let outcome = gateway.analyze("SELECT AVG(chol) FROM patient_records", &Policy::default());
        assert_eq!(outcome.analysis.decision, Decision::Allow);
        assert!(outcome.suggested_rewrite_sql.is_none());

        let outcome = gateway.analyze(
            "SELECT AVG(chol) FROM patient_records WHERE age = 41 AND sex = 1 AND cp = 1",
            &Policy::default(),
        );
        assert_eq!(outcome.analysis.decision, Decision::Rewrite);
        let suggestion = outcome.suggested_rewrite_sql.expect("Should suggest");
        assert!(suggestion.contains("age_band = '40-49'"));
    }

    #[test]
    fn test_execute_requires_rewrite_acceptance() {
        let gateway = gateway_with_rows(&diverse_rows(40));
        let sql = "SELECT AVG(chol) FROM patient_records WHERE age = 41 AND sex = 1 AND cp = 1";

        let outcome = gateway
            .execute(sql, false, &Policy::default())
            .expect("Should run");
        assert_eq!(outcome.status, ExecuteStatus::Blocked);
        assert_eq!(outcome.reason.as_deref(), Some("Rewrite required by policy"));
        assert!(outcome.receipt.is_none());
    }

    #[test]
    fn test_execute_rewrites_and_reanalyzes() {
        let gateway = gateway_with_rows(&diverse_rows(60));
        let sql = "SELECT AVG(chol) FROM patient_records WHERE age = 41 AND sex = 1 AND cp = 1";

        let outcome = gateway
            .execute(sql, true, &Policy::default())
            .expect("Should run");
        assert_eq!(outcome.status, ExecuteStatus::Ok);

        let final_sql = outcome.final_sql.expect("Should have final sql");
        assert!(final_sql.contains("age_band = '40-49'"));

        let receipt = outcome.receipt.expect("Should issue receipt");
        assert_eq!(receipt.rewrite.decision, ReceiptDecision::RewriteAndExecute);
        assert_eq!(receipt.query.rewritten_sql.as_deref(), Some(final_sql.as_str()));
        // Post-rewrite analysis is the one embedded.
        assert_eq!(receipt.risk_assessment.k_est, outcome.analysis.k_est);
        assert!(outcome.analysis.k_est > 2);
    }

    #[test]
    fn test_execute_returns_analysis_when_store_unreachable() {
        use crate::application::risk::tests::StubEvaluator;

        let gateway = QueryGateway::new(
            Arc::new(StubEvaluator {
                k: 0,
                l: 0,
                unavailable: true,
            }),
            ReceiptLedger::from_seed("gateway-test"),
        );

        let outcome = gateway
            .execute("SELECT AVG(chol) FROM patient_records", true, &Policy::default())
            .expect("Should run");
        assert_eq!(outcome.status, ExecuteStatus::Blocked);
        assert!(outcome.analysis.has_factor(FactorCode::DbNotReady));
        assert!(outcome.receipt.is_none());
    }

    #[test]
    fn test_execute_blocked_sql_issues_no_receipt() {
        let gateway = gateway_with_rows(&diverse_rows(40));
        let outcome = gateway
            .execute(
                "SELECT AVG(chol) FROM patient_records; --",
                true,
                &Policy::default(),
            )
            .expect("Should run");
        assert_eq!(outcome.status, ExecuteStatus::Blocked);
        assert_eq!(outcome.analysis.decision, Decision::Block);
        assert!(outcome.receipt.is_none());
        assert!(gateway.ledger().chain_head().is_none());
    }
}

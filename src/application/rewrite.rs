//! Rewrite engine: weaken a risky query until it satisfies policy.
//!
//! Two operations:
//! - a single heuristic pass applying the fixed rules R1/R2/R3'/R4
//! - a lattice search that scores every rule combination by information
//!   loss and returns the minimal-loss candidate that satisfies policy
//!
//! Both operate on SQL text rather than parsed queries: R1's input
//! (`SELECT chol FROM ...`) is outside the restricted grammar by design,
//! and textual substitution preserves the analyst's original formatting
//! everywhere a rule does not touch.

use std::sync::OnceLock;

use regex::{NoExpand, Regex};

use crate::domain::schema;
use crate::domain::{Analysis, Decision, FactorCode, Policy};
use crate::ports::QueryEvaluator;

use super::risk::RiskEngine;

struct RewriteRegexes {
    raw_chol_select: Regex,
    avg_call: Regex,
    raw_chol_select_sub: Regex,
    exact_age: Regex,
    exact_cp: Regex,
    sex_predicate: Regex,
    sex_predicate_full: Regex,
    where_clause: Regex,
    and_split: Regex,
    age_band_predicate: Regex,
    cp_group_predicate: Regex,
}

fn regexes() -> &'static RewriteRegexes {
    static RE: OnceLock<RewriteRegexes> = OnceLock::new();
    RE.get_or_init(|| RewriteRegexes {
        raw_chol_select: Regex::new(r"(?i)select\s+chol\s+from\s+").expect("Valid regex"),
        avg_call: Regex::new(r"(?i)avg\(").expect("Valid regex"),
        raw_chol_select_sub: Regex::new(r"(?i)select\s+chol\s+from").expect("Valid regex"),
        exact_age: Regex::new(r"(?i)\bage\s*=\s*(\d+)\b").expect("Valid regex"),
        exact_cp: Regex::new(r"(?i)\bcp\s*=\s*(\d+)\b").expect("Valid regex"),
        sex_predicate: Regex::new(r"(?i)\bsex\s*=\s*[01]\b").expect("Valid regex"),
        sex_predicate_full: Regex::new(r"(?i)^sex\s*=\s*\S+$").expect("Valid regex"),
        where_clause: Regex::new(r"(?is)\bwhere\b\s+(.*)$").expect("Valid regex"),
        and_split: Regex::new(r"(?i)\s+and\s+").expect("Valid regex"),
        age_band_predicate: Regex::new(r"(?i)\bage_band\s*=\s*'\d+-\d+'").expect("Valid regex"),
        cp_group_predicate: Regex::new(r"(?i)\bcp_group\s*=\s*'[^']+'").expect("Valid regex"),
    })
}

/// Result of a rewrite pass: the new SQL plus the rule identifiers that
/// fired, in application order.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RewriteProposal {
    pub rewritten_sql: String,
    pub applied_rules: Vec<String>,
}

/// R2: replace every exact-age predicate with the decade band of the
/// first one. Returns `None` when no exact-age predicate exists.
fn generalize_age(sql: &str) -> Option<String> {
    let re = regexes();
    let caps = re.exact_age.captures(sql)?;
    let age: i64 = caps[1].parse().ok()?;
    let replacement = format!("age_band = '{}'", schema::age_band(age));
    Some(
        re.exact_age
            .replace_all(sql, NoExpand(&replacement))
            .into_owned(),
    )
}

/// R3': replace every exact chest-pain predicate with the symptom-risk
/// bucket of the first one.
fn generalize_cp(sql: &str) -> Option<String> {
    let re = regexes();
    let caps = re.exact_cp.captures(sql)?;
    let cp: i64 = caps[1].parse().ok()?;
    let replacement = format!("cp_group = '{}'", schema::cp_group(cp));
    Some(
        re.exact_cp
            .replace_all(sql, NoExpand(&replacement))
            .into_owned(),
    )
}

/// R4: remove a `sex = <v>` predicate from the WHERE clause. Removing the
/// sole predicate removes the WHERE clause entirely.
fn drop_sex_predicate(sql: &str) -> Option<String> {
    let re = regexes();
    let s = sql.trim();
    let caps = re.where_clause.captures(s)?;
    let whole = caps.get(0)?;
    let clause = caps.get(1)?.as_str();

    let parts: Vec<&str> = re
        .and_split
        .split(clause)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    let kept: Vec<&str> = parts
        .iter()
        .copied()
        .filter(|p| !re.sex_predicate_full.is_match(p))
        .collect();
    if kept.len() == parts.len() {
        return None;
    }

    let prefix = &s[..whole.start()];
    if kept.is_empty() {
        Some(prefix.trim().to_string())
    } else {
        Some(format!("{prefix}WHERE {}", kept.join(" AND ")).trim().to_string())
    }
}

/// Single heuristic pass over the raw SQL.
///
/// Rules fire in order R1, R2, R3', R4. R4 is a fallback: it drops the
/// sex predicate only when the policy signaled risk, predicate dropping
/// is enabled, and neither generalization rule found anything to rewrite.
#[must_use]
pub fn propose_rewrite(
    sql: &str,
    analysis: &Analysis,
    enable_drop_predicate: bool,
) -> RewriteProposal {
    let re = regexes();
    let mut s = sql.trim().to_string();
    let mut applied: Vec<&'static str> = Vec::new();

    // R1: raw sensitive selection -> aggregate
    if re.raw_chol_select.is_match(&s) && !re.avg_call.is_match(&s) {
        s = re
            .raw_chol_select_sub
            .replace(&s, "SELECT AVG(chol) FROM")
            .into_owned();
        applied.push("R1");
    }

    // R2: exact age -> age_band
    if let Some(next) = generalize_age(&s) {
        s = next;
        applied.push("R2");
    }

    // R3': exact cp -> cp_group
    if let Some(next) = generalize_cp(&s) {
        s = next;
        applied.push("R3'");
    }

    // R4: drop the sex predicate when generalization had nothing to offer
    let generalized = applied.iter().any(|r| *r == "R2" || *r == "R3'");
    let risk_signal = analysis.decision == Decision::Rewrite
        || analysis.has_factor(FactorCode::SmallGroup)
        || analysis.has_factor(FactorCode::LowDiversity);
    if enable_drop_predicate && risk_signal && !generalized && re.sex_predicate.is_match(&s) {
        if let Some(next) = drop_sex_predicate(&s) {
            s = next;
            applied.push("R4");
        }
    }

    RewriteProposal {
        rewritten_sql: s,
        applied_rules: applied.into_iter().map(String::from).collect(),
    }
}

/// Information-loss proxy: fixed weights per applied transformation.
///
/// This is a ranking function, not a semantics-preserving metric; the
/// weights are part of the external contract.
#[must_use]
pub fn information_loss(raw_sql: &str, final_sql: &str) -> f64 {
    let re = regexes();
    let mut loss = 0.0;

    if re.exact_age.is_match(raw_sql) && re.age_band_predicate.is_match(final_sql) {
        loss += 0.6;
    }
    if re.exact_cp.is_match(raw_sql) && re.cp_group_predicate.is_match(final_sql) {
        loss += 0.4;
    }
    if re.sex_predicate.is_match(raw_sql) && !re.sex_predicate.is_match(final_sql) {
        loss += 0.3;
    }

    loss
}

/// One scored entry from the rewrite lattice.
#[derive(Debug, Clone)]
pub struct RewriteCandidate {
    pub rewritten_sql: String,
    pub applied_rules: Vec<String>,
    pub analysis: Analysis,
    pub information_loss: f64,
    /// Decision is ALLOW and both policy floors are met.
    pub safe: bool,
}

/// Search the rewrite lattice for the minimal-information-loss candidate
/// that satisfies policy.
///
/// Candidates: the raw query, each single generalization, their pair, and
/// (when enabled) the sex-predicate drop combined with each. Ranking is
/// the pair (safe?, IL): unsafe candidates sort after all safe ones, ties
/// break by insertion order. When no candidate is safe the minimum-IL one
/// is returned and the caller decides whether to execute or block.
pub fn minimal_safe_rewrite<E>(
    engine: &RiskEngine<E>,
    raw_sql: &str,
    policy: &Policy,
) -> RewriteCandidate
where
    E: QueryEvaluator,
{
    let re = regexes();
    let raw = raw_sql.trim().to_string();
    let has_age = re.exact_age.is_match(&raw);
    let has_cp = re.exact_cp.is_match(&raw);
    let has_sex = re.sex_predicate.is_match(&raw);

    let mut candidates: Vec<(String, Vec<&'static str>)> = vec![(raw.clone(), vec![])];

    // Base generalizations
    if has_age {
        if let Some(s) = generalize_age(&raw) {
            candidates.push((s, vec!["R2"]));
        }
    }
    if has_cp {
        if let Some(s) = generalize_cp(&raw) {
            candidates.push((s, vec!["R3'"]));
        }
    }
    if has_age && has_cp {
        if let Some(s) = generalize_cp(&raw).and_then(|s| generalize_age(&s)) {
            candidates.push((s, vec!["R3'", "R2"]));
        }
    }

    // Predicate drop as an alternative path to reach the k/l floors
    if policy.enable_drop_predicate && has_sex {
        if let Some(dropped) = drop_sex_predicate(&raw) {
            candidates.push((dropped.clone(), vec!["R4_DROP_sex"]));
            if has_age {
                if let Some(s) = generalize_age(&dropped) {
                    candidates.push((s, vec!["R4_DROP_sex", "R2"]));
                }
            }
            if has_cp {
                if let Some(s) = generalize_cp(&dropped) {
                    candidates.push((s, vec!["R4_DROP_sex", "R3'"]));
                }
            }
            if has_age && has_cp {
                if let Some(s) = generalize_cp(&dropped).and_then(|s| generalize_age(&s)) {
                    candidates.push((s, vec!["R4_DROP_sex", "R3'", "R2"]));
                }
            }
        }
    }

    // Deduplicate by canonical text, first occurrence wins.
    let mut seen = std::collections::HashSet::new();
    candidates.retain(|(sql, _)| seen.insert(sql.trim().to_string()));

    let mut scored: Vec<RewriteCandidate> = candidates
        .into_iter()
        .map(|(sql, rules)| {
            let analysis = engine.analyze(&sql, policy);
            let loss = information_loss(&raw, &sql);
            let safe = analysis.decision == Decision::Allow
                && analysis.k_est >= i64::from(policy.k_min)
                && analysis.l_est >= i64::from(policy.l_min);
            RewriteCandidate {
                rewritten_sql: sql,
                applied_rules: rules.into_iter().map(String::from).collect(),
                analysis,
                information_loss: loss,
                safe,
            }
        })
        .collect();

    // Stable sort keeps insertion order as the final tiebreaker.
    scored.sort_by(|a, b| {
        let ka = (u8::from(!a.safe), a.information_loss);
        let kb = (u8::from(!b.safe), b.information_loss);
        ka.partial_cmp(&kb).unwrap_or(std::cmp::Ordering::Equal)
    });

    scored
        .into_iter()
        .next()
        .unwrap_or_else(|| unreachable!("candidate set always contains the raw query"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::risk::tests::StubEvaluator;
    use crate::domain::{RiskFactor, RiskLevel, Severity};
    use crate::ports::EvaluatorError;
    use serde_json::json;
    use std::sync::Arc;

    fn rewrite_analysis() -> Analysis {
        Analysis {
            k_est: 2,
            l_est: 1,
            risk_score: 75,
            risk_level: RiskLevel::High,
            decision: Decision::Rewrite,
            factors: vec![RiskFactor::new(
                FactorCode::SmallGroup,
                Severity::High,
                json!({"k_est": 2, "k_min": 5}),
            )],
        }
    }

    #[test]
    fn test_heuristic_generalizes_age_and_cp_keeps_sex() {
        let proposal = propose_rewrite(
            "SELECT AVG(chol) FROM patient_records WHERE age = 63 AND sex = 1 AND cp = 4",
            &rewrite_analysis(),
            true,
        );
        assert_eq!(
            proposal.rewritten_sql,
            "SELECT AVG(chol) FROM patient_records WHERE age_band = '60-69' AND sex = 1 AND cp_group = 'HighRiskSymptoms'"
        );
        assert_eq!(proposal.applied_rules, vec!["R2", "R3'"]);
    }

    #[test]
    fn test_heuristic_lifts_raw_sensitive_selection() {
        let proposal = propose_rewrite(
            "SELECT chol FROM patient_records WHERE age = 50",
            &rewrite_analysis(),
            true,
        );
        assert_eq!(
            proposal.rewritten_sql,
            "SELECT AVG(chol) FROM patient_records WHERE age_band = '50-59'"
        );
        assert_eq!(proposal.applied_rules, vec!["R1", "R2"]);
    }

    #[test]
    fn test_heuristic_drops_sex_when_nothing_to_generalize() {
        let proposal = propose_rewrite(
            "SELECT AVG(chol) FROM patient_records WHERE sex = 1",
            &rewrite_analysis(),
            true,
        );
        assert_eq!(proposal.rewritten_sql, "SELECT AVG(chol) FROM patient_records");
        assert_eq!(proposal.applied_rules, vec!["R4"]);
    }

    #[test]
    fn test_heuristic_drop_keeps_other_predicates() {
        let proposal = propose_rewrite(
            "SELECT AVG(chol) FROM patient_records WHERE sex = 0 AND thalach > 120",
            &rewrite_analysis(),
            true,
        );
        assert_eq!(
            proposal.rewritten_sql,
            "SELECT AVG(chol) FROM patient_records WHERE thalach > 120"
        );
        assert_eq!(proposal.applied_rules, vec!["R4"]);
    }

    #[test]
    fn test_heuristic_respects_drop_switch() {
        let proposal = propose_rewrite(
            "SELECT AVG(chol) FROM patient_records WHERE sex = 1",
            &rewrite_analysis(),
            false,
        );
        assert!(proposal.applied_rules.is_empty());
        assert_eq!(
            proposal.rewritten_sql,
            "SELECT AVG(chol) FROM patient_records WHERE sex = 1"
        );
    }

    #[test]
    fn test_heuristic_noop_without_risk_signal() {
        let allow = Analysis {
            k_est: 100,
            l_est: 3,
            risk_score: 0,
            risk_level: RiskLevel::Low,
            decision: Decision::Allow,
            factors: vec![],
        };
        let proposal =
            propose_rewrite("SELECT AVG(chol) FROM patient_records WHERE sex = 1", &allow, true);
        assert!(proposal.applied_rules.is_empty());
    }

    #[test]
    fn test_information_loss_weights() {
        let raw = "SELECT AVG(chol) FROM patient_records WHERE age = 63 AND sex = 1 AND cp = 4";
        assert_eq!(information_loss(raw, raw), 0.0);
        assert_eq!(
            information_loss(
                raw,
                "SELECT AVG(chol) FROM patient_records WHERE age_band = '60-69' AND sex = 1 AND cp = 4"
            ),
            0.6
        );
        let fully = "SELECT AVG(chol) FROM patient_records WHERE age_band = '60-69' AND cp_group = 'HighRiskSymptoms'";
        let loss = information_loss(raw, fully);
        assert!((loss - 1.3).abs() < 1e-9);
    }

    /// Store double whose cohort estimates depend on whether the exact
    /// `age` predicate survived in the candidate.
    struct SlicingEvaluator;

    impl QueryEvaluator for SlicingEvaluator {
        fn count(&self, pq: &crate::domain::ParsedQuery) -> Result<i64, EvaluatorError> {
            let exact_age = pq.filters.iter().any(|f| f.column == "age");
            Ok(if exact_age { 2 } else { 30 })
        }

        fn distinct_count(
            &self,
            pq: &crate::domain::ParsedQuery,
            _column: &str,
        ) -> Result<i64, EvaluatorError> {
            let exact_age = pq.filters.iter().any(|f| f.column == "age");
            Ok(if exact_age { 1 } else { 3 })
        }

        fn aggregate(
            &self,
            _pq: &crate::domain::ParsedQuery,
        ) -> Result<Option<crate::domain::AggregateValue>, EvaluatorError> {
            Ok(Some(crate::domain::AggregateValue::Float(240.0)))
        }
    }

    #[test]
    fn test_lattice_picks_minimal_loss_safe_candidate() {
        let engine = RiskEngine::new(Arc::new(SlicingEvaluator));
        let best = minimal_safe_rewrite(
            &engine,
            "SELECT AVG(chol) FROM patient_records WHERE age = 63 AND sex = 1 AND cp = 4",
            &Policy::default(),
        );

        // Generalizing age alone already satisfies policy; everything
        // cheaper (raw, cp-only) is unsafe and everything else loses more.
        assert!(best.safe);
        assert_eq!(best.applied_rules, vec!["R2"]);
        assert!((best.information_loss - 0.6).abs() < 1e-9);
        assert!(best.rewritten_sql.contains("age_band = '60-69'"));
        assert!(best.rewritten_sql.contains("sex = 1"));
    }

    #[test]
    fn test_lattice_returns_min_loss_when_nothing_safe() {
        let engine = RiskEngine::new(Arc::new(StubEvaluator {
            k: 1,
            l: 1,
            unavailable: false,
        }));
        let best = minimal_safe_rewrite(
            &engine,
            "SELECT AVG(chol) FROM patient_records WHERE age = 63 AND sex = 1",
            &Policy::default(),
        );
        assert!(!best.safe);
        // The raw query has zero information loss and comes first.
        assert!(best.applied_rules.is_empty());
        assert_eq!(best.information_loss, 0.0);
    }

    #[test]
    fn test_lattice_dedupes_and_keeps_raw_only_query() {
        let engine = RiskEngine::new(Arc::new(StubEvaluator {
            k: 100,
            l: 3,
            unavailable: false,
        }));
        let best = minimal_safe_rewrite(
            &engine,
            "SELECT AVG(chol) FROM patient_records",
            &Policy::default(),
        );
        assert!(best.safe);
        assert!(best.applied_rules.is_empty());
        assert_eq!(best.rewritten_sql, "SELECT AVG(chol) FROM patient_records");
    }

    #[test]
    fn test_lattice_reaches_drop_combination() {
        // Safe only once both age is generalized and sex is dropped.
        struct NeedsWideCohort;
        impl QueryEvaluator for NeedsWideCohort {
            fn count(&self, pq: &crate::domain::ParsedQuery) -> Result<i64, EvaluatorError> {
                let exact_age = pq.filters.iter().any(|f| f.column == "age");
                let has_sex = pq.filters.iter().any(|f| f.column == "sex");
                Ok(if exact_age || has_sex { 3 } else { 40 })
            }
            fn distinct_count(
                &self,
                pq: &crate::domain::ParsedQuery,
                _column: &str,
            ) -> Result<i64, EvaluatorError> {
                let exact_age = pq.filters.iter().any(|f| f.column == "age");
                let has_sex = pq.filters.iter().any(|f| f.column == "sex");
                Ok(if exact_age || has_sex { 1 } else { 3 })
            }
            fn aggregate(
                &self,
                _pq: &crate::domain::ParsedQuery,
            ) -> Result<Option<crate::domain::AggregateValue>, EvaluatorError> {
                Ok(None)
            }
        }

        let engine = RiskEngine::new(Arc::new(NeedsWideCohort));
        let best = minimal_safe_rewrite(
            &engine,
            "SELECT AVG(chol) FROM patient_records WHERE age = 63 AND sex = 1",
            &Policy::default(),
        );
        assert!(best.safe);
        assert_eq!(best.applied_rules, vec!["R4_DROP_sex", "R2"]);
        assert!((best.information_loss - 0.9).abs() < 1e-9);
    }
}

//! Column taxonomy for the `patient_records` dataset.
//!
//! The gateway operates over one fixed table. Every column a query may
//! touch is listed here; anything else is rejected before SQL is formed.

use serde::{Deserialize, Serialize};

/// The only table the gateway will query.
pub const TABLE_NAME: &str = "patient_records";

/// Columns allowed as aggregate targets and in WHERE predicates.
pub const ALLOWED_COLUMNS: [&str; 11] = [
    "age", "sex", "cp", "age_band", "cp_group", "chol_level", "trestbps", "chol", "fbs",
    "thalach", "target",
];

/// Quasi-identifiers: columns that combine to re-identify individuals.
pub const QI_COLUMNS: [&str; 3] = ["age", "sex", "cp"];

/// Columns carrying sensitive clinical values.
pub const SENSITIVE_COLUMNS: [&str; 5] = ["trestbps", "chol", "fbs", "thalach", "target"];

/// Derived generalization columns, populated at ingest time.
pub const DERIVED_COLUMNS: [&str; 3] = ["age_band", "cp_group", "chol_level"];

/// The bucket column used for the l-diversity proxy.
pub const SENSITIVE_BUCKET_COLUMN: &str = "chol_level";

/// Look up a column name in the allowlist, returning its canonical form.
///
/// Callers that build SQL interpolate the returned static string, never the
/// input, so an allowlist hit is also an injection guard.
#[must_use]
pub fn canonical_column(name: &str) -> Option<&'static str> {
    ALLOWED_COLUMNS.iter().find(|c| **c == name).copied()
}

/// Decade bucket for an exact age, formatted `"S-E"` (e.g. `"50-59"`).
#[must_use]
pub fn age_band(age: i64) -> String {
    let start = (age / 10) * 10;
    format!("{start}-{}", start + 9)
}

/// Symptom-risk bucket for an exact chest-pain code.
///
/// Codes outside the documented range fall back to the medium bucket.
#[must_use]
pub fn cp_group(cp: i64) -> &'static str {
    match cp {
        0 | 1 => "LowRiskSymptoms",
        2 | 3 => "MediumRiskSymptoms",
        4 => "HighRiskSymptoms",
        _ => "MediumRiskSymptoms",
    }
}

/// Cholesterol bucket: `Normal` < 200 ≤ `BorderlineHigh` < 240 ≤ `High`.
#[must_use]
pub fn chol_level(chol: f64) -> &'static str {
    if chol < 200.0 {
        "Normal"
    } else if chol < 240.0 {
        "BorderlineHigh"
    } else {
        "High"
    }
}

/// One row of the dataset as supplied at ingest time.
///
/// Derived columns are not part of this record; the store computes them
/// from `age`, `cp` and `chol` on insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientRecord {
    pub age: i64,
    pub sex: i64,
    pub cp: i64,
    pub trestbps: Option<i64>,
    pub chol: i64,
    pub fbs: Option<i64>,
    pub thalach: Option<i64>,
    pub target: Option<i64>,
}

//! Receipt envelope and canonical JSON encoding.
//!
//! A receipt is a tamper-evident record of one executed query. Its hash is
//! computed over a canonical encoding: keys sorted lexicographically at
//! every depth, `,` and `:` separators with no whitespace, UTF-8 with
//! non-ASCII preserved literally. The `receipt_hash` and `signature.sig`
//! fields are excluded from the hashed payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::domain::analysis::{Analysis, RiskFactor, RiskLevel};
use crate::domain::policy::Policy;

pub const RECEIPT_VERSION: &str = "1.0";
pub const SIGNATURE_ALGO: &str = "ed25519";

/// Decision tag recorded in a receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiptDecision {
    Allow,
    Rewrite,
    RewriteAndExecute,
    Block,
}

impl From<crate::domain::analysis::Decision> for ReceiptDecision {
    fn from(decision: crate::domain::analysis::Decision) -> Self {
        use crate::domain::analysis::Decision;
        match decision {
            Decision::Allow => Self::Allow,
            Decision::Rewrite => Self::Rewrite,
            Decision::Block => Self::Block,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptQuery {
    pub raw_sql: String,
    pub rewritten_sql: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DpSlot {
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptPolicy {
    pub k_min: u32,
    pub l_min: u32,
    /// Reserved: no noise mechanism is wired in.
    pub dp: DpSlot,
}

impl From<&Policy> for ReceiptPolicy {
    fn from(policy: &Policy) -> Self {
        Self {
            k_min: policy.k_min,
            l_min: policy.l_min,
            dp: DpSlot { enabled: false },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub risk_score: u32,
    pub risk_level: RiskLevel,
    pub k_est: i64,
    pub l_est: i64,
    pub factors: Vec<RiskFactor>,
}

impl From<&Analysis> for RiskAssessment {
    fn from(analysis: &Analysis) -> Self {
        Self {
            risk_score: analysis.risk_score,
            risk_level: analysis.risk_level,
            k_est: analysis.k_est,
            l_est: analysis.l_est,
            factors: analysis.factors.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptRewrite {
    pub decision: ReceiptDecision,
    pub applied_rules: Vec<String>,
}

/// Shape of the executed result recorded in a receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub rows: u32,
    pub aggregates: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptExecution {
    pub result_summary: Option<ResultSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptSignature {
    pub algo: String,
    pub public_key_id: String,
    /// `base64:<sig>`; absent while the payload is being hashed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

/// The full receipt envelope.
///
/// `receipt_hash` and `signature.sig` are skipped during serialization
/// while unset, so the canonical encoding of a freshly built receipt is
/// exactly the hashed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub receipt_version: String,
    pub timestamp_utc: String,
    pub prev_receipt_hash: Option<String>,
    pub query: ReceiptQuery,
    pub policy: ReceiptPolicy,
    pub risk_assessment: RiskAssessment,
    pub rewrite: ReceiptRewrite,
    pub execution: ReceiptExecution,
    pub signature: ReceiptSignature,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_hash: Option<String>,
}

impl Receipt {
    /// JSON value form, as consumed by `verify`.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Canonical encoding of a JSON value: sorted keys, no whitespace,
/// non-ASCII preserved literally.
#[must_use]
pub fn canonical_json_bytes(value: &Value) -> Vec<u8> {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out.into_bytes()
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            // serde_json emits UTF-8 without escaping non-ASCII.
            match serde_json::to_string(value) {
                Ok(s) => out.push_str(&s),
                Err(_) => out.push_str("null"),
            }
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            for (idx, key) in keys.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                match serde_json::to_string(key) {
                    Ok(k) => out.push_str(&k),
                    Err(_) => out.push_str("\"\""),
                }
                out.push(':');
                if let Some(item) = map.get(*key) {
                    write_canonical(item, out);
                }
            }
            out.push('}');
        }
    }
}

/// SHA-256 digest of the canonical encoding.
#[must_use]
pub fn canonical_sha256(value: &Value) -> [u8; 32] {
    Sha256::digest(canonical_json_bytes(value)).into()
}

/// Lowercase hex rendering of a digest.
#[must_use]
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_sorts_keys_at_every_depth() {
        let value = json!({"b": 1, "a": {"d": 2, "c": [{"z": 0, "y": 1}]}});
        let bytes = canonical_json_bytes(&value);
        assert_eq!(
            String::from_utf8(bytes).expect("Should be utf-8"),
            r#"{"a":{"c":[{"y":1,"z":0}],"d":2},"b":1}"#
        );
    }

    #[test]
    fn test_canonical_has_no_whitespace() {
        let value = json!({"k": [1, 2, 3], "s": "a b"});
        let text = String::from_utf8(canonical_json_bytes(&value)).expect("Should be utf-8");
        assert_eq!(text, r#"{"k":[1,2,3],"s":"a b"}"#);
    }

    #[test]
    fn test_canonical_preserves_non_ascii() {
        let value = json!({"note": "kolesterol ≥ 240 é"});
        let text = String::from_utf8(canonical_json_bytes(&value)).expect("Should be utf-8");
        assert!(text.contains('≥'));
        assert!(text.contains('é'));
        assert!(!text.contains("\\u"));
    }

    #[test]
    fn test_canonical_null_and_bool() {
        let value = json!({"a": null, "b": true});
        let text = String::from_utf8(canonical_json_bytes(&value)).expect("Should be utf-8");
        assert_eq!(text, r#"{"a":null,"b":true}"#);
    }

    #[test]
    fn test_digest_is_stable_under_key_order() {
        let a = json!({"x": 1, "y": {"p": [true, null], "q": "s"}});
        let b = json!({"y": {"q": "s", "p": [true, null]}, "x": 1});
        assert_eq!(canonical_sha256(&a), canonical_sha256(&b));
    }

    #[test]
    fn test_hex_rendering() {
        assert_eq!(to_hex(&[0x00, 0xab, 0xff]), "00abff");
    }
}

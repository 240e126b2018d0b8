//! Receipt ledger: issue and verify tamper-evident query receipts.
//!
//! Every executed query yields a receipt: the canonical JSON payload is
//! hashed with SHA-256, the 32 raw digest bytes are signed with Ed25519,
//! and the hash of the previous receipt is embedded so receipts from one
//! process form a linear chain.
//!
//! The signing key is derived as `SHA-256(PG_SIGNING_SEED)`; this keeps
//! receipts reproducible across components sharing the seed. The default
//! seed is for demos only.
//!
//! # Mutex Behavior
//!
//! The chain head is protected by `Mutex` and held across the whole
//! construct-hash-sign-advance sequence so concurrent issues serialize
//! into a linear chain. A poisoned mutex causes a panic (fail fast).

use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{SecondsFormat, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::domain::receipt::{
    canonical_sha256, to_hex, Receipt, ReceiptExecution, ReceiptPolicy, ReceiptQuery,
    ReceiptRewrite, ReceiptSignature, RiskAssessment, RECEIPT_VERSION, SIGNATURE_ALGO,
};
use crate::domain::{Analysis, Policy, ReceiptDecision, ResultSummary};

const SIGNING_SEED_ENV: &str = "PG_SIGNING_SEED";
const DEFAULT_SIGNING_SEED: &str = "demo-only-change-me";

/// Identifier published alongside every signature.
pub const PUBLIC_KEY_ID: &str = "demo_key_01";

/// Error type for receipt issuance.
#[derive(Debug, thiserror::Error)]
pub enum ReceiptError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Everything the ledger needs to issue one receipt.
#[derive(Debug)]
pub struct IssueRequest<'a> {
    pub raw_sql: &'a str,
    pub rewritten_sql: Option<&'a str>,
    pub decision: ReceiptDecision,
    /// Post-rewrite analysis: the privacy posture of what actually ran.
    pub analysis: &'a Analysis,
    pub applied_rules: &'a [String],
    pub result_summary: Option<ResultSummary>,
    pub policy: &'a Policy,
}

/// Outcome of verifying a receipt. Never an error: failures are reported
/// through `valid` and `reason`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyOutcome {
    pub valid: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recomputed: Option<String>,
}

impl VerifyOutcome {
    fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: reason.into(),
            recomputed: None,
        }
    }
}

/// Issues and verifies receipts; owns the signing key and the chain head.
pub struct ReceiptLedger {
    signing_key: SigningKey,
    public_key_id: String,
    prev_hash: Mutex<Option<String>>,
}

impl ReceiptLedger {
    /// Build a ledger from `PG_SIGNING_SEED`, falling back to the demo
    /// seed when unset.
    #[must_use]
    pub fn from_env() -> Self {
        let seed = Zeroizing::new(
            std::env::var(SIGNING_SEED_ENV).unwrap_or_else(|_| DEFAULT_SIGNING_SEED.to_string()),
        );
        Self::from_seed(&seed)
    }

    /// Derive the Ed25519 signing key from `SHA-256(seed)`.
    #[must_use]
    pub fn from_seed(seed: &str) -> Self {
        let digest: [u8; 32] = Sha256::digest(seed.as_bytes()).into();
        Self {
            signing_key: SigningKey::from_bytes(&digest),
            public_key_id: PUBLIC_KEY_ID.to_string(),
            prev_hash: Mutex::new(None),
        }
    }

    /// The verifying half of the ledger's key.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Current chain head (`sha256:<hex>`), if any receipt was issued.
    #[must_use]
    pub fn chain_head(&self) -> Option<String> {
        self.prev_hash.lock().expect("Lock failed").clone()
    }

    /// Reinject a persisted chain tail so a restarted process continues
    /// the chain instead of starting a new one.
    pub fn set_chain_head(&self, head: Option<String>) {
        *self.prev_hash.lock().expect("Lock failed") = head;
    }

    /// Issue a signed receipt and advance the chain head.
    ///
    /// # Errors
    /// Returns error if the payload cannot be serialized; the chain head
    /// is not advanced in that case.
    pub fn issue(&self, request: &IssueRequest<'_>) -> Result<Receipt, ReceiptError> {
        let mut prev = self.prev_hash.lock().expect("Lock failed");

        let mut receipt = Receipt {
            receipt_version: RECEIPT_VERSION.to_string(),
            timestamp_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            prev_receipt_hash: prev.clone(),
            query: ReceiptQuery {
                raw_sql: request.raw_sql.to_string(),
                rewritten_sql: request.rewritten_sql.map(str::to_string),
            },
            policy: ReceiptPolicy::from(request.policy),
            risk_assessment: RiskAssessment::from(request.analysis),
            rewrite: ReceiptRewrite {
                decision: request.decision,
                applied_rules: request.applied_rules.to_vec(),
            },
            execution: ReceiptExecution {
                result_summary: request.result_summary.clone(),
            },
            signature: ReceiptSignature {
                algo: SIGNATURE_ALGO.to_string(),
                public_key_id: self.public_key_id.clone(),
                sig: None,
            },
            receipt_hash: None,
        };

        // With `sig` and `receipt_hash` unset, the serialized form is
        // exactly the hashed payload.
        let payload = receipt.to_value()?;
        let digest = canonical_sha256(&payload);
        let signature = self.signing_key.sign(&digest);

        let hash_text = format!("sha256:{}", to_hex(&digest));
        receipt.receipt_hash = Some(hash_text.clone());
        receipt.signature.sig = Some(format!("base64:{}", STANDARD.encode(signature.to_bytes())));

        *prev = Some(hash_text);
        tracing::info!(
            "Issued receipt {} ({})",
            receipt.receipt_hash.as_deref().unwrap_or_default(),
            receipt.rewrite.applied_rules.join(",")
        );

        Ok(receipt)
    }

    /// Verify a receipt in JSON form: recompute the canonical hash with
    /// `receipt_hash` and `signature.sig` stripped, then check the Ed25519
    /// signature over the recomputed digest.
    #[must_use]
    pub fn verify(&self, receipt: &Value) -> VerifyOutcome {
        let sig_text = receipt
            .get("signature")
            .and_then(|s| s.get("sig"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let Some(sig_b64) = sig_text.strip_prefix("base64:") else {
            return VerifyOutcome::invalid("Missing signature");
        };
        let sig_bytes = match STANDARD.decode(sig_b64) {
            Ok(bytes) => bytes,
            Err(_) => return VerifyOutcome::invalid("Verification error: invalid base64"),
        };

        let claimed = receipt
            .get("receipt_hash")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !claimed.starts_with("sha256:") {
            return VerifyOutcome::invalid("Missing receipt_hash");
        }

        let mut stripped = receipt.clone();
        if let Some(obj) = stripped.as_object_mut() {
            obj.remove("receipt_hash");
            if let Some(signature) = obj.get_mut("signature").and_then(Value::as_object_mut) {
                signature.remove("sig");
            }
        }

        let digest = canonical_sha256(&stripped);
        let recomputed = format!("sha256:{}", to_hex(&digest));
        if recomputed != claimed {
            return VerifyOutcome {
                valid: false,
                reason: "Hash mismatch".to_string(),
                recomputed: Some(recomputed),
            };
        }

        let signature = match Signature::from_slice(&sig_bytes) {
            Ok(signature) => signature,
            Err(_) => return VerifyOutcome::invalid("Verification error: malformed signature"),
        };
        match self.verifying_key().verify(&digest, &signature) {
            Ok(()) => VerifyOutcome {
                valid: true,
                reason: "OK".to_string(),
                recomputed: None,
            },
            Err(_) => VerifyOutcome::invalid("Verification error: signature check failed"),
        }
    }
}

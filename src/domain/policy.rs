//! Privacy policy thresholds.

use serde::{Deserialize, Serialize};

const K_MIN_DEFAULT: u32 = 5;
const L_MIN_DEFAULT: u32 = 2;

/// Per-request policy: k-anonymity and l-diversity floors plus the
/// predicate-drop switch for the rewrite engine.
///
/// Values are clamped at construction: `k_min` to [2, 50], `l_min` to
/// [1, 10].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub k_min: u32,
    pub l_min: u32,
    pub enable_drop_predicate: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            k_min: K_MIN_DEFAULT,
            l_min: L_MIN_DEFAULT,
            enable_drop_predicate: true,
        }
    }
}

impl Policy {
    /// Build a policy, clamping thresholds into their legal ranges.
    #[must_use]
    pub fn new(k_min: u32, l_min: u32, enable_drop_predicate: bool) -> Self {
        Self {
            k_min: k_min.clamp(2, 50),
            l_min: l_min.clamp(1, 10),
            enable_drop_predicate,
        }
    }

    /// Load policy overrides from the environment (best-effort).
    ///
    /// Supported:
    /// - `PG_K_MIN`
    /// - `PG_L_MIN`
    /// - `PG_DROP_PREDICATE` (1/true/yes to enable)
    #[must_use]
    pub fn from_env_or_default() -> Self {
        let mut policy = Self::default();

        if let Ok(v) = std::env::var("PG_K_MIN") {
            if let Ok(x) = v.trim().parse::<u32>() {
                policy.k_min = x;
            }
        }
        if let Ok(v) = std::env::var("PG_L_MIN") {
            if let Ok(x) = v.trim().parse::<u32>() {
                policy.l_min = x;
            }
        }
        if let Ok(v) = std::env::var("PG_DROP_PREDICATE") {
            policy.enable_drop_predicate =
                matches!(v.trim(), "1" | "true" | "TRUE" | "yes" | "YES");
        }

        Self::new(policy.k_min, policy.l_min, policy.enable_drop_predicate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = Policy::default();
        assert_eq!(policy.k_min, 5);
        assert_eq!(policy.l_min, 2);
        assert!(policy.enable_drop_predicate);
    }

    #[test]
    fn test_clamping() {
        let policy = Policy::new(1, 0, false);
        assert_eq!(policy.k_min, 2);
        assert_eq!(policy.l_min, 1);

        let policy = Policy::new(500, 99, true);
        assert_eq!(policy.k_min, 50);
        assert_eq!(policy.l_min, 10);
    }
}

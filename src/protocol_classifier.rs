// Protocol Classifier - decides which AMM family a staked token belongs to
// Rules are data; the first matching row wins.

use crate::errors::{FarmError, FarmResult};
use crate::pools::ProtocolVariant;
use crate::types::TokenKey;
use serde_json::Value;
use tracing::debug;

/// Structural test over a contract storage document.
///
/// `root_keys` must exist at the top level, `storage_keys` inside the nested
/// `storage` object (Quipuswap keeps its pool state there).
#[derive(Debug, Clone, Copy)]
pub struct StructuralRule {
    pub variant: ProtocolVariant,
    pub root_keys: &'static [&'static str],
    pub storage_keys: &'static [&'static str],
}

/// Evaluated in order.
pub const STRUCTURAL_RULES: &[StructuralRule] = &[
    StructuralRule {
        variant: ProtocolVariant::QuipuswapV1,
        root_keys: &["dex_lambdas", "token_lambdas"],
        storage_keys: &["reward_per_share", "reward_per_sec"],
    },
    StructuralRule {
        variant: ProtocolVariant::QuipuswapV2,
        root_keys: &["dex_lambdas", "token_lambdas"],
        storage_keys: &["flash_swaps_proxy", "baker_registry"],
    },
    StructuralRule {
        variant: ProtocolVariant::Plenty,
        root_keys: &["exchangeAddress", "securityCheck"],
        storage_keys: &[],
    },
    StructuralRule {
        variant: ProtocolVariant::Spicy,
        root_keys: &["spiceFeeLastK"],
        storage_keys: &[],
    },
];

fn has_key(doc: &Value, key: &str) -> bool {
    doc.get(key).map_or(false, |v| !v.is_null())
}

impl StructuralRule {
    pub fn matches(&self, storage: &Value) -> bool {
        if !self.root_keys.iter().all(|k| has_key(storage, k)) {
            return false;
        }
        if self.storage_keys.is_empty() {
            return true;
        }
        match storage.get("storage") {
            Some(inner) => self.storage_keys.iter().all(|k| has_key(inner, k)),
            None => false,
        }
    }
}

/// How a farm's staked token was recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationPath {
    /// Listed in the pool feed; reserves come from the feed record.
    Feed(ProtocolVariant),
    /// The configured Liquidity Baking LP token.
    LiquidityBaking,
    /// Pool contract storage matched a structural rule (or none, SingleToken).
    Storage(ProtocolVariant),
}

impl ClassificationPath {
    pub fn variant(&self) -> ProtocolVariant {
        match self {
            ClassificationPath::Feed(v) | ClassificationPath::Storage(v) => *v,
            ClassificationPath::LiquidityBaking => ProtocolVariant::LiquidityBaking,
        }
    }
}

pub struct ProtocolClassifier {
    lb_lp_token: String,
}

impl ProtocolClassifier {
    pub fn new(lb_lp_token: impl Into<String>) -> Self {
        Self {
            lb_lp_token: lb_lp_token.into(),
        }
    }

    pub fn is_liquidity_baking(&self, key: &TokenKey) -> bool {
        key.address == self.lb_lp_token
    }

    /// Map a pool feed dex type; unknown families stake as single tokens.
    pub fn classify_feed_dex(dex_type: &str) -> ProtocolVariant {
        ProtocolVariant::from_feed_name(dex_type).unwrap_or(ProtocolVariant::SingleToken)
    }

    /// Classify raw contract storage. Same payload, same answer.
    pub fn classify_storage(subject: &TokenKey, storage: &Value) -> FarmResult<ProtocolVariant> {
        if !storage.is_object() {
            return Err(FarmError::classification(
                subject.to_string(),
                "storage is not an object",
            ));
        }
        let variant = STRUCTURAL_RULES
            .iter()
            .find(|rule| rule.matches(storage))
            .map(|rule| rule.variant)
            .unwrap_or(ProtocolVariant::SingleToken);
        debug!("🔎 [Classifier] {} classified as {}", subject, variant);
        Ok(variant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> TokenKey {
        TokenKey::new("KT1Pool", 0)
    }

    #[test]
    fn quipuswap_v1_needs_inner_reward_fields() {
        let storage = json!({
            "dex_lambdas": 1, "token_lambdas": 2,
            "storage": { "reward_per_share": "0", "reward_per_sec": "0", "tez_pool": "1" }
        });
        assert_eq!(
            ProtocolClassifier::classify_storage(&key(), &storage).unwrap(),
            ProtocolVariant::QuipuswapV1
        );

        let partial = json!({ "dex_lambdas": 1, "token_lambdas": 2, "storage": {} });
        assert_eq!(
            ProtocolClassifier::classify_storage(&key(), &partial).unwrap(),
            ProtocolVariant::SingleToken
        );
    }

    #[test]
    fn quipuswap_v2_plenty_spicy() {
        let v2 = json!({
            "dex_lambdas": 1, "token_lambdas": 2,
            "storage": { "flash_swaps_proxy": "KT1", "baker_registry": "KT1" }
        });
        let plenty = json!({ "exchangeAddress": "KT1Ex", "securityCheck": false });
        let spicy = json!({ "spiceFeeLastK": "1", "token0": {} });
        assert_eq!(
            ProtocolClassifier::classify_storage(&key(), &v2).unwrap(),
            ProtocolVariant::QuipuswapV2
        );
        assert_eq!(
            ProtocolClassifier::classify_storage(&key(), &plenty).unwrap(),
            ProtocolVariant::Plenty
        );
        assert_eq!(
            ProtocolClassifier::classify_storage(&key(), &spicy).unwrap(),
            ProtocolVariant::Spicy
        );
    }

    #[test]
    fn first_rule_wins() {
        // Carries both V1 and V2 markers; V1 sits first in the table.
        let both = json!({
            "dex_lambdas": 1, "token_lambdas": 2,
            "storage": {
                "reward_per_share": "0", "reward_per_sec": "0",
                "flash_swaps_proxy": "KT1", "baker_registry": "KT1"
            }
        });
        assert_eq!(
            ProtocolClassifier::classify_storage(&key(), &both).unwrap(),
            ProtocolVariant::QuipuswapV1
        );
    }

    #[test]
    fn classification_is_idempotent() {
        let storage = json!({ "spiceFeeLastK": "1" });
        let first = ProtocolClassifier::classify_storage(&key(), &storage).unwrap();
        for _ in 0..5 {
            assert_eq!(
                ProtocolClassifier::classify_storage(&key(), &storage).unwrap(),
                first
            );
        }
    }

    #[test]
    fn null_markers_do_not_count() {
        let storage = json!({ "spiceFeeLastK": null });
        assert_eq!(
            ProtocolClassifier::classify_storage(&key(), &storage).unwrap(),
            ProtocolVariant::SingleToken
        );
    }

    #[test]
    fn non_object_storage_is_a_classification_error() {
        let err = ProtocolClassifier::classify_storage(&key(), &json!("oops")).unwrap_err();
        assert_eq!(err.kind(), "classification");
    }

    #[test]
    fn liquidity_baking_and_feed_names() {
        let classifier = ProtocolClassifier::new("KT1LB");
        assert!(classifier.is_liquidity_baking(&TokenKey::new("KT1LB", 0)));
        assert!(!classifier.is_liquidity_baking(&key()));
        assert_eq!(
            ProtocolClassifier::classify_feed_dex("spicy"),
            ProtocolVariant::Spicy
        );
        assert_eq!(
            ProtocolClassifier::classify_feed_dex("unknown_dex"),
            ProtocolVariant::SingleToken
        );
    }
}

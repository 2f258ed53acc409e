//! # Data Source Traits
//!
//! Every upstream the engine reads from sits behind one of the traits in this
//! module. The engine never talks HTTP directly; it holds `Arc<dyn Trait>`
//! handles so tests can swap in in-memory fakes and deployments can point at
//! any indexer that speaks the same shapes.
//!
//! ## Collaborators
//!
//! - [`PriceOracle`]: reference tez/USD price and per-token tez prices
//! - [`ChainIndexer`]: contract storage, big map entries, token balances
//! - [`PoolFeed`]: AMM pool records and LP token supplies
//! - [`TokenMetadataService`]: token display metadata
//! - [`MediaResolver`]: rewrites `ipfs://` and similar URIs for display
//!
//! Concrete HTTP implementations live in [`crate::adapters`].

use crate::errors::FarmResult;
use crate::types::{TokenKey, TokenMeta, U256};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;

/// One entry of an indexer big map.
#[derive(Debug, Clone, PartialEq)]
pub struct BigMapEntry {
    pub key: Value,
    pub value: Value,
    pub active: bool,
}

/// One side of an AMM pool as reported by the pool feed.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolLeg {
    pub token: TokenMeta,
    /// Raw reserve in the token's base units
    pub reserves: Decimal,
}

/// AMM pool record from the pool feed.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolRecord {
    pub address: String,
    /// Dex type string (`quipuswap`, `spicy`, `plenty_stable`, ...)
    pub dex_type: String,
    pub lp_token: Option<TokenKey>,
    pub tokens: Vec<PoolLeg>,
}

/// LP token with its raw total supply.
#[derive(Debug, Clone, PartialEq)]
pub struct LpTokenRecord {
    pub key: TokenKey,
    pub total_supply: Decimal,
}

/// Point-in-time copy of the pool feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolFeedSnapshot {
    pub pools: Vec<PoolRecord>,
    pub lp_tokens: Vec<LpTokenRecord>,
}

impl PoolFeedSnapshot {
    /// Pool whose LP token is `key`, with the LP token's supply record if listed.
    pub fn find_lp(&self, key: &TokenKey) -> Option<(&PoolRecord, Option<&LpTokenRecord>)> {
        let pool = self
            .pools
            .iter()
            .find(|p| p.lp_token.as_ref() == Some(key))?;
        let lp = self.lp_tokens.iter().find(|l| &l.key == key);
        Some((pool, lp))
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

/// Pure lookup of a staked token in the pool feed.
pub fn find_token_in_feed<'a>(
    key: &TokenKey,
    feed: &'a PoolFeedSnapshot,
) -> Option<(&'a PoolRecord, Option<&'a LpTokenRecord>)> {
    feed.find_lp(key)
}

#[async_trait]
pub trait PriceOracle: Send + Sync {
    fn name(&self) -> &'static str;

    /// Tez price in USD.
    async fn reference_price(&self) -> FarmResult<Decimal>;

    /// Tez price of one whole unit of each listed token.
    async fn current_prices(&self) -> FarmResult<HashMap<TokenKey, Decimal>>;
}

#[async_trait]
pub trait ChainIndexer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Active entries of a contract big map, optionally filtered by
    /// `(field path, value)` pairs such as `("key.address", "tz1...")`.
    async fn big_map_entries(
        &self,
        contract: &str,
        map: &str,
        filter: &[(String, String)],
    ) -> FarmResult<Vec<BigMapEntry>>;

    /// Value stored under `key` in the big map at storage `path`.
    async fn big_map_value(&self, contract: &str, path: &str, key: &str) -> FarmResult<Option<Value>>;

    /// Full storage document of a contract.
    async fn contract_storage(&self, address: &str) -> FarmResult<Value>;

    /// Raw token balance held by `owner`.
    async fn token_balance(&self, owner: &str, token: &TokenKey) -> FarmResult<U256>;
}

#[async_trait]
pub trait PoolFeed: Send + Sync {
    fn name(&self) -> &'static str;

    async fn all_pools(&self) -> FarmResult<Vec<PoolRecord>>;

    async fn lp_tokens(&self) -> FarmResult<Vec<LpTokenRecord>>;
}

#[async_trait]
pub trait TokenMetadataService: Send + Sync {
    async fn resolve(&self, key: &TokenKey) -> FarmResult<TokenMeta>;
}

pub trait MediaResolver: Send + Sync {
    /// Display-ready URI for a thumbnail.
    fn rewrite_uri(&self, uri: &str) -> String;
}

/// Leaves URIs untouched.
pub struct PassthroughMedia;

impl MediaResolver for PassthroughMedia {
    fn rewrite_uri(&self, uri: &str) -> String {
        uri.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(address: &str) -> TokenMeta {
        TokenMeta {
            token_address: address.to_string(),
            token_id: 0,
            name: address.to_string(),
            symbol: address.to_string(),
            decimals: 6,
            thumbnail_uri: None,
        }
    }

    #[test]
    fn finds_pool_by_lp_token() {
        let lp = TokenKey::new("KT1Lp", 0);
        let feed = PoolFeedSnapshot {
            pools: vec![PoolRecord {
                address: "KT1Dex".to_string(),
                dex_type: "quipuswap".to_string(),
                lp_token: Some(lp.clone()),
                tokens: vec![
                    PoolLeg {
                        token: TokenMeta::tez(),
                        reserves: Decimal::from(100),
                    },
                    PoolLeg {
                        token: meta("KT1Tok"),
                        reserves: Decimal::from(50),
                    },
                ],
            }],
            lp_tokens: vec![LpTokenRecord {
                key: lp.clone(),
                total_supply: Decimal::from(10),
            }],
        };

        let (pool, supply) = find_token_in_feed(&lp, &feed).unwrap();
        assert_eq!(pool.address, "KT1Dex");
        assert_eq!(supply.unwrap().total_supply, Decimal::from(10));
        assert!(find_token_in_feed(&TokenKey::new("KT1Other", 0), &feed).is_none());
    }
}

// src/adapters/dex_indexer.rs
//
// Pool feed and token price tracker served by a dex indexer
// (`/v1/pools`, `/v1/lp-tokens`, `/v1/prices`). Numeric fields arrive as
// strings or numbers, so they are read through the JSON conversion helpers.

use super::JsonClient;
use crate::data_sources::{LpTokenRecord, PoolFeed, PoolLeg, PoolRecord};
use crate::errors::FarmResult;
use crate::types::conversions::{json_decimal, json_u64};
use crate::types::{TokenKey, TokenMeta, TEZ_ADDRESS};
use async_trait::async_trait;
use log::{debug, warn};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

const ORIGIN: &str = "dex_indexer";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTokenRef {
    address: String,
    #[serde(default)]
    token_id: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPoolToken {
    address: String,
    #[serde(default)]
    token_id: Option<Value>,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    decimals: Option<Value>,
    #[serde(default)]
    thumbnail_uri: Option<String>,
    reserves: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPool {
    address: String,
    dex_type: String,
    #[serde(default)]
    lp_token: Option<RawTokenRef>,
    #[serde(default)]
    tokens: Vec<RawPoolToken>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLpToken {
    address: String,
    #[serde(default)]
    token_id: Option<Value>,
    total_supply: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPriceEntry {
    token_address: String,
    #[serde(default)]
    token_id: Option<Value>,
    #[serde(default)]
    current_price: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawPrices {
    #[serde(default)]
    contracts: Vec<RawPriceEntry>,
}

fn token_id(raw: &Option<Value>) -> FarmResult<u64> {
    match raw {
        Some(Value::Null) | None => Ok(0),
        Some(v) => Ok(json_u64(v)?),
    }
}

fn pool_leg(raw: RawPoolToken) -> FarmResult<PoolLeg> {
    let token = if raw.address == TEZ_ADDRESS {
        TokenMeta::tez()
    } else {
        let decimals = match &raw.decimals {
            Some(v) => json_u64(v)? as u32,
            None => 0,
        };
        let symbol = raw.symbol.unwrap_or_else(|| raw.address.clone());
        TokenMeta {
            token_id: token_id(&raw.token_id)?,
            name: raw.name.unwrap_or_else(|| symbol.clone()),
            symbol,
            decimals,
            thumbnail_uri: raw.thumbnail_uri,
            token_address: raw.address,
        }
    };
    Ok(PoolLeg {
        token,
        reserves: json_decimal(&raw.reserves)?,
    })
}

fn pool_record(raw: RawPool) -> FarmResult<PoolRecord> {
    let lp_token = match &raw.lp_token {
        Some(lp) => Some(TokenKey::new(lp.address.clone(), token_id(&lp.token_id)?)),
        None => None,
    };
    let tokens = raw
        .tokens
        .into_iter()
        .map(pool_leg)
        .collect::<FarmResult<Vec<_>>>()?;
    Ok(PoolRecord {
        address: raw.address,
        dex_type: raw.dex_type.to_lowercase(),
        lp_token,
        tokens,
    })
}

pub struct DexIndexerFeed {
    http: JsonClient,
}

impl DexIndexerFeed {
    pub fn new(base_url: &str, timeout: Duration) -> FarmResult<Self> {
        Ok(Self {
            http: JsonClient::new(ORIGIN, base_url, timeout, None)?,
        })
    }

    /// Tez price of every tracked token.
    pub async fn token_prices(&self) -> FarmResult<HashMap<TokenKey, Decimal>> {
        let raw: RawPrices = self.http.get("v1/prices", &[]).await?;
        let mut prices = HashMap::with_capacity(raw.contracts.len());
        for entry in raw.contracts {
            let price = match &entry.current_price {
                Some(v) => match json_decimal(v) {
                    Ok(p) => p,
                    Err(e) => {
                        debug!("[{}] skipping price of {}: {}", ORIGIN, entry.token_address, e);
                        continue;
                    }
                },
                None => continue,
            };
            let key = TokenKey::new(entry.token_address, token_id(&entry.token_id)?);
            prices.insert(key, price);
        }
        Ok(prices)
    }
}

#[async_trait]
impl PoolFeed for DexIndexerFeed {
    fn name(&self) -> &'static str {
        ORIGIN
    }

    async fn all_pools(&self) -> FarmResult<Vec<PoolRecord>> {
        let raw: Vec<RawPool> = self.http.get("v1/pools", &[]).await?;
        let mut pools = Vec::with_capacity(raw.len());
        for pool in raw {
            let address = pool.address.clone();
            match pool_record(pool) {
                Ok(record) => pools.push(record),
                Err(e) => warn!("⚠️ [{}] skipping pool {}: {}", ORIGIN, address, e),
            }
        }
        Ok(pools)
    }

    async fn lp_tokens(&self) -> FarmResult<Vec<LpTokenRecord>> {
        let raw: Vec<RawLpToken> = self.http.get("v1/lp-tokens", &[]).await?;
        raw.into_iter()
            .map(|lp| -> FarmResult<LpTokenRecord> {
                Ok(LpTokenRecord {
                    key: TokenKey::new(lp.address, token_id(&lp.token_id)?),
                    total_supply: json_decimal(&lp.total_supply)?,
                })
            })
            .collect()
    }
}

//! TzKT-style chain indexer.
//!
//! Serves contract storage, big map keys, token balances, token metadata
//! and the tez/USD quote from one REST API. Requests share a rate limiter.

use super::JsonClient;
use crate::data_sources::{BigMapEntry, ChainIndexer, TokenMetadataService};
use crate::errors::{FarmError, FarmResult};
use crate::types::conversions::{json_decimal, json_u256, json_u64};
use crate::types::{TokenKey, TokenMeta, U256};
use async_trait::async_trait;
use log::debug;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

const ORIGIN: &str = "tzkt";

/// Big map pages are requested at this size.
const PAGE_LIMIT: usize = 10_000;

#[derive(Debug, Deserialize)]
struct RawBigMapKey {
    key: Value,
    value: Value,
    #[serde(default = "default_active")]
    active: bool,
}

fn default_active() -> bool {
    true
}

impl From<RawBigMapKey> for BigMapEntry {
    fn from(raw: RawBigMapKey) -> Self {
        BigMapEntry {
            key: raw.key,
            value: raw.value,
            active: raw.active,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawToken {
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawQuote {
    usd: Value,
}

pub struct TzktIndexer {
    http: JsonClient,
}

impl TzktIndexer {
    pub fn new(base_url: &str, timeout: Duration, qps: u32) -> FarmResult<Self> {
        Ok(Self {
            http: JsonClient::new(ORIGIN, base_url, timeout, Some(qps))?,
        })
    }

    /// Last tez/USD quote.
    pub async fn xtz_usd(&self) -> FarmResult<Decimal> {
        let quote: RawQuote = self.http.get("v1/quotes/last", &[]).await?;
        Ok(json_decimal(&quote.usd)?)
    }
}

fn query(pairs: &[(&str, String)]) -> Vec<(String, String)> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// Token metadata from the indexer's free-form `metadata` object.
pub(crate) fn meta_from_indexer(key: &TokenKey, metadata: &Value) -> FarmResult<TokenMeta> {
    let text = |field: &str| metadata.get(field).and_then(Value::as_str).map(str::to_string);
    let symbol = text("symbol").ok_or_else(|| FarmError::Metadata {
        token: key.to_string(),
        message: "metadata has no symbol".to_string(),
    })?;
    let decimals = match metadata.get("decimals") {
        Some(v) => {
            let raw = json_u64(v)?;
            u32::try_from(raw).map_err(|_| FarmError::Metadata {
                token: key.to_string(),
                message: format!("decimals {} out of range", raw),
            })?
        }
        None => 0,
    };
    Ok(TokenMeta {
        token_address: key.address.clone(),
        token_id: key.token_id,
        name: text("name").unwrap_or_else(|| symbol.clone()),
        symbol,
        decimals,
        thumbnail_uri: text("thumbnailUri").or_else(|| text("icon")),
    })
}

#[async_trait]
impl ChainIndexer for TzktIndexer {
    fn name(&self) -> &'static str {
        ORIGIN
    }

    async fn big_map_entries(
        &self,
        contract: &str,
        map: &str,
        filter: &[(String, String)],
    ) -> FarmResult<Vec<BigMapEntry>> {
        let path = format!("v1/contracts/{}/bigmaps/{}/keys", contract, map);
        let mut entries = Vec::new();
        let mut offset = 0usize;
        loop {
            let mut params = query(&[
                ("active", "true".to_string()),
                ("limit", PAGE_LIMIT.to_string()),
                ("offset", offset.to_string()),
            ]);
            params.extend(filter.iter().cloned());
            let page: Vec<RawBigMapKey> = self.http.get(&path, &params).await?;
            let len = page.len();
            entries.extend(page.into_iter().map(BigMapEntry::from));
            if len < PAGE_LIMIT {
                break;
            }
            offset += len;
        }
        debug!("[tzkt] {}/{}: {} keys", contract, map, entries.len());
        Ok(entries)
    }

    async fn big_map_value(&self, contract: &str, path: &str, key: &str) -> FarmResult<Option<Value>> {
        let url_path = format!("v1/contracts/{}/bigmaps/{}/keys/{}", contract, path, key);
        let entry: Option<RawBigMapKey> = self.http.get_optional(&url_path, &[]).await?;
        Ok(entry.filter(|e| e.active).map(|e| e.value))
    }

    async fn contract_storage(&self, address: &str) -> FarmResult<Value> {
        self.http
            .get(&format!("v1/contracts/{}/storage", address), &[])
            .await
    }

    async fn token_balance(&self, owner: &str, token: &TokenKey) -> FarmResult<U256> {
        if token.is_tez() {
            let mutez: Value = self
                .http
                .get(&format!("v1/accounts/{}/balance", owner), &[])
                .await?;
            return Ok(json_u256(&mutez)?);
        }
        let params = query(&[
            ("account", owner.to_string()),
            ("token.contract", token.address.clone()),
            ("token.tokenId", token.token_id.to_string()),
            ("select", "balance".to_string()),
        ]);
        let balances: Vec<Value> = self.http.get("v1/tokens/balances", &params).await?;
        match balances.first() {
            Some(balance) => Ok(json_u256(balance)?),
            None => Ok(U256::zero()),
        }
    }
}

#[async_trait]
impl TokenMetadataService for TzktIndexer {
    async fn resolve(&self, key: &TokenKey) -> FarmResult<TokenMeta> {
        let params = query(&[
            ("contract", key.address.clone()),
            ("tokenId", key.token_id.to_string()),
        ]);
        let tokens: Vec<RawToken> = self.http.get("v1/tokens", &params).await?;
        let metadata = tokens
            .into_iter()
            .find_map(|t| t.metadata)
            .ok_or_else(|| FarmError::Metadata {
                token: key.to_string(),
                message: "token has no metadata".to_string(),
            })?;
        meta_from_indexer(key, &metadata)
    }
}

// src/normalization.rs
//
// Turns a classified pool (feed record or raw contract storage) into the
// canonical PoolToken. Each protocol only knows how to pull two legs and an
// LP supply out of its payload; everything after that is shared.

use crate::data_sources::{LpTokenRecord, PoolRecord};
use crate::errors::{FarmError, FarmResult};
use crate::pools::{LbPoolState, LpPair, PoolToken, ProtocolVariant};
use crate::price_index::PriceIndex;
use crate::token_metadata::TokenMetadataResolver;
use crate::types::conversions::{json_decimal, json_u64, pow10};
use crate::types::{TokenKey, TokenMeta, TEZ_DECIMALS};
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A pool leg before metadata resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum LegToken {
    /// Metadata already supplied by the pool feed.
    Meta(TokenMeta),
    Ref(TokenKey),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawLeg {
    pub token: LegToken,
    /// Raw reserve in the token's base units
    pub reserve: Decimal,
}

/// Protocol-independent extraction result.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPair {
    pub a: RawLeg,
    pub b: RawLeg,
    /// Raw LP supply
    pub total_supply: Decimal,
}

/// Extra reads a storage-classified pool needs before extraction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExtraFetch {
    /// Storage of another contract (Plenty's exchange).
    ContractStorage { address: String },
    BigMapValue { path: &'static str, key: String },
}

/// Everything fetched for a storage-classified pool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolSnapshot {
    pub root: Value,
    pub contracts: HashMap<String, Value>,
    pub big_maps: HashMap<(String, String), Value>,
}

impl PoolSnapshot {
    pub fn new(root: Value) -> Self {
        Self {
            root,
            ..Default::default()
        }
    }

    fn big_map(&self, path: &str, key: &str) -> Option<&Value> {
        self.big_maps.get(&(path.to_string(), key.to_string()))
    }
}

/// Walk a dotted path; missing or null segments are a classification error.
pub fn field<'a>(doc: &'a Value, path: &str, subject: &TokenKey) -> FarmResult<&'a Value> {
    let mut cur = doc;
    for segment in path.split('.') {
        cur = match cur.get(segment) {
            Some(v) if !v.is_null() => v,
            _ => {
                return Err(FarmError::classification(
                    subject.to_string(),
                    format!("missing field `{}`", path),
                ))
            }
        };
    }
    Ok(cur)
}

fn decimal_field(doc: &Value, path: &str, subject: &TokenKey) -> FarmResult<Decimal> {
    json_decimal(field(doc, path, subject)?)
        .map_err(|e| FarmError::classification(subject.to_string(), format!("{}: {}", path, e)))
}

fn u64_field(doc: &Value, path: &str, subject: &TokenKey) -> FarmResult<u64> {
    json_u64(field(doc, path, subject)?)
        .map_err(|e| FarmError::classification(subject.to_string(), format!("{}: {}", path, e)))
}

fn string_field(doc: &Value, path: &str, subject: &TokenKey) -> FarmResult<String> {
    field(doc, path, subject)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| FarmError::classification(subject.to_string(), format!("`{}` is not a string", path)))
}

/// Reads needed beyond the root storage, per protocol.
pub fn required_fetches(
    variant: ProtocolVariant,
    subject: &TokenKey,
    root: &Value,
) -> FarmResult<Vec<ExtraFetch>> {
    let id = subject.token_id.to_string();
    Ok(match variant {
        ProtocolVariant::QuipuswapV2 => vec![
            ExtraFetch::BigMapValue {
                path: "storage.tokens",
                key: id.clone(),
            },
            ExtraFetch::BigMapValue {
                path: "storage.pairs",
                key: id,
            },
        ],
        ProtocolVariant::Plenty => vec![ExtraFetch::ContractStorage {
            address: string_field(root, "exchangeAddress", subject)?,
        }],
        ProtocolVariant::Spicy => vec![ExtraFetch::BigMapValue {
            path: "token_total_supply",
            key: id,
        }],
        _ => Vec::new(),
    })
}

/// Quipuswap V2 / Spicy style token descriptor.
fn token_spec(doc: &Value, subject: &TokenKey) -> FarmResult<TokenKey> {
    if doc.get("tez").is_some() {
        return Ok(TokenKey::tez());
    }
    if let Some(addr) = doc.get("fa12").and_then(Value::as_str) {
        return Ok(TokenKey::new(addr, 0));
    }
    if let Some(fa2) = doc.get("fa2") {
        let addr = string_field(fa2, "token", subject)?;
        let id = u64_field(fa2, "id", subject)?;
        return Ok(TokenKey::new(addr, id));
    }
    if let Some(addr) = doc.get("fa2_address").and_then(Value::as_str) {
        let id = u64_field(doc, "token_id", subject)?;
        return Ok(TokenKey::new(addr, id));
    }
    if let Some(addr) = doc.get("fa12_address").and_then(Value::as_str) {
        return Ok(TokenKey::new(addr, 0));
    }
    Err(FarmError::classification(
        subject.to_string(),
        "unrecognised token descriptor",
    ))
}

fn leg(token: TokenKey, reserve: Decimal) -> RawLeg {
    RawLeg {
        token: LegToken::Ref(token),
        reserve,
    }
}

/// Pull legs and supply out of a storage-classified pool.
pub fn extract_from_storage(
    variant: ProtocolVariant,
    subject: &TokenKey,
    snapshot: &PoolSnapshot,
) -> FarmResult<RawPair> {
    let root = &snapshot.root;
    match variant {
        ProtocolVariant::QuipuswapV1 => {
            let token = TokenKey::new(
                string_field(root, "storage.token_address", subject)?,
                root.pointer("/storage/token_id")
                    .map(json_u64)
                    .transpose()
                    .map_err(|e| FarmError::classification(subject.to_string(), e.to_string()))?
                    .unwrap_or(0),
            );
            Ok(RawPair {
                a: leg(TokenKey::tez(), decimal_field(root, "storage.tez_pool", subject)?),
                b: leg(token, decimal_field(root, "storage.token_pool", subject)?),
                total_supply: decimal_field(root, "storage.total_supply", subject)?,
            })
        }
        ProtocolVariant::QuipuswapV2 => {
            let id = subject.token_id.to_string();
            let tokens = snapshot.big_map("storage.tokens", &id).ok_or_else(|| {
                FarmError::classification(subject.to_string(), "missing tokens entry")
            })?;
            let pair = snapshot.big_map("storage.pairs", &id).ok_or_else(|| {
                FarmError::classification(subject.to_string(), "missing pairs entry")
            })?;
            Ok(RawPair {
                a: leg(
                    token_spec(field(tokens, "token_a", subject)?, subject)?,
                    decimal_field(pair, "token_a_pool", subject)?,
                ),
                b: leg(
                    token_spec(field(tokens, "token_b", subject)?, subject)?,
                    decimal_field(pair, "token_b_pool", subject)?,
                ),
                total_supply: decimal_field(pair, "total_supply", subject)?,
            })
        }
        ProtocolVariant::Plenty => {
            let exchange_addr = string_field(root, "exchangeAddress", subject)?;
            let exchange = snapshot.contracts.get(&exchange_addr).ok_or_else(|| {
                FarmError::classification(subject.to_string(), "missing exchange storage")
            })?;
            Ok(RawPair {
                a: leg(
                    TokenKey::new(
                        string_field(exchange, "token1Address", subject)?,
                        u64_field(exchange, "token1Id", subject)?,
                    ),
                    decimal_field(exchange, "token1_pool", subject)?,
                ),
                b: leg(
                    TokenKey::new(
                        string_field(exchange, "token2Address", subject)?,
                        u64_field(exchange, "token2Id", subject)?,
                    ),
                    decimal_field(exchange, "token2_pool", subject)?,
                ),
                total_supply: decimal_field(exchange, "totalSupply", subject)?,
            })
        }
        ProtocolVariant::Spicy => {
            let supply = snapshot
                .big_map("token_total_supply", &subject.token_id.to_string())
                .ok_or_else(|| {
                    FarmError::classification(subject.to_string(), "missing LP supply entry")
                })?;
            Ok(RawPair {
                a: leg(
                    token_spec(field(root, "token0", subject)?, subject)?,
                    decimal_field(root, "reserve0", subject)?,
                ),
                b: leg(
                    token_spec(field(root, "token1", subject)?, subject)?,
                    decimal_field(root, "reserve1", subject)?,
                ),
                total_supply: json_decimal(supply).map_err(|e| {
                    FarmError::classification(subject.to_string(), e.to_string())
                })?,
            })
        }
        other => Err(FarmError::classification(
            subject.to_string(),
            format!("{} pools are not read from raw storage", other),
        )),
    }
}

/// Pull legs and supply out of a pool feed record.
pub fn extract_from_feed(
    subject: &TokenKey,
    record: &PoolRecord,
    lp: Option<&LpTokenRecord>,
) -> FarmResult<RawPair> {
    if record.tokens.len() < 2 {
        return Err(FarmError::classification(
            subject.to_string(),
            format!("pool {} lists {} tokens", record.address, record.tokens.len()),
        ));
    }
    let a = &record.tokens[0];
    let b = &record.tokens[1];
    Ok(RawPair {
        a: RawLeg {
            token: LegToken::Meta(a.token.clone()),
            reserve: a.reserves,
        },
        b: RawLeg {
            token: LegToken::Meta(b.token.clone()),
            reserve: b.reserves,
        },
        total_supply: lp.map(|l| l.total_supply).unwrap_or(Decimal::ZERO),
    })
}

/// Read the Liquidity Baking dex reserves.
pub fn lb_state_from_storage(storage: &Value, lb_dex: &str) -> FarmResult<LbPoolState> {
    let subject = TokenKey::new(lb_dex, 0);
    let xtz_pool = decimal_field(storage, "xtzPool", &subject)?;
    let lqt_total = decimal_field(storage, "lqtTotal", &subject)?;
    Ok(LbPoolState {
        tez_reserve: scale_down(xtz_pool, TEZ_DECIMALS)?,
        lqt_total,
    })
}

pub fn scale_down(raw: Decimal, decimals: u32) -> FarmResult<Decimal> {
    let divisor = pow10(decimals)
        .ok_or_else(|| FarmError::Degenerate(format!("10^{} out of range", decimals)))?;
    raw.checked_div(divisor)
        .ok_or_else(|| FarmError::Degenerate(format!("{} / 10^{}", raw, decimals)))
}

/// Builds canonical pool tokens.
pub struct PoolNormalizer {
    resolver: Arc<TokenMetadataResolver>,
    wrapped_tez: HashSet<String>,
}

impl PoolNormalizer {
    pub fn new(resolver: Arc<TokenMetadataResolver>, wrapped_tez: &[String]) -> Self {
        Self {
            resolver,
            wrapped_tez: wrapped_tez.iter().cloned().collect(),
        }
    }

    pub fn resolver(&self) -> &Arc<TokenMetadataResolver> {
        &self.resolver
    }

    fn is_tez_leg(&self, meta: &TokenMeta) -> bool {
        meta.key().is_tez() || self.wrapped_tez.contains(&meta.token_address)
    }

    async fn resolve_leg(&self, token: LegToken) -> TokenMeta {
        match token {
            LegToken::Meta(meta) => self.resolver.decorate(meta),
            LegToken::Ref(key) => self.resolver.resolve(&key).await,
        }
    }

    /// Generic assembly shared by every LP variant.
    pub async fn assemble(
        &self,
        variant: ProtocolVariant,
        subject: &TokenKey,
        raw: RawPair,
        prices: &PriceIndex,
    ) -> FarmResult<PoolToken> {
        let decimals = variant.lp_decimals().unwrap_or(0);
        let token1 = self.resolve_leg(raw.a.token).await;
        let token2 = self.resolve_leg(raw.b.token).await;
        let total_supply = scale_down(raw.total_supply, decimals)?;

        // Tez and wrapped tez reserves are always in mutez, whatever metadata says.
        let tez_pool = if !variant.spec().tracks_tez_pool {
            None
        } else if self.is_tez_leg(&token1) {
            Some(scale_down(raw.a.reserve, TEZ_DECIMALS)?)
        } else if self.is_tez_leg(&token2) {
            Some(scale_down(raw.b.reserve, TEZ_DECIMALS)?)
        } else {
            match prices.price(&token1.key()) {
                Some(price) => {
                    let whole = scale_down(raw.a.reserve, token1.decimals)?;
                    Some(whole.checked_mul(price).ok_or_else(|| {
                        FarmError::Degenerate(format!("{} x {}", whole, price))
                    })?)
                }
                None => None,
            }
        };

        let label = format!("{}/{}", token1.symbol, token2.symbol);
        Ok(PoolToken {
            variant,
            token_address: subject.address.clone(),
            token_id: subject.token_id,
            decimals,
            name: label.clone(),
            symbol: label,
            thumbnail_uri: None,
            pair: Some(LpPair {
                token1,
                token2,
                token1_pool: raw.a.reserve,
                token2_pool: raw.b.reserve,
                total_supply,
                tez_pool,
            }),
        })
    }

    pub async fn normalize_single(&self, subject: &TokenKey) -> PoolToken {
        PoolToken::single(self.resolver.resolve(subject).await)
    }

    /// Liquidity Baking pool from its dex storage.
    pub async fn normalize_liquidity_baking(
        &self,
        subject: &TokenKey,
        lb_storage: &Value,
        lb_dex: &str,
    ) -> FarmResult<PoolToken> {
        let dex_key = TokenKey::new(lb_dex, 0);
        let token_key = TokenKey::new(
            string_field(lb_storage, "tokenAddress", &dex_key)?,
            lb_storage
                .get("tokenId")
                .map(json_u64)
                .transpose()
                .map_err(|e| FarmError::classification(dex_key.to_string(), e.to_string()))?
                .unwrap_or(0),
        );
        let raw = RawPair {
            a: leg(TokenKey::tez(), decimal_field(lb_storage, "xtzPool", &dex_key)?),
            b: leg(token_key, decimal_field(lb_storage, "tokenPool", &dex_key)?),
            total_supply: decimal_field(lb_storage, "lqtTotal", &dex_key)?,
        };
        self.assemble(
            ProtocolVariant::LiquidityBaking,
            subject,
            raw,
            &PriceIndex::default(),
        )
        .await
    }
}

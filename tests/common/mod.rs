//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use farm_valuation_sdk::data_sources::{
    BigMapEntry, ChainIndexer, LpTokenRecord, PassthroughMedia, PoolFeed, PoolRecord, PriceOracle,
    TokenMetadataService,
};
use farm_valuation_sdk::engine::{Clock, Collaborators};
use farm_valuation_sdk::types::{TokenKey, TokenMeta, U256};
use farm_valuation_sdk::{FarmEngine, FarmError, FarmResult, Settings};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const FARM_CONTRACT: &str = "KT1Farm";
pub const WALLET: &str = "tz1Staker";
pub const T0: i64 = 1_660_000_000;

pub fn at(offset_secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(T0 + offset_secs, 0).unwrap()
}

/// Clock the test moves by hand.
pub struct TestClock(AtomicI64);

impl TestClock {
    pub fn new() -> Self {
        Self(AtomicI64::new(T0))
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.0.load(Ordering::SeqCst), 0).unwrap()
    }
}

/// Farm `id` staking `pool`, paying 1 reward token (6 decimals) per second.
pub fn farm_entry(id: &str, pool: &str) -> BigMapEntry {
    BigMapEntry {
        key: json!(id),
        value: json!({
            "poolToken": { "address": pool, "tokenId": "0" },
            "rewardToken": { "address": "KT1Reward", "tokenId": "0" },
            "rewardSupply": "1000000000000",
            "rewardPerSec": "1000000",
            "rewardPaid": "0",
            "poolBalance": "1000000",
            "accRewardPerShare": "0",
            "startTime": at(-2_000).to_rfc3339(),
            "endTime": at(1_000_000).to_rfc3339(),
            "lastRewardTime": at(-1_000).to_rfc3339()
        }),
        active: true,
    }
}

pub fn ledger_entry(id: &str, wallet: &str, amount: &str) -> BigMapEntry {
    BigMapEntry {
        key: json!({ "nat": id, "address": wallet }),
        value: json!({ "amount": amount, "rewardDebt": "0" }),
        active: true,
    }
}

/// Quipuswap v1 pool: 100 tez, 50 tokens, 10 LP minted.
pub fn quipuswap_v1_storage() -> Value {
    json!({
        "dex_lambdas": 1, "token_lambdas": 2,
        "storage": {
            "reward_per_share": "0", "reward_per_sec": "0",
            "token_address": "KT1Kusd", "token_id": "0",
            "tez_pool": "100000000", "token_pool": "50000000",
            "total_supply": "10000000"
        }
    })
}

/// Looks like Quipuswap v1 but has no reserves.
pub fn broken_storage() -> Value {
    json!({
        "dex_lambdas": 1, "token_lambdas": 2,
        "storage": { "reward_per_share": "0", "reward_per_sec": "0", "token_address": "KT1X" }
    })
}

fn key_field(key: &Value, field: &str) -> Option<String> {
    key.get(field).map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

pub struct MockIndexer {
    pub farms: Vec<BigMapEntry>,
    pub ledger: Mutex<Vec<BigMapEntry>>,
    pub storages: HashMap<String, Value>,
    /// Every call sleeps this long first so concurrent callers overlap.
    pub latency: Duration,
    pub entries_calls: AtomicUsize,
    pub value_calls: AtomicUsize,
    pub storage_calls: AtomicUsize,
}

impl MockIndexer {
    pub fn new(farms: Vec<BigMapEntry>, storages: Vec<(&str, Value)>) -> Self {
        Self {
            farms,
            ledger: Mutex::new(Vec::new()),
            storages: storages
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            latency: Duration::from_millis(20),
            entries_calls: AtomicUsize::new(0),
            value_calls: AtomicUsize::new(0),
            storage_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_ledger(self, entries: Vec<BigMapEntry>) -> Self {
        *self.ledger.lock().unwrap() = entries;
        self
    }

    pub fn storage_calls(&self) -> usize {
        self.storage_calls.load(Ordering::SeqCst)
    }

    pub fn value_calls(&self) -> usize {
        self.value_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainIndexer for MockIndexer {
    fn name(&self) -> &'static str {
        "mock_indexer"
    }

    async fn big_map_entries(
        &self,
        _contract: &str,
        map: &str,
        filter: &[(String, String)],
    ) -> FarmResult<Vec<BigMapEntry>> {
        self.entries_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        match map {
            "farms" => Ok(self.farms.clone()),
            "ledger" => {
                let ledger = self.ledger.lock().unwrap().clone();
                Ok(ledger
                    .into_iter()
                    .filter(|e| {
                        filter.iter().all(|(path, wanted)| {
                            let field = path.trim_start_matches("key.");
                            key_field(&e.key, field).as_deref() == Some(wanted.as_str())
                        })
                    })
                    .collect())
            }
            other => Err(FarmError::upstream("mock_indexer", format!("no big map {}", other))),
        }
    }

    async fn big_map_value(&self, _contract: &str, path: &str, key: &str) -> FarmResult<Option<Value>> {
        self.value_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        if path != "farms" {
            return Ok(None);
        }
        Ok(self
            .farms
            .iter()
            .find(|e| e.key == json!(key))
            .map(|e| e.value.clone()))
    }

    async fn contract_storage(&self, address: &str) -> FarmResult<Value> {
        self.storage_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        self.storages
            .get(address)
            .cloned()
            .ok_or_else(|| FarmError::upstream("mock_indexer", format!("no storage for {}", address)))
    }

    async fn token_balance(&self, _owner: &str, _token: &TokenKey) -> FarmResult<U256> {
        Ok(U256::from(2_500_000u64))
    }
}

/// Pool feed that lists nothing, so classification falls through to storage.
#[derive(Default)]
pub struct EmptyFeed {
    pub calls: AtomicUsize,
}

#[async_trait]
impl PoolFeed for EmptyFeed {
    fn name(&self) -> &'static str {
        "empty_feed"
    }

    async fn all_pools(&self) -> FarmResult<Vec<PoolRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }

    async fn lp_tokens(&self) -> FarmResult<Vec<LpTokenRecord>> {
        Ok(Vec::new())
    }
}

pub struct FixedOracle;

#[async_trait]
impl PriceOracle for FixedOracle {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn reference_price(&self) -> FarmResult<Decimal> {
        Ok(Decimal::new(150, 2))
    }

    async fn current_prices(&self) -> FarmResult<HashMap<TokenKey, Decimal>> {
        let mut prices = HashMap::new();
        prices.insert(TokenKey::new("KT1Reward", 0), Decimal::from(2));
        prices.insert(TokenKey::new("KT1Kusd", 0), Decimal::new(5, 1));
        Ok(prices)
    }
}

/// Six-decimal token whose symbol is the address without the `KT1` prefix.
pub struct SymbolMeta;

#[async_trait]
impl TokenMetadataService for SymbolMeta {
    async fn resolve(&self, key: &TokenKey) -> FarmResult<TokenMeta> {
        let symbol = key.address.trim_start_matches("KT1").to_uppercase();
        Ok(TokenMeta {
            token_address: key.address.clone(),
            token_id: key.token_id,
            name: symbol.clone(),
            symbol,
            decimals: 6,
            thumbnail_uri: None,
        })
    }
}

pub fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.contracts.farm = FARM_CONTRACT.to_string();
    settings
}

pub struct World {
    pub engine: FarmEngine,
    pub indexer: Arc<MockIndexer>,
    pub feed: Arc<EmptyFeed>,
    pub clock: Arc<TestClock>,
}

pub fn world(indexer: MockIndexer) -> World {
    let indexer = Arc::new(indexer);
    let feed = Arc::new(EmptyFeed::default());
    let clock = Arc::new(TestClock::new());
    let collaborators = Collaborators {
        oracle: Arc::new(FixedOracle),
        indexer: indexer.clone(),
        pool_feed: feed.clone(),
        metadata: Arc::new(SymbolMeta),
        media: Arc::new(PassthroughMedia),
    };
    let engine = FarmEngine::with_clock(settings(), collaborators, clock.clone()).unwrap();
    World {
        engine,
        indexer,
        feed,
        clock,
    }
}

/// Farm 1 stakes a healthy Quipuswap v1 LP, farm 2 a pool with a partial payload.
pub fn two_farm_indexer() -> MockIndexer {
    MockIndexer::new(
        vec![farm_entry("1", "KT1Quipu"), farm_entry("2", "KT1Broken")],
        vec![
            ("KT1Quipu", quipuswap_v1_storage()),
            ("KT1Broken", broken_storage()),
        ],
    )
}

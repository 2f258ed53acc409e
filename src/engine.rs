//! # Farm Engine
//!
//! `FarmEngine` ties the collaborators, snapshots and calculators together
//! and exposes the operations consumers call: loading farms, refreshing them
//! (all at once or one by one), filtering, reading TVL and pending rewards,
//! and driving the wallet lifecycle.
//!
//! ## Pass pipeline
//!
//! A pass for one farm runs strictly in order:
//! 1. resolve the reward token
//! 2. classify the staked token (once; the variant never changes afterwards)
//! 3. normalize the pool from fresh reserves
//! 4. value it against the current price index
//! 5. estimate the wallet's pending reward
//!
//! Passes for different farms run concurrently. A pass for a farm that
//! already has one in flight is skipped, and concurrent `refresh_one`
//! callers for the same farm share a single flight.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use farm_valuation_sdk::engine::{Collaborators, FarmEngine};
//! use farm_valuation_sdk::settings::Settings;
//!
//! # async fn run(collaborators: Collaborators) -> anyhow::Result<()> {
//! let engine = FarmEngine::new(Settings::new()?, collaborators)?;
//! engine.load_farms().await?;
//! engine.refresh_all().await?;
//! for farm in engine.visible_farms() {
//!     println!("{} {}", farm.id, farm.tvl_tez);
//! }
//! # Ok(())
//! # }
//! ```

use crate::cache::{parse_farm_entries, parse_ledger_entries, FarmStorage, SnapshotCache, UserStorage};
use crate::curation::FarmCurator;
use crate::data_sources::{
    find_token_in_feed, ChainIndexer, MediaResolver, PoolFeed, PoolFeedSnapshot, PriceOracle,
    TokenMetadataService,
};
use crate::errors::{FarmError, FarmResult};
use crate::farm_registry::{FarmRegistry, PassOutcome};
use crate::filters::{FilterConfig, FilterScope, FilterSet, FilterTag};
use crate::metrics;
use crate::normalization::{
    extract_from_feed, extract_from_storage, lb_state_from_storage, required_fetches, ExtraFetch,
    PoolNormalizer, PoolSnapshot,
};
use crate::pools::{LbPoolState, PoolToken, ProtocolVariant};
use crate::price_index::{refresh_current_prices, refresh_reference_price, SharedPriceIndex};
use crate::protocol_classifier::{ClassificationPath, ProtocolClassifier};
use crate::rewards::RewardCalculator;
use crate::scheduler::{fixed_interval, LoopInterval, LoopJob, Scheduler};
use crate::settings::Settings;
use crate::single_flight::SingleFlight;
use crate::token_metadata::TokenMetadataResolver;
use crate::types::conversions::u256_to_decimal;
use crate::types::{ErrantReason, Estimate, Farm, RawFarm, RewardToken, TokenKey, UserRecord};
use crate::valuation::{value_farm, Valuation, ValuationInput};
use arc_swap::{ArcSwap, ArcSwapOption};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use rust_decimal::Decimal;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, info_span, warn, Instrument};

/// Farm passes run at most this many at a time.
const PASS_CONCURRENCY: usize = 8;

const FARMS_BIG_MAP: &str = "farms";
const LEDGER_BIG_MAP: &str = "ledger";

/// Source of "now" for lifecycle flags and reward accrual.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Upstream handles the engine reads from.
#[derive(Clone)]
pub struct Collaborators {
    pub oracle: Arc<dyn PriceOracle>,
    pub indexer: Arc<dyn ChainIndexer>,
    pub pool_feed: Arc<dyn PoolFeed>,
    pub metadata: Arc<dyn TokenMetadataService>,
    pub media: Arc<dyn MediaResolver>,
}

/// Everything one successful pass writes back.
struct PassUpdate {
    pool: PoolToken,
    reward: RewardToken,
    raw: RawFarm,
    valuation: Valuation,
    stake: Option<(Decimal, Decimal)>,
}

struct EngineInner {
    settings: Settings,
    indexer: Arc<dyn ChainIndexer>,
    oracle: Arc<dyn PriceOracle>,
    pool_feed: Arc<dyn PoolFeed>,
    clock: Arc<dyn Clock>,
    registry: FarmRegistry,
    cache: SnapshotCache,
    prices: SharedPriceIndex,
    normalizer: PoolNormalizer,
    classifier: ProtocolClassifier,
    curator: FarmCurator,
    rewards: RewardCalculator,
    filter_config: FilterConfig,
    filters: ArcSwap<FilterSet>,
    wallet: ArcSwapOption<String>,
    /// Classification result per farm id, kept once it succeeds.
    paths: DashMap<String, ClassificationPath>,
    farm_flights: SingleFlight<String, ()>,
    source_flights: SingleFlight<&'static str, ()>,
    lb_flight: SingleFlight<String, Value>,
    scheduler: Mutex<Option<Scheduler>>,
}

#[derive(Clone)]
pub struct FarmEngine {
    inner: Arc<EngineInner>,
}

impl FarmEngine {
    pub fn new(settings: Settings, collaborators: Collaborators) -> FarmResult<Self> {
        Self::with_clock(settings, collaborators, Arc::new(SystemClock))
    }

    pub fn with_clock(
        settings: Settings,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> FarmResult<Self> {
        let resolver = Arc::new(TokenMetadataResolver::new(
            collaborators.metadata,
            collaborators.media,
            &settings,
        ));
        let inner = EngineInner {
            normalizer: PoolNormalizer::new(resolver, &settings.contracts.wrapped_tez),
            classifier: ProtocolClassifier::new(settings.contracts.lb_lp_token.clone()),
            curator: FarmCurator::new(&settings.curation, &settings.valuation),
            rewards: RewardCalculator::from_settings(&settings.rewards)?,
            filter_config: FilterConfig::from_settings(&settings),
            filters: ArcSwap::from_pointee(FilterSet::default()),
            wallet: ArcSwapOption::from(settings.wallet.clone().map(Arc::new)),
            indexer: collaborators.indexer,
            oracle: collaborators.oracle,
            pool_feed: collaborators.pool_feed,
            clock,
            registry: FarmRegistry::new(),
            cache: SnapshotCache::new(),
            prices: SharedPriceIndex::new(),
            paths: DashMap::new(),
            farm_flights: SingleFlight::new(),
            source_flights: SingleFlight::new(),
            lb_flight: SingleFlight::new(),
            scheduler: Mutex::new(None),
            settings,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn prices(&self) -> &SharedPriceIndex {
        &self.inner.prices
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.inner.cache
    }

    pub fn wallet(&self) -> Option<String> {
        self.inner.wallet.load_full().map(|w| w.as_ref().clone())
    }

    pub fn is_wallet_connected(&self) -> bool {
        self.inner.wallet.load().is_some()
    }

    // --- Reactive surface ---

    /// Change counter, bumped whenever any farm record changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.registry.subscribe()
    }

    pub fn subscribe_total_tvl(&self) -> watch::Receiver<Decimal> {
        self.inner.registry.subscribe_total_tvl()
    }

    pub fn total_tvl(&self) -> Decimal {
        self.inner.registry.total_tvl()
    }

    pub fn farms(&self) -> Vec<Farm> {
        self.inner.registry.snapshot()
    }

    pub fn farm(&self, id: &str) -> FarmResult<Farm> {
        self.inner
            .registry
            .get(id)
            .ok_or_else(|| FarmError::UnknownFarm(id.to_string()))
    }

    // --- Source refreshes ---

    async fn run_source<F, Fut>(&self, source: &'static str, work: F) -> FarmResult<()>
    where
        F: FnOnce(FarmEngine) -> Fut,
        Fut: std::future::Future<Output = FarmResult<()>> + Send + 'static,
    {
        let engine = self.clone();
        self.inner
            .source_flights
            .run(source, move || work(engine))
            .await
    }

    pub async fn refresh_reference_price(&self) -> FarmResult<()> {
        self.run_source("reference_price", |engine| async move {
            refresh_reference_price(engine.inner.oracle.as_ref(), &engine.inner.prices)
                .await
                .map(|_| ())
        })
        .await
    }

    pub async fn refresh_prices(&self) -> FarmResult<()> {
        self.run_source("current_prices", |engine| async move {
            let now = engine.now();
            refresh_current_prices(engine.inner.oracle.as_ref(), &engine.inner.prices, now)
                .await
                .map(|_| ())
        })
        .await
    }

    pub async fn refresh_pool_feed(&self) -> FarmResult<()> {
        self.run_source("pool_feed", |engine| async move {
            let feed = engine.inner.pool_feed.as_ref();
            let (pools, lp_tokens) = futures::try_join!(feed.all_pools(), feed.lp_tokens())?;
            info!("✅ [PoolFeed] {} pools, {} LP tokens from {}", pools.len(), lp_tokens.len(), feed.name());
            engine
                .inner
                .cache
                .replace_pool_feed(PoolFeedSnapshot { pools, lp_tokens });
            Ok(())
        })
        .await
    }

    /// Fetch farm storage and add farms seen for the first time.
    pub async fn load_farms(&self) -> FarmResult<usize> {
        self.refresh_farm_storage().await?;
        Ok(self.inner.registry.len())
    }

    pub async fn refresh_farm_storage(&self) -> FarmResult<()> {
        self.run_source("farm_storage", |engine| async move {
            let inner = &engine.inner;
            let contract = inner.settings.contracts.farm.clone();
            let entries = inner
                .indexer
                .big_map_entries(&contract, FARMS_BIG_MAP, &[])
                .await?;
            let farms = parse_farm_entries(&entries);
            let now = engine.now();

            let mut added = 0usize;
            for (id, raw) in &farms {
                if inner.registry.contains(id) {
                    inner
                        .registry
                        .update(id, |farm| {
                            inner.curator.apply_storage(farm, raw, now);
                            engine.apply_visibility(farm);
                        });
                } else if let Some(farm) = inner.curator.build_farm(id, &contract, raw, now) {
                    let mut farm = farm;
                    engine.apply_visibility(&mut farm);
                    if inner.registry.insert_new(farm) {
                        added += 1;
                    }
                }
            }
            inner.cache.replace_farm_storage(FarmStorage {
                farms,
                fetched_at: Some(now),
            });
            if added > 0 {
                info!("✅ [Farms] {} new farms ({} tracked)", added, inner.registry.len());
            }
            Ok(())
        })
        .await
    }

    /// Ledger records of the connected wallet. No-op without a wallet.
    pub async fn refresh_user_storage(&self) -> FarmResult<()> {
        self.run_source("user_storage", |engine| async move {
            let wallet = match engine.wallet() {
                Some(w) => w,
                None => return Ok(()),
            };
            let inner = &engine.inner;
            let filter = vec![("key.address".to_string(), wallet.clone())];
            let entries = inner
                .indexer
                .big_map_entries(&inner.settings.contracts.farm, LEDGER_BIG_MAP, &filter)
                .await?;
            let records = parse_ledger_entries(&entries);
            debug!("[Ledger] {} stake records for {}", records.len(), wallet);
            let mut storage = UserStorage::for_wallet(Some(wallet.clone()));
            storage.records = records;
            storage.fetched_at = Some(engine.now());
            // Dropped if the wallet changed while the fetch ran.
            if inner.cache.replace_user_storage(storage) {
                engine.refresh_rewards();
            } else {
                debug!("[Ledger] records for {} arrived after a wallet change", wallet);
            }
            Ok(())
        })
        .await
    }

    // --- Farm passes ---

    /// Re-value every farm. Farms with a pass already in flight are skipped.
    pub async fn refresh_valuations(&self) -> FarmResult<()> {
        self.run_source("valuation", |engine| async move {
            let ids = engine.inner.registry.ids();
            let total = ids.len();
            let results: Vec<FarmResult<()>> = stream::iter(ids)
                .map(|id| {
                    let engine = engine.clone();
                    async move { engine.refresh_farm(id, false).await }
                })
                .buffer_unordered(PASS_CONCURRENCY)
                .collect()
                .await;
            let failures: Vec<FarmError> = results.into_iter().filter_map(Result::err).collect();
            engine.after_passes();
            if !failures.is_empty() {
                warn!("⚠️ [Valuation] {} of {} farms failed this cycle", failures.len(), total);
                if failures.len() == total {
                    return Err(failures[0].clone());
                }
            }
            Ok(())
        })
        .await
    }

    /// Fresh pass for one farm. Concurrent callers share one flight.
    pub async fn refresh_one(&self, id: &str) -> FarmResult<()> {
        if !self.inner.registry.contains(id) {
            return Err(FarmError::UnknownFarm(id.to_string()));
        }
        let outcome = self.refresh_farm(id.to_string(), true).await;
        self.after_passes();
        outcome
    }

    async fn refresh_farm(&self, id: String, fresh: bool) -> FarmResult<()> {
        let engine = self.clone();
        let flight_id = id.clone();
        self.inner
            .farm_flights
            .run(id, move || {
                let span = info_span!("farm_pass", farm = %flight_id, fresh);
                async move { engine.run_pass(&flight_id, fresh).await }.instrument(span)
            })
            .await
    }

    async fn run_pass(&self, id: &str, fresh: bool) -> FarmResult<()> {
        let inner = &self.inner;
        let ticket = match inner.registry.begin_pass(id) {
            Some(t) => t,
            None => {
                debug!("pass already in flight, skipping");
                metrics::increment_valuation_pass("skipped");
                return Ok(());
            }
        };

        match self.compute_pass(id, fresh).await {
            Ok(update) => {
                let now = self.now();
                let outcome = inner.registry.finish_pass(&ticket, |farm| {
                    self.apply_update(farm, update, now);
                });
                metrics::increment_valuation_pass(outcome.as_str());
                if outcome == PassOutcome::Stale {
                    debug!("newer update landed first, result dropped");
                }
                Ok(())
            }
            Err(e @ FarmError::Classification { .. }) => {
                warn!("⚠️ [Classifier] farm {} marked errant: {}", id, e);
                metrics::increment_classification_failures();
                inner.paths.remove(id);
                let raw = inner.cache.raw_farm(id);
                let now = self.now();
                let reason = e.to_string();
                inner.registry.finish_pass(&ticket, |farm| {
                    farm.flags.errant = Some(ErrantReason::Classification(reason));
                    if let Some(raw) = &raw {
                        inner.curator.apply_storage(farm, raw, now);
                    }
                    farm.tvl_tez = Estimate::Unknown;
                    farm.apr = Estimate::Unknown;
                    farm.status.loading = false;
                    self.apply_visibility(farm);
                });
                Err(e)
            }
            Err(e) => {
                inner.registry.abandon_pass(&ticket);
                metrics::increment_valuation_pass("failed");
                Err(e)
            }
        }
    }

    async fn compute_pass(&self, id: &str, fresh: bool) -> FarmResult<PassUpdate> {
        let inner = &self.inner;
        let farm = self.farm(id)?;
        let raw = self.raw_farm(id, fresh).await?;

        let reward = match farm.reward_token {
            Some(r) if !TokenMetadataResolver::is_placeholder(&r.meta) => r,
            _ => RewardToken {
                meta: inner
                    .normalizer
                    .resolver()
                    .resolve(&farm.reward_token_ref)
                    .await,
            },
        };

        let key = farm.pool_token_ref.clone();
        let (path, prefetched) = match inner.paths.get(id).map(|p| *p) {
            Some(path) => (path, None),
            None => {
                let (path, storage) = self.classify(&key).await?;
                inner.paths.insert(id.to_string(), path);
                (path, storage)
            }
        };
        let (pool, lb) = self.normalize_pool(&key, path, prefetched).await?;

        let prices = inner.prices.snapshot();
        let now = self.now();
        let valuation = value_farm(&ValuationInput {
            pool: &pool,
            reward: &reward,
            pool_balance: raw.pool_balance,
            reward_per_sec: raw.reward_per_sec,
            bonuses: &raw.bonuses(),
            prices: &prices,
            lb: lb.as_ref(),
            now,
        });

        let stake = match self.wallet() {
            Some(wallet) => {
                let record = self.user_record(id, &wallet, fresh).await?;
                Some(self.stake_figures(&raw, &record, &pool, &reward, now)?)
            }
            None => None,
        };

        Ok(PassUpdate {
            pool,
            reward,
            raw,
            valuation,
            stake,
        })
    }

    fn apply_update(&self, farm: &mut Farm, update: PassUpdate, now: DateTime<Utc>) {
        if matches!(farm.flags.errant, Some(ErrantReason::Classification(_))) {
            info!("✅ farm {} recovered from classification failure", farm.id);
            farm.flags.errant = None;
        }
        farm.reward_token = Some(update.reward);
        // The variant is fixed once set; reserves and metadata are refreshed.
        match &farm.pool_token {
            Some(existing) if existing.variant != update.pool.variant => {
                warn!("⚠️ farm {} pool variant changed upstream, keeping {}", farm.id, existing.variant);
            }
            _ => farm.pool_token = Some(update.pool),
        }
        self.inner.curator.apply_storage(farm, &update.raw, now);
        farm.tvl_tez = update.valuation.tvl_tez;
        farm.apr = update.valuation.apr;
        farm.multiplier = update.valuation.multiplier;
        farm.pool_balance = update.valuation.pool_balance;
        match update.stake {
            Some((deposit, pending)) => {
                farm.deposit_amount = deposit;
                farm.rewards_earned = pending;
            }
            None => {
                farm.deposit_amount = Decimal::ZERO;
                farm.rewards_earned = Decimal::ZERO;
            }
        }
        farm.status.init = true;
        farm.status.loading = false;
        self.apply_visibility(farm);
    }

    fn after_passes(&self) {
        let total = self.inner.registry.recompute_total_tvl();
        metrics::set_total_tvl(total);
        let farms = self.inner.registry.snapshot();
        let visible = farms.iter().filter(|f| f.visible).count();
        metrics::set_farm_counts(farms.len(), visible);
    }

    async fn raw_farm(&self, id: &str, fresh: bool) -> FarmResult<RawFarm> {
        let inner = &self.inner;
        if fresh {
            let value = inner
                .indexer
                .big_map_value(&inner.settings.contracts.farm, FARMS_BIG_MAP, id)
                .await?;
            if let Some(value) = value {
                let raw: RawFarm = serde_json::from_value(value)
                    .map_err(|e| FarmError::InvalidPayload(format!("farm {}: {}", id, e)))?;
                inner.cache.upsert_raw_farm(id, raw.clone());
                return Ok(raw);
            }
        }
        inner
            .cache
            .raw_farm(id)
            .ok_or_else(|| FarmError::UnknownFarm(id.to_string()))
    }

    async fn user_record(&self, id: &str, wallet: &str, fresh: bool) -> FarmResult<UserRecord> {
        let inner = &self.inner;
        if fresh {
            let filter = vec![
                ("key.address".to_string(), wallet.to_string()),
                ("key.nat".to_string(), id.to_string()),
            ];
            let entries = inner
                .indexer
                .big_map_entries(&inner.settings.contracts.farm, LEDGER_BIG_MAP, &filter)
                .await?;
            let record = parse_ledger_entries(&entries)
                .remove(id)
                .unwrap_or_default();
            inner.cache.upsert_user_record(wallet, id, record.clone());
            return Ok(record);
        }
        Ok(inner.cache.user_record(id).unwrap_or_default())
    }

    /// (deposit, pending reward) in display units.
    fn stake_figures(
        &self,
        raw: &RawFarm,
        record: &UserRecord,
        pool: &PoolToken,
        reward: &RewardToken,
        now: DateTime<Utc>,
    ) -> FarmResult<(Decimal, Decimal)> {
        let deposit = u256_to_decimal(record.amount, pool.decimals)?;
        let pending = self
            .inner
            .rewards
            .pending_reward(raw, record, now, reward.decimals())?;
        Ok((deposit, pending))
    }

    // --- Classification and normalization ---

    async fn classify(&self, key: &TokenKey) -> FarmResult<(ClassificationPath, Option<Value>)> {
        let inner = &self.inner;
        if inner.classifier.is_liquidity_baking(key) {
            return Ok((ClassificationPath::LiquidityBaking, None));
        }
        if !inner.cache.is_pool_feed_loaded() {
            if let Err(e) = self.refresh_pool_feed().await {
                warn!("⚠️ Pool feed unavailable, classifying {} from storage: {}", key, e);
            }
        }
        let feed = inner.cache.pool_feed();
        if let Some((record, _)) = find_token_in_feed(key, &feed) {
            let variant = ProtocolClassifier::classify_feed_dex(&record.dex_type);
            return Ok((ClassificationPath::Feed(variant), None));
        }
        let storage = inner.indexer.contract_storage(&key.address).await?;
        let variant = ProtocolClassifier::classify_storage(key, &storage)?;
        Ok((ClassificationPath::Storage(variant), Some(storage)))
    }

    async fn normalize_pool(
        &self,
        key: &TokenKey,
        path: ClassificationPath,
        prefetched: Option<Value>,
    ) -> FarmResult<(PoolToken, Option<LbPoolState>)> {
        let inner = &self.inner;
        let normalizer = &inner.normalizer;
        match path {
            ClassificationPath::LiquidityBaking => {
                let lb_dex = inner.settings.contracts.lb_dex.clone();
                let storage = self.lb_storage().await?;
                let state = lb_state_from_storage(&storage, &lb_dex)?;
                let pool = normalizer
                    .normalize_liquidity_baking(key, &storage, &lb_dex)
                    .await?;
                Ok((pool, Some(state)))
            }
            ClassificationPath::Feed(ProtocolVariant::SingleToken)
            | ClassificationPath::Storage(ProtocolVariant::SingleToken) => {
                Ok((normalizer.normalize_single(key).await, None))
            }
            ClassificationPath::Feed(variant) => {
                let feed = inner.cache.pool_feed();
                let (record, lp) = find_token_in_feed(key, &feed).ok_or_else(|| {
                    FarmError::classification(key.to_string(), "no longer listed in the pool feed")
                })?;
                let raw = extract_from_feed(key, record, lp)?;
                let prices = inner.prices.snapshot();
                Ok((normalizer.assemble(variant, key, raw, &prices).await?, None))
            }
            ClassificationPath::Storage(variant) => {
                let root = match prefetched {
                    Some(root) => root,
                    None => inner.indexer.contract_storage(&key.address).await?,
                };
                let snapshot = self.storage_snapshot(variant, key, root).await?;
                let raw = extract_from_storage(variant, key, &snapshot)?;
                let prices = inner.prices.snapshot();
                Ok((normalizer.assemble(variant, key, raw, &prices).await?, None))
            }
        }
    }

    async fn storage_snapshot(
        &self,
        variant: ProtocolVariant,
        key: &TokenKey,
        root: Value,
    ) -> FarmResult<PoolSnapshot> {
        let indexer = &self.inner.indexer;
        let fetches = required_fetches(variant, key, &root)?;
        let mut snapshot = PoolSnapshot::new(root);
        for fetch in fetches {
            match fetch {
                ExtraFetch::ContractStorage { address } => {
                    let storage = indexer.contract_storage(&address).await?;
                    snapshot.contracts.insert(address, storage);
                }
                ExtraFetch::BigMapValue { path, key: map_key } => {
                    if let Some(value) = indexer.big_map_value(&key.address, path, &map_key).await? {
                        snapshot.big_maps.insert((path.to_string(), map_key), value);
                    }
                }
            }
        }
        Ok(snapshot)
    }

    /// LB dex storage, fetched fresh; concurrent LB passes share one fetch.
    async fn lb_storage(&self) -> FarmResult<Value> {
        let lb_dex = self.inner.settings.contracts.lb_dex.clone();
        let indexer = Arc::clone(&self.inner.indexer);
        let address = lb_dex.clone();
        self.inner
            .lb_flight
            .run(lb_dex, move || async move { indexer.contract_storage(&address).await })
            .await
    }

    // --- Rewards ---

    /// Re-estimate pending rewards from cached storage. Local only.
    pub fn refresh_rewards(&self) {
        if !self.is_wallet_connected() {
            return;
        }
        let inner = &self.inner;
        let now = self.now();
        for farm in inner.registry.snapshot() {
            let (pool, reward) = match (&farm.pool_token, &farm.reward_token) {
                (Some(p), Some(r)) => (p, r),
                _ => continue,
            };
            let raw = match inner.cache.raw_farm(&farm.id) {
                Some(raw) => raw,
                None => continue,
            };
            let record = inner.cache.user_record(&farm.id).unwrap_or_default();
            match self.stake_figures(&raw, &record, pool, reward, now) {
                Ok((deposit, pending)) => {
                    inner.registry.update_if_unchanged(&farm.id, farm.applied_seq, |f| {
                        f.deposit_amount = deposit;
                        f.rewards_earned = pending;
                        self.apply_visibility(f);
                    });
                }
                Err(e) => debug!("reward estimate for farm {} failed: {}", farm.id, e),
            }
        }
    }

    /// Pending reward of the connected wallet, in reward-token units.
    pub fn pending_reward(&self, id: &str) -> FarmResult<Decimal> {
        if !self.is_wallet_connected() {
            return Err(FarmError::WalletNotConnected);
        }
        let farm = self.farm(id)?;
        let (raw, reward) = match (self.inner.cache.raw_farm(id), &farm.reward_token) {
            (Some(raw), Some(reward)) => (raw, reward.clone()),
            _ => return Ok(farm.rewards_earned),
        };
        let record = self.inner.cache.user_record(id).unwrap_or_default();
        self.inner
            .rewards
            .pending_reward(&raw, &record, self.now(), reward.decimals())
    }

    pub fn tvl(&self, id: &str) -> FarmResult<Estimate> {
        Ok(self.farm(id)?.tvl_tez)
    }

    /// Confirmed harvest: zero the estimate now and re-run the farm's pass.
    pub async fn mark_harvested(&self, id: &str) -> FarmResult<()> {
        let wallet = self.wallet().ok_or(FarmError::WalletNotConnected)?;
        let inner = &self.inner;
        if !inner.registry.contains(id) {
            return Err(FarmError::UnknownFarm(id.to_string()));
        }
        let now = self.now();
        if let Some(raw) = inner.cache.raw_farm(id) {
            let mut record = inner.cache.user_record(id).unwrap_or_default();
            inner.rewards.apply_harvest(&raw, &mut record, now);
            if !inner.cache.record_harvest(&wallet, id, record) {
                return Err(FarmError::WalletNotConnected);
            }
        }
        inner.registry.stamp(id, |farm| farm.rewards_earned = Decimal::ZERO);
        info!("✅ farm {} harvested, estimate reset", id);
        // The checkpoint outlives ledger refreshes until the indexer's record moves.
        let outcome = self.refresh_farm(id.to_string(), false).await;
        self.after_passes();
        outcome
    }

    /// Wallet's balance of the farm's staked token, in whole units.
    pub async fn pool_token_balance(&self, id: &str) -> FarmResult<Decimal> {
        let wallet = self.wallet().ok_or(FarmError::WalletNotConnected)?;
        let farm = self.farm(id)?;
        let decimals = farm.pool_token.as_ref().map_or(0, |p| p.decimals);
        let raw = self
            .inner
            .indexer
            .token_balance(&wallet, &farm.pool_token_ref)
            .await?;
        Ok(u256_to_decimal(raw, decimals)?)
    }

    // --- Wallet lifecycle ---

    /// Track `pkh`: reload its stake records and re-value every farm.
    pub async fn connect_wallet(&self, pkh: &str) -> FarmResult<()> {
        let pkh = pkh.trim();
        if pkh.is_empty() {
            return Err(FarmError::InvalidPayload("empty wallet address".to_string()));
        }
        info!("🔗 Wallet connected: {}", pkh);
        self.inner.wallet.store(Some(Arc::new(pkh.to_string())));
        self.inner.cache.reset_user_storage(Some(pkh.to_string()));
        // Passes still running for a previous wallet come back stale.
        self.inner.registry.stamp_all(|farm| {
            farm.deposit_amount = Decimal::ZERO;
            farm.rewards_earned = Decimal::ZERO;
            farm.status.loading = true;
        });

        let mut loaded = self.refresh_user_storage().await;
        if loaded.is_ok() && self.inner.cache.user_storage().fetched_at.is_none() {
            // Joined a ledger fetch started for the previous wallet.
            loaded = self.refresh_user_storage().await;
        }
        let outcome = match loaded {
            Ok(()) => self.refresh_valuations().await,
            Err(e) => Err(e),
        };
        self.inner.registry.update_all(|farm| {
            farm.status.loading = false;
        });
        outcome
    }

    pub fn disconnect_wallet(&self) {
        info!("🔌 Wallet disconnected");
        self.inner.wallet.store(None);
        self.inner.cache.reset_user_storage(None);
        self.inner.registry.stamp_all(|farm| {
            farm.deposit_amount = Decimal::ZERO;
            farm.rewards_earned = Decimal::ZERO;
            farm.user_visible = false;
        });
    }

    // --- Filters ---

    fn apply_visibility(&self, farm: &mut Farm) {
        let filters = self.inner.filters.load();
        let cfg = &self.inner.filter_config;
        farm.visible = cfg.is_visible(farm, &filters, FilterScope::All);
        farm.user_visible =
            self.is_wallet_connected() && cfg.is_visible(farm, &filters, FilterScope::User);
    }

    pub fn set_filters(&self, tags: impl IntoIterator<Item = FilterTag>, keyword: Option<&str>) {
        let filters = FilterSet::new(tags, keyword);
        debug!("filters set: {:?}", filters);
        self.inner.filters.store(Arc::new(filters));
        self.inner.registry.update_all(|farm| self.apply_visibility(farm));
        let farms = self.inner.registry.snapshot();
        metrics::set_farm_counts(farms.len(), farms.iter().filter(|f| f.visible).count());
    }

    pub fn filters(&self) -> FilterSet {
        self.inner.filters.load().as_ref().clone()
    }

    pub fn visible_farms(&self) -> Vec<Farm> {
        self.inner
            .registry
            .snapshot()
            .into_iter()
            .filter(|f| f.visible)
            .collect()
    }

    pub fn visible_user_farms(&self) -> Vec<Farm> {
        self.inner
            .registry
            .snapshot()
            .into_iter()
            .filter(|f| f.user_visible)
            .collect()
    }

    // --- Orchestration ---

    /// One full cycle: prices, pool feed, storage, then every farm pass.
    ///
    /// Every step runs even if an earlier one failed; the first failure is returned.
    pub async fn refresh_all(&self) -> FarmResult<()> {
        let steps: [(&str, FarmResult<()>); 5] = [
            ("reference_price", self.refresh_reference_price().await),
            ("current_prices", self.refresh_prices().await),
            ("pool_feed", self.refresh_pool_feed().await),
            ("farm_storage", self.refresh_farm_storage().await),
            ("user_storage", self.refresh_user_storage().await),
        ];
        let mut first_error = None;
        for (step, outcome) in steps {
            if let Err(e) = outcome {
                warn!("⚠️ [refresh_all] {} failed: {}", step, e);
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.refresh_valuations().await {
            first_error.get_or_insert(e);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn job<F, Fut>(&self, work: F) -> LoopJob
    where
        F: Fn(FarmEngine) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = FarmResult<()>> + Send + 'static,
    {
        let engine = self.clone();
        Arc::new(move || work(engine.clone()).boxed())
    }

    /// Start the refresh loops. No-op if already running.
    pub async fn start(&self) {
        let mut slot = self.inner.scheduler.lock().await;
        if slot.is_some() {
            warn!("⚠️ Scheduler already running");
            return;
        }
        let r = &self.inner.settings.refresh;
        let secs = Duration::from_secs;
        let mut scheduler = Scheduler::new();

        scheduler.spawn_loop(
            "reference_price",
            fixed_interval(secs(r.reference_price_secs)),
            self.job(|e| async move { e.refresh_reference_price().await }),
        );
        scheduler.spawn_loop(
            "current_prices",
            fixed_interval(secs(r.current_prices_secs)),
            self.job(|e| async move { e.refresh_prices().await }),
        );
        if r.pool_feed_secs > 0 {
            scheduler.spawn_loop(
                "pool_feed",
                fixed_interval(secs(r.pool_feed_secs)),
                self.job(|e| async move { e.refresh_pool_feed().await }),
            );
        }
        scheduler.spawn_loop(
            "farm_storage",
            fixed_interval(secs(r.farm_storage_secs)),
            self.job(|e| async move { e.refresh_farm_storage().await }),
        );
        scheduler.spawn_loop(
            "user_storage",
            fixed_interval(secs(r.user_storage_secs)),
            self.job(|e| async move { e.refresh_user_storage().await }),
        );

        let engine = self.clone();
        let (connected, disconnected) = (
            secs(r.valuation_connected_secs),
            secs(r.valuation_disconnected_secs),
        );
        let valuation_interval: LoopInterval = Arc::new(move || {
            if engine.is_wallet_connected() {
                connected
            } else {
                disconnected
            }
        });
        scheduler.spawn_loop(
            "valuation",
            valuation_interval,
            self.job(|e| async move { e.refresh_valuations().await }),
        );
        scheduler.spawn_loop(
            "rewards",
            fixed_interval(Duration::from_millis(r.rewards_millis)),
            self.job(|e| async move {
                e.refresh_rewards();
                Ok(())
            }),
        );

        info!("🚀 Farm engine started ({} loops)", scheduler.loop_names().len());
        *slot = Some(scheduler);
    }

    /// Cancel and join every loop.
    pub async fn stop(&self) {
        let scheduler = self.inner.scheduler.lock().await.take();
        if let Some(scheduler) = scheduler {
            scheduler.stop().await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner
            .scheduler
            .lock()
            .await
            .as_ref()
            .map_or(false, Scheduler::is_running)
    }
}

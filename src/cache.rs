use crate::data_sources::{BigMapEntry, PoolFeedSnapshot};
use crate::metrics;
use crate::types::conversions::json_u64;
use crate::types::farm::RawUserRecord;
use crate::types::{RawFarm, UserRecord};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use log::{debug, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Farm contract storage keyed by farm id, in big map order.
#[derive(Debug, Clone, Default)]
pub struct FarmStorage {
    pub farms: IndexMap<String, RawFarm>,
    pub fetched_at: Option<DateTime<Utc>>,
}

/// Stake records of the connected wallet keyed by farm id.
#[derive(Debug, Clone, Default)]
pub struct UserStorage {
    pub wallet: Option<String>,
    pub records: HashMap<String, UserRecord>,
    pub fetched_at: Option<DateTime<Utc>>,
    /// Local harvests the indexer has not reflected yet.
    pub harvests: HashMap<String, HarvestCheckpoint>,
}

/// A harvest applied locally, kept until the indexer's record moves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestCheckpoint {
    /// Indexer record as last seen before the harvest.
    pub before: UserRecord,
    pub local: UserRecord,
}

impl UserStorage {
    pub fn for_wallet(wallet: Option<String>) -> Self {
        Self {
            wallet,
            ..Self::default()
        }
    }

    /// Indexer record for `id`, or the local checkpoint while the indexer lags.
    fn settle(&mut self, id: &str, incoming: UserRecord) {
        let record = match self.harvests.get(id) {
            Some(cp) if cp.before == incoming => cp.local.clone(),
            Some(_) => {
                debug!("Indexer caught up with harvest on farm {}", id);
                self.harvests.remove(id);
                incoming
            }
            None => incoming,
        };
        self.records.insert(id.to_string(), record);
    }
}

/// Read-mostly upstream snapshots shared by every refresh loop.
///
/// Each snapshot is replaced as a whole; readers take an `Arc` and never
/// observe a half-written update.
#[derive(Debug, Clone)]
pub struct SnapshotCache {
    pool_feed: Arc<ArcSwap<PoolFeedSnapshot>>,
    pool_feed_loaded: Arc<AtomicBool>,
    farm_storage: Arc<ArcSwap<FarmStorage>>,
    user_storage: Arc<ArcSwap<UserStorage>>,
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self {
            pool_feed: Arc::new(ArcSwap::from_pointee(PoolFeedSnapshot::default())),
            pool_feed_loaded: Arc::new(AtomicBool::new(false)),
            farm_storage: Arc::new(ArcSwap::from_pointee(FarmStorage::default())),
            user_storage: Arc::new(ArcSwap::from_pointee(UserStorage::default())),
        }
    }

    pub fn pool_feed(&self) -> Arc<PoolFeedSnapshot> {
        self.pool_feed.load_full()
    }

    pub fn is_pool_feed_loaded(&self) -> bool {
        self.pool_feed_loaded.load(Ordering::Acquire)
    }

    pub fn replace_pool_feed(&self, feed: PoolFeedSnapshot) {
        metrics::set_snapshot_size("pool_feed", feed.pools.len());
        self.pool_feed.store(Arc::new(feed));
        self.pool_feed_loaded.store(true, Ordering::Release);
    }

    pub fn farm_storage(&self) -> Arc<FarmStorage> {
        self.farm_storage.load_full()
    }

    pub fn raw_farm(&self, id: &str) -> Option<RawFarm> {
        self.farm_storage.load().farms.get(id).cloned()
    }

    pub fn replace_farm_storage(&self, storage: FarmStorage) {
        metrics::set_snapshot_size("farm_storage", storage.farms.len());
        self.farm_storage.store(Arc::new(storage));
    }

    /// Overwrite one farm's raw record after a targeted fetch.
    pub fn upsert_raw_farm(&self, id: &str, raw: RawFarm) {
        self.farm_storage.rcu(|current| {
            let mut next = FarmStorage::clone(current);
            next.farms.insert(id.to_string(), raw.clone());
            next
        });
    }

    pub fn user_storage(&self) -> Arc<UserStorage> {
        self.user_storage.load_full()
    }

    pub fn user_record(&self, id: &str) -> Option<UserRecord> {
        self.user_storage.load().records.get(id).cloned()
    }

    /// Swap in freshly fetched records. Ignored if they belong to another wallet.
    pub fn replace_user_storage(&self, storage: UserStorage) -> bool {
        let mut applied = false;
        self.user_storage.rcu(|current| {
            if current.wallet != storage.wallet {
                applied = false;
                return Arc::clone(current);
            }
            applied = true;
            let mut next = UserStorage {
                wallet: storage.wallet.clone(),
                records: HashMap::with_capacity(storage.records.len()),
                fetched_at: storage.fetched_at,
                harvests: current.harvests.clone(),
            };
            for (id, record) in &storage.records {
                next.settle(id, record.clone());
            }
            // Farms absent from the ledger answer hold no stake at all.
            let missing: Vec<String> = next
                .harvests
                .keys()
                .filter(|id| !storage.records.contains_key(*id))
                .cloned()
                .collect();
            for id in missing {
                next.settle(&id, UserRecord::default());
            }
            Arc::new(next)
        });
        if applied {
            metrics::set_snapshot_size("user_storage", storage.records.len());
        }
        applied
    }

    /// Overwrite one record after a targeted fetch for `wallet`.
    pub fn upsert_user_record(&self, wallet: &str, id: &str, record: UserRecord) -> bool {
        let mut applied = false;
        self.user_storage.rcu(|current| {
            applied = current.wallet.as_deref() == Some(wallet);
            if !applied {
                return Arc::clone(current);
            }
            let mut next = UserStorage::clone(current);
            next.settle(id, record.clone());
            Arc::new(next)
        });
        applied
    }

    /// Store a locally harvested record for `wallet` until the indexer reflects it.
    pub fn record_harvest(&self, wallet: &str, id: &str, local: UserRecord) -> bool {
        let mut applied = false;
        self.user_storage.rcu(|current| {
            applied = current.wallet.as_deref() == Some(wallet);
            if !applied {
                return Arc::clone(current);
            }
            let mut next = UserStorage::clone(current);
            let before = match next.harvests.get(id) {
                Some(cp) => cp.before.clone(),
                None => next.records.get(id).cloned().unwrap_or_default(),
            };
            next.harvests.insert(
                id.to_string(),
                HarvestCheckpoint {
                    before,
                    local: local.clone(),
                },
            );
            next.records.insert(id.to_string(), local.clone());
            Arc::new(next)
        });
        applied
    }

    /// Drop every record and start tracking `wallet` (or nobody).
    pub fn reset_user_storage(&self, wallet: Option<String>) {
        self.user_storage.store(Arc::new(UserStorage::for_wallet(wallet)));
    }
}

/// Farm id from a big map key (`"3"`, `3` or `{"nat": "3", ...}`).
pub fn farm_id_from_key(key: &Value) -> Option<String> {
    match key {
        Value::Object(map) => map
            .get("nat")
            .or_else(|| map.get("farmId"))
            .or_else(|| map.get("farm_id"))
            .and_then(|v| json_u64(v).ok())
            .map(|id| id.to_string()),
        other => json_u64(other).ok().map(|id| id.to_string()),
    }
}

/// Parse the farm contract's `farms` big map. Undecodable entries are skipped.
pub fn parse_farm_entries(entries: &[BigMapEntry]) -> IndexMap<String, RawFarm> {
    let mut farms = IndexMap::with_capacity(entries.len());
    for entry in entries.iter().filter(|e| e.active) {
        let id = match farm_id_from_key(&entry.key) {
            Some(id) => id,
            None => {
                warn!("⚠️ Skipping farm entry with unreadable key {}", entry.key);
                continue;
            }
        };
        match serde_json::from_value::<RawFarm>(entry.value.clone()) {
            Ok(raw) => {
                farms.insert(id, raw);
            }
            Err(e) => warn!("⚠️ Skipping farm {}: {}", id, e),
        }
    }
    debug!("Parsed {} farm entries", farms.len());
    farms
}

/// Parse ledger entries already filtered to one wallet.
pub fn parse_ledger_entries(entries: &[BigMapEntry]) -> HashMap<String, UserRecord> {
    let mut records = HashMap::new();
    for entry in entries.iter().filter(|e| e.active) {
        let Some(id) = farm_id_from_key(&entry.key) else {
            continue;
        };
        match serde_json::from_value::<RawUserRecord>(entry.value.clone()) {
            Ok(raw) => {
                records.insert(id, UserRecord::from(raw));
            }
            Err(e) => warn!("⚠️ Skipping ledger entry for farm {}: {}", id, e),
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::U256;
    use serde_json::json;

    fn farm_value() -> Value {
        json!({
            "poolToken": { "address": "KT1Pool", "tokenId": "0" },
            "rewardToken": { "address": "KT1Reward", "tokenId": "0" },
            "rewardSupply": "1000",
            "rewardPerSec": "1",
            "startTime": "2022-01-01T00:00:00Z",
            "endTime": "2022-02-01T00:00:00Z"
        })
    }

    #[test]
    fn farm_entries_keep_order_and_skip_garbage() {
        let entries = vec![
            BigMapEntry { key: json!("7"), value: farm_value(), active: true },
            BigMapEntry { key: json!("2"), value: json!({ "nope": 1 }), active: true },
            BigMapEntry { key: json!("3"), value: farm_value(), active: true },
            BigMapEntry { key: json!("4"), value: farm_value(), active: false },
        ];
        let farms = parse_farm_entries(&entries);
        let ids: Vec<&String> = farms.keys().collect();
        assert_eq!(ids, vec!["7", "3"]);
    }

    #[test]
    fn ledger_keys_are_pairs() {
        let entries = vec![BigMapEntry {
            key: json!({ "nat": "3", "address": "tz1Wallet" }),
            value: json!({ "amount": "500", "rewardDebt": "20" }),
            active: true,
        }];
        let records = parse_ledger_entries(&entries);
        let record = &records["3"];
        assert_eq!(record.amount, U256::from(500u64));
        assert_eq!(record.reward_debt, U256::from(20u64));
        assert!(record.carried.is_zero());
    }

    #[test]
    fn snapshots_swap_atomically() {
        let cache = SnapshotCache::new();
        assert!(!cache.is_pool_feed_loaded());
        cache.replace_pool_feed(PoolFeedSnapshot::default());
        assert!(cache.is_pool_feed_loaded());

        cache.reset_user_storage(Some("tz1A".to_string()));
        let before = cache.user_storage();
        assert!(cache.upsert_user_record("tz1A", "1", UserRecord::default()));
        assert!(before.records.is_empty(), "readers keep their snapshot");
        assert!(cache.user_record("1").is_some());
        cache.reset_user_storage(None);
        assert!(cache.user_record("1").is_none());
    }

    fn stake(amount: u64, debt: u64) -> UserRecord {
        UserRecord {
            amount: U256::from(amount),
            reward_debt: U256::from(debt),
            carried: U256::zero(),
        }
    }

    fn ledger_for(wallet: &str, id: &str, record: UserRecord) -> UserStorage {
        let mut storage = UserStorage::for_wallet(Some(wallet.to_string()));
        storage.records.insert(id.to_string(), record);
        storage
    }

    #[test]
    fn records_of_another_wallet_are_ignored() {
        let cache = SnapshotCache::new();
        cache.reset_user_storage(Some("tz1B".to_string()));
        assert!(!cache.replace_user_storage(ledger_for("tz1A", "1", stake(5, 0))));
        assert!(!cache.upsert_user_record("tz1A", "1", stake(5, 0)));
        assert!(cache.user_record("1").is_none());

        cache.reset_user_storage(None);
        assert!(!cache.upsert_user_record("tz1B", "1", stake(5, 0)));
        assert!(cache.user_record("1").is_none());
    }

    #[test]
    fn harvest_checkpoint_survives_lagging_indexer() {
        let cache = SnapshotCache::new();
        cache.reset_user_storage(Some("tz1A".to_string()));
        assert!(cache.replace_user_storage(ledger_for("tz1A", "1", stake(100, 10))));
        assert!(cache.record_harvest("tz1A", "1", stake(100, 70)));

        // Indexer still serves the pre-harvest record.
        cache.replace_user_storage(ledger_for("tz1A", "1", stake(100, 10)));
        assert_eq!(cache.user_record("1"), Some(stake(100, 70)));
        cache.upsert_user_record("tz1A", "1", stake(100, 10));
        assert_eq!(cache.user_record("1"), Some(stake(100, 70)));

        // A second local harvest still compares against the original indexer record.
        cache.record_harvest("tz1A", "1", stake(100, 90));
        cache.replace_user_storage(ledger_for("tz1A", "1", stake(100, 10)));
        assert_eq!(cache.user_record("1"), Some(stake(100, 90)));

        // Once the indexer moves, its record wins and the checkpoint is gone.
        cache.replace_user_storage(ledger_for("tz1A", "1", stake(100, 88)));
        assert_eq!(cache.user_record("1"), Some(stake(100, 88)));
        assert!(cache.user_storage().harvests.is_empty());
    }
}

//! Concurrent farm registry.
//!
//! Farms are keyed by id in a `DashMap`. Every valuation pass and every
//! local harvest takes a fresh sequence number from one monotonic counter;
//! a pass result is applied only if no newer stamp has landed on the farm
//! in the meantime. A farm whose pass is still in flight is skipped by the
//! next pass instead of queueing behind it.

use crate::types::Farm;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// Proof that a pass was admitted for one farm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassTicket {
    pub farm_id: String,
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Applied,
    /// A newer stamp landed first; the result was dropped.
    Stale,
    /// The farm disappeared while the pass ran.
    Missing,
}

impl PassOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassOutcome::Applied => "applied",
            PassOutcome::Stale => "stale",
            PassOutcome::Missing => "missing",
        }
    }
}

pub struct FarmRegistry {
    farms: DashMap<String, Farm>,
    next_seq: AtomicU64,
    changes: watch::Sender<u64>,
    total_tvl: watch::Sender<Decimal>,
}

impl Default for FarmRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn id_order(id: &str) -> (u64, String) {
    (id.parse().unwrap_or(u64::MAX), id.to_string())
}

impl FarmRegistry {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        let (total_tvl, _) = watch::channel(Decimal::ZERO);
        Self {
            farms: DashMap::new(),
            next_seq: AtomicU64::new(1),
            changes,
            total_tvl,
        }
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    fn notify(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Change counter, bumped on every applied mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub fn subscribe_total_tvl(&self) -> watch::Receiver<Decimal> {
        self.total_tvl.subscribe()
    }

    pub fn total_tvl(&self) -> Decimal {
        *self.total_tvl.borrow()
    }

    pub fn len(&self) -> usize {
        self.farms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.farms.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.farms.contains_key(id)
    }

    /// Add a farm first seen in storage. Existing records are left alone.
    pub fn insert_new(&self, farm: Farm) -> bool {
        let inserted = match self.farms.entry(farm.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(farm);
                true
            }
        };
        if inserted {
            self.notify();
        }
        inserted
    }

    pub fn get(&self, id: &str) -> Option<Farm> {
        self.farms.get(id).map(|f| f.clone())
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.farms.iter().map(|f| f.key().clone()).collect();
        ids.sort_by_key(|id| id_order(id));
        ids
    }

    /// All farms ordered by numeric id.
    pub fn snapshot(&self) -> Vec<Farm> {
        let mut farms: Vec<Farm> = self.farms.iter().map(|f| f.value().clone()).collect();
        farms.sort_by_key(|f| id_order(&f.id));
        farms
    }

    /// Admit a pass for `id`, or `None` if one is already running (or the farm is unknown).
    pub fn begin_pass(&self, id: &str) -> Option<PassTicket> {
        let mut farm = self.farms.get_mut(id)?;
        if farm.status.updating {
            return None;
        }
        farm.status.updating = true;
        Some(PassTicket {
            farm_id: id.to_string(),
            seq: self.next_seq(),
        })
    }

    /// Apply a pass result unless a newer stamp landed first. Always releases the pass.
    pub fn finish_pass(&self, ticket: &PassTicket, apply: impl FnOnce(&mut Farm)) -> PassOutcome {
        let outcome = match self.farms.get_mut(&ticket.farm_id) {
            None => PassOutcome::Missing,
            Some(mut farm) => {
                farm.status.updating = false;
                if ticket.seq > farm.applied_seq {
                    apply(farm.value_mut());
                    farm.applied_seq = ticket.seq;
                    PassOutcome::Applied
                } else {
                    PassOutcome::Stale
                }
            }
        };
        if outcome == PassOutcome::Applied {
            self.notify();
        }
        outcome
    }

    /// Release a pass that produced nothing.
    pub fn abandon_pass(&self, ticket: &PassTicket) {
        if let Some(mut farm) = self.farms.get_mut(&ticket.farm_id) {
            farm.status.updating = false;
        }
    }

    /// Apply a local mutation under a fresh stamp; in-flight passes become stale.
    pub fn stamp(&self, id: &str, apply: impl FnOnce(&mut Farm)) -> bool {
        let seq = self.next_seq();
        let applied = match self.farms.get_mut(id) {
            Some(mut farm) => {
                apply(farm.value_mut());
                farm.applied_seq = seq;
                true
            }
            None => false,
        };
        if applied {
            self.notify();
        }
        applied
    }

    /// Sequence last applied to `id`.
    pub fn applied_seq(&self, id: &str) -> Option<u64> {
        self.farms.get(id).map(|f| f.applied_seq)
    }

    /// Apply `f` only if nothing was stamped since `seen_seq` was read.
    pub fn update_if_unchanged(&self, id: &str, seen_seq: u64, apply: impl FnOnce(&mut Farm)) -> bool {
        let applied = match self.farms.get_mut(id) {
            Some(mut farm) if farm.applied_seq == seen_seq => {
                apply(farm.value_mut());
                true
            }
            _ => false,
        };
        if applied {
            self.notify();
        }
        applied
    }

    /// Apply a local mutation to every farm under one fresh stamp.
    /// Passes admitted before the call come back stale.
    pub fn stamp_all(&self, mut apply: impl FnMut(&mut Farm)) {
        let seq = self.next_seq();
        for mut farm in self.farms.iter_mut() {
            apply(farm.value_mut());
            farm.applied_seq = farm.applied_seq.max(seq);
        }
        self.notify();
    }

    /// Mutate every farm without touching stamps (flags, filters).
    pub fn update_all(&self, mut apply: impl FnMut(&mut Farm)) {
        for mut farm in self.farms.iter_mut() {
            apply(farm.value_mut());
        }
        self.notify();
    }

    pub fn update(&self, id: &str, apply: impl FnOnce(&mut Farm)) -> bool {
        let applied = match self.farms.get_mut(id) {
            Some(mut farm) => {
                apply(farm.value_mut());
                true
            }
            None => false,
        };
        if applied {
            self.notify();
        }
        applied
    }

    /// Sum of known TVL over farms that are not errant.
    pub fn recompute_total_tvl(&self) -> Decimal {
        let total = self
            .farms
            .iter()
            .filter(|f| !f.flags.is_errant())
            .filter_map(|f| f.tvl_tez.known())
            .fold(Decimal::ZERO, |acc, v| acc.checked_add(v).unwrap_or(acc));
        self.total_tvl.send_if_modified(|current| {
            if *current != total {
                *current = total;
                true
            } else {
                false
            }
        });
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curation::FarmCurator;
    use crate::settings::{Curation, Valuation};
    use crate::types::{ErrantReason, Estimate, RawFarm, RawTokenRef, U256};
    use chrono::{Duration, Utc};

    fn farm(id: &str) -> Farm {
        let now = Utc::now();
        let raw = RawFarm {
            pool_token: RawTokenRef {
                address: "KT1Pool".to_string(),
                token_id: 0,
                token_type: None,
            },
            reward_token: RawTokenRef {
                address: "KT1Reward".to_string(),
                token_id: 0,
                token_type: None,
            },
            reward_supply: U256::from(100u64),
            reward_per_sec: U256::from(1u64),
            reward_paid: U256::zero(),
            pool_balance: U256::from(1u64),
            acc_reward_per_share: U256::zero(),
            start_time: now - Duration::days(1),
            end_time: now + Duration::days(10),
            last_reward_time: None,
            lock_duration: 0,
            bonuses: vec![],
            owner: None,
        };
        let curation = Curation {
            excluded_farms: vec![],
            errant_farms: vec![],
            badges: Default::default(),
        };
        FarmCurator::new(&curation, &Valuation::default())
            .build_farm(id, "KT1Farm", &raw, now)
            .unwrap()
    }

    #[test]
    fn overlapping_pass_is_skipped() {
        let registry = FarmRegistry::new();
        registry.insert_new(farm("1"));
        let ticket = registry.begin_pass("1").unwrap();
        assert!(registry.begin_pass("1").is_none(), "second pass must not queue");
        registry.abandon_pass(&ticket);
        assert!(registry.begin_pass("1").is_some());
    }

    #[test]
    fn stamped_harvest_beats_older_pass() {
        let registry = FarmRegistry::new();
        registry.insert_new(farm("1"));
        let ticket = registry.begin_pass("1").unwrap();
        registry.stamp("1", |f| f.rewards_earned = Decimal::ZERO);
        let outcome = registry.finish_pass(&ticket, |f| f.rewards_earned = Decimal::from(9));
        assert_eq!(outcome, PassOutcome::Stale);
        let f = registry.get("1").unwrap();
        assert_eq!(f.rewards_earned, Decimal::ZERO);
        assert!(!f.status.updating);
    }

    #[test]
    fn stamp_all_invalidates_every_running_pass() {
        let registry = FarmRegistry::new();
        registry.insert_new(farm("1"));
        registry.insert_new(farm("2"));
        let first = registry.begin_pass("1").unwrap();
        let second = registry.begin_pass("2").unwrap();
        registry.stamp_all(|f| f.deposit_amount = Decimal::ZERO);

        let write = |f: &mut Farm| f.deposit_amount = Decimal::from(5);
        assert_eq!(registry.finish_pass(&first, write), PassOutcome::Stale);
        assert_eq!(registry.finish_pass(&second, write), PassOutcome::Stale);
        assert_eq!(registry.get("2").unwrap().deposit_amount, Decimal::ZERO);

        let later = registry.begin_pass("1").unwrap();
        assert_eq!(registry.finish_pass(&later, write), PassOutcome::Applied);
    }

    #[test]
    fn aggregate_skips_errant_and_unknown() {
        let registry = FarmRegistry::new();
        for id in ["1", "2", "3"] {
            registry.insert_new(farm(id));
        }
        let mut rx = registry.subscribe_total_tvl();
        registry.update("1", |f| f.tvl_tez = Estimate::Known(Decimal::from(10)));
        registry.update("2", |f| {
            f.tvl_tez = Estimate::Known(Decimal::from(99));
            f.flags.errant = Some(ErrantReason::Classification("x".to_string()));
        });
        registry.update("3", |f| f.tvl_tez = Estimate::Unknown);
        assert_eq!(registry.recompute_total_tvl(), Decimal::from(10));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Decimal::from(10));
    }

    #[test]
    fn snapshot_orders_numerically() {
        let registry = FarmRegistry::new();
        for id in ["10", "2", "1"] {
            registry.insert_new(farm(id));
        }
        assert!(!registry.insert_new(farm("2")));
        let ids: Vec<String> = registry.snapshot().into_iter().map(|f| f.id).collect();
        assert_eq!(ids, vec!["1", "2", "10"]);
    }
}

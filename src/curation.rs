// Farm Curation - builds farm records from storage and applies operator lists
//
// Exclusions, forced-errant ids and badges all come from configuration.
// Lifecycle flags (started/ended/flash/suppressed) are recomputed on every
// storage refresh.

use crate::settings::{Curation, Valuation};
use crate::types::conversions::u256_to_decimal;
use crate::types::{Badges, ErrantReason, Estimate, Farm, FarmFlags, FarmStatus, RawFarm};
use chrono::{DateTime, Utc};
use log::debug;
use rust_decimal::Decimal;
use std::collections::HashSet;

/// Applies curation lists and lifecycle rules to farm records.
///
/// ## Features
///
/// - **Exclusions**: excluded ids never become farm records
/// - **Errant overrides**: configured ids, and farms with a zero reward rate, are errant
/// - **Badges**: verified / core / partner / lpLocked by farm id
#[derive(Debug, Clone)]
pub struct FarmCurator {
    excluded: HashSet<String>,
    errant: HashSet<String>,
    verified: HashSet<String>,
    core: HashSet<String>,
    partner: HashSet<String>,
    lp_locked: HashSet<String>,
    flash_max_duration_secs: i64,
}

fn to_set(ids: &[String]) -> HashSet<String> {
    ids.iter().map(|s| s.trim().to_string()).collect()
}

impl FarmCurator {
    pub fn new(curation: &Curation, valuation: &Valuation) -> Self {
        Self {
            excluded: to_set(&curation.excluded_farms),
            errant: to_set(&curation.errant_farms),
            verified: to_set(&curation.badges.verified),
            core: to_set(&curation.badges.core),
            partner: to_set(&curation.badges.partner),
            lp_locked: to_set(&curation.badges.lp_locked),
            flash_max_duration_secs: valuation.flash_max_duration_secs,
        }
    }

    pub fn is_excluded(&self, id: &str) -> bool {
        self.excluded.contains(id)
    }

    pub fn badges(&self, id: &str) -> Badges {
        Badges {
            verified: self.verified.contains(id),
            core: self.core.contains(id),
            partner: self.partner.contains(id),
            lp_locked: self.lp_locked.contains(id),
        }
    }

    /// Errant reason coming from configuration or the stored reward rate.
    pub fn configured_errant(&self, id: &str, raw: &RawFarm) -> Option<ErrantReason> {
        if self.errant.contains(id) {
            Some(ErrantReason::Curated)
        } else if raw.reward_per_sec.is_zero() {
            Some(ErrantReason::ZeroRewardRate)
        } else {
            None
        }
    }

    /// Fresh record for a farm first seen in storage. `None` when excluded.
    pub fn build_farm(
        &self,
        id: &str,
        contract: &str,
        raw: &RawFarm,
        now: DateTime<Utc>,
    ) -> Option<Farm> {
        if self.is_excluded(id) {
            debug!("Skipping excluded farm {}", id);
            return None;
        }
        let mut farm = Farm {
            id: id.to_string(),
            contract: contract.to_string(),
            pool_token_ref: raw.pool_token.key(),
            reward_token_ref: raw.reward_token.key(),
            pool_token: None,
            reward_token: None,
            reward_supply: Decimal::ZERO,
            reward_per_sec: Decimal::ZERO,
            start_time: raw.start_time,
            end_time: raw.end_time,
            lock_duration: raw.lock_duration,
            duration_secs: raw.duration_secs(),
            bonuses: raw.bonuses(),
            pool_balance: Decimal::ZERO,
            tvl_tez: Estimate::Unknown,
            apr: Estimate::Unknown,
            multiplier: 1,
            deposit_amount: Decimal::ZERO,
            rewards_earned: Decimal::ZERO,
            flags: FarmFlags::default(),
            badges: self.badges(id),
            visible: false,
            user_visible: false,
            suppressed: false,
            status: FarmStatus {
                loading: true,
                updating: false,
                init: false,
            },
            applied_seq: 0,
        };
        self.apply_storage(&mut farm, raw, now);
        Some(farm)
    }

    /// Re-read economic parameters and lifecycle flags from storage.
    ///
    /// A classification errant flag survives unless configuration marks the
    /// farm errant for another reason; the engine clears it after a
    /// successful re-initialisation.
    pub fn apply_storage(&self, farm: &mut Farm, raw: &RawFarm, now: DateTime<Utc>) {
        let reward_decimals = farm.reward_token.as_ref().map_or(0, |r| r.decimals());
        farm.reward_supply = u256_to_decimal(raw.reward_supply, reward_decimals).unwrap_or(Decimal::ZERO);
        farm.reward_per_sec = u256_to_decimal(raw.reward_per_sec, reward_decimals).unwrap_or(Decimal::ZERO);
        farm.start_time = raw.start_time;
        farm.end_time = raw.end_time;
        farm.lock_duration = raw.lock_duration;
        farm.duration_secs = raw.duration_secs();
        farm.bonuses = raw.bonuses();

        let retained = match &farm.flags.errant {
            Some(reason @ ErrantReason::Classification(_)) => Some(reason.clone()),
            _ => None,
        };
        farm.flags = FarmFlags {
            started: raw.start_time < now,
            ended: raw.end_time < now || (!raw.reward_supply.is_zero() && raw.reward_paid >= raw.reward_supply),
            flash_farm: raw.duration_secs() <= self.flash_max_duration_secs,
            errant: self.configured_errant(&farm.id, raw).or(retained),
        };
        farm.suppressed = (farm.flags.ended || farm.flags.is_errant()) && raw.pool_balance.is_zero();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::BadgeLists;
    use crate::types::{RawTokenRef, U256};
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_660_000_000, 0).unwrap()
    }

    fn raw(start: i64, end: i64) -> RawFarm {
        RawFarm {
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
            reward_supply: U256::from(1_000u64),
            reward_per_sec: U256::from(1u64),
            reward_paid: U256::zero(),
            pool_balance: U256::from(10u64),
            acc_reward_per_share: U256::zero(),
            start_time: now() + Duration::seconds(start),
            end_time: now() + Duration::seconds(end),
            last_reward_time: None,
            lock_duration: 0,
            bonuses: vec![],
            owner: None,
        }
    }

    fn curator() -> FarmCurator {
        let curation = Curation {
            excluded_farms: vec!["13".to_string()],
            errant_farms: vec!["75".to_string()],
            badges: BadgeLists {
                core: vec!["1".to_string()],
                verified: vec!["1".to_string(), "2".to_string()],
                ..Default::default()
            },
        };
        FarmCurator::new(&curation, &Valuation::default())
    }

    #[test]
    fn excluded_farms_are_never_built() {
        assert!(curator().build_farm("13", "KT1Farm", &raw(-10, 1_000_000), now()).is_none());
        assert!(curator().build_farm("14", "KT1Farm", &raw(-10, 1_000_000), now()).is_some());
    }

    #[test]
    fn lifecycle_flags() {
        let c = curator();
        let pending = c.build_farm("1", "KT1Farm", &raw(100, 1_000_000), now()).unwrap();
        assert!(!pending.flags.started);
        assert!(!pending.flags.flash_farm);
        assert!(pending.badges.core && pending.badges.verified && !pending.badges.partner);

        let flash = c.build_farm("2", "KT1Farm", &raw(-10, 3_600), now()).unwrap();
        assert!(flash.flags.flash_farm);
        assert!(flash.flags.started && !flash.flags.ended);

        let ended = c.build_farm("3", "KT1Farm", &raw(-1_000_000, -10), now()).unwrap();
        assert!(ended.flags.ended);
        assert!(!ended.suppressed, "still has stake");
    }

    #[test]
    fn fully_paid_farm_counts_as_ended() {
        let mut r = raw(-10, 1_000_000);
        r.reward_paid = r.reward_supply;
        let farm = curator().build_farm("4", "KT1Farm", &r, now()).unwrap();
        assert!(farm.flags.ended);
    }

    #[test]
    fn errant_sources_and_suppression() {
        let c = curator();
        let mut r = raw(-10, 1_000_000);
        r.pool_balance = U256::zero();
        let curated = c.build_farm("75", "KT1Farm", &r, now()).unwrap();
        assert_eq!(curated.flags.errant, Some(ErrantReason::Curated));
        assert!(curated.suppressed);

        let mut zero_rate = raw(-10, 1_000_000);
        zero_rate.reward_per_sec = U256::zero();
        let farm = c.build_farm("5", "KT1Farm", &zero_rate, now()).unwrap();
        assert_eq!(farm.flags.errant, Some(ErrantReason::ZeroRewardRate));
        assert!(!farm.suppressed);
    }

    #[test]
    fn classification_errant_survives_storage_refresh() {
        let c = curator();
        let r = raw(-10, 1_000_000);
        let mut farm = c.build_farm("6", "KT1Farm", &r, now()).unwrap();
        farm.flags.errant = Some(ErrantReason::Classification("bad storage".to_string()));
        c.apply_storage(&mut farm, &r, now());
        assert!(matches!(farm.flags.errant, Some(ErrantReason::Classification(_))));
    }
}

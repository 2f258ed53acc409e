// src/rewards.rs
//
// Off-chain reproduction of the farm contract's reward-per-share accounting.
// All accumulator math runs on raw 256-bit integers with floor division;
// conversion to display units happens last.

use crate::errors::{FarmError, FarmResult};
use crate::settings::Rewards;
use crate::types::conversions::{parse_u256, u256_to_decimal};
use crate::types::{Bonus, RawFarm, UserRecord, U256};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// 1 + sum of increments whose bonus window is still open at `now`.
pub fn multiplier_at(bonuses: &[Bonus], now: DateTime<Utc>) -> u64 {
    bonuses
        .iter()
        .filter(|b| b.end_time > now)
        .fold(1u64, |acc, b| acc.saturating_add(b.increment))
}

/// Seconds in `[from, to)` weighted by the multiplier in force at each second.
pub fn weighted_seconds(bonuses: &[Bonus], from: DateTime<Utc>, to: DateTime<Utc>) -> U256 {
    if to <= from {
        return U256::zero();
    }
    let mut cuts: Vec<DateTime<Utc>> = bonuses
        .iter()
        .map(|b| b.end_time)
        .filter(|t| *t > from && *t < to)
        .collect();
    cuts.sort();
    cuts.dedup();
    cuts.push(to);

    let mut total = U256::zero();
    let mut cursor = from;
    for cut in cuts {
        let secs = (cut - cursor).num_seconds().max(0) as u64;
        let weight = multiplier_at(bonuses, cursor);
        total = total.saturating_add(U256::from(secs).saturating_mul(U256::from(weight)));
        cursor = cut;
    }
    total
}

/// Reward emitted by the farm since its last on-chain update, capped by what is left to pay.
pub fn farm_reward_between(farm: &RawFarm, now: DateTime<Utc>) -> U256 {
    let from = farm
        .last_reward_time
        .map_or(farm.start_time, |t| t.max(farm.start_time));
    let to = now.min(farm.end_time);
    let emitted = farm
        .reward_per_sec
        .saturating_mul(weighted_seconds(&farm.bonuses(), from, to));
    let remaining = farm.reward_supply.saturating_sub(farm.reward_paid);
    emitted.min(remaining)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewardCalculator {
    precision: U256,
}

impl Default for RewardCalculator {
    fn default() -> Self {
        Self {
            precision: U256::exp10(12),
        }
    }
}

impl RewardCalculator {
    pub fn new(precision: U256) -> FarmResult<Self> {
        if precision.is_zero() {
            return Err(FarmError::InvalidPayload(
                "accumulator precision must be positive".to_string(),
            ));
        }
        Ok(Self { precision })
    }

    pub fn from_settings(rewards: &Rewards) -> FarmResult<Self> {
        Self::new(parse_u256(&rewards.acc_precision)?)
    }

    pub fn precision(&self) -> U256 {
        self.precision
    }

    /// accRewardPerShare advanced to `now`; unchanged while nothing is staked.
    pub fn current_acc_per_share(&self, farm: &RawFarm, now: DateTime<Utc>) -> U256 {
        if farm.pool_balance.is_zero() {
            return farm.acc_reward_per_share;
        }
        let reward = farm_reward_between(farm, now);
        let increase = reward.saturating_mul(self.precision) / farm.pool_balance;
        farm.acc_reward_per_share.saturating_add(increase)
    }

    /// amount x acc / precision
    fn accrued(&self, amount: U256, acc: U256) -> U256 {
        amount.saturating_mul(acc) / self.precision
    }

    /// Raw pending reward for a stake against an accumulator value.
    pub fn pending_raw(&self, user: &UserRecord, acc: U256) -> U256 {
        if user.amount.is_zero() {
            return U256::zero();
        }
        self.accrued(user.amount, acc)
            .saturating_sub(user.reward_debt)
            .saturating_add(user.carried)
    }

    /// Pending reward in whole reward-token units.
    pub fn pending_reward(
        &self,
        farm: &RawFarm,
        user: &UserRecord,
        now: DateTime<Utc>,
        reward_decimals: u32,
    ) -> FarmResult<Decimal> {
        let acc = self.current_acc_per_share(farm, now);
        Ok(u256_to_decimal(self.pending_raw(user, acc), reward_decimals)?)
    }

    /// Checkpoint the stake as if a harvest settled at `now`.
    pub fn apply_harvest(&self, farm: &RawFarm, user: &mut UserRecord, now: DateTime<Utc>) {
        let acc = self.current_acc_per_share(farm, now);
        user.reward_debt = self.accrued(user.amount, acc);
        user.carried = U256::zero();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RawBonus, RawTokenRef};
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_650_000_000 + secs, 0).unwrap()
    }

    fn token(address: &str) -> RawTokenRef {
        RawTokenRef {
            address: address.to_string(),
            token_id: 0,
            token_type: None,
        }
    }

    fn farm() -> RawFarm {
        RawFarm {
            pool_token: token("KT1Pool"),
            reward_token: token("KT1Reward"),
            reward_supply: U256::from(10_000_000u64),
            reward_per_sec: U256::from(10u64),
            reward_paid: U256::zero(),
            pool_balance: U256::from(1_000u64),
            acc_reward_per_share: U256::zero(),
            start_time: t(0),
            end_time: t(100_000),
            last_reward_time: Some(t(0)),
            lock_duration: 0,
            bonuses: vec![RawBonus {
                end_time: t(100),
                multiplier: 2,
            }],
            owner: None,
        }
    }

    fn stake(amount: u64) -> UserRecord {
        UserRecord {
            amount: U256::from(amount),
            ..Default::default()
        }
    }

    #[test]
    fn multiplier_steps_down_and_settles_at_one() {
        let bonuses = vec![
            Bonus { end_time: t(100), increment: 2 },
            Bonus { end_time: t(200), increment: 1 },
        ];
        assert_eq!(multiplier_at(&bonuses, t(0)), 4);
        assert_eq!(multiplier_at(&bonuses, t(100)), 2);
        assert_eq!(multiplier_at(&bonuses, t(150)), 2);
        assert_eq!(multiplier_at(&bonuses, t(200)), 1);
        assert_eq!(multiplier_at(&bonuses, t(10_000)), 1);

        let mut last = u64::MAX;
        for s in (0..300).step_by(7) {
            let m = multiplier_at(&bonuses, t(s));
            assert!(m <= last, "multiplier rose at t+{}", s);
            last = m;
        }
    }

    #[test]
    fn weighted_seconds_integrates_bonus_windows() {
        let bonuses = farm().bonuses();
        // 100s at x3 then 50s at x1
        assert_eq!(weighted_seconds(&bonuses, t(0), t(150)), U256::from(350u64));
        assert_eq!(weighted_seconds(&bonuses, t(150), t(150)), U256::zero());
        assert_eq!(weighted_seconds(&bonuses, t(200), t(100)), U256::zero());
    }

    #[test]
    fn emission_stops_at_end_time_and_supply() {
        let mut f = farm();
        f.end_time = t(150);
        assert_eq!(farm_reward_between(&f, t(10_000)), U256::from(3_500u64));

        f.reward_paid = U256::from(9_999_000u64);
        assert_eq!(farm_reward_between(&f, t(10_000)), U256::from(1_000u64));
    }

    #[test]
    fn pending_reward_accrues_monotonically() {
        let calc = RewardCalculator::default();
        let f = farm();
        let user = stake(100);
        let mut last = Decimal::ZERO;
        for s in (0..1_000).step_by(13) {
            let pending = calc.pending_reward(&f, &user, t(s), 0).unwrap();
            assert!(pending >= last, "pending went backwards at t+{}", s);
            last = pending;
        }
        // 100 of 1000 staked: a tenth of 10/s x (100s x3 + 150s x1)
        assert_eq!(calc.pending_reward(&f, &user, t(250), 0).unwrap(), Decimal::from(450));
    }

    #[test]
    fn harvest_resets_then_accrues_again() {
        let calc = RewardCalculator::default();
        let f = farm();
        let mut user = stake(100);
        user.carried = U256::from(7u64);
        calc.apply_harvest(&f, &mut user, t(500));
        assert_eq!(calc.pending_reward(&f, &user, t(500), 0).unwrap(), Decimal::ZERO);
        assert!(calc.pending_reward(&f, &user, t(600), 0).unwrap() > Decimal::ZERO);
    }

    #[test]
    fn empty_pool_and_empty_stake() {
        let calc = RewardCalculator::default();
        let mut f = farm();
        f.pool_balance = U256::zero();
        f.acc_reward_per_share = U256::from(5u64);
        assert_eq!(calc.current_acc_per_share(&f, t(1_000)), U256::from(5u64));

        let f = farm();
        assert_eq!(calc.pending_reward(&f, &stake(0), t(1_000), 6).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn precision_comes_from_settings() {
        let calc = RewardCalculator::from_settings(&Rewards {
            acc_precision: "1000000".to_string(),
        })
        .unwrap();
        assert_eq!(calc.precision(), U256::from(1_000_000u64));
        assert!(RewardCalculator::from_settings(&Rewards {
            acc_precision: "0".to_string(),
        })
        .is_err());
        assert_eq!(RewardCalculator::default().precision(), U256::exp10(12));
    }
}

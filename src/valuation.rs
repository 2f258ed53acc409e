// src/valuation.rs

use crate::pools::{LbPoolState, PoolToken, ProtocolVariant};
use crate::price_index::PriceIndex;
use crate::rewards::multiplier_at;
use crate::types::conversions::u256_to_decimal;
use crate::types::{Bonus, Estimate, RewardToken, U256};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

const SECONDS_PER_DAY: u32 = 86_400;
const DAYS_PER_YEAR: u32 = 365;

/// Figures one valuation pass writes back onto a farm.
#[derive(Debug, Clone, PartialEq)]
pub struct Valuation {
    pub tvl_tez: Estimate,
    pub apr: Estimate,
    pub multiplier: u64,
    /// Staked amount in whole pool-token units
    pub pool_balance: Decimal,
}

/// Value of the staked amount in tez.
///
/// Paired LPs value the staked share of the tez-equivalent reserve twice
/// (both legs), single tokens go through the price index, and Liquidity
/// Baking reads the dex reserve directly. Anything that would divide by
/// zero or lacks its reserve comes back `Unknown`.
pub fn tvl_tez(
    pool: &PoolToken,
    pool_balance: U256,
    prices: &PriceIndex,
    lb: Option<&LbPoolState>,
) -> Estimate {
    match pool.variant {
        ProtocolVariant::LiquidityBaking => lb.map_or(Estimate::Unknown, |state| {
            liquidity_baking_tvl(pool_balance, state)
        }),
        ProtocolVariant::SingleToken | ProtocolVariant::PlentyTez => {
            single_token_tvl(pool, pool_balance, prices)
        }
        _ => paired_tvl(pool, pool_balance),
    }
}

fn paired_tvl(pool: &PoolToken, pool_balance: U256) -> Estimate {
    let pair = match &pool.pair {
        Some(pair) => pair,
        None => return Estimate::Unknown,
    };
    let tez_pool = match pair.tez_pool {
        Some(t) => t,
        None => return Estimate::Unknown,
    };
    if pair.total_supply.is_zero() {
        return Estimate::Unknown;
    }
    let staked = match u256_to_decimal(pool_balance, pool.decimals) {
        Ok(v) => v,
        Err(_) => return Estimate::Unknown,
    };
    Decimal::TWO
        .checked_mul(staked)
        .and_then(|v| v.checked_mul(tez_pool))
        .and_then(|v| v.checked_div(pair.total_supply))
        .map_or(Estimate::Unknown, Estimate::Known)
}

fn single_token_tvl(pool: &PoolToken, pool_balance: U256, prices: &PriceIndex) -> Estimate {
    let price = match prices.price(&pool.key()) {
        Some(p) => p,
        None => return Estimate::Known(Decimal::ZERO),
    };
    u256_to_decimal(pool_balance, pool.decimals)
        .ok()
        .and_then(|staked| staked.checked_mul(price))
        .map_or(Estimate::Unknown, Estimate::Known)
}

fn liquidity_baking_tvl(pool_balance: U256, state: &LbPoolState) -> Estimate {
    if state.lqt_total.is_zero() {
        return Estimate::Unknown;
    }
    u256_to_decimal(pool_balance, 0)
        .ok()
        .and_then(|staked| staked.checked_mul(state.tez_reserve))
        .and_then(|v| v.checked_div(state.lqt_total))
        .and_then(|v| v.checked_mul(Decimal::TWO))
        .map_or(Estimate::Unknown, Estimate::Known)
}

/// Yearly percentage return at the current emission rate.
///
/// Unknown unless TVL is known and positive and the reward token is priced.
pub fn apr(
    reward_per_sec: U256,
    multiplier: u64,
    reward: &RewardToken,
    reward_price: Option<Decimal>,
    tvl: Estimate,
) -> Estimate {
    let tvl = match tvl.known() {
        Some(v) if v > Decimal::ZERO => v,
        _ => return Estimate::Unknown,
    };
    let price = match reward_price {
        Some(p) => p,
        None => return Estimate::Unknown,
    };
    u256_to_decimal(reward_per_sec, reward.decimals())
        .ok()
        .and_then(|rate| rate.checked_mul(Decimal::from(multiplier)))
        .and_then(|v| v.checked_mul(Decimal::from(SECONDS_PER_DAY)))
        .and_then(|per_day| per_day.checked_mul(Decimal::from(DAYS_PER_YEAR)))
        .and_then(|v| v.checked_mul(price))
        .and_then(|v| v.checked_div(tvl))
        .and_then(|v| v.checked_mul(Decimal::ONE_HUNDRED))
        .map_or(Estimate::Unknown, Estimate::Known)
}

/// Everything a valuation pass reads for one farm.
pub struct ValuationInput<'a> {
    pub pool: &'a PoolToken,
    pub reward: &'a RewardToken,
    pub pool_balance: U256,
    pub reward_per_sec: U256,
    pub bonuses: &'a [Bonus],
    pub prices: &'a PriceIndex,
    pub lb: Option<&'a LbPoolState>,
    pub now: DateTime<Utc>,
}

pub fn value_farm(input: &ValuationInput<'_>) -> Valuation {
    let multiplier = multiplier_at(input.bonuses, input.now);
    let tvl = tvl_tez(input.pool, input.pool_balance, input.prices, input.lb);
    let apr = apr(
        input.reward_per_sec,
        multiplier,
        input.reward,
        input.prices.price(&input.reward.key()),
        tvl,
    );
    Valuation {
        tvl_tez: tvl,
        apr,
        multiplier,
        pool_balance: u256_to_decimal(input.pool_balance, input.pool.decimals)
            .unwrap_or(Decimal::ZERO),
    }
}

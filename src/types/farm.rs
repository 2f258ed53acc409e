use crate::pools::PoolToken;
use crate::types::conversions::{u256_string, u64_string, U256};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Address of the native tez "token" inside pool and price records.
pub const TEZ_ADDRESS: &str = "tez";

/// Decimals of the native tez unit (mutez).
pub const TEZ_DECIMALS: u32 = 6;

/// `address:tokenId` key for price and metadata lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenKey {
    pub address: String,
    pub token_id: u64,
}

impl TokenKey {
    pub fn new(address: impl Into<String>, token_id: u64) -> Self {
        Self {
            address: address.into(),
            token_id,
        }
    }

    pub fn tez() -> Self {
        Self::new(TEZ_ADDRESS, 0)
    }

    pub fn is_tez(&self) -> bool {
        self.address == TEZ_ADDRESS
    }

    /// Parse the `address_tokenId` form used by the token price feed.
    pub fn from_feed_id(raw: &str) -> Option<Self> {
        let (address, id) = raw.rsplit_once('_')?;
        let token_id = id.parse().ok()?;
        if address.is_empty() {
            return None;
        }
        Some(Self::new(address, token_id))
    }
}

impl fmt::Display for TokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.token_id)
    }
}

/// Display metadata for a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenMeta {
    pub token_address: String,
    pub token_id: u64,
    pub name: String,
    pub symbol: String,
    pub decimals: u32,
    #[serde(default)]
    pub thumbnail_uri: Option<String>,
}

impl TokenMeta {
    pub fn key(&self) -> TokenKey {
        TokenKey::new(self.token_address.clone(), self.token_id)
    }

    pub fn tez() -> Self {
        Self {
            token_address: TEZ_ADDRESS.to_string(),
            token_id: 0,
            name: "Tezos".to_string(),
            symbol: "XTZ".to_string(),
            decimals: TEZ_DECIMALS,
            thumbnail_uri: None,
        }
    }
}

/// Reward token descriptor; raw supply and rate are scaled by `decimals`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardToken {
    pub meta: TokenMeta,
}

impl RewardToken {
    pub fn decimals(&self) -> u32 {
        self.meta.decimals
    }

    pub fn key(&self) -> TokenKey {
        self.meta.key()
    }
}

/// Token reference as stored in the farm contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTokenRef {
    pub address: String,
    #[serde(with = "u64_string", default)]
    pub token_id: u64,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl RawTokenRef {
    pub fn key(&self) -> TokenKey {
        TokenKey::new(self.address.clone(), self.token_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBonus {
    pub end_time: DateTime<Utc>,
    #[serde(with = "u64_string")]
    pub multiplier: u64,
}

/// One step of the bonus schedule: `increment` applies while `now < end_time`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bonus {
    pub end_time: DateTime<Utc>,
    pub increment: u64,
}

impl From<&RawBonus> for Bonus {
    fn from(raw: &RawBonus) -> Self {
        Self {
            end_time: raw.end_time,
            increment: raw.multiplier,
        }
    }
}

/// Farm record as it sits in the farm contract's `farms` big map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFarm {
    pub pool_token: RawTokenRef,
    pub reward_token: RawTokenRef,
    #[serde(with = "u256_string")]
    pub reward_supply: U256,
    #[serde(with = "u256_string")]
    pub reward_per_sec: U256,
    #[serde(with = "u256_string", default)]
    pub reward_paid: U256,
    #[serde(with = "u256_string", default)]
    pub pool_balance: U256,
    #[serde(with = "u256_string", default)]
    pub acc_reward_per_share: U256,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub last_reward_time: Option<DateTime<Utc>>,
    #[serde(with = "u64_string", default)]
    pub lock_duration: u64,
    #[serde(default)]
    pub bonuses: Vec<RawBonus>,
    #[serde(default)]
    pub owner: Option<String>,
}

impl RawFarm {
    pub fn bonuses(&self) -> Vec<Bonus> {
        self.bonuses.iter().map(Bonus::from).collect()
    }

    pub fn duration_secs(&self) -> i64 {
        (self.end_time - self.start_time).num_seconds().max(0)
    }
}

/// A wallet's stake record for one farm.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserRecord {
    pub amount: U256,
    /// amount x accRewardPerShare / precision at the last interaction
    pub reward_debt: U256,
    /// Reward already owed but not yet paid out.
    pub carried: U256,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawUserRecord {
    #[serde(with = "u256_string", default)]
    pub amount: U256,
    #[serde(with = "u256_string", default)]
    pub reward_debt: U256,
    #[serde(with = "u256_string", default)]
    pub pending_reward: U256,
}

impl From<RawUserRecord> for UserRecord {
    fn from(raw: RawUserRecord) -> Self {
        Self {
            amount: raw.amount,
            reward_debt: raw.reward_debt,
            carried: raw.pending_reward,
        }
    }
}

/// A valuation figure that may be unknown (missing price, zero supply).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Estimate {
    #[default]
    Unknown,
    Known(Decimal),
}

impl Estimate {
    pub fn known(&self) -> Option<Decimal> {
        match self {
            Estimate::Known(v) => Some(*v),
            Estimate::Unknown => None,
        }
    }

    pub fn value_or_zero(&self) -> Decimal {
        self.known().unwrap_or(Decimal::ZERO)
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Estimate::Known(_))
    }
}

impl fmt::Display for Estimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Estimate::Known(v) => write!(f, "{}", v.round_dp(2)),
            Estimate::Unknown => write!(f, "~"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrantReason {
    /// Listed as errant in curation config.
    Curated,
    /// Reward rate is zero.
    ZeroRewardRate,
    /// Pool storage could not be classified; retried next pass.
    Classification(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FarmFlags {
    pub started: bool,
    pub ended: bool,
    pub flash_farm: bool,
    pub errant: Option<ErrantReason>,
}

impl FarmFlags {
    pub fn is_errant(&self) -> bool {
        self.errant.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Badges {
    pub verified: bool,
    pub core: bool,
    pub partner: bool,
    pub lp_locked: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FarmStatus {
    pub loading: bool,
    pub updating: bool,
    pub init: bool,
}

/// Canonical farm record exposed to consumers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Farm {
    pub id: String,
    pub contract: String,
    pub pool_token_ref: TokenKey,
    pub reward_token_ref: TokenKey,
    /// Set once by the normalizer; the protocol variant never changes afterwards.
    pub pool_token: Option<PoolToken>,
    pub reward_token: Option<RewardToken>,
    pub reward_supply: Decimal,
    pub reward_per_sec: Decimal,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub lock_duration: u64,
    pub duration_secs: i64,
    pub bonuses: Vec<Bonus>,
    pub pool_balance: Decimal,
    pub tvl_tez: Estimate,
    pub apr: Estimate,
    pub multiplier: u64,
    pub deposit_amount: Decimal,
    pub rewards_earned: Decimal,
    pub flags: FarmFlags,
    pub badges: Badges,
    pub visible: bool,
    pub user_visible: bool,
    /// Ended or errant with nothing staked; never shown.
    pub suppressed: bool,
    pub status: FarmStatus,
    #[serde(skip)]
    pub(crate) applied_seq: u64,
}

impl Farm {
    pub fn is_initialized(&self) -> bool {
        self.pool_token.is_some() && self.reward_token.is_some()
    }

    pub fn pool_symbol(&self) -> Option<&str> {
        self.pool_token.as_ref().map(|p| p.symbol.as_str())
    }

    pub fn reward_symbol(&self) -> Option<&str> {
        self.reward_token.as_ref().map(|r| r.meta.symbol.as_str())
    }

    pub fn is_staked(&self) -> bool {
        self.deposit_amount > Decimal::ZERO
    }
}

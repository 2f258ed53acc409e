pub mod conversions;
pub mod farm;

pub use conversions::U256;
pub use farm::{
    Badges, Bonus, ErrantReason, Estimate, Farm, FarmFlags, FarmStatus, RawBonus, RawFarm,
    RawTokenRef, RewardToken, TokenKey, TokenMeta, UserRecord, TEZ_ADDRESS, TEZ_DECIMALS,
};

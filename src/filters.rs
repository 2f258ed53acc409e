// Farm Filter Engine - multi-criteria visibility over canonical farms
// Tags OR within a group, groups AND together, keyword applies on top.

use crate::settings::Settings;
use crate::types::Farm;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterTag {
    Farm,
    Garden,
    Flash,
    Staked,
    Pending,
    Running,
    Ended,
    Verified,
    Core,
    Partner,
    LpLocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterGroup {
    Type,
    Staked,
    Status,
    Badge,
}

pub const FILTER_GROUPS: [FilterGroup; 4] = [
    FilterGroup::Type,
    FilterGroup::Staked,
    FilterGroup::Status,
    FilterGroup::Badge,
];

impl FilterTag {
    pub fn group(&self) -> FilterGroup {
        match self {
            FilterTag::Farm | FilterTag::Garden | FilterTag::Flash => FilterGroup::Type,
            FilterTag::Staked => FilterGroup::Staked,
            FilterTag::Pending | FilterTag::Running | FilterTag::Ended => FilterGroup::Status,
            FilterTag::Verified | FilterTag::Core | FilterTag::Partner | FilterTag::LpLocked => {
                FilterGroup::Badge
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterTag::Farm => "farm",
            FilterTag::Garden => "garden",
            FilterTag::Flash => "flash",
            FilterTag::Staked => "staked",
            FilterTag::Pending => "pending",
            FilterTag::Running => "running",
            FilterTag::Ended => "ended",
            FilterTag::Verified => "verified",
            FilterTag::Core => "core",
            FilterTag::Partner => "partner",
            FilterTag::LpLocked => "lpLocked",
        }
    }
}

impl fmt::Display for FilterTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "farm" => Ok(FilterTag::Farm),
            "garden" => Ok(FilterTag::Garden),
            "flash" => Ok(FilterTag::Flash),
            "staked" => Ok(FilterTag::Staked),
            "pending" => Ok(FilterTag::Pending),
            "running" => Ok(FilterTag::Running),
            "ended" => Ok(FilterTag::Ended),
            "verified" => Ok(FilterTag::Verified),
            "core" => Ok(FilterTag::Core),
            "partner" => Ok(FilterTag::Partner),
            "lplocked" | "lp_locked" => Ok(FilterTag::LpLocked),
            other => Err(format!("unknown filter tag `{}`", other)),
        }
    }
}

/// Which farm list a predicate is evaluated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterScope {
    /// The public farm list; the staked group does not apply.
    All,
    /// "My farms" for the connected wallet; the staked group applies here.
    User,
}

/// Active tags plus an optional keyword.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSet {
    pub tags: BTreeSet<FilterTag>,
    pub keyword: Option<String>,
}

impl FilterSet {
    pub fn new(tags: impl IntoIterator<Item = FilterTag>, keyword: Option<&str>) -> Self {
        let keyword = keyword
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty());
        Self {
            tags: tags.into_iter().collect(),
            keyword,
        }
    }

    fn active_in(&self, group: FilterGroup) -> impl Iterator<Item = &FilterTag> {
        self.tags.iter().filter(move |t| t.group() == group)
    }
}

/// Thresholds the predicate needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterConfig {
    pub farm_tvl_threshold: Decimal,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            farm_tvl_threshold: Decimal::from(10_000),
        }
    }
}

impl FilterConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            farm_tvl_threshold: Decimal::from(settings.valuation.farm_tvl_threshold),
        }
    }

    pub fn tag_matches(&self, tag: FilterTag, farm: &Farm) -> bool {
        let tvl = farm.tvl_tez.value_or_zero();
        let flash = farm.flags.flash_farm;
        let core = farm.badges.core;
        match tag {
            FilterTag::Flash => flash,
            FilterTag::Farm => !flash && (tvl >= self.farm_tvl_threshold || core),
            FilterTag::Garden => !flash && (tvl < self.farm_tvl_threshold || core),
            FilterTag::Staked => farm.is_staked(),
            FilterTag::Pending => !farm.flags.started,
            FilterTag::Running => farm.flags.started && !farm.flags.ended,
            FilterTag::Ended => farm.flags.ended,
            FilterTag::Verified => farm.badges.verified,
            FilterTag::Core => core,
            FilterTag::Partner => farm.badges.partner,
            FilterTag::LpLocked => farm.badges.lp_locked,
        }
    }

    pub fn keyword_matches(keyword: &str, farm: &Farm) -> bool {
        let mut haystacks: Vec<&str> = Vec::with_capacity(4);
        if let Some(pool) = &farm.pool_token {
            haystacks.push(&pool.name);
            haystacks.push(&pool.symbol);
        }
        if let Some(reward) = &farm.reward_token {
            haystacks.push(&reward.meta.name);
            haystacks.push(&reward.meta.symbol);
        }
        haystacks
            .iter()
            .any(|h| h.to_lowercase().contains(keyword))
    }

    /// Visibility of one farm under `filters`.
    pub fn is_visible(&self, farm: &Farm, filters: &FilterSet, scope: FilterScope) -> bool {
        if farm.suppressed {
            return false;
        }
        if let Some(keyword) = &filters.keyword {
            if !Self::keyword_matches(keyword, farm) {
                return false;
            }
        }
        FILTER_GROUPS.iter().all(|group| {
            if *group == FilterGroup::Staked && scope == FilterScope::All {
                return true;
            }
            let mut active = filters.active_in(*group).peekable();
            active.peek().is_none() || active.any(|tag| self.tag_matches(*tag, farm))
        })
    }
}

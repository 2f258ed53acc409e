// src/pools.rs

use crate::types::{TokenKey, TokenMeta};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;

/// AMM family a farm's staked token belongs to.
///
/// The variant decides which decimals divide LP supply and how reserves are
/// read. It is fixed for a farm once normalization succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ProtocolVariant {
    SingleToken,
    LiquidityBaking,
    QuipuswapV1,
    QuipuswapV2,
    QuipuswapStable,
    QuipuswapToken2Token,
    Spicy,
    Plenty,
    PlentyCtez,
    PlentyTez,
    PlentyStable,
}

/// Static per-protocol parameters.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolSpec {
    pub variant: ProtocolVariant,
    /// Decimals of the LP token; `None` means the token's own metadata decides.
    pub lp_decimals: Option<u32>,
    /// Whether the pool reports a tez-equivalent reserve usable for TVL.
    pub tracks_tez_pool: bool,
    /// Dex type string used by the pool feed.
    pub feed_name: Option<&'static str>,
}

pub const PROTOCOL_TABLE: &[ProtocolSpec] = &[
    ProtocolSpec {
        variant: ProtocolVariant::SingleToken,
        lp_decimals: None,
        tracks_tez_pool: false,
        feed_name: None,
    },
    ProtocolSpec {
        variant: ProtocolVariant::LiquidityBaking,
        lp_decimals: Some(0),
        tracks_tez_pool: true,
        feed_name: None,
    },
    ProtocolSpec {
        variant: ProtocolVariant::QuipuswapV1,
        lp_decimals: Some(6),
        tracks_tez_pool: true,
        feed_name: Some("quipuswap"),
    },
    ProtocolSpec {
        variant: ProtocolVariant::QuipuswapV2,
        lp_decimals: Some(6),
        tracks_tez_pool: true,
        feed_name: Some("quipuswap_v2"),
    },
    ProtocolSpec {
        variant: ProtocolVariant::QuipuswapStable,
        lp_decimals: Some(18),
        tracks_tez_pool: true,
        feed_name: Some("quipuswap_stable"),
    },
    ProtocolSpec {
        variant: ProtocolVariant::QuipuswapToken2Token,
        lp_decimals: Some(6),
        tracks_tez_pool: true,
        feed_name: Some("quipuswap_token2token"),
    },
    ProtocolSpec {
        variant: ProtocolVariant::Spicy,
        lp_decimals: Some(18),
        tracks_tez_pool: true,
        feed_name: Some("spicy"),
    },
    ProtocolSpec {
        variant: ProtocolVariant::Plenty,
        lp_decimals: Some(18),
        tracks_tez_pool: true,
        feed_name: Some("plenty"),
    },
    ProtocolSpec {
        variant: ProtocolVariant::PlentyCtez,
        lp_decimals: Some(6),
        tracks_tez_pool: true,
        feed_name: Some("plenty_ctez"),
    },
    ProtocolSpec {
        variant: ProtocolVariant::PlentyTez,
        lp_decimals: Some(18),
        tracks_tez_pool: false,
        feed_name: Some("plenty_tez"),
    },
    ProtocolSpec {
        variant: ProtocolVariant::PlentyStable,
        lp_decimals: Some(12),
        tracks_tez_pool: true,
        feed_name: Some("plenty_stable"),
    },
];

impl ProtocolVariant {
    pub fn spec(&self) -> &'static ProtocolSpec {
        PROTOCOL_TABLE
            .iter()
            .find(|s| s.variant == *self)
            .unwrap_or(&PROTOCOL_TABLE[0])
    }

    /// Fixed LP decimals, `None` for single tokens.
    pub fn lp_decimals(&self) -> Option<u32> {
        self.spec().lp_decimals
    }

    pub fn is_lp(&self) -> bool {
        !matches!(self, ProtocolVariant::SingleToken)
    }

    pub fn from_feed_name(name: &str) -> Option<Self> {
        PROTOCOL_TABLE
            .iter()
            .find(|s| s.feed_name == Some(name))
            .map(|s| s.variant)
    }
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProtocolVariant::SingleToken => "Single",
            ProtocolVariant::LiquidityBaking => "Liquidity Baking",
            ProtocolVariant::QuipuswapV1 => "Quipuswap",
            ProtocolVariant::QuipuswapV2 => "Quipuswap V2",
            ProtocolVariant::QuipuswapStable => "Quipuswap Stable",
            ProtocolVariant::QuipuswapToken2Token => "Quipuswap T2T",
            ProtocolVariant::Spicy => "SpicySwap",
            ProtocolVariant::Plenty => "Plenty",
            ProtocolVariant::PlentyCtez => "Plenty ctez",
            ProtocolVariant::PlentyTez => "Plenty tez",
            ProtocolVariant::PlentyStable => "Plenty Stable",
        };
        f.write_str(label)
    }
}

/// Both sides of an LP pool with their reserves.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LpPair {
    pub token1: TokenMeta,
    pub token2: TokenMeta,
    /// Raw reserves, in each token's base units
    pub token1_pool: Decimal,
    pub token2_pool: Decimal,
    /// LP supply scaled by the variant's decimals
    pub total_supply: Decimal,
    /// Tez-equivalent of one side of the pool, when it can be derived
    pub tez_pool: Option<Decimal>,
}

/// Reserve snapshot of the Liquidity Baking dex, fetched fresh each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LbPoolState {
    /// Tez reserve in whole tez
    pub tez_reserve: Decimal,
    /// Raw LP supply (LB liquidity token has no decimals)
    pub lqt_total: Decimal,
}

/// Canonical descriptor of the asset a farm stakes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolToken {
    pub variant: ProtocolVariant,
    pub token_address: String,
    pub token_id: u64,
    pub decimals: u32,
    pub name: String,
    pub symbol: String,
    pub thumbnail_uri: Option<String>,
    /// Present for LP variants (LB included once its dex storage is read)
    pub pair: Option<LpPair>,
}

impl PoolToken {
    pub fn key(&self) -> TokenKey {
        TokenKey::new(self.token_address.clone(), self.token_id)
    }

    pub fn single(meta: TokenMeta) -> Self {
        Self {
            variant: ProtocolVariant::SingleToken,
            token_address: meta.token_address,
            token_id: meta.token_id,
            decimals: meta.decimals,
            name: meta.name,
            symbol: meta.symbol,
            thumbnail_uri: meta.thumbnail_uri,
            pair: None,
        }
    }

    pub fn tez_pool(&self) -> Option<Decimal> {
        self.pair.as_ref().and_then(|p| p.tez_pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimals_table() {
        assert_eq!(ProtocolVariant::QuipuswapV1.lp_decimals(), Some(6));
        assert_eq!(ProtocolVariant::QuipuswapV2.lp_decimals(), Some(6));
        assert_eq!(ProtocolVariant::QuipuswapToken2Token.lp_decimals(), Some(6));
        assert_eq!(ProtocolVariant::QuipuswapStable.lp_decimals(), Some(18));
        assert_eq!(ProtocolVariant::Spicy.lp_decimals(), Some(18));
        assert_eq!(ProtocolVariant::Plenty.lp_decimals(), Some(18));
        assert_eq!(ProtocolVariant::PlentyCtez.lp_decimals(), Some(6));
        assert_eq!(ProtocolVariant::PlentyTez.lp_decimals(), Some(18));
        assert_eq!(ProtocolVariant::PlentyStable.lp_decimals(), Some(12));
        assert_eq!(ProtocolVariant::LiquidityBaking.lp_decimals(), Some(0));
        assert_eq!(ProtocolVariant::SingleToken.lp_decimals(), None);
    }

    #[test]
    fn every_variant_has_a_row() {
        for spec in PROTOCOL_TABLE {
            assert_eq!(spec.variant.spec().variant, spec.variant);
        }
        assert!(!ProtocolVariant::PlentyTez.spec().tracks_tez_pool);
    }

    #[test]
    fn feed_names_resolve() {
        assert_eq!(
            ProtocolVariant::from_feed_name("quipuswap_stable"),
            Some(ProtocolVariant::QuipuswapStable)
        );
        assert_eq!(
            ProtocolVariant::from_feed_name("plenty_ctez"),
            Some(ProtocolVariant::PlentyCtez)
        );
        assert_eq!(ProtocolVariant::from_feed_name("vortex"), None);
    }
}

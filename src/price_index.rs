// src/price_index.rs

use crate::data_sources::PriceOracle;
use crate::errors::{FarmError, FarmResult};
use crate::types::TokenKey;
use arc_swap::{ArcSwap, ArcSwapOption};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Tez price of one whole unit of each token, replaced as a whole on refresh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceIndex {
    prices: HashMap<TokenKey, Decimal>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl PriceIndex {
    /// Build from a feed map; the native tez entry is always 1.
    pub fn from_feed(mut prices: HashMap<TokenKey, Decimal>, at: DateTime<Utc>) -> Self {
        prices.retain(|_, p| *p >= Decimal::ZERO);
        prices.insert(TokenKey::tez(), Decimal::ONE);
        Self {
            prices,
            updated_at: Some(at),
        }
    }

    pub fn price(&self, key: &TokenKey) -> Option<Decimal> {
        if key.is_tez() {
            return Some(Decimal::ONE);
        }
        self.prices.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

/// Shared price snapshot with freshness bookkeeping.
#[derive(Clone)]
pub struct SharedPriceIndex {
    current: Arc<ArcSwap<PriceIndex>>,
    reference_usd: Arc<ArcSwapOption<Decimal>>,
    last_successful_update: Arc<AtomicI64>,
    consecutive_failures: Arc<AtomicU32>,
}

impl Default for SharedPriceIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedPriceIndex {
    pub fn new() -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(PriceIndex::default())),
            reference_usd: Arc::new(ArcSwapOption::empty()),
            last_successful_update: Arc::new(AtomicI64::new(0)),
            consecutive_failures: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn snapshot(&self) -> Arc<PriceIndex> {
        self.current.load_full()
    }

    pub fn get_price(&self, key: &TokenKey) -> Option<Decimal> {
        self.current.load().price(key)
    }

    pub fn replace(&self, index: PriceIndex) {
        self.current.store(Arc::new(index));
    }

    pub fn set_reference_usd(&self, price: Decimal) {
        self.reference_usd.store(Some(Arc::new(price)));
    }

    /// Tez price in USD, once the reference loop has run.
    pub fn reference_usd(&self) -> Option<Decimal> {
        self.reference_usd.load().as_deref().copied()
    }

    /// Healthy while failures stay under 3 and the last success is newer than `max_age_secs`.
    pub fn is_healthy(&self, now: DateTime<Utc>, max_age_secs: i64) -> bool {
        let failures = self.consecutive_failures.load(Ordering::Relaxed);
        let last_update = self.last_successful_update.load(Ordering::Relaxed);
        if last_update == 0 {
            return failures < 3;
        }
        let age = now.timestamp().saturating_sub(last_update);
        failures < 3 && age < max_age_secs
    }

    pub fn mark_success(&self, now: DateTime<Utc>) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.last_successful_update
            .store(now.timestamp(), Ordering::Relaxed);
    }

    pub fn mark_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }
}

/// Pull token prices from the oracle and swap in a new index.
pub async fn refresh_current_prices(
    oracle: &dyn PriceOracle,
    index: &SharedPriceIndex,
    now: DateTime<Utc>,
) -> FarmResult<usize> {
    let start = Instant::now();
    match oracle.current_prices().await {
        Ok(prices) if prices.is_empty() => {
            // An empty feed would wipe every price; keep the previous snapshot.
            let failures = index.mark_failure();
            warn!(
                "⚠️ [Prices] {} returned an empty feed (consecutive failures: {})",
                oracle.name(),
                failures
            );
            Err(FarmError::upstream(oracle.name(), "empty price feed"))
        }
        Ok(prices) => {
            let next = PriceIndex::from_feed(prices, now);
            let count = next.len();
            index.replace(next);
            index.mark_success(now);
            info!(
                "✅ [Prices] {} prices from {} in {:?}",
                count,
                oracle.name(),
                start.elapsed()
            );
            Ok(count)
        }
        Err(e) => {
            let failures = index.mark_failure();
            error!(
                "❌ [Prices] Update failed (consecutive failures: {}): {}",
                failures, e
            );
            if failures >= 3 {
                error!("🚨 Price index is unhealthy! Valuations may be stale.");
            }
            Err(e)
        }
    }
}

pub async fn refresh_reference_price(
    oracle: &dyn PriceOracle,
    index: &SharedPriceIndex,
) -> FarmResult<Decimal> {
    let price = oracle.reference_price().await?;
    if price <= Decimal::ZERO {
        return Err(FarmError::upstream(
            oracle.name(),
            format!("non-positive reference price {}", price),
        ));
    }
    index.set_reference_usd(price);
    info!("✅ [Prices] Reference XTZ/USD = {}", price);
    Ok(price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedOracle {
        prices: HashMap<TokenKey, Decimal>,
        fail: bool,
    }

    #[async_trait]
    impl PriceOracle for FixedOracle {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn reference_price(&self) -> FarmResult<Decimal> {
            Ok(Decimal::new(125, 2))
        }

        async fn current_prices(&self) -> FarmResult<HashMap<TokenKey, Decimal>> {
            if self.fail {
                return Err(FarmError::upstream("fixed", "down"));
            }
            Ok(self.prices.clone())
        }
    }

    #[test]
    fn tez_is_always_one() {
        let index = PriceIndex::from_feed(HashMap::new(), Utc::now());
        assert_eq!(index.price(&TokenKey::tez()), Some(Decimal::ONE));
        assert_eq!(PriceIndex::default().price(&TokenKey::tez()), Some(Decimal::ONE));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_snapshot() {
        let key = TokenKey::new("KT1Tok", 0);
        let mut prices = HashMap::new();
        prices.insert(key.clone(), Decimal::new(5, 1));
        let index = SharedPriceIndex::new();
        let now = Utc::now();

        let ok = FixedOracle {
            prices: prices.clone(),
            fail: false,
        };
        assert_eq!(refresh_current_prices(&ok, &index, now).await.unwrap(), 2);
        assert_eq!(index.get_price(&key), Some(Decimal::new(5, 1)));

        let down = FixedOracle {
            prices,
            fail: true,
        };
        assert!(refresh_current_prices(&down, &index, now).await.is_err());
        assert_eq!(index.get_price(&key), Some(Decimal::new(5, 1)));
        assert_eq!(index.consecutive_failures(), 1);
        assert!(index.is_healthy(now, 120));
    }

    #[tokio::test]
    async fn reference_price_is_stored() {
        let index = SharedPriceIndex::new();
        let oracle = FixedOracle {
            prices: HashMap::new(),
            fail: false,
        };
        assert_eq!(index.reference_usd(), None);
        refresh_reference_price(&oracle, &index).await.unwrap();
        assert_eq!(index.reference_usd(), Some(Decimal::new(125, 2)));
    }
}

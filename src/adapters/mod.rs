// HTTP Adapters Module
// Concrete implementations of the data source traits over public REST APIs

pub mod dex_indexer;
pub mod ipfs;
pub mod tzkt;

pub use dex_indexer::DexIndexerFeed;
pub use ipfs::IpfsGateway;
pub use tzkt::TzktIndexer;

use crate::data_sources::PriceOracle;
use crate::engine::Collaborators;
use crate::errors::{FarmError, FarmResult};
use crate::settings::Settings;
use crate::types::TokenKey;
use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::debug;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

type DefaultDirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// JSON GET client bound to one base URL, optionally rate limited.
pub struct JsonClient {
    origin: &'static str,
    base: Url,
    client: reqwest::Client,
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
}

impl JsonClient {
    pub fn new(
        origin: &'static str,
        base_url: &str,
        timeout: Duration,
        qps: Option<u32>,
    ) -> FarmResult<Self> {
        // `Url::join` drops the last segment unless the base ends with a slash.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base = Url::parse(&normalized)
            .map_err(|e| FarmError::InvalidPayload(format!("{} base url {}: {}", origin, base_url, e)))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FarmError::upstream(origin, e))?;
        let limiter = match qps.and_then(NonZeroU32::new) {
            Some(qps) => Some(Arc::new(RateLimiter::direct(Quota::per_second(qps)))),
            None => None,
        };
        Ok(Self {
            origin,
            base,
            client,
            limiter,
        })
    }

    pub fn url(&self, path: &str) -> FarmResult<Url> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| FarmError::InvalidPayload(format!("{} path {}: {}", self.origin, path, e)))
    }

    async fn send(&self, path: &str, query: &[(String, String)]) -> FarmResult<reqwest::Response> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
        let url = self.url(path)?;
        debug!("[{}] GET {}", self.origin, url);
        self.client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| FarmError::upstream(self.origin, e))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(String, String)]) -> FarmResult<T> {
        self.get_optional(path, query).await?.ok_or_else(|| {
            FarmError::upstream(self.origin, format!("empty response from {}", path))
        })
    }

    /// `None` on 204/404 (the indexer's way of saying "no such key").
    pub async fn get_optional<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> FarmResult<Option<T>> {
        let response = self.send(path, query).await?;
        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => return Ok(None),
            status if !status.is_success() => {
                return Err(FarmError::upstream(self.origin, format!("{} returned {}", path, status)));
            }
            _ => {}
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| FarmError::upstream(self.origin, e))?;
        if body.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| FarmError::InvalidPayload(format!("{} {}: {}", self.origin, path, e)))
    }
}

/// Reference price from the indexer's quotes, token prices from the pool feed.
pub struct SplitOracle {
    quotes: Arc<TzktIndexer>,
    feed: Arc<DexIndexerFeed>,
}

impl SplitOracle {
    pub fn new(quotes: Arc<TzktIndexer>, feed: Arc<DexIndexerFeed>) -> Self {
        Self { quotes, feed }
    }
}

#[async_trait]
impl PriceOracle for SplitOracle {
    fn name(&self) -> &'static str {
        "tzkt+dex_indexer"
    }

    async fn reference_price(&self) -> FarmResult<Decimal> {
        self.quotes.xtz_usd().await
    }

    async fn current_prices(&self) -> FarmResult<HashMap<TokenKey, Decimal>> {
        self.feed.token_prices().await
    }
}

/// Wire every HTTP adapter from settings.
pub fn http_collaborators(settings: &Settings) -> FarmResult<Collaborators> {
    let endpoints = &settings.endpoints;
    let timeout = Duration::from_millis(endpoints.request_timeout_ms);
    let indexer = Arc::new(TzktIndexer::new(
        &endpoints.indexer_url,
        timeout,
        endpoints.indexer_qps,
    )?);
    let feed = Arc::new(DexIndexerFeed::new(&endpoints.pool_feed_url, timeout)?);
    Ok(Collaborators {
        oracle: Arc::new(SplitOracle::new(Arc::clone(&indexer), Arc::clone(&feed))),
        indexer: indexer.clone(),
        pool_feed: feed,
        metadata: indexer,
        media: Arc::new(IpfsGateway::new(&endpoints.ipfs_gateway)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_paths_under_base_path() {
        let client = JsonClient::new("test", "https://example.org/api", Duration::from_secs(1), None).unwrap();
        assert_eq!(
            client.url("/v1/contracts/KT1/storage").unwrap().as_str(),
            "https://example.org/api/v1/contracts/KT1/storage"
        );
    }

    #[test]
    fn rejects_garbage_base_url() {
        assert!(JsonClient::new("test", "not a url", Duration::from_secs(1), Some(5)).is_err());
    }
}

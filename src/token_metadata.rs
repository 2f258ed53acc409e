use crate::data_sources::{MediaResolver, TokenMetadataService};
use crate::metrics;
use crate::settings::{MetadataOverride, Settings};
use crate::single_flight::SingleFlight;
use crate::types::{TokenKey, TokenMeta};
use dashmap::DashMap;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;

const PLACEHOLDER_LABEL: &str = "???";

/// Memoized address+id -> display metadata lookup.
///
/// Successful lookups are cached for the life of the resolver. Failures
/// yield a placeholder record and are not cached, so a later lookup
/// retries the metadata service.
pub struct TokenMetadataResolver {
    service: Arc<dyn TokenMetadataService>,
    media: Arc<dyn MediaResolver>,
    overrides: HashMap<TokenKey, MetadataOverride>,
    placeholder_thumbnail: String,
    memo: DashMap<TokenKey, TokenMeta>,
    in_flight: SingleFlight<TokenKey, TokenMeta>,
}

impl TokenMetadataResolver {
    pub fn new(
        service: Arc<dyn TokenMetadataService>,
        media: Arc<dyn MediaResolver>,
        settings: &Settings,
    ) -> Self {
        let overrides = settings
            .metadata_overrides
            .iter()
            .map(|o| (TokenKey::new(o.token_address.clone(), o.token_id), o.clone()))
            .collect();
        Self {
            service,
            media,
            overrides,
            placeholder_thumbnail: settings.endpoints.placeholder_thumbnail.clone(),
            memo: DashMap::new(),
            in_flight: SingleFlight::new(),
        }
    }

    /// Resolve display metadata; never fails.
    pub async fn resolve(&self, key: &TokenKey) -> TokenMeta {
        if key.is_tez() {
            return self.decorate(TokenMeta::tez());
        }
        if let Some(hit) = self.memo.get(key) {
            return hit.clone();
        }

        let service = Arc::clone(&self.service);
        let lookup_key = key.clone();
        let fetched = self
            .in_flight
            .run(key.clone(), move || async move { service.resolve(&lookup_key).await })
            .await;

        match fetched {
            Ok(mut meta) => {
                // The service may echo a different id format; keep the caller's key.
                meta.token_address = key.address.clone();
                meta.token_id = key.token_id;
                let meta = self.decorate(meta);
                self.memo.insert(key.clone(), meta.clone());
                meta
            }
            Err(e) => {
                warn!("⚠️ Metadata lookup failed for {}: {}", key, e);
                metrics::increment_metadata_fallbacks();
                self.placeholder(key)
            }
        }
    }

    /// Apply the override table and media rewrite to metadata from any source.
    pub fn decorate(&self, mut meta: TokenMeta) -> TokenMeta {
        if let Some(o) = self.overrides.get(&meta.key()) {
            debug!("Applying metadata override for {}", meta.key());
            if let Some(name) = &o.name {
                meta.name = name.clone();
            }
            if let Some(symbol) = &o.symbol {
                meta.symbol = symbol.clone();
            }
            if let Some(decimals) = o.decimals {
                meta.decimals = decimals;
            }
            if let Some(uri) = &o.thumbnail_uri {
                meta.thumbnail_uri = Some(uri.clone());
            }
        }
        meta.thumbnail_uri = meta
            .thumbnail_uri
            .as_deref()
            .map(|uri| self.media.rewrite_uri(uri));
        meta
    }

    pub fn placeholder(&self, key: &TokenKey) -> TokenMeta {
        self.decorate(TokenMeta {
            token_address: key.address.clone(),
            token_id: key.token_id,
            name: PLACEHOLDER_LABEL.to_string(),
            symbol: PLACEHOLDER_LABEL.to_string(),
            decimals: 0,
            thumbnail_uri: Some(self.placeholder_thumbnail.clone()),
        })
    }

    pub fn is_placeholder(meta: &TokenMeta) -> bool {
        meta.symbol == PLACEHOLDER_LABEL && meta.name == PLACEHOLDER_LABEL
    }

    pub fn cached_count(&self) -> usize {
        self.memo.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{FarmError, FarmResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingService {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl TokenMetadataService for CountingService {
        async fn resolve(&self, key: &TokenKey) -> FarmResult<TokenMeta> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(FarmError::Metadata {
                    token: key.to_string(),
                    message: "not found".to_string(),
                });
            }
            Ok(TokenMeta {
                token_address: key.address.clone(),
                token_id: key.token_id,
                name: "Crunchy".to_string(),
                symbol: "CRNCHY".to_string(),
                decimals: 8,
                thumbnail_uri: Some("ipfs://QmLogo".to_string()),
            })
        }
    }

    struct Gateway;

    impl MediaResolver for Gateway {
        fn rewrite_uri(&self, uri: &str) -> String {
            uri.replace("ipfs://", "https://gw/ipfs/")
        }
    }

    fn resolver(fail: bool, settings: &Settings) -> (TokenMetadataResolver, Arc<CountingService>) {
        let service = Arc::new(CountingService {
            calls: AtomicUsize::new(0),
            fail,
        });
        let r = TokenMetadataResolver::new(service.clone(), Arc::new(Gateway), settings);
        (r, service)
    }

    #[tokio::test]
    async fn memoizes_per_key() {
        let (r, service) = resolver(false, &Settings::default());
        let key = TokenKey::new("KT1Crunch", 0);
        let a = r.resolve(&key).await;
        let b = r.resolve(&key).await;
        assert_eq!(a, b);
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.thumbnail_uri.as_deref(), Some("https://gw/ipfs/QmLogo"));
    }

    #[tokio::test]
    async fn failure_yields_placeholder_and_retries_later() {
        let (r, service) = resolver(true, &Settings::default());
        let key = TokenKey::new("KT1Missing", 4);
        let meta = r.resolve(&key).await;
        assert!(TokenMetadataResolver::is_placeholder(&meta));
        assert_eq!(meta.token_id, 4);
        assert_eq!(
            meta.thumbnail_uri.as_deref(),
            Some("https://static.thenounproject.com/png/796573-200.png")
        );
        r.resolve(&key).await;
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn overrides_apply_after_lookup() {
        let mut settings = Settings::default();
        settings.metadata_overrides.push(MetadataOverride {
            token_address: "KT1Crunch".to_string(),
            token_id: 0,
            name: None,
            symbol: Some("CRUNCH".to_string()),
            decimals: None,
            thumbnail_uri: None,
        });
        let (r, _) = resolver(false, &settings);
        let meta = r.resolve(&TokenKey::new("KT1Crunch", 0)).await;
        assert_eq!(meta.symbol, "CRUNCH");
        assert_eq!(meta.name, "Crunchy");
        assert_eq!(meta.decimals, 8);
    }

    #[tokio::test]
    async fn tez_never_hits_the_service() {
        let (r, service) = resolver(true, &Settings::default());
        let meta = r.resolve(&TokenKey::tez()).await;
        assert_eq!(meta.symbol, "XTZ");
        assert_eq!(meta.decimals, 6);
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);
    }
}

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct Contracts {
    /// Farm program whose `farms` and `ledger` big maps are tracked
    #[serde(default = "default_farm_contract")]
    pub farm: String,
    /// Liquidity Baking LP token; farms staking it take the LB valuation path
    #[serde(default = "default_lb_lp_address")]
    pub lb_lp_token: String,
    #[serde(default = "default_lb_dex_address")]
    pub lb_dex: String,
    /// Token addresses that count as the tez leg of a pool
    #[serde(default)]
    pub wrapped_tez: Vec<String>,
}

fn default_farm_contract() -> String {
    "KT1KnuE87q1EKjPozJ5sRAjQA24FPsP57CE3".to_string()
}
fn default_lb_lp_address() -> String {
    "KT1AafHA1C1vk959wvHWBispY9Y2f3fxBUUo".to_string()
}
fn default_lb_dex_address() -> String {
    "KT1TxqZ8QtKvLu3V3JH7Gx58n7Co8pgtpQU5".to_string()
}

impl Default for Contracts {
    fn default() -> Self {
        Self {
            farm: default_farm_contract(),
            lb_lp_token: default_lb_lp_address(),
            lb_dex: default_lb_dex_address(),
            wrapped_tez: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Endpoints {
    #[serde(default = "default_indexer_url")]
    pub indexer_url: String,
    #[serde(default = "default_pool_feed_url")]
    pub pool_feed_url: String,
    #[serde(default = "default_ipfs_gateway")]
    pub ipfs_gateway: String,
    #[serde(default = "default_placeholder_thumbnail")]
    pub placeholder_thumbnail: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Max indexer requests per second
    #[serde(default = "default_indexer_qps")]
    pub indexer_qps: u32,
}

fn default_indexer_url() -> String {
    "https://api.tzkt.io".to_string()
}
fn default_pool_feed_url() -> String {
    "https://api.teztools.io".to_string()
}
fn default_ipfs_gateway() -> String {
    "https://ipfs.io/ipfs/".to_string()
}
fn default_placeholder_thumbnail() -> String {
    "https://static.thenounproject.com/png/796573-200.png".to_string()
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_indexer_qps() -> u32 {
    10
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            indexer_url: default_indexer_url(),
            pool_feed_url: default_pool_feed_url(),
            ipfs_gateway: default_ipfs_gateway(),
            placeholder_thumbnail: default_placeholder_thumbnail(),
            request_timeout_ms: default_request_timeout_ms(),
            indexer_qps: default_indexer_qps(),
        }
    }
}

/// Loop periods of the refresh scheduler.
#[derive(Debug, Deserialize, Clone)]
pub struct Refresh {
    #[serde(default = "default_reference_price_secs")]
    pub reference_price_secs: u64,
    #[serde(default = "default_current_prices_secs")]
    pub current_prices_secs: u64,
    /// 0 keeps the pool feed on-demand only
    #[serde(default)]
    pub pool_feed_secs: u64,
    #[serde(default = "default_storage_secs")]
    pub farm_storage_secs: u64,
    #[serde(default = "default_storage_secs")]
    pub user_storage_secs: u64,
    #[serde(default = "default_storage_secs")]
    pub valuation_connected_secs: u64,
    #[serde(default = "default_valuation_disconnected_secs")]
    pub valuation_disconnected_secs: u64,
    #[serde(default = "default_rewards_millis")]
    pub rewards_millis: u64,
}

fn default_reference_price_secs() -> u64 {
    300
}
fn default_current_prices_secs() -> u64 {
    60
}
fn default_storage_secs() -> u64 {
    30
}
fn default_valuation_disconnected_secs() -> u64 {
    60
}
fn default_rewards_millis() -> u64 {
    1_000
}

impl Default for Refresh {
    fn default() -> Self {
        Self {
            reference_price_secs: default_reference_price_secs(),
            current_prices_secs: default_current_prices_secs(),
            pool_feed_secs: 0,
            farm_storage_secs: default_storage_secs(),
            user_storage_secs: default_storage_secs(),
            valuation_connected_secs: default_storage_secs(),
            valuation_disconnected_secs: default_valuation_disconnected_secs(),
            rewards_millis: default_rewards_millis(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Rewards {
    /// Fixed-point scale of accRewardPerShare in farm storage
    #[serde(default = "default_acc_precision")]
    pub acc_precision: String,
}

fn default_acc_precision() -> String {
    "1000000000000".to_string()
}

impl Default for Rewards {
    fn default() -> Self {
        Self {
            acc_precision: default_acc_precision(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Valuation {
    /// TVL (tez) at which a non-flash farm counts as a "farm" rather than a "garden"
    #[serde(default = "default_farm_tvl_threshold")]
    pub farm_tvl_threshold: u64,
    #[serde(default = "default_flash_max_duration_secs")]
    pub flash_max_duration_secs: i64,
}

fn default_farm_tvl_threshold() -> u64 {
    10_000
}
fn default_flash_max_duration_secs() -> i64 {
    86_400
}

impl Default for Valuation {
    fn default() -> Self {
        Self {
            farm_tvl_threshold: default_farm_tvl_threshold(),
            flash_max_duration_secs: default_flash_max_duration_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BadgeLists {
    #[serde(default)]
    pub verified: Vec<String>,
    #[serde(default)]
    pub core: Vec<String>,
    #[serde(default)]
    pub partner: Vec<String>,
    #[serde(default)]
    pub lp_locked: Vec<String>,
}

/// Operator curation: hard exclusions, forced-errant ids and badges (all by farm id).
#[derive(Debug, Deserialize, Clone)]
pub struct Curation {
    #[serde(default = "default_excluded_farms")]
    pub excluded_farms: Vec<String>,
    #[serde(default = "default_errant_farms")]
    pub errant_farms: Vec<String>,
    #[serde(default)]
    pub badges: BadgeLists,
}

fn default_excluded_farms() -> Vec<String> {
    vec!["13".to_string(), "55".to_string()]
}
fn default_errant_farms() -> Vec<String> {
    ["75", "83", "84", "85", "93"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for Curation {
    fn default() -> Self {
        Self {
            excluded_farms: default_excluded_farms(),
            errant_farms: default_errant_farms(),
            badges: BadgeLists::default(),
        }
    }
}

/// Display fixes for tokens whose on-chain metadata is wrong or missing.
#[derive(Debug, Deserialize, Clone)]
pub struct MetadataOverride {
    pub token_address: String,
    #[serde(default)]
    pub token_id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub decimals: Option<u32>,
    #[serde(default)]
    pub thumbnail_uri: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsSettings {
    #[serde(default = "default_metrics_listen")]
    pub listen: String,
}

fn default_metrics_listen() -> String {
    "127.0.0.1:9100".to_string()
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            listen: default_metrics_listen(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub contracts: Contracts,
    #[serde(default)]
    pub endpoints: Endpoints,
    #[serde(default)]
    pub refresh: Refresh,
    #[serde(default)]
    pub rewards: Rewards,
    #[serde(default)]
    pub valuation: Valuation,
    #[serde(default)]
    pub curation: Curation,
    #[serde(default)]
    pub metadata_overrides: Vec<MetadataOverride>,
    /// Wallet to track; usually set at runtime by connecting a wallet
    #[serde(default)]
    pub wallet: Option<String>,
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
}

impl Settings {
    /// Load `Config.toml` from the working directory (if present) plus env overrides.
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(File::with_name("Config.toml").required(false))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let name = path
            .to_str()
            .ok_or_else(|| ConfigError::Message(format!("non-utf8 config path {:?}", path)))?;
        Self::load(File::with_name(name))
    }

    fn load<S>(file: S) -> Result<Self, ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let s = Config::builder()
            .add_source(file)
            .add_source(Environment::with_prefix("FARM").separator("__"))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;

        if let Ok(wallet) = env::var("FARM_WALLET") {
            let trimmed = wallet.trim();
            if !trimmed.is_empty() {
                settings.wallet = Some(trimmed.to_string());
            }
        }
        if let Ok(contract) = env::var("FARM_CONTRACT") {
            let trimmed = contract.trim();
            if !trimmed.is_empty() {
                settings.contracts.farm = trimmed.to_string();
            }
        }
        if let Ok(raw) = env::var("FARM_EXCLUDED_FARMS") {
            if let Some(list) = parse_string_list(&raw) {
                settings.curation.excluded_farms = list;
            }
        }
        if let Ok(raw) = env::var("FARM_ERRANT_FARMS") {
            if let Some(list) = parse_string_list(&raw) {
                settings.curation.errant_farms = list;
            }
        }

        Ok(settings)
    }
}

/// Accepts `["a","b"]`, `[a, b]` or `a,b`.
fn parse_string_list(input: &str) -> Option<Vec<String>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Some(vec![]);
    }

    if trimmed.starts_with('[') {
        if let Ok(v) = serde_json::from_str::<Vec<String>>(trimmed) {
            return Some(v);
        }
        let without_brackets = trimmed.trim_start_matches('[').trim_end_matches(']').trim();
        return Some(split_list(without_brackets));
    }

    Some(split_list(trimmed))
}

fn split_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(|s| s.trim().trim_matches('"').trim_matches('\'').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

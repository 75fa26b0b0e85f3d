use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub chain: ChainConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub explorer: ExplorerConfig,
    #[serde(default)]
    pub similarity: SimilarityConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    pub rpc_http: String,
    pub rpc_ws: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_channel_size")]
    pub channel_size: usize,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_fatal_retry_delay_ms")]
    pub fatal_retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplorerConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_address_url")]
    pub address_url: String,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityConfig {
    #[serde(default = "default_reference_path")]
    pub reference_path: String,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: String,
    #[serde(default = "default_pipeline_concurrency")]
    pub pipeline_concurrency: usize,
    #[serde(default = "default_pipeline_queue_capacity")]
    pub pipeline_queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Rotated daily log files kept on disk.
    #[serde(default = "default_log_max_files")]
    pub log_max_files: usize,
    #[serde(default = "default_liveness_bind")]
    pub liveness_bind: String,
    #[serde(default)]
    pub metrics_enabled: bool,
}

impl AppConfig {
    /// Loads `path` (optional, any format `config` understands) and layers
    /// `CLONEWATCH__SECTION__KEY` environment overrides on top.
    pub fn load(path: &str) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("CLONEWATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let cfg: Self = cfg.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.similarity.threshold) {
            return Err(Error::Invalid(format!(
                "similarity.threshold must be within 0..=100, got {}",
                self.similarity.threshold
            )));
        }
        if self.feed.reconnect_base_ms == 0 || self.feed.reconnect_max_ms < self.feed.reconnect_base_ms
        {
            return Err(Error::Invalid(format!(
                "feed reconnect window invalid: base {}ms, max {}ms",
                self.feed.reconnect_base_ms, self.feed.reconnect_max_ms
            )));
        }
        if self.watcher.pipeline_concurrency == 0 {
            return Err(Error::Invalid(
                "watcher.pipeline_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            channel_size: default_channel_size(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            fatal_retry_delay_ms: default_fatal_retry_delay_ms(),
        }
    }
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key_env: default_api_key_env(),
            address_url: default_address_url(),
            settle_delay_ms: default_settle_delay_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            reference_path: default_reference_path(),
            threshold: default_threshold(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            checkpoint_path: default_checkpoint_path(),
            pipeline_concurrency: default_pipeline_concurrency(),
            pipeline_queue_capacity: default_pipeline_queue_capacity(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: None,
            log_max_files: default_log_max_files(),
            liveness_bind: default_liveness_bind(),
            metrics_enabled: false,
        }
    }
}

fn default_chain_id() -> u64 {
    8453
}

fn default_channel_size() -> usize {
    128
}

fn default_reconnect_base_ms() -> u64 {
    5_000
}

fn default_reconnect_max_ms() -> u64 {
    60_000
}

fn default_fatal_retry_delay_ms() -> u64 {
    5_000
}

fn default_api_url() -> String {
    "https://api.basescan.org/api".to_string()
}

fn default_api_key_env() -> String {
    "ETHERSCAN_API_KEY".to_string()
}

fn default_address_url() -> String {
    "https://base.blockscout.com/address/".to_string()
}

fn default_settle_delay_ms() -> u64 {
    20_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_reference_path() -> String {
    "BaseToken1.sol".to_string()
}

fn default_threshold() -> f64 {
    90.0
}

fn default_checkpoint_path() -> String {
    "state.json".to_string()
}

fn default_pipeline_concurrency() -> usize {
    16
}

fn default_pipeline_queue_capacity() -> usize {
    1_024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_files() -> usize {
    14
}

fn default_liveness_bind() -> String {
    "0.0.0.0:3000".to_string()
}

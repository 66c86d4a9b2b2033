//! Configuration management for Lodestone

use serde::Deserialize;
use std::fs;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub currency: CurrencyConfig,
    #[serde(default)]
    pub mining: MiningConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Host clients should dial for websocket connections, without a scheme.
    #[serde(default = "default_public_url")]
    pub public_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CurrencyConfig {
    #[serde(default = "default_address_prefix")]
    pub address_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MiningConfig {
    #[serde(default = "default_min_work")]
    pub min_work: u64,
    #[serde(default = "default_max_work")]
    pub max_work: u64,
    /// Multiplicative bump applied to work after every accepted block.
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,
    /// Adaptation rate of the background controller: 0 freezes, 1 jumps.
    #[serde(default = "default_work_factor")]
    pub work_factor: f64,
    #[serde(default = "default_seconds_per_block")]
    pub seconds_per_block: u64,
    #[serde(default = "default_work_interval_secs")]
    pub work_interval_secs: u64,
    #[serde(default = "default_nonce_max_size")]
    pub nonce_max_size: usize,
    /// Descending base-reward schedule as (height, reward) breakpoints.
    #[serde(default = "default_reward_schedule")]
    pub reward_schedule: Vec<RewardTier>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RewardTier {
    pub height: u64,
    pub reward: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_queue_timeout_secs")]
    pub queue_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_token_expiry_secs")]
    pub token_expiry_secs: u64,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: default_public_url(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for CurrencyConfig {
    fn default() -> Self {
        Self {
            address_prefix: default_address_prefix(),
        }
    }
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            min_work: default_min_work(),
            max_work: default_max_work(),
            growth_factor: default_growth_factor(),
            work_factor: default_work_factor(),
            seconds_per_block: default_seconds_per_block(),
            work_interval_secs: default_work_interval_secs(),
            nonce_max_size: default_nonce_max_size(),
            reward_schedule: default_reward_schedule(),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            queue_timeout_secs: default_queue_timeout_secs(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            token_expiry_secs: default_token_expiry_secs(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            currency: CurrencyConfig::default(),
            mining: MiningConfig::default(),
            processor: ProcessorConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

pub fn load_config(path: &str) -> Result<Config, Box<dyn std::error::Error>> {
    let config_str = fs::read_to_string(path).unwrap_or_default();
    let mut config: Config = if config_str.is_empty() {
        // Sane defaults when the file is absent
        Config::default()
    } else {
        toml::from_str(&config_str)?
    };

    // Validate critical values
    if config.database.path.is_empty() {
        return Err("database.path must be set".into());
    }
    if config.currency.address_prefix.is_empty() {
        return Err("currency.address_prefix must be set".into());
    }
    if config.mining.min_work > config.mining.max_work {
        return Err("mining.min_work must not exceed mining.max_work".into());
    }
    if config.mining.growth_factor <= 0.0 {
        return Err("mining.growth_factor must be positive".into());
    }
    if !(0.0..=1.0).contains(&config.mining.work_factor) {
        return Err("mining.work_factor must lie in [0, 1]".into());
    }
    if config.mining.reward_schedule.is_empty() {
        return Err("mining.reward_schedule must contain at least one tier".into());
    }
    if config.processor.max_concurrency == 0 {
        return Err("processor.max_concurrency must be at least 1".into());
    }
    config.mining.reward_schedule.sort_by_key(|t| t.height);

    Ok(config)
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_public_url() -> String {
    "localhost:8080".to_string()
}

fn default_db_path() -> String {
    "./lodestone.db".to_string()
}

fn default_address_prefix() -> String {
    "l".to_string()
}

fn default_min_work() -> u64 {
    100
}

fn default_max_work() -> u64 {
    100_000
}

fn default_growth_factor() -> f64 {
    1.125
}

fn default_work_factor() -> f64 {
    0.025
}

fn default_seconds_per_block() -> u64 {
    60
}

fn default_work_interval_secs() -> u64 {
    5
}

fn default_nonce_max_size() -> usize {
    24
}

fn default_reward_schedule() -> Vec<RewardTier> {
    vec![
        RewardTier {
            height: 0,
            reward: 25,
        },
        RewardTier {
            height: 100_000,
            reward: 12,
        },
    ]
}

fn default_max_concurrency() -> usize {
    8
}

fn default_queue_timeout_secs() -> u64 {
    10
}

fn default_token_expiry_secs() -> u64 {
    30
}

fn default_keepalive_secs() -> u64 {
    10
}

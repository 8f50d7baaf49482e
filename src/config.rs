use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// Server Configuration
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8080";
pub const DEFAULT_API_BIND_ADDRESS: &str = "127.0.0.1:8081";
pub const DEFAULT_STATIC_DIR: &str = "./ui";
pub const STATS_INTERVAL_SECS: u64 = 60;
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

// Producer Configuration
pub const DEFAULT_PROVIDERS: &str = "Bitcoin,Ethereum,Binance";
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 100;
pub const DEFAULT_BASE_PRICE: f64 = 100.0;
pub const DEFAULT_PRICE_SPREAD: f64 = 10.0;

// Hub Configuration
pub const DEFAULT_LANE_CAPACITY: usize = 16;
pub const CONTROL_CHANNEL_SIZE: usize = 256;
pub const PUBLISH_CHANNEL_SIZE: usize = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} must be a number, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
    #[error("at least one provider name is required")]
    NoProviders,
    #[error("duplicate provider name: {0}")]
    DuplicateProvider(String),
    #[error("tick interval must be greater than zero")]
    ZeroInterval,
    #[error("price spread must be a finite, non-negative number, got {0}")]
    InvalidSpread(f64),
    #[error("base price must be finite, got {0}")]
    InvalidBasePrice(f64),
    #[error("lane capacity must be greater than zero")]
    ZeroLaneCapacity,
    #[error("static asset directory not found: {0}")]
    StaticDirMissing(String),
    #[error("replay directory not found: {0}")]
    ReplayDirMissing(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub api_bind_address: String,
    pub providers: Vec<String>,
    pub tick_interval_ms: u64,
    pub base_price: f64,
    pub price_spread: f64,
    pub lane_capacity: usize,
    pub static_dir: String,
    pub replay_dir: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            api_bind_address: DEFAULT_API_BIND_ADDRESS.to_string(),
            providers: parse_providers(DEFAULT_PROVIDERS),
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            base_price: DEFAULT_BASE_PRICE,
            price_spread: DEFAULT_PRICE_SPREAD,
            lane_capacity: DEFAULT_LANE_CAPACITY,
            static_dir: DEFAULT_STATIC_DIR.to_string(),
            replay_dir: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            bind_address: env::var("BIND_ADDRESS")
                .unwrap_or(defaults.bind_address),
            api_bind_address: env::var("API_BIND_ADDRESS")
                .unwrap_or(defaults.api_bind_address),
            providers: env::var("PROVIDERS")
                .map(|raw| parse_providers(&raw))
                .unwrap_or(defaults.providers),
            tick_interval_ms: env_number("TICK_INTERVAL_MS", defaults.tick_interval_ms)?,
            base_price: env_number("BASE_PRICE", defaults.base_price)?,
            price_spread: env_number("PRICE_SPREAD", defaults.price_spread)?,
            lane_capacity: env_number("LANE_CAPACITY", defaults.lane_capacity)?,
            static_dir: env::var("STATIC_DIR")
                .unwrap_or(defaults.static_dir),
            replay_dir: env::var("REPLAY_DIR").ok().filter(|dir| !dir.trim().is_empty()),
            log_level: env::var("RUST_LOG")
                .unwrap_or(defaults.log_level),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() && self.replay_dir.is_none() {
            return Err(ConfigError::NoProviders);
        }

        let mut seen = HashSet::new();
        for name in &self.providers {
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::DuplicateProvider(name.clone()));
            }
        }

        if self.tick_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval);
        }

        if !self.base_price.is_finite() {
            return Err(ConfigError::InvalidBasePrice(self.base_price));
        }

        if !self.price_spread.is_finite() || self.price_spread < 0.0 {
            return Err(ConfigError::InvalidSpread(self.price_spread));
        }

        if self.lane_capacity == 0 {
            return Err(ConfigError::ZeroLaneCapacity);
        }

        if !Path::new(&self.static_dir).is_dir() {
            return Err(ConfigError::StaticDirMissing(self.static_dir.clone()));
        }

        if let Some(dir) = &self.replay_dir {
            if !Path::new(dir).is_dir() {
                return Err(ConfigError::ReplayDirMissing(dir.clone()));
            }
        }

        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn log_config(&self) {
        println!("Server Configuration:");
        println!("  WebSocket Address: {}", self.bind_address);
        println!("  API Address: {}", self.api_bind_address);
        println!("  Providers: {}", self.providers.join(", "));
        println!("  Tick Interval: {}ms", self.tick_interval_ms);
        println!("  Price: {} + [0, {})", self.base_price, self.price_spread);
        println!("  Lane Capacity: {}", self.lane_capacity);
        println!("  Static Dir: {}", self.static_dir);
        println!("  Replay Dir: {}", self.replay_dir.as_deref().unwrap_or("-"));
        println!("  Log Level: {}", self.log_level);
    }
}

/// Splits a comma-separated provider list, trimming whitespace and dropping
/// empty entries.
pub fn parse_providers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_number<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
        Err(_) => Ok(default),
    }
}

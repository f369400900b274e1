use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use url::Url;

use crate::models::ErrorClass;
use crate::plugins::parsers::SelectorProfile;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub proxy: ProxyPoolConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub dedupe: DedupeConfig,
    #[serde(default)]
    pub cooldowns: CooldownConfig,
    #[serde(default)]
    pub categories: CategoriesConfig,
    #[serde(default)]
    pub parsers: ParsersConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/deal-radar.db?mode=rwc".to_string(),
            max_connections: 5,
            min_connections: 1,
            acquire_timeout: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

/// Backing technology for the shared TTL store (lock, dedupe, cooldowns).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between scheduled coordinator runs.
    pub tick_interval: u64,
    /// Seconds between polls for a pending manual scan request.
    pub manual_poll_interval: u64,
    pub max_concurrency: usize,
    /// Upper bound on one coordinator run, in seconds.
    pub run_timeout: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: 300,
            manual_poll_interval: 10,
            max_concurrency: 3,
            run_timeout: 3600,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval)
    }

    pub fn manual_poll_interval(&self) -> Duration {
        Duration::from_secs(self.manual_poll_interval)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub ttl: u64,
    pub heartbeat_interval: u64,
    /// Staleness threshold as a multiple of the heartbeat interval.
    pub staleness_multiplier: u32,
    /// Seconds after which a running scan job is reported as stuck.
    pub stuck_job_after: u64,
    pub max_heartbeat_failures: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: 7200,
            heartbeat_interval: 45,
            staleness_multiplier: 10,
            stuck_job_after: 10800,
            max_heartbeat_failures: 3,
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    pub fn staleness_threshold(&self) -> Duration {
        self.heartbeat_interval() * self.staleness_multiplier
    }

    pub fn stuck_job_after(&self) -> Duration {
        Duration::from_secs(self.stuck_job_after)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub max_retries: u32,
    pub max_connect_failovers: u32,
    pub connect_timeout: u64,
    pub read_timeout: u64,
    pub max_read_timeout: u64,
    pub forbidden_backoff_base: f64,
    pub rate_limit_backoff_base: f64,
    pub server_error_backoff_base: f64,
    pub max_retry_after: u64,
    pub jitter_min: f64,
    pub jitter_max: f64,
    pub page_delay_min: f64,
    pub page_delay_max: f64,
    /// Fall back to a direct connection when every proxy is disabled.
    pub direct_fallback: bool,
    pub user_agents: Vec<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_connect_failovers: 5,
            connect_timeout: 10,
            read_timeout: 45,
            max_read_timeout: 90,
            forbidden_backoff_base: 15.0,
            rate_limit_backoff_base: 10.0,
            server_error_backoff_base: 10.0,
            max_retry_after: 300,
            jitter_min: 5.0,
            jitter_max: 15.0,
            page_delay_min: 2.0,
            page_delay_max: 5.0,
            direct_fallback: true,
            user_agents: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyPoolConfig {
    pub failure_threshold: u32,
    /// Trailing window, in seconds, over which failures are counted.
    pub failure_window: u64,
    /// Seconds before an auto-disabled proxy is put back in rotation.
    pub reenable_after: u64,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: 600,
            reenable_after: 1800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub min_confidence: f64,
    pub price_error_multiplier: f64,
    pub store_adjustments: HashMap<String, f64>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        let store_adjustments = [
            ("homedepot", 0.85),
            ("lowes", 0.85),
            ("costco", 0.75),
            ("bestbuy", 0.90),
            ("newegg", 0.80),
            ("microcenter", 0.75),
            ("gamestop", 0.85),
            ("bhphotovideo", 0.80),
            ("kohls", 1.10),
            ("officedepot", 0.90),
            ("ebay", 0.85),
            ("macys", 1.15),
        ]
        .into_iter()
        .map(|(store, multiplier)| (store.to_string(), multiplier))
        .collect();

        Self {
            min_confidence: 0.6,
            price_error_multiplier: 2.0,
            store_adjustments,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupeConfig {
    pub ttl_hours: u64,
    pub cooldown_minutes: u64,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            ttl_hours: 12,
            cooldown_minutes: 60,
        }
    }
}

impl DedupeConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours * 3600)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_minutes * 60)
    }
}

/// Per error-class category cooldowns, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownConfig {
    pub forbidden: u64,
    pub blocked: u64,
    pub rate_limited: u64,
    pub server_error: u64,
    pub timeout: u64,
    pub connect: u64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            forbidden: 8 * 3600,
            blocked: 4 * 3600,
            rate_limited: 3600,
            server_error: 1800,
            timeout: 1200,
            connect: 600,
        }
    }
}

impl CooldownConfig {
    /// Structural classes have no cooldown; they count toward auto-disable instead.
    pub fn duration_for(&self, class: ErrorClass) -> Option<Duration> {
        let secs = match class {
            ErrorClass::Forbidden => self.forbidden,
            ErrorClass::Blocked => self.blocked,
            ErrorClass::RateLimited => self.rate_limited,
            ErrorClass::ServerError => self.server_error,
            ErrorClass::Timeout => self.timeout,
            ErrorClass::Connect => self.connect,
            ErrorClass::NotFound | ErrorClass::Other => return None,
        };
        (secs > 0).then(|| Duration::from_secs(secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoriesConfig {
    /// Consecutive structural failures before a category is disabled.
    pub auto_disable_after: u32,
    /// Base URL per store, used to resolve relative category URLs.
    pub store_base_urls: HashMap<String, String>,
}

impl Default for CategoriesConfig {
    fn default() -> Self {
        Self {
            auto_disable_after: 3,
            store_base_urls: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParsersConfig {
    #[serde(default)]
    pub profiles: Vec<SelectorProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub webhook_url: Option<String>,
    pub webhook_timeout: u64,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_timeout: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub directory: Option<String>,
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            file_prefix: "deal-radar.log".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9001,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default"))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Local overrides, ignored by git
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("DEAL_RADAR").separator("__"))
            .build()?;

        let config: AppConfig = s.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.max_connections == 0 {
            return Err(ConfigError::Message("Database max_connections must be greater than 0".into()));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigError::Message("Database min_connections cannot exceed max_connections".into()));
        }

        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return Err(ConfigError::Message("store.redis_url is required for the redis backend".into()));
        }

        if self.scheduler.max_concurrency == 0 {
            return Err(ConfigError::Message("Scheduler max_concurrency must be greater than 0".into()));
        }

        if self.scheduler.tick_interval == 0 || self.scheduler.manual_poll_interval == 0 {
            return Err(ConfigError::Message("Scheduler intervals must be greater than 0".into()));
        }

        if self.lock.heartbeat_interval == 0 || self.lock.heartbeat_interval >= self.lock.ttl {
            return Err(ConfigError::Message("Lock heartbeat_interval must be shorter than the lock ttl".into()));
        }

        if self.lock.staleness_multiplier == 0 {
            return Err(ConfigError::Message("Lock staleness_multiplier must be greater than 0".into()));
        }

        if self.fetch.max_retries == 0 {
            return Err(ConfigError::Message("Fetch max_retries must be greater than 0".into()));
        }

        if self.fetch.read_timeout == 0 || self.fetch.max_read_timeout < self.fetch.read_timeout {
            return Err(ConfigError::Message("Fetch max_read_timeout cannot be below read_timeout".into()));
        }

        if self.fetch.jitter_min > self.fetch.jitter_max || self.fetch.page_delay_min > self.fetch.page_delay_max {
            return Err(ConfigError::Message("Fetch delay ranges must have min <= max".into()));
        }

        if self.proxy.failure_threshold == 0 {
            return Err(ConfigError::Message("Proxy failure_threshold must be greater than 0".into()));
        }

        if !(0.0..=1.0).contains(&self.detection.min_confidence) {
            return Err(ConfigError::Message("Detection min_confidence must be between 0 and 1".into()));
        }

        if self.detection.price_error_multiplier < 1.0 {
            return Err(ConfigError::Message("Detection price_error_multiplier must be at least 1.0".into()));
        }

        if let Some((store, _)) = self.detection.store_adjustments.iter().find(|(_, m)| **m <= 0.0) {
            return Err(ConfigError::Message(format!("Store adjustment for {} must be positive", store)));
        }

        if self.dedupe.ttl_hours == 0 || self.dedupe.cooldown_minutes == 0 {
            return Err(ConfigError::Message("Dedupe ttl_hours and cooldown_minutes must be greater than 0".into()));
        }

        for (store, base) in &self.categories.store_base_urls {
            if Url::parse(base).is_err() {
                return Err(ConfigError::Message(format!("Invalid base URL for store {}", store)));
            }
        }

        if let Some(webhook) = &self.notifications.webhook_url {
            if Url::parse(webhook).is_err() {
                return Err(ConfigError::Message("Invalid notifications.webhook_url".into()));
            }
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(ConfigError::Message("Metrics port must be greater than 0".into()));
        }

        Ok(())
    }
}

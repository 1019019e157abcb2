use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_CACHE_TYPE: &str = "in-memory";
const DEFAULT_NETWORK: &str = "polygon";
const DEFAULT_TIMEZONE: &str = "Asia/Ho_Chi_Minh";

/// Cache configuration
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Type of cache to use: "in-memory" or "redis"
    #[serde(default = "default_cache_type")]
    #[validate(custom = "validate_cache_type")]
    pub cache_type: String,

    /// Redis connection URL for cache
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Default TTL (Time To Live) for cache entries in seconds
    #[serde(default)]
    pub default_ttl_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_type: default_cache_type(),
            redis_url: default_redis_url(),
            default_ttl_secs: Some(300),
        }
    }
}

/// Money-movement policy for payments and cashbacks.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SettlementConfig {
    /// Minutes a pending payment stays open before the expiry sweep fails it
    #[serde(default = "default_payment_expiry_minutes")]
    #[validate(range(min = 1, max = 10080))]
    pub payment_expiry_minutes: i64,

    /// Currency for orders and payments
    #[serde(default = "default_currency")]
    #[validate(length(min = 3, max = 8))]
    pub default_currency: String,

    /// Percentage applied to cashbacks created automatically on payment success
    #[serde(default = "default_cashback_percentage")]
    #[validate(custom = "validate_percentage")]
    pub cashback_percentage: Decimal,

    /// Token the cashback is paid out in
    #[serde(default = "default_cashback_currency")]
    pub cashback_currency: String,

    /// Days after creation before a cashback may be submitted
    #[serde(default = "default_cashback_eligible_after_days")]
    #[validate(range(min = 0, max = 365))]
    pub cashback_eligible_after_days: i64,

    /// Days after creation before an unsettled cashback is cancelled
    #[serde(default = "default_cashback_expires_after_days")]
    #[validate(range(min = 1, max = 3650))]
    pub cashback_expires_after_days: i64,

    /// Upper bound on automatic resubmissions of a failed cashback
    #[serde(default = "default_cashback_max_retries")]
    #[validate(range(min = 0, max = 100))]
    pub cashback_max_retries: i32,

    /// Timeout applied to each blockchain gateway call
    #[serde(default = "default_gateway_timeout_secs")]
    #[validate(range(min = 1, max = 600))]
    pub gateway_timeout_secs: u64,

    /// Network used when a cashback request does not name one
    #[serde(default = "default_network")]
    pub default_network: String,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            payment_expiry_minutes: default_payment_expiry_minutes(),
            default_currency: default_currency(),
            cashback_percentage: default_cashback_percentage(),
            cashback_currency: default_cashback_currency(),
            cashback_eligible_after_days: default_cashback_eligible_after_days(),
            cashback_expires_after_days: default_cashback_expires_after_days(),
            cashback_max_retries: default_cashback_max_retries(),
            gateway_timeout_secs: default_gateway_timeout_secs(),
            default_network: default_network(),
        }
    }
}

impl SettlementConfig {
    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }
}

/// Reconciliation sweep schedule
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Start the sweeps together with the service
    #[serde(default = "default_true_bool")]
    pub enabled: bool,

    #[serde(default = "default_process_pending_interval")]
    #[validate(range(min = 1))]
    pub process_pending_interval_secs: u64,

    #[serde(default = "default_retry_failed_interval")]
    #[validate(range(min = 1))]
    pub retry_failed_interval_secs: u64,

    #[serde(default = "default_cancel_expired_interval")]
    #[validate(range(min = 1))]
    pub cancel_expired_interval_secs: u64,

    #[serde(default = "default_expire_payments_interval")]
    #[validate(range(min = 1))]
    pub expire_payments_interval_secs: u64,

    /// Cashbacks fetched per pending sweep
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1, max = 1000))]
    pub batch_size: u64,

    /// Guard each sweep with a database lease so only one instance runs it per interval
    #[serde(default = "default_true_bool")]
    pub lease_enabled: bool,

    /// Timezone label attached to sweep logs
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            process_pending_interval_secs: default_process_pending_interval(),
            retry_failed_interval_secs: default_retry_failed_interval(),
            cancel_expired_interval_secs: default_cancel_expired_interval(),
            expire_payments_interval_secs: default_expire_payments_interval(),
            batch_size: default_batch_size(),
            lease_enabled: true,
            timezone: default_timezone(),
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1))]
    pub database_url: String,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,

    /// Cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Payment and cashback policy
    #[serde(default)]
    pub settlement: SettlementConfig,

    /// Reconciliation sweep schedule
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the connection and environment
    pub fn new(database_url: String, environment: String) -> Self {
        Self {
            database_url,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            cache: CacheConfig::default(),
            settlement: SettlementConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Gets cache TTL in Duration
    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache.default_ttl_secs.map(Duration::from_secs)
    }

    /// Validates the root and every nested section
    pub fn validate_all(&self) -> Result<(), validator::ValidationErrors> {
        self.validate()?;
        self.cache.validate()?;
        self.settlement.validate()?;
        self.scheduler.validate()?;
        if self.settlement.cashback_eligible_after_days > self.settlement.cashback_expires_after_days
        {
            let mut errors = validator::ValidationErrors::new();
            let mut err = ValidationError::new("cashback_window");
            err.message = Some("cashback eligibility must start before it expires".into());
            errors.add("cashback_eligible_after_days", err);
            return Err(errors);
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_cache_type() -> String {
    DEFAULT_CACHE_TYPE.to_string()
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}
fn default_event_channel_capacity() -> usize {
    1024
}
fn default_true_bool() -> bool {
    true
}
fn default_payment_expiry_minutes() -> i64 {
    15
}
fn default_currency() -> String {
    "VND".to_string()
}
fn default_cashback_percentage() -> Decimal {
    dec!(5)
}
fn default_cashback_currency() -> String {
    "USDT".to_string()
}
fn default_cashback_eligible_after_days() -> i64 {
    7
}
fn default_cashback_expires_after_days() -> i64 {
    90
}
fn default_cashback_max_retries() -> i32 {
    3
}
fn default_gateway_timeout_secs() -> u64 {
    30
}
fn default_network() -> String {
    DEFAULT_NETWORK.to_string()
}
fn default_process_pending_interval() -> u64 {
    5 * 60
}
fn default_retry_failed_interval() -> u64 {
    30 * 60
}
fn default_cancel_expired_interval() -> u64 {
    60 * 60
}
fn default_expire_payments_interval() -> u64 {
    10 * 60
}
fn default_batch_size() -> u64 {
    50
}
fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}

fn validate_cache_type(value: &str) -> Result<(), ValidationError> {
    match value.to_ascii_lowercase().as_str() {
        "in-memory" | "redis" => Ok(()),
        _ => {
            let mut err = ValidationError::new("cache_type");
            err.message = Some("Must be one of: in-memory, redis".into());
            Err(err)
        }
    }
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_percentage(value: &Decimal) -> Result<(), ValidationError> {
    if *value <= Decimal::ZERO || *value > dec!(100) {
        let mut err = ValidationError::new("cashback_percentage");
        err.message = Some("cashback_percentage must be in (0, 100]".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("stateset_settlement={},sea_orm=warn", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://stateset_settlement.db?mode=rwc")?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate_all().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

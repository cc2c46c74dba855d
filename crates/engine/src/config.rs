use persistence::db::DatabaseConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub retention: RetentionConfig,
    pub worker: WorkerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding packages (`<root>/<jobId>/`) and staging files.
    pub root: PathBuf,

    /// Upper bound on a single compressed package.
    #[serde(default = "default_max_package_bytes")]
    pub max_package_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_days")]
    pub default_days: i32,

    /// Packages downloaded this recently are kept past their expiry.
    #[serde(default = "default_grace_window")]
    pub grace_window_minutes: i64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_minutes: u64,

    #[serde(default = "default_sweep_batch_size")]
    pub batch_size: i64,

    /// The retention sweep re-hashes live packages verified longer ago than this.
    #[serde(default = "default_verification_freshness")]
    pub verification_freshness_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_worker_batch_size")]
    pub batch_size: i64,

    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_host")]
    pub host: String,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_metrics_host(),
            port: default_metrics_port(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_max_package_bytes() -> u64 {
    512 * 1024 * 1024
}
fn default_retention_days() -> i32 {
    domain::models::DEFAULT_PACKAGE_RETENTION_DAYS
}
fn default_grace_window() -> i64 {
    60
}
fn default_sweep_interval() -> u64 {
    15
}
fn default_sweep_batch_size() -> i64 {
    100
}
fn default_verification_freshness() -> i64 {
    24 * 60
}
fn default_poll_interval() -> u64 {
    5
}
fn default_worker_batch_size() -> i64 {
    10
}
fn default_shutdown_timeout() -> u64 {
    30
}
fn default_metrics_host() -> String {
    "0.0.0.0".to_string()
}
fn default_metrics_port() -> u16 {
    9090
}

/// Configuration validation error
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Loading order (later sources override earlier):
    /// 1. config/default.toml - base configuration with defaults
    /// 2. config/local.toml - local overrides (optional, not in git)
    /// 3. Environment variables with TX__ prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("TX").separator("__"))
            .build()?;

        let cfg: Self = config.try_deserialize()?;
        cfg.validate()
            .map_err(|e| config::ConfigError::Message(e.to_string()))?;
        Ok(cfg)
    }

    /// Load configuration from embedded defaults plus overrides, without
    /// touching config files.
    pub fn load_for_test(overrides: &[(&str, &str)]) -> Result<Self, config::ConfigError> {
        let defaults = r#"
            [database]
            url = ""
            max_connections = 10
            min_connections = 2
            connect_timeout_secs = 10
            idle_timeout_secs = 600

            [logging]
            level = "info"
            format = "json"

            [storage]
            root = "/tmp/tool-exports"
            max_package_bytes = 536870912

            [retention]
            default_days = 7
            grace_window_minutes = 60
            sweep_interval_minutes = 15
            batch_size = 100
            verification_freshness_minutes = 1440

            [worker]
            poll_interval_secs = 5
            batch_size = 10
            shutdown_timeout_secs = 30

            [metrics]
            enabled = false
            host = "127.0.0.1"
            port = 9090
        "#;

        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(defaults, config::FileFormat::Toml));

        for (key, value) in overrides {
            builder = builder.set_override(*key, *value)?;
        }

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.database.url.is_empty() {
            return Err(ConfigValidationError::MissingRequired(
                "TX__DATABASE__URL environment variable must be set".to_string(),
            ));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigValidationError::InvalidValue(
                "min_connections cannot exceed max_connections".to_string(),
            ));
        }

        if self.storage.root.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingRequired(
                "storage.root must point at a writable directory".to_string(),
            ));
        }

        if self.storage.max_package_bytes == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "storage.max_package_bytes must be positive".to_string(),
            ));
        }

        if self.retention.default_days <= 0 {
            return Err(ConfigValidationError::InvalidValue(
                "retention.default_days must be at least 1".to_string(),
            ));
        }

        if self.retention.grace_window_minutes < 0
            || self.retention.verification_freshness_minutes < 0
        {
            return Err(ConfigValidationError::InvalidValue(
                "retention windows cannot be negative".to_string(),
            ));
        }

        if self.retention.sweep_interval_minutes == 0 || self.worker.poll_interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "scheduler intervals must be positive".to_string(),
            ));
        }

        if self.retention.batch_size <= 0 || self.worker.batch_size <= 0 {
            return Err(ConfigValidationError::InvalidValue(
                "batch sizes must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Address for the Prometheus scrape listener.
    pub fn metrics_addr(&self) -> Result<SocketAddr, ConfigValidationError> {
        format!("{}:{}", self.metrics.host, self.metrics.port)
            .parse()
            .map_err(|e| ConfigValidationError::InvalidValue(format!("metrics address: {}", e)))
    }
}

//! Typed Configuration Record
//!
//! The configuration every component consumes, deserialized from a TOML
//! file by the binaries. Validation is plain range checking against the
//! documented bounds; violations are fatal at startup and name the
//! offending section and key.

use std::net::SocketAddr;

use serde::Deserialize;
use thiserror::Error;

use crate::count::Resolution;
use crate::datalink::BACNET_IP_PORT;
use crate::rate::RateSpec;

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration [{section}] {key}: {reason}")]
    Invalid {
        section: &'static str,
        key: String,
        reason: String,
    },
}

fn invalid(section: &'static str, key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        section,
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// Top-level configuration record
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BacmonConfig {
    #[serde(default)]
    pub bacmon: BacmonSection,
    #[serde(default)]
    pub redis: RedisSection,
    #[serde(default, rename = "rate-monitoring")]
    pub rate_monitoring: RateMonitoringSection,
    #[serde(default, rename = "redis-optimization")]
    pub redis_optimization: RedisOptimizationSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub alerts: AlertsSection,
    #[serde(default)]
    pub api: ApiSection,
}

impl BacmonConfig {
    /// Load and validate a configuration file
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: BacmonConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Range-check every recognized option
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bacmon.validate()?;
        self.rate_monitoring.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

/// `[bacmon]`: packet capture
#[derive(Debug, Clone, Deserialize)]
pub struct BacmonSection {
    /// Interface address to bind the UDP socket on
    #[serde(default = "default_interface")]
    pub interface: String,
    /// UDP port, the BACnet/IP well-known port by default
    #[serde(default = "default_bacnet_port")]
    pub port: u16,
    /// Monitored subnet in CIDR notation (informational)
    pub address: Option<String>,
    /// Known BBMD addresses
    #[serde(default)]
    pub bbmd: Vec<String>,
}

fn default_interface() -> String {
    "0.0.0.0".to_string()
}

fn default_bacnet_port() -> u16 {
    BACNET_IP_PORT
}

impl Default for BacmonSection {
    fn default() -> Self {
        BacmonSection {
            interface: default_interface(),
            port: default_bacnet_port(),
            address: None,
            bbmd: Vec::new(),
        }
    }
}

impl BacmonSection {
    /// UDP bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.interface, self.port)
    }

    /// Parsed BBMD socket addresses; a bare IP gets the well-known port
    pub fn bbmd_addresses(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.bbmd
            .iter()
            .map(|entry| {
                let candidate = if entry.contains(':') {
                    entry.clone()
                } else {
                    format!("{}:{}", entry, BACNET_IP_PORT)
                };
                candidate
                    .parse()
                    .map_err(|_| invalid("bacmon", "bbmd", format!("bad address: {}", entry)))
            })
            .collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.bbmd_addresses()?;
        Ok(())
    }
}

/// `[redis]`: store connection
#[derive(Debug, Clone, Deserialize)]
pub struct RedisSection {
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub db: u32,
    pub password: Option<String>,
    /// Socket timeout in seconds
    #[serde(default = "default_socket_timeout")]
    pub socket_timeout: f64,
    /// Bounded retries for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_socket_timeout() -> f64 {
    5.0
}

fn default_max_retries() -> u32 {
    3
}

impl Default for RedisSection {
    fn default() -> Self {
        RedisSection {
            host: default_redis_host(),
            port: default_redis_port(),
            db: 0,
            password: None,
            socket_timeout: default_socket_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

impl RedisSection {
    /// Connection URL for the redis client
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    /// Retry policy for the store wrapper
    pub fn retry_policy(&self) -> crate::kv::RetryPolicy {
        crate::kv::RetryPolicy {
            max_retries: self.max_retries,
            base_delay: std::time::Duration::from_millis(100),
        }
    }
}

/// `[rate-monitoring]`: detector tuning and monitored rates
#[derive(Debug, Clone, Deserialize)]
pub struct RateMonitoringSection {
    /// Task scan interval in milliseconds
    #[serde(default = "default_scan_interval")]
    pub scan_interval: u64,
    #[serde(default)]
    pub use_enhanced_detection: bool,
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,
    #[serde(default = "default_spike_sensitivity")]
    pub spike_sensitivity: f64,
    #[serde(default = "default_z_threshold")]
    pub z_threshold: f64,
    #[serde(default = "default_trend_threshold")]
    pub trend_threshold: f64,
    #[serde(default = "default_hour_granularity")]
    pub hour_granularity: u32,
    /// Monitored rates: `rate.<name> = "<key>, <interval_s>, <max>, <duration>"`
    #[serde(default)]
    pub rate: std::collections::BTreeMap<String, String>,
}

fn default_scan_interval() -> u64 {
    10_000
}

fn default_sensitivity() -> f64 {
    1.0
}

fn default_spike_sensitivity() -> f64 {
    2.0
}

fn default_z_threshold() -> f64 {
    3.0
}

fn default_trend_threshold() -> f64 {
    0.2
}

fn default_hour_granularity() -> u32 {
    1
}

impl Default for RateMonitoringSection {
    fn default() -> Self {
        RateMonitoringSection {
            scan_interval: default_scan_interval(),
            use_enhanced_detection: false,
            sensitivity: default_sensitivity(),
            spike_sensitivity: default_spike_sensitivity(),
            z_threshold: default_z_threshold(),
            trend_threshold: default_trend_threshold(),
            hour_granularity: default_hour_granularity(),
            rate: std::collections::BTreeMap::new(),
        }
    }
}

impl RateMonitoringSection {
    fn validate(&self) -> Result<(), ConfigError> {
        let section = "rate-monitoring";
        if !(1000..=60_000).contains(&self.scan_interval) {
            return Err(invalid(section, "scan_interval", "must be 1000-60000 ms"));
        }
        if !(0.1..=10.0).contains(&self.sensitivity) {
            return Err(invalid(section, "sensitivity", "must be 0.1-10"));
        }
        if !(1.0..=10.0).contains(&self.spike_sensitivity) {
            return Err(invalid(section, "spike_sensitivity", "must be 1-10"));
        }
        if !(1.0..=10.0).contains(&self.z_threshold) {
            return Err(invalid(section, "z_threshold", "must be 1-10"));
        }
        if !(0.05..=1.0).contains(&self.trend_threshold) {
            return Err(invalid(section, "trend_threshold", "must be 0.05-1"));
        }
        if !(1..=12).contains(&self.hour_granularity) {
            return Err(invalid(section, "hour_granularity", "must be 1-12"));
        }
        self.rate_specs()?;
        Ok(())
    }

    /// Parsed monitored-rate entries, in name order
    pub fn rate_specs(&self) -> Result<Vec<(String, RateSpec)>, ConfigError> {
        self.rate
            .iter()
            .map(|(name, value)| {
                RateSpec::parse(value)
                    .map(|spec| (name.clone(), spec))
                    .ok_or_else(|| {
                        invalid(
                            "rate-monitoring",
                            name,
                            "expected \"<key>, <interval_s>, <max_value>, <duration>\"",
                        )
                    })
            })
            .collect()
    }

    /// Detector tuning shared by every enhanced rate task
    pub fn detector_config(&self) -> crate::detect::DetectorConfig {
        crate::detect::DetectorConfig {
            sensitivity: self.sensitivity,
            spike_sensitivity: self.spike_sensitivity,
            z_threshold: self.z_threshold,
            trend_threshold: self.trend_threshold,
            hour_granularity: self.hour_granularity,
            ..crate::detect::DetectorConfig::default()
        }
    }
}

/// `[redis-optimization]`: retention and cleanup
#[derive(Debug, Clone, Deserialize)]
pub struct RedisOptimizationSection {
    /// Series bound at second resolution
    #[serde(default = "default_retention_seconds")]
    pub retention_seconds: usize,
    /// Series bound at minute resolution
    #[serde(default = "default_retention_minutes")]
    pub retention_minutes: usize,
    /// Series bound at hour resolution
    #[serde(default = "default_retention_hours")]
    pub retention_hours: usize,
    /// Seconds between cleanup passes
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
}

fn default_retention_seconds() -> usize {
    900
}

fn default_retention_minutes() -> usize {
    1440
}

fn default_retention_hours() -> usize {
    168
}

fn default_cleanup_interval() -> u64 {
    3600
}

impl Default for RedisOptimizationSection {
    fn default() -> Self {
        RedisOptimizationSection {
            retention_seconds: default_retention_seconds(),
            retention_minutes: default_retention_minutes(),
            retention_hours: default_retention_hours(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

impl RedisOptimizationSection {
    /// Series bound for a resolution
    pub fn max_len(&self, resolution: Resolution) -> usize {
        match resolution {
            Resolution::Second => self.retention_seconds,
            Resolution::Minute => self.retention_minutes,
            Resolution::Hour => self.retention_hours,
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `json` or `text`
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Log file path; stderr when unset
    pub file: Option<String>,
    /// `daily`, `hourly` or `never`
    #[serde(default = "default_log_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_log_rotation() -> String {
    "daily".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        LoggingSection {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            rotation: default_log_rotation(),
        }
    }
}

impl LoggingSection {
    fn validate(&self) -> Result<(), ConfigError> {
        if !["json", "text"].contains(&self.format.as_str()) {
            return Err(invalid("logging", "format", "must be json or text"));
        }
        if !["daily", "hourly", "never"].contains(&self.rotation.as_str()) {
            return Err(invalid(
                "logging",
                "rotation",
                "must be daily, hourly or never",
            ));
        }
        Ok(())
    }
}

/// `[alerts]`: admission limits and notification channels
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertsSection {
    #[serde(default)]
    pub max_alerts_per_hour: Option<u32>,
    #[serde(default)]
    pub cooldown_period: Option<u64>,
    pub email: Option<crate::alert::EmailConfig>,
    pub webhook: Option<crate::alert::WebhookConfig>,
    pub logfile: Option<crate::alert::LogFileConfig>,
}

impl AlertsSection {
    /// Admission limits with defaults applied
    pub fn rate_limit(&self) -> crate::alert::RateLimit {
        let defaults = crate::alert::RateLimit::default();
        crate::alert::RateLimit {
            max_alerts_per_hour: self
                .max_alerts_per_hour
                .unwrap_or(defaults.max_alerts_per_hour),
            cooldown_period: self.cooldown_period.unwrap_or(defaults.cooldown_period),
        }
    }
}

/// One API key entry
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyConfig {
    pub key: String,
    pub permissions: Vec<String>,
}

/// `[api]`
#[derive(Debug, Clone, Deserialize)]
pub struct ApiSection {
    #[serde(default = "default_api_bind")]
    pub bind: String,
    #[serde(default)]
    pub keys: Vec<ApiKeyConfig>,
}

fn default_api_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ApiSection {
    fn default() -> Self {
        ApiSection {
            bind: default_api_bind(),
            keys: Vec::new(),
        }
    }
}

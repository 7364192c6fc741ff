use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the reports service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Request admission and generation limits
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// API configuration for the report endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
}

/// Limits applied to each report request
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Divisor applied to available memory to compute the maximum
    /// handleable upload size
    #[serde(default = "default_memory_factor")]
    pub memory_factor: u64,
    /// Total wall-clock deadline per request, in milliseconds. Covers
    /// upload handling, decompression, admission and generation.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Number of analysis worker slots. 0 means available parallelism.
    #[serde(default)]
    pub worker_threads: usize,
}

// Default value functions
fn default_service_name() -> String {
    "reports-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_memory_factor() -> u64 {
    10
}

fn default_timeout_ms() -> u64 {
    29000
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/reports").required(false))
            .add_source(config::File::with_name("/etc/reports/reports").required(false))
            // Override with environment variables
            // REPORTS__LIMITS__TIMEOUT_MS -> limits.timeout_ms
            .add_source(
                config::Environment::with_prefix("REPORTS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get the total request deadline as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.limits.timeout_ms)
    }

    /// Get the analysis worker slot count, resolving 0 to available parallelism
    pub fn worker_threads(&self) -> usize {
        if self.limits.worker_threads > 0 {
            self.limits.worker_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            api: ApiConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            memory_factor: default_memory_factor(),
            timeout_ms: default_timeout_ms(),
            worker_threads: 0,
        }
    }
}

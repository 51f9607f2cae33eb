use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Declarative model registry inputs: defaults mapping and pricing table.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RegistryConfig {
    /// logical id -> provider model id
    #[serde(default)]
    pub defaults: HashMap<String, String>,
    /// tenant -> (logical id -> provider model id), checked before defaults
    #[serde(default)]
    pub tenant_overrides: HashMap<String, HashMap<String, String>>,
    /// provider model id -> priced capability entry
    #[serde(default)]
    pub models: HashMap<String, ModelEntry>,
    /// Fail startup when a configured default has no priced entry
    #[serde(default)]
    pub strict: bool,
}

/// One priced model entry in the registry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelEntry {
    pub provider: String,
    pub input_cost_per_1k: Decimal,
    pub output_cost_per_1k: Decimal,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_context_window")]
    pub context_window: u32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_true")]
    pub supports_streaming: bool,
    #[serde(default)]
    pub supports_function_calling: bool,
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_context_window() -> u32 {
    128_000
}

fn default_max_output_tokens() -> u32 {
    4_096
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct BudgetConfig {
    /// Daily credit limit for the free tier
    pub free_daily_credits: i64,
    /// Daily credit limit for the pro tier
    pub pro_daily_credits: i64,
    /// Daily credit limit for the enterprise tier
    pub enterprise_daily_credits: i64,
    /// Default reservation TTL in seconds
    pub reservation_ttl_secs: u64,
    /// Interval between sweeper passes over expired reservations
    pub sweep_interval_secs: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            free_daily_credits: 100,
            pro_daily_credits: 2_000,
            enterprise_daily_credits: 20_000,
            reservation_ttl_secs: 600,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    /// Channel namespace, e.g. "sse:<namespace>:<conversation_id>"
    pub namespace: String,
    /// Per-conversation broadcast buffer size
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            namespace: "axon".to_string(),
            channel_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum attempts per node execution (including the first)
    pub max_attempts: u32,
    /// Base backoff delay in milliseconds
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds
    pub max_delay_ms: u64,
    /// Use exponential backoff (constant base delay when false)
    pub exponential: bool,
    /// Per-attempt timeout in milliseconds
    pub attempt_timeout_ms: u64,
    /// Consecutive failures before a node's breaker trips
    pub breaker_failure_threshold: u32,
    /// Seconds an open breaker waits before probing again
    pub breaker_recovery_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            exponential: true,
            attempt_timeout_ms: 30_000,
            breaker_failure_threshold: 5,
            breaker_recovery_timeout_secs: 60,
        }
    }
}

impl RuntimeConfig {
    /// Retry policy carrying this config's attempt and backoff settings.
    pub fn retry_policy(&self) -> crate::runtime::RetryPolicy {
        crate::runtime::RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: std::time::Duration::from_millis(self.base_delay_ms),
            max_delay: std::time::Duration::from_millis(self.max_delay_ms),
            exponential: self.exponential,
            ..Default::default()
        }
    }

    /// Default breaker configuration for nodes without a per-node override.
    pub fn breaker_config(&self) -> crate::coordination::CircuitBreakerConfig {
        crate::coordination::CircuitBreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            recovery_timeout_secs: self.breaker_recovery_timeout_secs,
            ..Default::default()
        }
    }

    pub fn attempt_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.attempt_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsensusConfig {
    /// Concurrency cap for provider fan-out
    pub max_concurrency: usize,
    /// Per-provider call timeout in milliseconds
    pub call_timeout_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            call_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("budget.reservation_ttl_secs", 600)?
            .set_default("runtime.max_attempts", 3)?
            .set_default("consensus.max_concurrency", 4)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("AXON_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (AXON_BUDGET__RESERVATION_TTL_SECS, etc.)
            .add_source(
                Environment::with_prefix("AXON")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.budget.free_daily_credits <= 0 {
            errors.push("free_daily_credits must be positive".to_string());
        }
        if self.budget.free_daily_credits > self.budget.pro_daily_credits
            || self.budget.pro_daily_credits > self.budget.enterprise_daily_credits
        {
            errors.push("tier limits must be ordered free <= pro <= enterprise".to_string());
        }
        if self.budget.reservation_ttl_secs == 0 {
            errors.push("reservation_ttl_secs must be nonzero".to_string());
        }

        if self.runtime.max_attempts == 0 {
            errors.push("runtime.max_attempts must be at least 1".to_string());
        }
        if self.runtime.base_delay_ms > self.runtime.max_delay_ms {
            errors.push("runtime.base_delay_ms must not exceed max_delay_ms".to_string());
        }
        if self.runtime.breaker_failure_threshold == 0 {
            errors.push("breaker_failure_threshold must be nonzero".to_string());
        }

        if self.consensus.max_concurrency == 0 {
            errors.push("consensus.max_concurrency must be nonzero".to_string());
        }

        if self.events.channel_capacity == 0 {
            errors.push("events.channel_capacity must be nonzero".to_string());
        }

        for (model_id, entry) in &self.registry.models {
            if entry.input_cost_per_1k < Decimal::ZERO || entry.output_cost_per_1k < Decimal::ZERO {
                errors.push(format!("negative pricing for model {model_id}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Install the global tracing subscriber from logging config.
pub fn init_tracing(cfg: &LoggingConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.level.clone()));

    if cfg.json {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt().with_env_filter(filter).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            registry: RegistryConfig::default(),
            budget: BudgetConfig::default(),
            events: EventsConfig::default(),
            runtime: RuntimeConfig::default(),
            consensus: ConsensusConfig::default(),
            database: None,
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_tiers() {
        let mut cfg = base_config();
        cfg.budget.pro_daily_credits = 10;
        let errors = cfg.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("tier limits")));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut cfg = base_config();
        cfg.runtime.max_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_runtime_config_builds_policy_and_breaker() {
        let cfg = RuntimeConfig {
            max_attempts: 5,
            base_delay_ms: 200,
            breaker_failure_threshold: 2,
            ..Default::default()
        };

        let policy = cfg.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, std::time::Duration::from_millis(200));

        let breaker = cfg.breaker_config();
        assert_eq!(breaker.failure_threshold, 2);
    }
}

use serde::Deserialize;
use std::time::Duration;

use crate::services::circuit_breaker::CircuitBreakerConfig;
use crate::services::dispatcher::DispatcherConfig;
use crate::services::remote::{Endpoint, RetryPolicy};
use crate::services::router::ConfidenceThresholds;

/// Process configuration, read from the environment (and `.env` if present).
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string. Results are kept in memory when unset.
    pub database_url: Option<String>,

    /// Inference node URL for the first-pass identification call
    pub primary_endpoint_url: String,

    /// Inference node URL for verification calls; defaults to the primary node
    pub verification_endpoint_url: Option<String>,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    #[serde(default = "default_low_threshold")]
    pub low_confidence_threshold: f64,

    #[serde(default = "default_high_threshold")]
    pub high_confidence_threshold: f64,

    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,

    #[serde(default = "default_breaker_cooldown_ms")]
    pub breaker_cooldown_ms: u64,

    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,

    #[serde(default = "default_retry_max_elapsed_ms")]
    pub retry_max_elapsed_ms: u64,

    #[serde(default = "default_persist_max_attempts")]
    pub persist_max_attempts: u32,

    #[serde(default = "default_persist_retry_delay_ms")]
    pub persist_retry_delay_ms: u64,

    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    #[serde(default = "default_primary_budget_ms")]
    pub primary_budget_ms: u64,

    #[serde(default = "default_verification_budget_ms")]
    pub verification_budget_ms: u64,

    #[serde(default = "default_total_budget_ms")]
    pub total_budget_ms: u64,

    #[serde(default = "default_result_retention")]
    pub result_retention: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}
fn default_max_concurrency() -> usize {
    8
}
fn default_batch_size() -> usize {
    32
}
fn default_queue_depth() -> usize {
    256
}
fn default_low_threshold() -> f64 {
    0.70
}
fn default_high_threshold() -> f64 {
    0.92
}
fn default_breaker_failure_threshold() -> u32 {
    5
}
fn default_breaker_cooldown_ms() -> u64 {
    5000
}
fn default_call_timeout_ms() -> u64 {
    250
}
fn default_retry_max_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    10
}
fn default_retry_multiplier() -> f64 {
    2.0
}
fn default_retry_max_elapsed_ms() -> u64 {
    1000
}
fn default_persist_max_attempts() -> u32 {
    3
}
fn default_persist_retry_delay_ms() -> u64 {
    20
}
fn default_shutdown_grace_ms() -> u64 {
    5000
}
fn default_primary_budget_ms() -> u64 {
    60
}
fn default_verification_budget_ms() -> u64 {
    40
}
fn default_total_budget_ms() -> u64 {
    100
}
fn default_result_retention() -> usize {
    1024
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Ok(envy::from_env()?)
    }

    /// Build the validated pipeline configuration.
    pub fn pipeline(&self) -> Result<PipelineConfig, ConfigError> {
        let verification_url = self
            .verification_endpoint_url
            .clone()
            .unwrap_or_else(|| self.primary_endpoint_url.clone());

        let config = PipelineConfig {
            primary_endpoint: Endpoint {
                name: "primary".to_string(),
                url: self.primary_endpoint_url.clone(),
            },
            verification_endpoint: Endpoint {
                name: "verification".to_string(),
                url: verification_url,
            },
            dispatcher: DispatcherConfig {
                max_concurrency: self.max_concurrency,
                batch_size: self.batch_size,
                queue_depth: self.queue_depth,
            },
            thresholds: ConfidenceThresholds {
                low: self.low_confidence_threshold,
                high: self.high_confidence_threshold,
            },
            breaker: CircuitBreakerConfig {
                failure_threshold: self.breaker_failure_threshold,
                cooldown: Duration::from_millis(self.breaker_cooldown_ms),
            },
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            retry: RetryPolicy {
                max_attempts: self.retry_max_attempts,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                multiplier: self.retry_multiplier,
                max_elapsed: Duration::from_millis(self.retry_max_elapsed_ms),
            },
            persist_max_attempts: self.persist_max_attempts,
            persist_retry_delay: Duration::from_millis(self.persist_retry_delay_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            budgets: LatencyBudgets {
                primary: Duration::from_millis(self.primary_budget_ms),
                verification: Duration::from_millis(self.verification_budget_ms),
                total: Duration::from_millis(self.total_budget_ms),
            },
            result_retention: self.result_retention,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Per-stage latency targets. Exceeding one is recorded, never enforced.
#[derive(Debug, Clone)]
pub struct LatencyBudgets {
    pub primary: Duration,
    pub verification: Duration,
    pub total: Duration,
}

impl Default for LatencyBudgets {
    fn default() -> Self {
        Self {
            primary: Duration::from_millis(60),
            verification: Duration::from_millis(40),
            total: Duration::from_millis(100),
        }
    }
}

/// Everything the orchestrator needs to run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub primary_endpoint: Endpoint,
    pub verification_endpoint: Endpoint,
    pub dispatcher: DispatcherConfig,
    pub thresholds: ConfidenceThresholds,
    pub breaker: CircuitBreakerConfig,
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
    pub persist_max_attempts: u32,
    pub persist_retry_delay: Duration,
    pub shutdown_grace: Duration,
    pub budgets: LatencyBudgets,
    pub result_retention: usize,
}

impl PipelineConfig {
    /// Defaults for a single inference node serving both stages.
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        let url = endpoint_url.into();
        Self {
            primary_endpoint: Endpoint {
                name: "primary".to_string(),
                url: url.clone(),
            },
            verification_endpoint: Endpoint {
                name: "verification".to_string(),
                url,
            },
            dispatcher: DispatcherConfig::default(),
            thresholds: ConfidenceThresholds::default(),
            breaker: CircuitBreakerConfig::default(),
            call_timeout: Duration::from_millis(default_call_timeout_ms()),
            retry: RetryPolicy::default(),
            persist_max_attempts: default_persist_max_attempts(),
            persist_retry_delay: Duration::from_millis(default_persist_retry_delay_ms()),
            shutdown_grace: Duration::from_millis(default_shutdown_grace_ms()),
            budgets: LatencyBudgets::default(),
            result_retention: default_result_retention(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.dispatcher.max_concurrency == 0 {
            return invalid("max_concurrency must be greater than 0");
        }
        if self.dispatcher.batch_size == 0 {
            return invalid("batch_size must be greater than 0");
        }
        if self.dispatcher.queue_depth == 0 {
            return invalid("queue_depth must be greater than 0");
        }
        let t = &self.thresholds;
        if !(0.0..=1.0).contains(&t.low) || !(0.0..=1.0).contains(&t.high) {
            return invalid("confidence thresholds must be within [0, 1]");
        }
        if t.low > t.high {
            return invalid("low_confidence_threshold must not exceed high_confidence_threshold");
        }
        if self.breaker.failure_threshold == 0 {
            return invalid("breaker_failure_threshold must be greater than 0");
        }
        if self.call_timeout.is_zero() {
            return invalid("call_timeout_ms must be greater than 0");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry_max_attempts must be greater than 0");
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return invalid("retry_multiplier must be a finite number of at least 1.0");
        }
        if self.persist_max_attempts == 0 {
            return invalid("persist_max_attempts must be greater than 0");
        }
        if self.primary_endpoint.url.trim().is_empty() || self.verification_endpoint.url.trim().is_empty() {
            return invalid("endpoint URLs must not be empty");
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

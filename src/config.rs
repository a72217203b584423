//! Configuration surface for the resilience layer.
//!
//! Every field has a default, so partial JSON documents are accepted:
//!
//! ```rust
//! use backstop::ResilienceConfig;
//! use std::time::Duration;
//!
//! let cfg = ResilienceConfig::from_json_str(r#"{ "max_retries": 5, "failure_threshold": 3 }"#)
//!     .unwrap();
//! assert_eq!(cfg.max_retries, 5);
//! assert_eq!(cfg.initial_delay(), Duration::from_millis(100));
//! ```

use crate::backoff::BackoffError;
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerError};
use crate::dead_letter::DeadLetterConfig;
use crate::retry::BuildError;
use crate::{Backoff, Jitter};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Errors produced while loading or applying configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error(transparent)]
    Backoff(#[from] BackoffError),
    #[error(transparent)]
    CircuitBreaker(#[from] CircuitBreakerError),
    #[error(transparent)]
    Build(#[from] BuildError),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { field, reason: reason.into() }
}

/// Recognized options. Durations are integer milliseconds except the dead-letter TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub base_url: String,
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter_percent: f64,
    pub total_retry_timeout_ms: u64,
    pub per_attempt_timeout_ms: u64,
    pub failure_threshold: usize,
    pub success_threshold: usize,
    pub circuit_open_timeout_ms: u64,
    pub half_open_max_calls: usize,
    pub dead_letter_ttl_secs: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_percent: 0.10,
            total_retry_timeout_ms: 300_000,
            per_attempt_timeout_ms: 30_000,
            failure_threshold: 5,
            success_threshold: 2,
            circuit_open_timeout_ms: 30_000,
            half_open_max_calls: 1,
            dead_letter_ttl_secs: 7 * 24 * 60 * 60,
        }
    }
}

impl ResilienceConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(invalid("base_url", "must not be empty"));
        }
        if self.initial_delay_ms == 0 {
            return Err(invalid("initial_delay_ms", "must be > 0"));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(invalid("max_delay_ms", "must be >= initial_delay_ms"));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(invalid("multiplier", format!("must be >= 1.0 (got {})", self.multiplier)));
        }
        if !(0.0..1.0).contains(&self.jitter_percent) {
            return Err(invalid(
                "jitter_percent",
                format!("must be within [0.0, 1.0) (got {})", self.jitter_percent),
            ));
        }
        for (field, value) in [
            ("total_retry_timeout_ms", self.total_retry_timeout_ms),
            ("per_attempt_timeout_ms", self.per_attempt_timeout_ms),
            ("circuit_open_timeout_ms", self.circuit_open_timeout_ms),
            ("dead_letter_ttl_secs", self.dead_letter_ttl_secs),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be > 0"));
            }
        }
        if self.failure_threshold == 0 {
            return Err(invalid("failure_threshold", "must be > 0"));
        }
        if self.success_threshold == 0 {
            return Err(invalid("success_threshold", "must be > 0"));
        }
        if self.half_open_max_calls == 0 {
            return Err(invalid("half_open_max_calls", "must be > 0"));
        }
        Ok(())
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn total_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.total_retry_timeout_ms)
    }

    pub fn per_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.per_attempt_timeout_ms)
    }

    pub fn circuit_open_timeout(&self) -> Duration {
        Duration::from_millis(self.circuit_open_timeout_ms)
    }

    pub fn dead_letter_ttl(&self) -> Duration {
        Duration::from_secs(self.dead_letter_ttl_secs)
    }

    pub fn backoff(&self) -> Result<Backoff, ConfigError> {
        Ok(Backoff::exponential(self.initial_delay(), self.max_delay(), self.multiplier)?)
    }

    pub fn jitter(&self) -> Result<Jitter, ConfigError> {
        if self.jitter_percent == 0.0 {
            return Ok(Jitter::None);
        }
        Jitter::proportional(self.jitter_percent).map_err(|e| invalid("jitter_percent", e))
    }

    pub fn circuit_breaker(&self) -> Result<CircuitBreakerConfig, ConfigError> {
        Ok(CircuitBreakerConfig::new(
            self.failure_threshold,
            self.success_threshold,
            self.circuit_open_timeout(),
        )?
        .with_half_open_limit(self.half_open_max_calls)?)
    }

    pub fn dead_letter(&self) -> DeadLetterConfig {
        DeadLetterConfig::default().with_ttl(self.dead_letter_ttl())
    }
}

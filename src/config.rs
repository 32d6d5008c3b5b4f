//! Configuration management

use std::path::Path;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Health policy
    pub policy: OpsPolicy,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// Environment variables use the `OPS_HEALTH_` prefix with `__` as the
    /// nesting separator, e.g. `OPS_HEALTH_POLICY__COOLDOWN_MS=5000`.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("OPS_HEALTH_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        tracing::debug!(
            window_ms = config.policy.window_ms,
            cooldown_ms = config.policy.cooldown_ms,
            "Loaded ops-health configuration"
        );

        Ok(config)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (text, json)
    pub format: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: None,
        }
    }
}

/// Health scoring and kill-switch policy.
///
/// A zero `max_*` threshold disables that category's penalty. The kill
/// switch does not validate a policy; call [`OpsPolicy::validate`] when
/// constructing one from untrusted input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsPolicy {
    /// Trailing window for event counts (ms)
    pub window_ms: i64,
    /// Error events per window that saturate the error penalty
    pub max_errors_per_window: u32,
    /// Throttle (429) events per window that saturate the throttle penalty
    pub max_429_per_window: u32,
    /// Reconnects per window that saturate the reconnect penalty
    pub max_reconnects_per_window: u32,
    /// p95 latency ceiling (ms)
    pub max_p95_latency_ms: f64,
    /// Weight of the error penalty
    pub weight_errors: f64,
    /// Weight of the throttle penalty
    pub weight_429: f64,
    /// Weight of the reconnect penalty
    pub weight_reconnects: f64,
    /// Weight of the latency penalty
    pub weight_latency: f64,
    /// Scores at or above this are GREEN
    pub score_threshold_yellow: f64,
    /// Scores below this are RED
    pub score_threshold_red: f64,
    /// Kill-switch cooldown after a RED classification (ms)
    pub cooldown_ms: i64,
}

impl Default for OpsPolicy {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_errors_per_window: 10,
            max_429_per_window: 5,
            max_reconnects_per_window: 3,
            max_p95_latency_ms: 1_000.0,
            weight_errors: 0.4,
            weight_429: 0.2,
            weight_reconnects: 0.2,
            weight_latency: 0.2,
            score_threshold_yellow: 0.7,
            score_threshold_red: 0.4,
            cooldown_ms: 30_000,
        }
    }
}

impl OpsPolicy {
    /// Pre-flight check for policies built from external input.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPolicy`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.window_ms < 0 {
            return Err(invalid("window_ms must be non-negative"));
        }
        if self.cooldown_ms < 0 {
            return Err(invalid("cooldown_ms must be non-negative"));
        }

        let non_negative = [
            ("max_p95_latency_ms", self.max_p95_latency_ms),
            ("weight_errors", self.weight_errors),
            ("weight_429", self.weight_429),
            ("weight_reconnects", self.weight_reconnects),
            ("weight_latency", self.weight_latency),
        ];
        for (field, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(&format!(
                    "{field} must be finite and non-negative (got {value})"
                )));
            }
        }

        let thresholds = [
            ("score_threshold_yellow", self.score_threshold_yellow),
            ("score_threshold_red", self.score_threshold_red),
        ];
        for (field, value) in thresholds {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(&format!("{field} must lie in [0, 1] (got {value})")));
            }
        }

        if self.score_threshold_yellow < self.score_threshold_red {
            return Err(invalid(&format!(
                "score_threshold_yellow ({}) must be >= score_threshold_red ({})",
                self.score_threshold_yellow, self.score_threshold_red
            )));
        }

        Ok(())
    }
}

fn invalid(msg: &str) -> Error {
    Error::InvalidPolicy(msg.to_string())
}

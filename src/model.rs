//! Data contracts: subject state, health classification, and the output signal

use std::fmt;

use serde::{Deserialize, Serialize};

/// Reason code: the score fell below the red threshold.
pub const REASON_BELOW_RED: &str = "health_score_below_red_threshold";
/// Reason code: the subject is inside a kill-switch cooldown.
pub const REASON_COOLDOWN_ACTIVE: &str = "kill_switch_cooldown_active";
/// Reason code: scoring failed and the signal was forced closed.
pub const REASON_FAIL_CLOSED: &str = "fail_closed_exception";

/// Three-level health classification, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    /// Healthy
    Green,
    /// Degraded but tolerable
    Yellow,
    /// Unhealthy
    Red,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Green => "GREEN",
            Self::Yellow => "YELLOW",
            Self::Red => "RED",
        })
    }
}

/// Binary recommendation handed back to the decision pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// Do not act
    Hold,
    /// Safe to act
    Act,
}

/// Mutable health state for a single subject.
///
/// Timestamps are milliseconds and are expected in non-decreasing order.
/// Latency samples carry no timestamps and are never windowed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsState {
    /// Error event timestamps
    pub error_timestamps: Vec<i64>,
    /// Throttle / rate-limit (429) event timestamps
    pub rate_limit_timestamps: Vec<i64>,
    /// Reconnect event timestamps
    pub reconnect_timestamps: Vec<i64>,
    /// Latency samples in milliseconds
    pub latency_samples: Vec<f64>,
    /// Kill-switch cooldown deadline, if latched
    pub cooldown_until_ms: Option<i64>,
}

impl OpsState {
    /// Create an empty state
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error event
    pub fn record_error(&mut self, ts_ms: i64) {
        self.error_timestamps.push(ts_ms);
    }

    /// Record a throttle / rate-limit event
    pub fn record_rate_limit(&mut self, ts_ms: i64) {
        self.rate_limit_timestamps.push(ts_ms);
    }

    /// Record a reconnect event
    pub fn record_reconnect(&mut self, ts_ms: i64) {
        self.reconnect_timestamps.push(ts_ms);
    }

    /// Record a latency sample
    pub fn record_latency(&mut self, latency_ms: f64) {
        self.latency_samples.push(latency_ms);
    }

    /// Whether a cooldown deadline is latched and still in the future.
    #[must_use]
    pub fn in_cooldown(&self, now_ms: i64) -> bool {
        self.cooldown_until_ms.is_some_and(|until| now_ms < until)
    }
}

/// Kill-switch decision record. A value, rebuilt on every evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpsSignal {
    /// Health score in `[0, 1]`
    pub score: f64,
    /// Classification derived from the score
    pub state: HealthState,
    /// Authoritative gate: callers must not act while this is set
    pub deny_actions: bool,
    /// Cooldown deadline as held in the subject state after evaluation
    pub cooldown_until_ms: Option<i64>,
    /// Recommended action
    pub recommended_action: Action,
    /// Diagnostic reason codes, in order
    pub reasons: Vec<String>,
}

impl OpsSignal {
    /// The signal returned whenever scoring fails.
    #[must_use]
    pub fn fail_closed(cooldown_until_ms: Option<i64>) -> Self {
        Self {
            score: 0.0,
            state: HealthState::Red,
            deny_actions: true,
            cooldown_until_ms,
            recommended_action: Action::Hold,
            reasons: vec![REASON_FAIL_CLOSED.to_string()],
        }
    }

    /// Whether this signal came from the fail-closed path.
    #[must_use]
    pub fn is_fail_closed(&self) -> bool {
        self.reasons.iter().any(|r| r == REASON_FAIL_CLOSED)
    }
}

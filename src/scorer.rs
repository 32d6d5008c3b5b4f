//! Health score computation
//!
//! Each timestamped category is normalized against its per-window threshold,
//! latency against its p95 ceiling, and the weighted penalties are deducted
//! from 1:
//!
//! ```text
//! p_err = min(1, errors / max_errors)            (0 when max_errors == 0)
//! p_429 = min(1, throttles / max_429)            (0 when max_429 == 0)
//! p_rec = min(1, reconnects / max_reconnects)    (0 when max_reconnects == 0)
//! p_lat = min(1, (p95 - ceiling) / ceiling)      (only when p95 > ceiling)
//! score = clamp(1 - (w_err*p_err + w_429*p_429 + w_rec*p_rec + w_lat*p_lat), 0, 1)
//! ```
//!
//! Scoring is pure: it re-derives the window instead of relying on prior
//! pruning and never mutates the state.

use serde::Serialize;

use crate::config::OpsPolicy;
use crate::error::ScoreError;
use crate::model::{HealthState, OpsState};
use crate::windows::count_in_window;

/// Percentile used for the latency penalty
const LATENCY_PERCENTILE: f64 = 0.95;

/// Source of `(score, classification)` for the kill switch.
pub trait HealthScorer {
    /// Score `state` under `policy` at `now_ms`.
    fn score(
        &self,
        state: &OpsState,
        policy: &OpsPolicy,
        now_ms: i64,
    ) -> Result<(f64, HealthState), ScoreError>;
}

/// The weighted-penalty scorer.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultScorer;

impl HealthScorer for DefaultScorer {
    fn score(
        &self,
        state: &OpsState,
        policy: &OpsPolicy,
        now_ms: i64,
    ) -> Result<(f64, HealthState), ScoreError> {
        compute_health_score(state, policy, now_ms)
    }
}

/// Intermediate values behind a score, for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthBreakdown {
    /// Error events in window
    pub errors: usize,
    /// Throttle events in window
    pub rate_limits: usize,
    /// Reconnect events in window
    pub reconnects: usize,
    /// p95 over all retained latency samples
    pub p95_latency_ms: Option<f64>,
    /// Error penalty
    pub penalty_errors: f64,
    /// Throttle penalty
    pub penalty_429: f64,
    /// Reconnect penalty
    pub penalty_reconnects: f64,
    /// Latency penalty
    pub penalty_latency: f64,
    /// Clamped score
    pub score: f64,
    /// Classification
    pub state: HealthState,
}

/// Compute the health score and classification.
pub fn compute_health_score(
    state: &OpsState,
    policy: &OpsPolicy,
    now_ms: i64,
) -> Result<(f64, HealthState), ScoreError> {
    health_breakdown(state, policy, now_ms).map(|b| (b.score, b.state))
}

/// Compute the score along with every count and penalty feeding it.
pub fn health_breakdown(
    state: &OpsState,
    policy: &OpsPolicy,
    now_ms: i64,
) -> Result<HealthBreakdown, ScoreError> {
    let errors = count_in_window(&state.error_timestamps, now_ms, policy.window_ms);
    let rate_limits = count_in_window(&state.rate_limit_timestamps, now_ms, policy.window_ms);
    let reconnects = count_in_window(&state.reconnect_timestamps, now_ms, policy.window_ms);

    let penalty_errors = ratio_penalty(errors, policy.max_errors_per_window);
    let penalty_429 = ratio_penalty(rate_limits, policy.max_429_per_window);
    let penalty_reconnects = ratio_penalty(reconnects, policy.max_reconnects_per_window);

    // Latency samples are not windowed: the percentile covers every retained sample.
    let p95_latency_ms = p95_latency(&state.latency_samples)?;
    let penalty_latency = match p95_latency_ms {
        Some(p95) => latency_penalty(p95, policy.max_p95_latency_ms)?,
        None => 0.0,
    };

    let raw = 1.0
        - (policy.weight_errors * penalty_errors
            + policy.weight_429 * penalty_429
            + policy.weight_reconnects * penalty_reconnects
            + policy.weight_latency * penalty_latency);

    if !raw.is_finite() {
        return Err(ScoreError::NonFiniteScore(raw));
    }

    let score = raw.clamp(0.0, 1.0);
    let health = classify(score, policy);

    tracing::trace!(
        errors,
        rate_limits,
        reconnects,
        ?p95_latency_ms,
        score,
        state = %health,
        "Computed health score"
    );

    Ok(HealthBreakdown {
        errors,
        rate_limits,
        reconnects,
        p95_latency_ms,
        penalty_errors,
        penalty_429,
        penalty_reconnects,
        penalty_latency,
        score,
        state: health,
    })
}

/// Classify a score against the policy's yellow/red thresholds.
///
/// With `yellow < red` the YELLOW band is empty; that is a tuning problem,
/// not a runtime failure.
#[must_use]
pub fn classify(score: f64, policy: &OpsPolicy) -> HealthState {
    if score >= policy.score_threshold_yellow {
        HealthState::Green
    } else if score >= policy.score_threshold_red {
        HealthState::Yellow
    } else {
        HealthState::Red
    }
}

/// 95th percentile of `samples` (index `floor(0.95 * n)`, clamped).
///
/// Returns `Ok(None)` for an empty set.
pub fn p95_latency(samples: &[f64]) -> Result<Option<f64>, ScoreError> {
    if samples.is_empty() {
        return Ok(None);
    }
    if samples.iter().any(|s| !s.is_finite()) {
        return Err(ScoreError::NonFiniteInput {
            field: "latency_samples",
        });
    }

    let mut sorted = samples.to_vec();
    sorted.sort_unstable_by(f64::total_cmp);

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let index = ((sorted.len() as f64) * LATENCY_PERCENTILE).floor() as usize;
    let index = index.min(sorted.len() - 1);
    Ok(sorted.get(index).copied())
}

#[allow(clippy::cast_precision_loss)]
fn ratio_penalty(count: usize, threshold: u32) -> f64 {
    if threshold == 0 {
        return 0.0;
    }
    (count as f64 / f64::from(threshold)).min(1.0)
}

#[allow(clippy::float_cmp)]
fn latency_penalty(p95: f64, ceiling: f64) -> Result<f64, ScoreError> {
    if !ceiling.is_finite() {
        return Err(ScoreError::NonFiniteInput {
            field: "max_p95_latency_ms",
        });
    }
    if ceiling == 0.0 || p95 <= ceiling {
        return Ok(0.0);
    }
    Ok(((p95 - ceiling) / ceiling).min(1.0))
}

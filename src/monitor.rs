//! Per-subject state ownership
//!
//! [`HealthMonitor`] keeps one [`OpsState`] per named subject, each behind
//! its own lock, so evaluations of different subjects never contend and two
//! evaluations of the same subject never interleave. Subjects are scored
//! independently; nothing is aggregated across them.
//!
//! Each evaluation publishes the `ops_health_score` gauge labelled with the
//! subject. A fail-closed evaluation publishes `0.0`.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use telemetry_metrics::gauge;
use tracing::debug;

use crate::config::OpsPolicy;
use crate::error::ScoreError;
use crate::kill_switch::KillSwitch;
use crate::model::{HealthState, OpsSignal, OpsState};
use crate::scorer::{DefaultScorer, HealthScorer};

/// Registry of subject states evaluated by a shared [`KillSwitch`].
#[derive(Debug)]
pub struct HealthMonitor<S = DefaultScorer> {
    kill_switch: KillSwitch<S>,
    subjects: DashMap<String, Arc<Mutex<OpsState>>>,
}

impl HealthMonitor<DefaultScorer> {
    /// Create a monitor using the weighted-penalty scorer.
    #[must_use]
    pub fn new(policy: OpsPolicy) -> Self {
        Self::with_kill_switch(KillSwitch::new(policy))
    }
}

impl<S: HealthScorer> HealthMonitor<S> {
    /// Create a monitor around an existing kill switch.
    #[must_use]
    pub fn with_kill_switch(kill_switch: KillSwitch<S>) -> Self {
        Self {
            kill_switch,
            subjects: DashMap::new(),
        }
    }

    /// The bound policy
    #[must_use]
    pub fn policy(&self) -> &OpsPolicy {
        self.kill_switch.policy()
    }

    // ── Event recording ───────────────────────────────────────────────────────

    /// Record an error event for `subject`.
    pub fn record_error(&self, subject: &str, ts_ms: i64) {
        self.get_or_create(subject).lock().record_error(ts_ms);
    }

    /// Record a throttle / rate-limit event for `subject`.
    pub fn record_rate_limit(&self, subject: &str, ts_ms: i64) {
        self.get_or_create(subject).lock().record_rate_limit(ts_ms);
    }

    /// Record a reconnect event for `subject`.
    pub fn record_reconnect(&self, subject: &str, ts_ms: i64) {
        self.get_or_create(subject).lock().record_reconnect(ts_ms);
    }

    /// Record a latency sample for `subject`.
    pub fn record_latency(&self, subject: &str, latency_ms: f64) {
        self.get_or_create(subject).lock().record_latency(latency_ms);
    }

    // ── Evaluation ────────────────────────────────────────────────────────────

    /// Run the kill switch for `subject`.
    ///
    /// Unknown subjects are evaluated against a temporary empty state that is
    /// not retained, so only recording grows the registry.
    pub fn evaluate(&self, subject: &str, now_ms: i64) -> OpsSignal {
        let signal = match self.existing(subject) {
            Some(state) => self.kill_switch.evaluate(&mut state.lock(), now_ms),
            None => self.kill_switch.evaluate(&mut OpsState::default(), now_ms),
        };
        gauge!("ops_health_score", "subject" => subject.to_string()).set(signal.score);
        signal
    }

    /// Read-only score for `subject`. Unknown subjects score as an empty state.
    pub fn score(&self, subject: &str, now_ms: i64) -> Result<(f64, HealthState), ScoreError> {
        match self.existing(subject) {
            Some(state) => self.kill_switch.score(&state.lock(), now_ms),
            None => self.kill_switch.score(&OpsState::default(), now_ms),
        }
    }

    // ── Housekeeping ──────────────────────────────────────────────────────────

    /// Copy of the current state for `subject`, if tracked.
    #[must_use]
    pub fn snapshot(&self, subject: &str) -> Option<OpsState> {
        self.existing(subject).map(|s| s.lock().clone())
    }

    /// Forget `subject` entirely. Returns `true` if it was tracked.
    pub fn reset(&self, subject: &str) -> bool {
        let removed = self.subjects.remove(subject).is_some();
        if removed {
            debug!(subject, "Subject health state reset");
        }
        removed
    }

    /// Names of all tracked subjects (snapshot, unordered).
    #[must_use]
    pub fn subjects(&self) -> Vec<String> {
        self.subjects.iter().map(|e| e.key().clone()).collect()
    }

    // ── Internal helpers ──────────────────────────────────────────────────────

    fn existing(&self, subject: &str) -> Option<Arc<Mutex<OpsState>>> {
        self.subjects.get(subject).map(|s| Arc::clone(s.value()))
    }

    fn get_or_create(&self, subject: &str) -> Arc<Mutex<OpsState>> {
        // Clone the Arc out so the shard lock is released before the state lock is taken.
        self.subjects
            .entry(subject.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(OpsState::default())))
            .clone()
    }
}

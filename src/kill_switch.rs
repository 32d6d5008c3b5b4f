//! Kill switch: cooldown latching and fail-closed admission decisions.
//!
//! Each evaluation:
//!
//! 1. prunes the subject's event logs to the policy window (in place),
//! 2. scores the pruned state,
//! 3. latches a cooldown on a RED classification unless one is already active,
//! 4. clears a cooldown whose deadline has been reached,
//! 5. returns an [`OpsSignal`] that denies actions while RED or cooling down.
//!
//! Any scoring failure, including a panic inside a custom [`HealthScorer`],
//! yields [`OpsSignal::fail_closed`]. Evaluation never returns an error.
//! The only diagnostic is one warning carrying the failure category; panic
//! messages raised while scoring are kept off the panic hook's output.
//!
//! A subject is either in cooldown or not; that membership is derived from
//! `cooldown_until_ms` on every call rather than stored separately.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;

use telemetry_metrics::counter;
use tracing::{debug, info, warn};

use crate::config::OpsPolicy;
use crate::error::ScoreError;
use crate::model::{
    Action, HealthState, OpsSignal, OpsState, REASON_BELOW_RED, REASON_COOLDOWN_ACTIVE,
};
use crate::scorer::{DefaultScorer, HealthScorer};
use crate::windows::prune_timestamps_in_place;

// ============================================================================
// Kill switch
// ============================================================================

/// A policy bound to a scorer.
///
/// Holds no subject state; the same switch can evaluate any number of
/// independently owned [`OpsState`] values.
#[derive(Debug, Clone, Default)]
pub struct KillSwitch<S = DefaultScorer> {
    policy: OpsPolicy,
    scorer: S,
}

impl KillSwitch<DefaultScorer> {
    /// Create a kill switch using the weighted-penalty scorer.
    #[must_use]
    pub fn new(policy: OpsPolicy) -> Self {
        Self {
            policy,
            scorer: DefaultScorer,
        }
    }
}

impl<S: HealthScorer> KillSwitch<S> {
    /// Create a kill switch with a custom scorer.
    #[must_use]
    pub fn with_scorer(policy: OpsPolicy, scorer: S) -> Self {
        Self { policy, scorer }
    }

    /// The bound policy
    #[must_use]
    pub fn policy(&self) -> &OpsPolicy {
        &self.policy
    }

    /// Evaluate `state` at `now_ms`. See [`update_kill_switch_with`].
    pub fn evaluate(&self, state: &mut OpsState, now_ms: i64) -> OpsSignal {
        update_kill_switch_with(&self.scorer, state, &self.policy, now_ms)
    }

    /// Read-only score of `state`, without pruning or cooldown handling.
    pub fn score(&self, state: &OpsState, now_ms: i64) -> Result<(f64, HealthState), ScoreError> {
        guarded_score(&self.scorer, state, &self.policy, now_ms)
    }
}

/// Evaluate the kill switch with the weighted-penalty scorer.
pub fn update_kill_switch(state: &mut OpsState, policy: &OpsPolicy, now_ms: i64) -> OpsSignal {
    update_kill_switch_with(&DefaultScorer, state, policy, now_ms)
}

/// Evaluate the kill switch with an explicit scorer.
///
/// Mutates `state`: event logs are pruned and `cooldown_until_ms` may be
/// latched or cleared. The caller must hold exclusive access to `state`
/// for the duration of the call.
///
/// The first call installs a process-wide panic hook that forwards to the
/// previous hook except while a scorer runs on the current thread. A hook
/// installed by the host afterwards replaces it, and scorer panic messages
/// then reach that hook.
pub fn update_kill_switch_with<S>(
    scorer: &S,
    state: &mut OpsState,
    policy: &OpsPolicy,
    now_ms: i64,
) -> OpsSignal
where
    S: HealthScorer + ?Sized,
{
    counter!("ops_health_evaluations_total").increment(1);

    prune_timestamps_in_place(&mut state.error_timestamps, now_ms, policy.window_ms);
    prune_timestamps_in_place(&mut state.rate_limit_timestamps, now_ms, policy.window_ms);
    prune_timestamps_in_place(&mut state.reconnect_timestamps, now_ms, policy.window_ms);

    let (score, health) = match guarded_score(scorer, state, policy, now_ms) {
        Ok(result) => result,
        Err(e) => {
            warn!(
                category = e.category(),
                "Kill switch fail-closed on scoring failure"
            );
            counter!("ops_health_fail_closed_total").increment(1);
            return OpsSignal::fail_closed(state.cooldown_until_ms);
        }
    };

    let mut in_cooldown = state.in_cooldown(now_ms);

    // Latch only when not already cooling down; an active deadline is never extended.
    if health == HealthState::Red && !in_cooldown {
        let until = now_ms.saturating_add(policy.cooldown_ms);
        state.cooldown_until_ms = Some(until);
        in_cooldown = now_ms < until;
        counter!("ops_health_cooldown_latched_total").increment(1);
        info!(
            score,
            cooldown_until_ms = until,
            "Kill switch engaged: health below red threshold"
        );
    }

    if let Some(until) = state.cooldown_until_ms {
        if now_ms >= until {
            state.cooldown_until_ms = None;
            in_cooldown = false;
            debug!(cooldown_until_ms = until, "Kill switch cooldown expired");
        }
    }

    let mut reasons = Vec::new();
    if health == HealthState::Red {
        reasons.push(REASON_BELOW_RED.to_string());
    }
    if in_cooldown {
        reasons.push(REASON_COOLDOWN_ACTIVE.to_string());
    }

    let deny_actions = in_cooldown || health == HealthState::Red;

    OpsSignal {
        score,
        state: health,
        deny_actions,
        cooldown_until_ms: state.cooldown_until_ms,
        recommended_action: if deny_actions {
            Action::Hold
        } else {
            Action::Act
        },
        reasons,
    }
}

// ============================================================================
// Failure capture
// ============================================================================

/// Run the scorer, converting panics and out-of-range scores into errors.
fn guarded_score<S>(
    scorer: &S,
    state: &OpsState,
    policy: &OpsPolicy,
    now_ms: i64,
) -> Result<(f64, HealthState), ScoreError>
where
    S: HealthScorer + ?Sized,
{
    let (score, health) = catch_quietly(|| scorer.score(state, policy, now_ms))
        .unwrap_or(Err(ScoreError::Panicked))?;

    if !score.is_finite() {
        return Err(ScoreError::NonFiniteScore(score));
    }
    if !(0.0..=1.0).contains(&score) {
        return Err(ScoreError::OutOfRange(score));
    }
    Ok((score, health))
}

thread_local! {
    static QUIET_PANICS: Cell<bool> = const { Cell::new(false) };
}

static QUIET_HOOK: Once = Once::new();

/// Wrap the current panic hook so it is skipped while `QUIET_PANICS` is set.
fn install_quiet_hook() {
    QUIET_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if !QUIET_PANICS.with(Cell::get) {
                previous(info);
            }
        }));
    });
}

/// `catch_unwind` that keeps the panic payload away from the panic hook.
fn catch_quietly<T>(f: impl FnOnce() -> T) -> std::thread::Result<T> {
    install_quiet_hook();
    let was_quiet = QUIET_PANICS.with(|q| q.replace(true));
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    QUIET_PANICS.with(|q| q.set(was_quiet));
    result
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::REASON_FAIL_CLOSED;
    use pretty_assertions::assert_eq;
    use std::fmt;
    use std::sync::Arc;
    use tracing::field::{Field, Visit};
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    const T: i64 = 1_000_000;

    const SECRET: &str = "db=prod-1 token=abc";

    /// One captured tracing event: level plus every recorded field.
    type Record = (Level, Vec<(String, String)>);

    /// Layer that records every event it sees.
    #[derive(Clone, Default)]
    struct CaptureLayer(Arc<parking_lot::Mutex<Vec<Record>>>);

    impl CaptureLayer {
        fn warnings(&self) -> Vec<Vec<(String, String)>> {
            self.0
                .lock()
                .iter()
                .filter(|(level, _)| *level == Level::WARN)
                .map(|(_, fields)| fields.clone())
                .collect()
        }
    }

    #[derive(Default)]
    struct FieldVisitor(Vec<(String, String)>);

    impl Visit for FieldVisitor {
        fn record_str(&mut self, field: &Field, value: &str) {
            self.0.push((field.name().to_string(), value.to_string()));
        }

        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            self.0.push((field.name().to_string(), format!("{value:?}")));
        }
    }

    impl<S: Subscriber> Layer<S> for CaptureLayer {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            let mut visitor = FieldVisitor::default();
            event.record(&mut visitor);
            self.0.lock().push((*event.metadata().level(), visitor.0));
        }
    }

    /// Run `f` with a capturing subscriber on this thread.
    fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, CaptureLayer) {
        let layer = CaptureLayer::default();
        let subscriber = tracing_subscriber::registry().with(layer.clone());
        let out = tracing::subscriber::with_default(subscriber, f);
        (out, layer)
    }

    fn field<'a>(fields: &'a [(String, String)], name: &str) -> Option<&'a str> {
        fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Scorer that always fails, standing in for a faulting computation.
    struct FailingScorer;

    impl HealthScorer for FailingScorer {
        fn score(&self, _: &OpsState, _: &OpsPolicy, _: i64) -> Result<(f64, HealthState), ScoreError> {
            Err(ScoreError::NonFiniteScore(f64::NAN))
        }
    }

    struct PanickingScorer;

    impl HealthScorer for PanickingScorer {
        fn score(&self, _: &OpsState, _: &OpsPolicy, _: i64) -> Result<(f64, HealthState), ScoreError> {
            panic!("simulated scorer fault {SECRET}");
        }
    }

    /// Scorer returning a fixed result regardless of state.
    struct FixedScorer(f64, HealthState);

    impl HealthScorer for FixedScorer {
        fn score(&self, _: &OpsState, _: &OpsPolicy, _: i64) -> Result<(f64, HealthState), ScoreError> {
            Ok((self.0, self.1))
        }
    }

    /// Policy where hitting `max_errors_per_window` alone drives the score to 0.
    fn error_only_policy() -> OpsPolicy {
        OpsPolicy {
            window_ms: 60_000,
            max_errors_per_window: 3,
            weight_errors: 1.0,
            weight_429: 0.0,
            weight_reconnects: 0.0,
            weight_latency: 0.0,
            cooldown_ms: 10_000,
            ..OpsPolicy::default()
        }
    }

    fn red_state(now: i64) -> OpsState {
        let mut state = OpsState::new();
        for i in 0..3 {
            state.record_error(now - i);
        }
        state
    }

    // ── All clear ────────────────────────────────────────────────────────────

    #[test]
    fn empty_state_allows_action() {
        let mut state = OpsState::new();
        let signal = update_kill_switch(&mut state, &OpsPolicy::default(), T);
        assert!((signal.score - 1.0).abs() < f64::EPSILON);
        assert_eq!(signal.state, HealthState::Green);
        assert!(!signal.deny_actions);
        assert_eq!(signal.recommended_action, Action::Act);
        assert!(signal.reasons.is_empty());
        assert_eq!(signal.cooldown_until_ms, None);
    }

    #[test]
    fn yellow_does_not_deny() {
        // GIVEN: 5 of 10 errors at full error weight → score 0.5 (YELLOW)
        let policy = OpsPolicy {
            weight_errors: 1.0,
            weight_429: 0.0,
            weight_reconnects: 0.0,
            weight_latency: 0.0,
            ..OpsPolicy::default()
        };
        let mut state = OpsState::new();
        for i in 0..5 {
            state.record_error(T - i);
        }
        let signal = update_kill_switch(&mut state, &policy, T);
        assert_eq!(signal.state, HealthState::Yellow);
        assert!(!signal.deny_actions);
        assert_eq!(signal.recommended_action, Action::Act);
        assert_eq!(state.cooldown_until_ms, None);
    }

    // ── Threshold breach and latching ────────────────────────────────────────

    #[test]
    fn red_latches_cooldown_and_reports_both_reasons() {
        // GIVEN: error count at threshold with full error weight
        let policy = error_only_policy();
        let mut state = red_state(T);
        // WHEN: evaluated
        let signal = update_kill_switch(&mut state, &policy, T);
        // THEN: RED, cooldown latched at T + cooldown
        assert_eq!(signal.state, HealthState::Red);
        assert!(signal.score < policy.score_threshold_red);
        assert!(signal.deny_actions);
        assert_eq!(signal.recommended_action, Action::Hold);
        assert_eq!(state.cooldown_until_ms, Some(T + 10_000));
        assert_eq!(signal.cooldown_until_ms, Some(T + 10_000));
        assert_eq!(
            signal.reasons,
            vec![REASON_BELOW_RED.to_string(), REASON_COOLDOWN_ACTIVE.to_string()]
        );
    }

    #[test]
    fn cooldown_holds_until_deadline_then_releases() {
        let policy = error_only_policy();
        let mut state = red_state(T);
        update_kill_switch(&mut state, &policy, T);

        // Errors age out of the window; health is GREEN again
        state.error_timestamps.clear();

        // One ms before the deadline: still held
        let held = update_kill_switch(&mut state, &policy, T + 9_999);
        assert_eq!(held.state, HealthState::Green);
        assert!(held.deny_actions);
        assert_eq!(held.recommended_action, Action::Hold);
        assert_eq!(held.reasons, vec![REASON_COOLDOWN_ACTIVE.to_string()]);

        // At the deadline: released in the same call
        let released = update_kill_switch(&mut state, &policy, T + 10_000);
        assert!(!released.deny_actions);
        assert_eq!(released.recommended_action, Action::Act);
        assert!(released.reasons.is_empty());
        assert_eq!(released.cooldown_until_ms, None);
        assert_eq!(state.cooldown_until_ms, None);
    }

    #[test]
    fn repeated_red_does_not_extend_cooldown() {
        let policy = error_only_policy();
        let mut state = red_state(T);
        update_kill_switch(&mut state, &policy, T);
        assert_eq!(state.cooldown_until_ms, Some(T + 10_000));

        // Still RED five seconds later
        for i in 0..3 {
            state.record_error(T + 5_000 - i);
        }
        let signal = update_kill_switch(&mut state, &policy, T + 5_000);
        assert_eq!(signal.state, HealthState::Red);
        assert_eq!(state.cooldown_until_ms, Some(T + 10_000));
    }

    #[test]
    fn red_at_expiry_relatches() {
        let policy = error_only_policy();
        let mut state = red_state(T);
        update_kill_switch(&mut state, &policy, T);

        let later = T + 10_000;
        for i in 0..3 {
            state.record_error(later - i);
        }
        let signal = update_kill_switch(&mut state, &policy, later);
        assert_eq!(state.cooldown_until_ms, Some(later + 10_000));
        assert!(signal.deny_actions);
    }

    #[test]
    fn zero_cooldown_denies_only_while_red() {
        let policy = OpsPolicy {
            cooldown_ms: 0,
            ..error_only_policy()
        };
        let mut state = red_state(T);
        let signal = update_kill_switch(&mut state, &policy, T);
        assert!(signal.deny_actions);
        assert_eq!(signal.reasons, vec![REASON_BELOW_RED.to_string()]);
        assert_eq!(state.cooldown_until_ms, None);
    }

    #[test]
    fn stale_cooldown_is_cleared() {
        let mut state = OpsState {
            cooldown_until_ms: Some(T - 1),
            ..OpsState::default()
        };
        let signal = update_kill_switch(&mut state, &OpsPolicy::default(), T);
        assert!(!signal.deny_actions);
        assert_eq!(state.cooldown_until_ms, None);
    }

    // ── Pruning ──────────────────────────────────────────────────────────────

    #[test]
    fn evaluation_prunes_event_logs_in_place() {
        let policy = OpsPolicy::default();
        let mut state = OpsState {
            error_timestamps: vec![T - 60_001, T - 60_000, T],
            rate_limit_timestamps: vec![0, 1, 2],
            reconnect_timestamps: vec![T - 100],
            latency_samples: vec![1.0, 2.0],
            cooldown_until_ms: None,
        };
        update_kill_switch(&mut state, &policy, T);
        assert_eq!(state.error_timestamps, vec![T - 60_000, T]);
        assert!(state.rate_limit_timestamps.is_empty());
        assert_eq!(state.reconnect_timestamps, vec![T - 100]);
        // Latency samples are never windowed
        assert_eq!(state.latency_samples, vec![1.0, 2.0]);
    }

    // ── Fail-closed ──────────────────────────────────────────────────────────

    #[test]
    fn scorer_error_fails_closed() {
        let mut state = OpsState::new();
        let signal = update_kill_switch_with(&FailingScorer, &mut state, &OpsPolicy::default(), T);
        assert!(signal.deny_actions);
        assert_eq!(signal.recommended_action, Action::Hold);
        assert_eq!(signal.state, HealthState::Red);
        assert!(signal.score.abs() < f64::EPSILON);
        assert_eq!(signal.reasons, vec![REASON_FAIL_CLOSED.to_string()]);
    }

    #[test]
    fn scorer_panic_fails_closed() {
        let mut state = OpsState::new();
        let signal =
            update_kill_switch_with(&PanickingScorer, &mut state, &OpsPolicy::default(), T);
        assert!(signal.deny_actions);
        assert_eq!(signal.recommended_action, Action::Hold);
        assert!(signal.is_fail_closed());
    }

    #[test]
    fn fail_closed_leaves_cooldown_untouched() {
        // GIVEN: a stale cooldown that a successful evaluation would clear
        let mut state = OpsState {
            cooldown_until_ms: Some(T - 1),
            ..OpsState::default()
        };
        let signal = update_kill_switch_with(&FailingScorer, &mut state, &OpsPolicy::default(), T);
        assert_eq!(state.cooldown_until_ms, Some(T - 1));
        assert_eq!(signal.cooldown_until_ms, Some(T - 1));
    }

    #[test]
    fn corrupted_latency_sample_fails_closed() {
        let mut state = OpsState::new();
        state.record_latency(f64::INFINITY);
        let signal = update_kill_switch(&mut state, &OpsPolicy::default(), T);
        assert!(signal.is_fail_closed());
        assert!(signal.deny_actions);
    }

    #[test]
    fn out_of_range_score_fails_closed() {
        let mut state = OpsState::new();
        let scorer = FixedScorer(1.5, HealthState::Green);
        let signal = update_kill_switch_with(&scorer, &mut state, &OpsPolicy::default(), T);
        assert!(signal.is_fail_closed());
    }

    #[test]
    fn fail_closed_ignores_healthy_counts() {
        // Even an all-clear state must be denied when scoring fails
        let mut state = OpsState::new();
        let scorer = FixedScorer(f64::NAN, HealthState::Green);
        let signal = update_kill_switch_with(&scorer, &mut state, &OpsPolicy::default(), T);
        assert!(signal.deny_actions);
        assert_eq!(signal.recommended_action, Action::Hold);
    }

    // ── Fail-closed diagnostics ──────────────────────────────────────────────

    #[test]
    fn scorer_panic_logs_single_category_warning() {
        // GIVEN: a scorer whose panic message carries internal detail
        let mut state = OpsState::new();
        // WHEN: evaluated under a capturing subscriber
        let (signal, logs) = capture_logs(|| {
            update_kill_switch_with(&PanickingScorer, &mut state, &OpsPolicy::default(), T)
        });
        // THEN: exactly one warning, naming only the category
        assert!(signal.is_fail_closed());
        let warnings = logs.warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(field(&warnings[0], "category"), Some("panic"));
        for (_, fields) in logs.0.lock().iter() {
            assert!(fields.iter().all(|(_, v)| !v.contains(SECRET)));
        }
    }

    #[test]
    fn scorer_error_logs_single_category_warning() {
        let mut state = OpsState::new();
        state.record_latency(f64::NAN);
        let (_, logs) = capture_logs(|| update_kill_switch(&mut state, &OpsPolicy::default(), T));
        let warnings = logs.warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(field(&warnings[0], "category"), Some("non_finite_input"));
        assert!(field(&warnings[0], "field").is_none());
    }

    #[test]
    fn healthy_and_red_evaluations_emit_no_warning() {
        let policy = error_only_policy();
        let mut state = red_state(T);
        let (_, logs) = capture_logs(|| {
            update_kill_switch(&mut state, &policy, T);
            update_kill_switch(&mut OpsState::new(), &policy, T);
        });
        assert!(logs.warnings().is_empty());
    }

    #[test]
    fn quiet_capture_restores_hook_flag() {
        // A captured panic must not leave this thread muted
        let caught: std::thread::Result<()> = catch_quietly(|| panic!("captured"));
        assert!(caught.is_err());
        assert!(!QUIET_PANICS.with(Cell::get));
        assert_eq!(catch_quietly(|| 7).ok(), Some(7));
    }

    // ── KillSwitch wrapper ───────────────────────────────────────────────────

    #[test]
    fn kill_switch_struct_matches_free_function() {
        let policy = error_only_policy();
        let ks = KillSwitch::new(policy.clone());
        let mut a = red_state(T);
        let mut b = a.clone();
        assert_eq!(ks.evaluate(&mut a, T), update_kill_switch(&mut b, &policy, T));
        assert_eq!(a, b);
    }

    #[test]
    fn kill_switch_score_is_read_only() {
        let ks = KillSwitch::new(error_only_policy());
        let state = OpsState {
            error_timestamps: vec![0, T],
            ..OpsState::default()
        };
        // One of three errors in window → score 2/3, just under the yellow line
        let (score, health) = ks.score(&state, T).unwrap();
        assert!((score - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(health, HealthState::Yellow);
        assert_eq!(state.error_timestamps, vec![0, T]);
    }

    #[test]
    fn kill_switch_with_custom_scorer() {
        let ks = KillSwitch::with_scorer(OpsPolicy::default(), FixedScorer(0.1, HealthState::Red));
        let mut state = OpsState::new();
        let signal = ks.evaluate(&mut state, T);
        assert_eq!(signal.state, HealthState::Red);
        assert_eq!(state.cooldown_until_ms, Some(T + ks.policy().cooldown_ms));
    }
}

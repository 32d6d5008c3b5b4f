//! Ops Health Core
//!
//! Bounded health scoring and a fail-closed kill switch for admission
//! control inside a larger decision pipeline.
//!
//! # Features
//!
//! - **Sliding windows**: error, throttle, and reconnect events are counted
//!   over a trailing window and pruned in place
//! - **Weighted scoring**: per-category penalties plus a p95 latency penalty
//!   are folded into a score in `[0, 1]` and a GREEN / YELLOW / RED class
//! - **Kill switch**: a RED classification latches a cooldown during which
//!   actions are denied, even after health recovers
//! - **Fail-closed**: any scoring fault yields a HOLD signal, never an error
//!
//! # Example
//!
//! ```
//! use ops_health_core::{Action, OpsPolicy, OpsState, update_kill_switch};
//!
//! let policy = OpsPolicy::default();
//! let mut state = OpsState::new();
//! state.record_latency(120.0);
//!
//! let signal = update_kill_switch(&mut state, &policy, 1_700_000_000_000);
//! assert_eq!(signal.recommended_action, Action::Act);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod kill_switch;
pub mod model;
pub mod monitor;
pub mod scorer;
pub mod windows;

pub use config::{Config, OpsPolicy};
pub use error::{Error, Result, ScoreError};
pub use kill_switch::{KillSwitch, update_kill_switch, update_kill_switch_with};
pub use model::{Action, HealthState, OpsSignal, OpsState};
pub use monitor::HealthMonitor;
pub use scorer::{DefaultScorer, HealthScorer, compute_health_score};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// Logs go to stderr so stdout stays clean for JSON output.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        _ => subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    }
    .map_err(|e| Error::Config(format!("tracing already initialized: {e}")))
}

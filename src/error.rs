//! Error types for ops-health-core

use std::io;

use thiserror::Error;

/// Result type alias for ops-health-core
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the outer surfaces (configuration loading, CLI I/O).
///
/// The kill switch itself never returns one of these: evaluation always
/// produces an [`OpsSignal`](crate::model::OpsSignal).
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Policy failed pre-flight validation
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Failure while deriving a score and classification.
///
/// Recovered inside the kill switch and collapsed into the fail-closed
/// signal; only [`ScoreError::category`] ever reaches the logs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScoreError {
    /// A latency sample or policy value was NaN or infinite
    #[error("non-finite input: {field}")]
    NonFiniteInput {
        /// Name of the offending field
        field: &'static str,
    },

    /// The weighted deduction did not produce a finite number
    #[error("non-finite score: {0}")]
    NonFiniteScore(f64),

    /// The scorer returned a score outside `[0, 1]`
    #[error("score out of range: {0}")]
    OutOfRange(f64),

    /// The scorer panicked; the payload is discarded
    #[error("scorer panicked")]
    Panicked,
}

impl ScoreError {
    /// Short, detail-free name suitable for logs shared with other systems.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::NonFiniteInput { .. } => "non_finite_input",
            Self::NonFiniteScore(_) => "non_finite_score",
            Self::OutOfRange(_) => "score_out_of_range",
            Self::Panicked => "panic",
        }
    }
}

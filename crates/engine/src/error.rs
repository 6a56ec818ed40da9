//! Error taxonomy for the optimization engine

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum OptimizeError {
    /// Unknown strategy, invalid parameter space or invalid search configuration.
    /// Raised before any evaluation starts.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A single evaluation exceeded its wall-clock budget
    #[error("Evaluation of {strategy_id} timed out after {after:?}")]
    EvaluationTimeout { strategy_id: String, after: Duration },

    /// The strategy simulator failed (returned an error or panicked)
    #[error("Simulation failed for {strategy_id}: {message}")]
    Simulation { strategy_id: String, message: String },

    /// A search mode's backend is not available in this build or could not start
    #[error("{mode} unavailable: {reason}")]
    DependencyUnavailable { mode: String, reason: String },

    /// Result store read/write failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Historical data could not be obtained for the strategy
    #[error("Historical data unavailable for {strategy_id}: {reason}")]
    Data { strategy_id: String, reason: String },

    /// Every candidate of a run failed; carries the last candidate error
    #[error("No candidate evaluated successfully ({attempts} attempts); last error: {last_error}")]
    NoSuccessfulEvaluation { attempts: usize, last_error: String },

    /// Cancelled (or out of time budget) before any candidate was scored
    #[error("Optimization cancelled before any result was produced")]
    Cancelled,
}

impl OptimizeError {
    pub fn unknown_strategy(strategy_id: &str) -> Self {
        Self::Configuration(format!("Unknown strategy: {strategy_id}"))
    }

    /// Errors that move the orchestrator to the next method in the fallback chain
    pub fn triggers_fallback(&self) -> bool {
        matches!(self, Self::DependencyUnavailable { .. })
    }
}

impl From<persistence::DbError> for OptimizeError {
    fn from(e: persistence::DbError) -> Self {
        Self::Persistence(e.to_string())
    }
}

pub type OptimizeResult<T> = Result<T, OptimizeError>;

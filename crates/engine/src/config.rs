//! Optimizer configuration
//!
//! Everything is optional in the JSON file; missing fields take the
//! defaults below. The whole tree is validated before any run starts.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{OptimizeError, OptimizeResult};
use crate::evaluator::ScoreWeights;
use crate::genetic::GeneticConfig;
use crate::grid::GridConfig;
use crate::search::MethodRequest;
use crate::surrogate::SurrogateConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Runs executing at once (pool B)
    pub max_concurrent_runs: usize,
    /// Evaluations executing at once across all runs (pool A)
    pub evaluation_workers: usize,
    pub evaluation_timeout_secs: u64,
    pub default_method: MethodRequest,
    /// A persisted best older than this triggers re-optimization
    pub staleness_days: i64,
    pub check_interval_secs: u64,
    pub backoff_initial_secs: u64,
    pub backoff_max_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 3,
            evaluation_workers: 4,
            evaluation_timeout_secs: 300,
            default_method: MethodRequest::Auto,
            staleness_days: 7,
            check_interval_secs: 3600,
            backoff_initial_secs: 300,
            backoff_max_secs: 86_400,
        }
    }
}

impl OrchestratorConfig {
    pub fn evaluation_timeout(&self) -> Duration {
        Duration::from_secs(self.evaluation_timeout_secs)
    }

    pub fn staleness(&self) -> chrono::Duration {
        chrono::Duration::days(self.staleness_days)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn validate(&self) -> OptimizeResult<()> {
        let fail = |msg: &str| Err(OptimizeError::Configuration(format!("orchestrator: {msg}")));
        if self.max_concurrent_runs == 0 || self.evaluation_workers == 0 {
            return fail("max_concurrent_runs and evaluation_workers must be positive");
        }
        if self.evaluation_timeout_secs == 0 {
            return fail("evaluation_timeout_secs must be positive");
        }
        if self.staleness_days <= 0 || self.check_interval_secs == 0 {
            return fail("staleness_days and check_interval_secs must be positive");
        }
        if self.backoff_initial_secs == 0 || self.backoff_max_secs < self.backoff_initial_secs {
            return fail("backoff_initial_secs must be positive and not exceed backoff_max_secs");
        }
        Ok(())
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub genetic: GeneticConfig,
    pub surrogate: SurrogateConfig,
    pub grid: GridConfig,
    pub orchestrator: OrchestratorConfig,
    /// Weights for strategies without an override
    pub score_weights: ScoreWeights,
    /// Per-strategy weight overrides
    pub strategy_weights: HashMap<String, ScoreWeights>,
}

impl OptimizerConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> OptimizeResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OptimizeError::Configuration(format!("read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            OptimizeError::Configuration(format!("parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> OptimizeResult<()> {
        self.genetic.validate()?;
        self.surrogate.validate()?;
        self.grid.validate()?;
        self.orchestrator.validate()?;
        self.score_weights.validate()?;
        for weights in self.strategy_weights.values() {
            weights.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = OptimizerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.genetic.population_size, 20);
        assert_eq!(config.grid.ceiling, 50);
        assert_eq!(config.surrogate.trial_budget, 50);
        assert_eq!(config.orchestrator.max_concurrent_runs, 3);
        assert_eq!(config.orchestrator.evaluation_timeout(), Duration::from_secs(300));
        assert_eq!(config.orchestrator.staleness(), chrono::Duration::days(7));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "genetic": {{ "population_size": 30 }},
                "orchestrator": {{ "default_method": "grid" }},
                "strategy_weights": {{ "macd": {{ "win_rate": 0.7, "profit": 0.3 }} }}
            }}"#
        )
        .unwrap();

        let config = OptimizerConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.genetic.population_size, 30);
        assert_eq!(config.genetic.generations, 10);
        assert_eq!(config.orchestrator.default_method, MethodRequest::Grid);
        let macd = config.strategy_weights["macd"];
        assert_eq!(macd.win_rate, 0.7);
        assert_eq!(macd.profit_normalizer, 10_000.0);
        assert!(!config.strategy_weights.contains_key("ema_rsi"));
        assert_eq!(config.score_weights.win_rate, 0.6);
    }

    #[test]
    fn test_invalid_file_is_configuration_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "grid": {{ "resolution": 0 }} }}"#).unwrap();
        let err = OptimizerConfig::from_json_file(file.path()).unwrap_err();
        assert!(matches!(err, OptimizeError::Configuration(_)));

        let err = OptimizerConfig::from_json_file("/nonexistent/hyperopt.json").unwrap_err();
        assert!(matches!(err, OptimizeError::Configuration(_)));
    }
}

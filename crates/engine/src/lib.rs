//! Hyperopt Engine — strategy hyperparameter optimization
//!
//! Searches a declared parameter space for the values that maximize a
//! backtested composite score. Provides:
//! - Parameter spaces with uniform and grid sampling
//! - Fitness evaluation through pluggable strategy simulators on a bounded pool
//! - Genetic, surrogate-guided (Gaussian process or random forest) and grid search
//! - An orchestrator with method fallback, concurrent runs and persistence
//! - Background re-optimization of stale strategies

pub mod config;
pub mod error;
pub mod evaluator;
pub mod genetic;
pub mod grid;
pub mod orchestrator;
pub mod progress;
pub mod scheduler;
pub mod search;
pub mod simulators;
pub mod space;
pub mod store;
pub mod surrogate;
pub mod types;

// Re-exports for convenience
pub use config::{OptimizerConfig, OrchestratorConfig};
pub use error::{OptimizeError, OptimizeResult};
pub use evaluator::{
    score_trades, simulator_fn, EvaluationPool, EvaluationResult, FitnessEvaluator, ScoreWeights,
    SimulatorRegistry, StrategySimulator, Trial, WORST_SCORE,
};
pub use genetic::{GeneticConfig, GeneticSearch};
pub use grid::{GridConfig, GridSearch};
pub use orchestrator::{
    HistoricalDataSource, OptimizationOrchestrator, OptimizationRun, StaticDataSource,
};
pub use progress::{RunProgress, RunStatus};
pub use scheduler::ReoptimizationScheduler;
pub use search::{
    MethodRequest, RunConstraints, SearchContext, SearchMethod, SearchOutcome, SearchStrategy,
};
pub use simulators::{register_builtin_strategies, BuiltinStrategy};
pub use space::{ParamKind, ParameterSet, ParameterSpace, ParameterSpec, StrategySpace};
pub use store::{MemoryResultStore, ResultStore, SqliteResultStore};
pub use surrogate::{SurrogateBackends, SurrogateConfig, SurrogateSearch};
pub use types::*;

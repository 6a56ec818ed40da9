//! Optimization orchestrator
//!
//! Turns "optimize strategy X with method M" into a finalized
//! [`OptimizationRun`]: validates the request, resolves the method chain,
//! pulls historical data, drives the search and persists the best result.
//! Runs for different strategies execute concurrently through a bounded
//! semaphore; one run failing never affects its siblings.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::OptimizerConfig;
use crate::error::{OptimizeError, OptimizeResult};
use crate::evaluator::{EvaluationPool, EvaluationResult, FitnessEvaluator, SimulatorRegistry};
use crate::genetic::GeneticSearch;
use crate::grid::GridSearch;
use crate::progress::{RunProgress, RunStatus};
use crate::search::{
    MethodRequest, RunConstraints, SearchContext, SearchMethod, SearchOutcome, SearchStrategy,
};
use crate::space::{ParameterSpace, StrategySpace};
use crate::store::ResultStore;
use crate::surrogate::{SurrogateBackends, SurrogateSearch};
use crate::types::HistoricalDataset;

// ============================================================================
// Run record
// ============================================================================

/// One optimization request from start to its final status
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationRun {
    pub id: String,
    pub strategy_id: String,
    pub requested_method: MethodRequest,
    /// Algorithm that produced the best result
    pub search_method: Option<SearchMethod>,
    /// Set when a documented fallback replaced this method
    pub fallback_from: Option<MethodRequest>,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub best_result: Option<EvaluationResult>,
    pub error_reason: Option<String>,
    /// Evaluator calls made by the run
    pub evaluations: usize,
}

impl OptimizationRun {
    pub fn new(strategy_id: &str, requested_method: MethodRequest) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            strategy_id: strategy_id.to_string(),
            requested_method,
            search_method: None,
            fallback_from: None,
            status: RunStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            best_result: None,
            error_reason: None,
            evaluations: 0,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    fn complete(&mut self, outcome: SearchOutcome) {
        self.status = RunStatus::Completed;
        self.search_method = Some(outcome.method_used);
        self.fallback_from = outcome.fallback_from;
        self.evaluations = outcome.evaluations;
        self.best_result = Some(outcome.best);
        self.end_time = Some(Utc::now());
    }

    fn fail(&mut self, err: &OptimizeError) {
        self.status = RunStatus::Failed;
        self.error_reason = Some(err.to_string());
        self.end_time = Some(Utc::now());
    }
}

// ============================================================================
// Historical data
// ============================================================================

/// Supplies the dataset a strategy is optimized against
#[async_trait]
pub trait HistoricalDataSource: Send + Sync {
    async fn load(&self, strategy_id: &str) -> OptimizeResult<HistoricalDataset>;
}

/// Datasets held in memory; per-strategy entries override the default
#[derive(Default)]
pub struct StaticDataSource {
    default: Option<HistoricalDataset>,
    per_strategy: HashMap<String, HistoricalDataset>,
}

impl StaticDataSource {
    pub fn new(default: HistoricalDataset) -> Self {
        Self {
            default: Some(default),
            per_strategy: HashMap::new(),
        }
    }

    pub fn with_strategy(mut self, strategy_id: &str, dataset: HistoricalDataset) -> Self {
        self.per_strategy.insert(strategy_id.to_string(), dataset);
        self
    }
}

#[async_trait]
impl HistoricalDataSource for StaticDataSource {
    async fn load(&self, strategy_id: &str) -> OptimizeResult<HistoricalDataset> {
        let dataset = self
            .per_strategy
            .get(strategy_id)
            .or(self.default.as_ref())
            .cloned()
            .ok_or_else(|| OptimizeError::Data {
                strategy_id: strategy_id.to_string(),
                reason: "no dataset configured".to_string(),
            })?;
        if dataset.is_empty() {
            return Err(OptimizeError::Data {
                strategy_id: strategy_id.to_string(),
                reason: "dataset has no candles".to_string(),
            });
        }
        Ok(dataset)
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Clears a strategy's in-flight entry when the run ends, unwinding included
struct ActiveRunGuard<'a> {
    active: &'a RwLock<HashMap<String, Arc<RunProgress>>>,
    strategy_id: &'a str,
}

impl Drop for ActiveRunGuard<'_> {
    fn drop(&mut self) {
        self.active
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(self.strategy_id);
    }
}

pub struct OptimizationOrchestrator {
    space: Arc<ParameterSpace>,
    registry: Arc<SimulatorRegistry>,
    pool: EvaluationPool,
    store: Arc<dyn ResultStore>,
    data: Arc<dyn HistoricalDataSource>,
    backends: SurrogateBackends,
    config: OptimizerConfig,
    auto_chain: Vec<MethodRequest>,
    run_permits: Arc<Semaphore>,
    active: RwLock<HashMap<String, Arc<RunProgress>>>,
}

impl OptimizationOrchestrator {
    /// Validates the configuration and applies per-strategy score weights
    /// to the registry.
    pub fn new(
        config: OptimizerConfig,
        space: Arc<ParameterSpace>,
        registry: Arc<SimulatorRegistry>,
        store: Arc<dyn ResultStore>,
        data: Arc<dyn HistoricalDataSource>,
        backends: SurrogateBackends,
    ) -> OptimizeResult<Self> {
        config.validate()?;
        for (strategy_id, weights) in &config.strategy_weights {
            if registry.contains(strategy_id) {
                registry.set_weights(strategy_id, *weights)?;
            } else {
                warn!(strategy = %strategy_id, "Score weights configured for unknown strategy");
            }
        }

        // Resolved once; availability does not change during the process
        let auto_chain = if backends.is_available() {
            vec![
                MethodRequest::Surrogate,
                MethodRequest::Genetic,
                MethodRequest::Grid,
            ]
        } else {
            vec![MethodRequest::Genetic, MethodRequest::Grid]
        };

        let orch = &config.orchestrator;
        let pool = EvaluationPool::new(
            FitnessEvaluator::new(registry.clone()),
            orch.evaluation_workers,
            orch.evaluation_timeout(),
        );
        info!(
            max_runs = orch.max_concurrent_runs,
            auto_chain = ?auto_chain,
            "Optimization orchestrator ready"
        );

        Ok(Self {
            run_permits: Arc::new(Semaphore::new(orch.max_concurrent_runs)),
            space,
            registry,
            pool,
            store,
            data,
            backends,
            auto_chain,
            config,
            active: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn space(&self) -> &Arc<ParameterSpace> {
        &self.space
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    /// Methods `auto` tries, in order
    pub fn auto_chain(&self) -> &[MethodRequest] {
        &self.auto_chain
    }

    /// Progress handle of the strategy's in-flight run
    pub fn progress(&self, strategy_id: &str) -> Option<Arc<RunProgress>> {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(strategy_id)
            .cloned()
    }

    pub fn active_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Request cooperative cancellation. Takes effect at the next
    /// generation, trial or batch boundary.
    pub fn cancel(&self, strategy_id: &str) -> bool {
        match self.progress(strategy_id) {
            Some(progress) => {
                progress.cancel();
                info!(strategy = %strategy_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Run one optimization to completion. Never returns an error: every
    /// failure ends up in the run's status and `error_reason`.
    pub async fn run_optimization(
        &self,
        strategy_id: &str,
        method: MethodRequest,
        constraints: RunConstraints,
    ) -> OptimizationRun {
        let mut run = OptimizationRun::new(strategy_id, method);

        let space = self.space.get(strategy_id).and_then(|space| {
            if self.registry.contains(strategy_id) {
                Ok(space)
            } else {
                Err(OptimizeError::Configuration(format!(
                    "No simulator registered for {strategy_id}"
                )))
            }
        });
        let space = match space {
            Ok(space) => space,
            Err(e) => {
                warn!(strategy = %strategy_id, error = %e, "Rejected optimization request");
                run.fail(&e);
                self.record(&run).await;
                return run;
            }
        };

        let progress = Arc::new(RunProgress::new());
        let duplicate = {
            let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
            if active.contains_key(strategy_id) {
                true
            } else {
                active.insert(strategy_id.to_string(), progress.clone());
                false
            }
        };
        if duplicate {
            let e = OptimizeError::Configuration(format!(
                "Optimization already running for {strategy_id}"
            ));
            warn!(strategy = %strategy_id, "Rejected duplicate optimization request");
            run.fail(&e);
            self.record(&run).await;
            return run;
        }
        let guard = ActiveRunGuard {
            active: &self.active,
            strategy_id,
        };

        let outcome = match self.run_permits.clone().acquire_owned().await {
            Ok(_permit) => {
                run.status = RunStatus::Running;
                progress.set_status(RunStatus::Running);
                info!(
                    strategy = %strategy_id,
                    run_id = %run.id,
                    method = %method,
                    "Optimization run started"
                );
                self.execute(space, method, constraints, progress.clone())
                    .await
            }
            Err(_) => Err(OptimizeError::Cancelled),
        };

        match outcome {
            Ok(outcome) => self.finalize(&mut run, outcome).await,
            Err(e) => {
                error!(strategy = %strategy_id, run_id = %run.id, error = %e, "Optimization run failed");
                run.fail(&e);
            }
        }
        if run.evaluations == 0 {
            run.evaluations = progress.completed() as usize;
        }

        progress.set_status(run.status);
        drop(guard);
        self.record(&run).await;
        run
    }

    /// Run several strategies concurrently. Results come back in input order.
    pub async fn run_many(
        self: &Arc<Self>,
        strategies: &[String],
        method: MethodRequest,
        constraints: RunConstraints,
    ) -> Vec<OptimizationRun> {
        let handles = strategies.iter().map(|strategy_id| {
            let this = Arc::clone(self);
            let strategy_id = strategy_id.clone();
            let constraints = constraints.clone();
            tokio::spawn(async move {
                this.run_optimization(&strategy_id, method, constraints)
                    .await
            })
        });
        let joined = futures_util::future::join_all(handles).await;

        strategies
            .iter()
            .zip(joined)
            .map(|(strategy_id, joined)| {
                joined.unwrap_or_else(|join_err| {
                    let mut run = OptimizationRun::new(strategy_id, method);
                    run.fail(&OptimizeError::Simulation {
                        strategy_id: strategy_id.clone(),
                        message: format!("run task aborted: {join_err}"),
                    });
                    error!(strategy = %strategy_id, error = %join_err, "Optimization task aborted");
                    run
                })
            })
            .collect()
    }

    fn chain_for(&self, method: MethodRequest) -> Vec<MethodRequest> {
        match method {
            MethodRequest::Auto => self.auto_chain.clone(),
            other => vec![other],
        }
    }

    fn search_for(
        &self,
        method: MethodRequest,
        in_auto: bool,
    ) -> OptimizeResult<Box<dyn SearchStrategy>> {
        Ok(match method {
            MethodRequest::Genetic => Box::new(GeneticSearch::new(self.config.genetic.clone())?),
            MethodRequest::Grid => Box::new(GridSearch::new(self.config.grid.clone())?),
            MethodRequest::Surrogate => {
                let search = SurrogateSearch::new(
                    self.config.surrogate.clone(),
                    self.backends.clone(),
                    self.config.grid.clone(),
                )?;
                // Inside `auto` the chain itself continues with genetic search
                if in_auto {
                    Box::new(search.without_grid_fallback())
                } else {
                    Box::new(search)
                }
            }
            MethodRequest::Auto => {
                return Err(OptimizeError::Configuration(
                    "auto is not a concrete search method".to_string(),
                ))
            }
        })
    }

    async fn execute(
        &self,
        space: StrategySpace,
        method: MethodRequest,
        constraints: RunConstraints,
        progress: Arc<RunProgress>,
    ) -> OptimizeResult<SearchOutcome> {
        let strategy_id = space.strategy_id().to_string();
        let dataset = self.data.load(&strategy_id).await?;
        let ctx = SearchContext::new(space, dataset, self.pool.clone(), progress, constraints);

        let mut fallback_from = None;
        let mut last_error = None;
        for step in self.chain_for(method) {
            let search = self.search_for(step, method == MethodRequest::Auto)?;
            match search.search(&ctx).await {
                Ok(mut outcome) => {
                    if outcome.fallback_from.is_none() {
                        outcome.fallback_from = fallback_from;
                    }
                    return Ok(outcome);
                }
                Err(e) if e.triggers_fallback() => {
                    warn!(
                        strategy = %strategy_id,
                        method = %step,
                        error = %e,
                        "Search method unavailable, falling back"
                    );
                    fallback_from.get_or_insert(step);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| OptimizeError::DependencyUnavailable {
            mode: method.to_string(),
            reason: "no search method available".to_string(),
        }))
    }

    /// Persist the best of a finished search and mark the run completed.
    /// A failed save fails the run.
    async fn finalize(&self, run: &mut OptimizationRun, outcome: SearchOutcome) {
        let strategy_id = run.strategy_id.clone();
        let run_id = run.id.clone();
        if outcome.predicted_only {
            warn!(
                strategy = %strategy_id,
                "Best candidate was ranked by prediction only, not persisting"
            );
        } else if let Err(e) = self
            .store
            .save(&strategy_id, &outcome.best, outcome.method_used, Some(&run_id))
            .await
        {
            error!(strategy = %strategy_id, run_id = %run_id, error = %e, "Failed to persist best result");
            run.search_method = Some(outcome.method_used);
            run.fallback_from = outcome.fallback_from;
            run.evaluations = outcome.evaluations;
            run.fail(&e);
            return;
        }

        info!(
            strategy = %strategy_id,
            run_id = %run_id,
            method = %outcome.method_used,
            fallback_from = ?outcome.fallback_from,
            score = outcome.best.score,
            evaluations = outcome.evaluations,
            cancelled = outcome.cancelled,
            "Optimization run completed"
        );
        run.complete(outcome);
    }

    /// Best-effort write to the run ledger
    async fn record(&self, run: &OptimizationRun) {
        if let Err(e) = self.store.record_run(run).await {
            warn!(strategy = %run.strategy_id, run_id = %run.id, error = %e, "Failed to record run");
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::evaluator::{ScoreWeights, StrategySimulator};
    use crate::genetic::GeneticConfig;
    use crate::grid::GridConfig;
    use crate::search::test_support::gap_space;
    use crate::surrogate::SurrogateConfig;
    use crate::types::test_support::ascending_dataset;

    /// Small budgets so whole runs finish in milliseconds
    pub fn small_config() -> OptimizerConfig {
        OptimizerConfig {
            genetic: GeneticConfig {
                population_size: 6,
                generations: 3,
                mutation_rate: 0.1,
                elite_size: 1,
                tournament_size: 2,
            },
            grid: GridConfig {
                batch_size: 4,
                ..GridConfig::default()
            },
            surrogate: SurrogateConfig {
                trial_budget: 12,
                initial_random_trials: 4,
                candidates_per_ask: 32,
                training_samples: 8,
                candidate_pool: 20,
                forest_trees: 5,
                ..SurrogateConfig::default()
            },
            ..OptimizerConfig::default()
        }
    }

    /// Every strategy gets the `ema_gap` parameter space
    pub fn orchestrator_with(
        simulators: Vec<(&str, Arc<dyn StrategySimulator>)>,
        store: Arc<dyn ResultStore>,
        backends: SurrogateBackends,
    ) -> Arc<OptimizationOrchestrator> {
        let space = Arc::new(ParameterSpace::new());
        let registry = Arc::new(SimulatorRegistry::new());
        let specs = gap_space().specs().to_vec();
        for (id, simulator) in simulators {
            space.register_strategy(id, specs.clone()).unwrap();
            registry
                .register(id, simulator, ScoreWeights::default())
                .unwrap();
        }
        let data = Arc::new(StaticDataSource::new(ascending_dataset(100)));
        Arc::new(
            OptimizationOrchestrator::new(small_config(), space, registry, store, data, backends)
                .unwrap(),
        )
    }
}

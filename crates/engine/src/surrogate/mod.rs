//! Surrogate-guided search
//!
//! Two modes, chosen by which backends were resolved at startup:
//!
//! - **sequential**: an ask/tell optimizer proposes one point of the unit cube
//!   at a time, learning from every true evaluation;
//! - **regression**: a model trained on a uniformly sampled corpus ranks a
//!   larger candidate pool by prediction alone.
//!
//! Sequential is preferred. With no backend at all the search either hands
//! over to [`GridSearch`] and tags the result, or reports
//! [`OptimizeError::DependencyUnavailable`] so the orchestrator can move on
//! down its fallback chain.

pub mod gaussian_process;
pub mod random_forest;

use async_trait::async_trait;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{OptimizeError, OptimizeResult};
use crate::evaluator::EvaluationResult;
use crate::grid::{GridConfig, GridSearch};
use crate::search::{
    BestTracker, MethodRequest, SearchContext, SearchMethod, SearchOutcome, SearchStrategy,
};
use crate::space::ParameterSet;

pub use gaussian_process::{GaussianProcessFactory, GaussianProcessOptimizer};
pub use random_forest::{RandomForest, RandomForestFactory};

// ============================================================================
// Backend contracts
// ============================================================================

/// Ask/tell optimizer over the unit cube
pub trait SequentialOptimizer: Send {
    /// Next point to evaluate; coordinates in [0, 1]
    fn ask(&mut self, rng: &mut StdRng) -> Vec<f64>;

    /// Report the true score of a point previously asked for
    fn tell(&mut self, point: Vec<f64>, score: f64);
}

pub trait SequentialOptimizerFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn create(&self, dimensions: usize) -> OptimizeResult<Box<dyn SequentialOptimizer>>;
}

/// Regression model mapping unit-cube points to predicted scores
pub trait RegressionModel: Send {
    fn fit(&mut self, xs: &[Vec<f64>], ys: &[f64], rng: &mut StdRng) -> OptimizeResult<()>;

    fn predict(&self, x: &[f64]) -> f64;
}

pub trait RegressionModelFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn create(&self) -> OptimizeResult<Box<dyn RegressionModel>>;
}

/// Surrogate backends available to this process, resolved once
#[derive(Clone, Default)]
pub struct SurrogateBackends {
    pub sequential: Option<Arc<dyn SequentialOptimizerFactory>>,
    pub regression: Option<Arc<dyn RegressionModelFactory>>,
}

impl SurrogateBackends {
    /// Built-in backends compiled into this build
    pub fn detect(config: &SurrogateConfig) -> Self {
        #[allow(unused_mut)]
        let mut backends = Self::none();

        #[cfg(feature = "smbo")]
        {
            backends.sequential = Some(Arc::new(GaussianProcessFactory::new(config.clone())));
        }
        #[cfg(feature = "regression")]
        {
            backends.regression = Some(Arc::new(RandomForestFactory::new(config.clone())));
        }
        let _ = config;

        info!(
            sequential = backends.sequential.as_ref().map(|b| b.name()),
            regression = backends.regression.as_ref().map(|b| b.name()),
            "Surrogate backends resolved"
        );
        backends
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_available(&self) -> bool {
        self.sequential.is_some() || self.regression.is_some()
    }
}

impl std::fmt::Debug for SurrogateBackends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurrogateBackends")
            .field("sequential", &self.sequential.as_ref().map(|b| b.name()))
            .field("regression", &self.regression.as_ref().map(|b| b.name()))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SurrogateConfig {
    /// Sequential mode: true evaluations per run
    pub trial_budget: usize,
    /// Sequential mode: random points before the model takes over
    pub initial_random_trials: usize,
    /// Sequential mode: random candidates scored by the acquisition per ask
    pub candidates_per_ask: usize,
    /// Exploration weight of the upper confidence bound
    pub ucb_beta: f64,
    /// RBF kernel length scale in unit-cube coordinates
    pub length_scale: f64,
    pub noise_variance: f64,
    /// Regression mode: truly evaluated training corpus
    pub training_samples: usize,
    /// Regression mode: candidates ranked by prediction
    pub candidate_pool: usize,
    /// Regression mode: evaluate the top-predicted candidate once
    pub confirm_best: bool,
    pub forest_trees: usize,
    pub forest_max_depth: usize,
    pub forest_min_samples_split: usize,
}

impl Default for SurrogateConfig {
    fn default() -> Self {
        Self {
            trial_budget: 50,
            initial_random_trials: 10,
            candidates_per_ask: 256,
            ucb_beta: 2.0,
            length_scale: 0.25,
            noise_variance: 1e-3,
            training_samples: 30,
            candidate_pool: 100,
            confirm_best: true,
            forest_trees: 25,
            forest_max_depth: 6,
            forest_min_samples_split: 4,
        }
    }
}

impl SurrogateConfig {
    pub fn validate(&self) -> OptimizeResult<()> {
        let fail = |msg: &str| Err(OptimizeError::Configuration(format!("surrogate: {msg}")));
        if self.trial_budget == 0 || self.candidates_per_ask == 0 {
            return fail("trial_budget and candidates_per_ask must be positive");
        }
        if self.training_samples < 2 || self.candidate_pool == 0 {
            return fail("training_samples must be at least 2 and candidate_pool positive");
        }
        let positive = |x: f64| x.is_finite() && x > 0.0;
        if !positive(self.length_scale)
            || !positive(self.noise_variance)
            || self.ucb_beta.is_nan()
            || self.ucb_beta < 0.0
        {
            return fail("length_scale and noise_variance must be positive, ucb_beta non-negative");
        }
        if self.forest_trees == 0 || self.forest_max_depth == 0 {
            return fail("forest_trees and forest_max_depth must be positive");
        }
        Ok(())
    }
}

// ============================================================================
// Search
// ============================================================================

pub struct SurrogateSearch {
    config: SurrogateConfig,
    backends: SurrogateBackends,
    grid: GridConfig,
    grid_fallback: bool,
}

impl SurrogateSearch {
    pub fn new(
        config: SurrogateConfig,
        backends: SurrogateBackends,
        grid: GridConfig,
    ) -> OptimizeResult<Self> {
        config.validate()?;
        grid.validate()?;
        Ok(Self {
            config,
            backends,
            grid,
            grid_fallback: true,
        })
    }

    /// Report missing backends as `DependencyUnavailable` instead of
    /// delegating to grid search
    pub fn without_grid_fallback(mut self) -> Self {
        self.grid_fallback = false;
        self
    }

    pub fn backends(&self) -> &SurrogateBackends {
        &self.backends
    }

    async fn run_sequential(
        &self,
        ctx: &SearchContext,
        factory: &dyn SequentialOptimizerFactory,
    ) -> OptimizeResult<SearchOutcome> {
        let space = ctx.space();
        let mut optimizer = factory.create(space.dimensions())?;
        let mut rng = ctx.rng();
        let mut tracker = BestTracker::new();
        let budget = self.config.trial_budget;

        info!(
            strategy = %ctx.strategy_id(),
            backend = factory.name(),
            budget,
            "Starting sequential surrogate search"
        );
        ctx.progress().add_total(budget);

        for trial_no in 0..budget {
            if ctx.should_stop() {
                break;
            }
            ctx.progress()
                .set_phase(format!("trial {}/{}", trial_no + 1, budget));

            let point = optimizer.ask(&mut rng);
            let candidate = space.decode(&point);
            let trials = ctx
                .evaluate(vec![candidate], SearchMethod::SurrogateSequential, &mut tracker)
                .await;
            let Some(trial) = trials.into_iter().next() else {
                break;
            };
            // Failed trials teach the model nothing
            if trial.is_success() {
                optimizer.tell(space.encode(&trial.result.params), trial.score());
            }
            tracker.checkpoint();
        }

        let stopped = ctx.is_cancelled() || ctx.out_of_time();
        tracker.finish(SearchMethod::SurrogateSequential, stopped)
    }

    async fn run_regression(
        &self,
        ctx: &SearchContext,
        factory: &dyn RegressionModelFactory,
    ) -> OptimizeResult<SearchOutcome> {
        let space = ctx.space();
        let mut model = factory.create()?;
        let mut rng = ctx.rng();
        let mut tracker = BestTracker::new();
        let method = SearchMethod::SurrogateRegression;

        info!(
            strategy = %ctx.strategy_id(),
            backend = factory.name(),
            corpus = self.config.training_samples,
            pool = self.config.candidate_pool,
            "Starting regression surrogate search"
        );
        ctx.progress()
            .add_total(self.config.training_samples + usize::from(self.config.confirm_best));
        ctx.progress().set_phase("training corpus");

        let corpus = space.sample_uniform(self.config.training_samples, &mut rng);
        let trials = ctx.evaluate(corpus, method, &mut tracker).await;
        tracker.checkpoint();

        let (xs, ys): (Vec<Vec<f64>>, Vec<f64>) = trials
            .iter()
            .filter(|t| t.is_success())
            .map(|t| (space.encode(&t.result.params), t.score()))
            .unzip();

        if ctx.should_stop() || xs.is_empty() {
            let stopped = ctx.is_cancelled() || ctx.out_of_time();
            return tracker.finish(method, stopped);
        }

        ctx.progress().set_phase("ranking candidates");
        model.fit(&xs, &ys, &mut rng)?;

        let pool = space.sample_uniform(self.config.candidate_pool, &mut rng);
        let mut ranked: Option<(ParameterSet, f64)> = None;
        for candidate in pool {
            let predicted = model.predict(&space.encode(&candidate));
            if ranked.as_ref().map_or(true, |(_, top)| predicted > *top) {
                ranked = Some((candidate, predicted));
            }
        }

        let Some((top, predicted)) = ranked else {
            return tracker.finish(method, false);
        };
        debug!(strategy = %ctx.strategy_id(), predicted, "Top predicted candidate");

        if !self.config.confirm_best {
            let mut outcome = tracker.finish(method, false)?;
            let mut suggestion = EvaluationResult::worst_case(top).with_method(method);
            suggestion.score = predicted;
            outcome.best = suggestion;
            outcome.predicted_only = true;
            return Ok(outcome);
        }

        ctx.progress().set_phase("confirming top candidate");
        ctx.evaluate(vec![top], method, &mut tracker).await;
        tracker.checkpoint();

        let stopped = ctx.is_cancelled() || ctx.out_of_time();
        tracker.finish(method, stopped)
    }
}

#[async_trait]
impl SearchStrategy for SurrogateSearch {
    fn method(&self) -> MethodRequest {
        MethodRequest::Surrogate
    }

    async fn search(&self, ctx: &SearchContext) -> OptimizeResult<SearchOutcome> {
        if let Some(factory) = &self.backends.sequential {
            match self.run_sequential(ctx, factory.as_ref()).await {
                Err(e) if e.triggers_fallback() => {
                    warn!(strategy = %ctx.strategy_id(), error = %e, "Sequential surrogate unavailable");
                }
                other => return other,
            }
        }

        if let Some(factory) = &self.backends.regression {
            match self.run_regression(ctx, factory.as_ref()).await {
                Err(e) if e.triggers_fallback() => {
                    warn!(strategy = %ctx.strategy_id(), error = %e, "Regression surrogate unavailable");
                }
                other => return other,
            }
        }

        if !self.grid_fallback {
            return Err(OptimizeError::DependencyUnavailable {
                mode: "surrogate search".to_string(),
                reason: "no sequential or regression backend available".to_string(),
            });
        }

        warn!(
            strategy = %ctx.strategy_id(),
            "No surrogate backend available, delegating to grid search"
        );
        let mut outcome = GridSearch::new(self.grid.clone())?.search(ctx).await?;
        outcome.fallback_from = Some(MethodRequest::Surrogate);
        Ok(outcome)
    }
}

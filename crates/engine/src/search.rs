//! Shared search plumbing
//!
//! Every search variant implements [`SearchStrategy`] and talks to the
//! evaluation pool through a [`SearchContext`], which applies the run's
//! constraints (evaluation ceiling, time budget, cancellation) and feeds the
//! [`BestTracker`].

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{OptimizeError, OptimizeResult};
use crate::evaluator::{EvaluationPool, EvaluationResult, Trial};
use crate::progress::RunProgress;
use crate::space::{ParameterSet, StrategySpace};
use crate::types::HistoricalDataset;

// ============================================================================
// Methods
// ============================================================================

/// Algorithm that actually produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMethod {
    Genetic,
    SurrogateSequential,
    SurrogateRegression,
    Grid,
}

impl SearchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMethod::Genetic => "genetic",
            SearchMethod::SurrogateSequential => "surrogate_sequential",
            SearchMethod::SurrogateRegression => "surrogate_regression",
            SearchMethod::Grid => "grid",
        }
    }
}

impl std::fmt::Display for SearchMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SearchMethod {
    type Err = OptimizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "genetic" => Ok(SearchMethod::Genetic),
            "surrogate_sequential" => Ok(SearchMethod::SurrogateSequential),
            "surrogate_regression" => Ok(SearchMethod::SurrogateRegression),
            "grid" => Ok(SearchMethod::Grid),
            other => Err(OptimizeError::Configuration(format!(
                "Unknown search method: {other}"
            ))),
        }
    }
}

/// Method requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodRequest {
    Genetic,
    Surrogate,
    Grid,
    Auto,
}

impl MethodRequest {
    pub fn as_str(&self) -> &'static str {
        match self {
            MethodRequest::Genetic => "genetic",
            MethodRequest::Surrogate => "surrogate",
            MethodRequest::Grid => "grid",
            MethodRequest::Auto => "auto",
        }
    }
}

impl std::fmt::Display for MethodRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for MethodRequest {
    type Err = OptimizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "genetic" | "evolutionary" => Ok(MethodRequest::Genetic),
            "surrogate" => Ok(MethodRequest::Surrogate),
            "grid" => Ok(MethodRequest::Grid),
            "auto" => Ok(MethodRequest::Auto),
            other => Err(OptimizeError::Configuration(format!(
                "Unknown optimization method: {other}"
            ))),
        }
    }
}

// ============================================================================
// Constraints and context
// ============================================================================

/// Per-run limits supplied by the caller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConstraints {
    /// Seed for every random draw of the run; `None` draws from entropy
    pub seed: Option<u64>,
    /// Hard cap on evaluator calls
    pub evaluation_ceiling: Option<usize>,
    /// Wall-clock budget, checked between batches
    pub time_budget: Option<Duration>,
}

impl RunConstraints {
    pub fn seeded(seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..Self::default()
        }
    }
}

/// Everything a search needs for one run
pub struct SearchContext {
    space: StrategySpace,
    dataset: HistoricalDataset,
    pool: EvaluationPool,
    progress: Arc<RunProgress>,
    constraints: RunConstraints,
    started: Instant,
    evaluations: AtomicUsize,
}

impl SearchContext {
    pub fn new(
        space: StrategySpace,
        dataset: HistoricalDataset,
        pool: EvaluationPool,
        progress: Arc<RunProgress>,
        constraints: RunConstraints,
    ) -> Self {
        Self {
            space,
            dataset,
            pool,
            progress,
            constraints,
            started: Instant::now(),
            evaluations: AtomicUsize::new(0),
        }
    }

    pub fn strategy_id(&self) -> &str {
        self.space.strategy_id()
    }

    pub fn space(&self) -> &StrategySpace {
        &self.space
    }

    pub fn dataset(&self) -> &HistoricalDataset {
        &self.dataset
    }

    pub fn progress(&self) -> &Arc<RunProgress> {
        &self.progress
    }

    pub fn constraints(&self) -> &RunConstraints {
        &self.constraints
    }

    /// Fresh generator for one search; seeded runs are reproducible
    pub fn rng(&self) -> StdRng {
        match self.constraints.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Evaluator calls made so far in this run
    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::Relaxed)
    }

    pub fn remaining_evaluations(&self) -> Option<usize> {
        self.constraints
            .evaluation_ceiling
            .map(|cap| cap.saturating_sub(self.evaluations()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.progress.is_cancelled()
    }

    pub fn out_of_time(&self) -> bool {
        self.constraints
            .time_budget
            .is_some_and(|budget| self.started.elapsed() >= budget)
    }

    /// Checked between batches; never interrupts an evaluation in flight
    pub fn should_stop(&self) -> bool {
        self.is_cancelled() || self.out_of_time() || self.remaining_evaluations() == Some(0)
    }

    /// Evaluate a batch, truncated to the remaining evaluation ceiling, and
    /// fold the trials into `tracker`. Trials come back in input order.
    pub async fn evaluate(
        &self,
        mut candidates: Vec<ParameterSet>,
        method: SearchMethod,
        tracker: &mut BestTracker,
    ) -> Vec<Trial> {
        if let Some(remaining) = self.remaining_evaluations() {
            candidates.truncate(remaining);
        }
        if candidates.is_empty() {
            return Vec::new();
        }

        self.evaluations.fetch_add(candidates.len(), Ordering::Relaxed);
        let trials = self
            .pool
            .evaluate_batch(self.strategy_id(), candidates, &self.dataset, method)
            .await;

        for trial in &trials {
            self.progress.record_evaluation(trial.is_success());
            if tracker.observe(trial) {
                self.progress.set_best_score(trial.score());
                debug!(
                    strategy = %self.strategy_id(),
                    score = trial.score(),
                    "New best candidate"
                );
            }
        }
        trials
    }
}

// ============================================================================
// Best-so-far tracking
// ============================================================================

/// Best successful result of a run plus failure bookkeeping
#[derive(Debug, Default)]
pub struct BestTracker {
    best: Option<EvaluationResult>,
    history: Vec<f64>,
    attempts: usize,
    successes: usize,
    last_error: Option<OptimizeError>,
}

impl BestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one trial in. Only a strictly higher score replaces the best,
    /// so the best score never decreases. Returns true on improvement.
    pub fn observe(&mut self, trial: &Trial) -> bool {
        self.attempts += 1;
        if let Some(err) = &trial.error {
            self.last_error = Some(err.clone());
            return false;
        }
        self.successes += 1;
        let improved = self
            .best
            .as_ref()
            .map_or(true, |best| trial.result.score > best.score);
        if improved {
            self.best = Some(trial.result.clone());
        }
        improved
    }

    /// Fold in a result that was produced outside the pool
    pub fn observe_result(&mut self, result: &EvaluationResult) -> bool {
        self.observe(&Trial::success(result.clone()))
    }

    /// Record the current best score (once per generation or trial)
    pub fn checkpoint(&mut self) {
        if let Some(best) = &self.best {
            self.history.push(best.score);
        }
    }

    pub fn best(&self) -> Option<&EvaluationResult> {
        self.best.as_ref()
    }

    pub fn history(&self) -> &[f64] {
        &self.history
    }

    pub fn successes(&self) -> usize {
        self.successes
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Close the search. Without a single successful evaluation this is an
    /// error, never an empty success.
    pub fn finish(self, method: SearchMethod, cancelled: bool) -> OptimizeResult<SearchOutcome> {
        match self.best {
            Some(best) => Ok(SearchOutcome {
                best,
                evaluations: self.attempts,
                successful: self.successes,
                best_history: self.history,
                method_used: method,
                fallback_from: None,
                cancelled,
                predicted_only: false,
            }),
            None if cancelled => Err(OptimizeError::Cancelled),
            None => Err(OptimizeError::NoSuccessfulEvaluation {
                attempts: self.attempts,
                last_error: self
                    .last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no candidates evaluated".to_string()),
            }),
        }
    }
}

/// What a finished search hands back to the orchestrator
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub best: EvaluationResult,
    pub evaluations: usize,
    pub successful: usize,
    /// Best score after each generation / trial / batch
    pub best_history: Vec<f64>,
    pub method_used: SearchMethod,
    /// Requested method that was replaced by a documented fallback
    pub fallback_from: Option<MethodRequest>,
    /// Stopped early by cancellation or time budget
    pub cancelled: bool,
    /// Best was ranked by surrogate prediction without a confirming evaluation
    pub predicted_only: bool,
}

/// One search algorithm behind the common evaluation contract
#[async_trait]
pub trait SearchStrategy: Send + Sync {
    /// Requested method this strategy fulfills
    fn method(&self) -> MethodRequest;

    async fn search(&self, ctx: &SearchContext) -> OptimizeResult<SearchOutcome>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::evaluator::{
        simulator_fn, FitnessEvaluator, ScoreWeights, SimulatorRegistry, StrategySimulator,
    };
    use crate::space::ParameterSpec;
    use crate::types::test_support::ascending_dataset;
    use crate::types::{TradeOutcome, TradeSide};
    use rust_decimal::Decimal;

    /// One winning trade whose PnL is `profit`
    pub fn trade_with_pnl(profit: f64) -> TradeOutcome {
        let pnl = Decimal::from_f64_retain(profit).unwrap_or(Decimal::ZERO);
        TradeOutcome {
            entry_time: 0,
            exit_time: 1,
            side: TradeSide::Buy,
            entry_price: Decimal::ONE_HUNDRED,
            exit_price: Decimal::ONE_HUNDRED + pnl,
            size: Decimal::ONE,
            pnl,
            pnl_pct: pnl,
        }
    }

    /// `{ema_fast: int[8,20], ema_slow: int[20,50]}`
    pub fn gap_space() -> StrategySpace {
        StrategySpace::new(
            "ema_gap",
            vec![
                ParameterSpec::integer("ema_fast", 8, 20).unwrap(),
                ParameterSpec::integer("ema_slow", 20, 50).unwrap(),
            ],
        )
        .unwrap()
    }

    /// Profit grows with `ema_slow - ema_fast`
    pub fn gap_simulator() -> Arc<dyn StrategySimulator> {
        simulator_fn(|p, ds| {
            let gap = p.get("ema_slow").unwrap_or(0.0) - p.get("ema_fast").unwrap_or(0.0);
            let trend = ds.len() as f64;
            Ok(vec![trade_with_pnl(gap * trend)])
        })
    }

    pub fn context_for(
        space: StrategySpace,
        simulator: Arc<dyn StrategySimulator>,
        constraints: RunConstraints,
    ) -> SearchContext {
        let registry = Arc::new(SimulatorRegistry::new());
        registry
            .register(space.strategy_id(), simulator, ScoreWeights::default())
            .unwrap();
        let pool = EvaluationPool::new(
            FitnessEvaluator::new(registry),
            4,
            Duration::from_secs(30),
        );
        SearchContext::new(
            space,
            ascending_dataset(100),
            pool,
            Arc::new(RunProgress::new()),
            constraints,
        )
    }

    pub fn gap_context(seed: u64) -> SearchContext {
        context_for(gap_space(), gap_simulator(), RunConstraints::seeded(seed))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::evaluator::simulator_fn;

    #[test]
    fn test_method_parsing() {
        assert_eq!("auto".parse::<MethodRequest>().unwrap(), MethodRequest::Auto);
        assert_eq!("Genetic".parse::<MethodRequest>().unwrap(), MethodRequest::Genetic);
        assert!("annealing".parse::<MethodRequest>().is_err());
        assert_eq!(
            "surrogate_regression".parse::<SearchMethod>().unwrap(),
            SearchMethod::SurrogateRegression
        );
        assert_eq!(SearchMethod::Grid.to_string(), "grid");
    }

    #[tokio::test]
    async fn test_context_respects_evaluation_ceiling() {
        let ctx = context_for(
            gap_space(),
            gap_simulator(),
            RunConstraints {
                seed: Some(1),
                evaluation_ceiling: Some(5),
                time_budget: None,
            },
        );
        let mut rng = ctx.rng();
        let mut tracker = BestTracker::new();
        let batch = ctx.space().sample_uniform(8, &mut rng);
        let trials = ctx.evaluate(batch, SearchMethod::Grid, &mut tracker).await;
        assert_eq!(trials.len(), 5);
        assert!(ctx.should_stop());
        let more = ctx.space().sample_uniform(3, &mut rng);
        assert!(ctx.evaluate(more, SearchMethod::Grid, &mut tracker).await.is_empty());
        assert_eq!(ctx.evaluations(), 5);
    }

    #[tokio::test]
    async fn test_all_failures_is_no_successful_evaluation() {
        let ctx = context_for(
            gap_space(),
            simulator_fn(|_, _| anyhow::bail!("exchange offline")),
            RunConstraints::seeded(2),
        );
        let mut tracker = BestTracker::new();
        let batch = ctx.space().sample_uniform(3, &mut ctx.rng());
        ctx.evaluate(batch, SearchMethod::Genetic, &mut tracker).await;
        let err = tracker.finish(SearchMethod::Genetic, false).unwrap_err();
        match err {
            OptimizeError::NoSuccessfulEvaluation { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("exchange offline"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_cancelled_without_result() {
        let tracker = BestTracker::new();
        assert!(matches!(
            tracker.finish(SearchMethod::Grid, true),
            Err(OptimizeError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_tracker_only_replaces_on_strictly_better() {
        let ctx = gap_context(3);
        let space = ctx.space().clone();
        let base = space.sample(&mut ctx.rng());
        let a = space.with_value(&space.with_value(&base, "ema_fast", 10.0), "ema_slow", 30.0);
        let b = space.with_value(&space.with_value(&base, "ema_fast", 12.0), "ema_slow", 32.0);

        let mut tracker = BestTracker::new();
        ctx.evaluate(vec![a.clone(), b], SearchMethod::Grid, &mut tracker).await;
        // Equal score: the first one seen stays
        assert_eq!(tracker.best().unwrap().params, a);
        tracker.checkpoint();
        assert_eq!(tracker.history().len(), 1);
    }
}

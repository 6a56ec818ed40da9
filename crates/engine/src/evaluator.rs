//! Fitness evaluation
//!
//! [`FitnessEvaluator`] turns one candidate into an [`EvaluationResult`] by
//! replaying it through the strategy's registered [`StrategySimulator`] and
//! scoring the trades. [`EvaluationPool`] runs batches of those evaluations on
//! the blocking thread pool behind a shared semaphore with a per-evaluation
//! timeout.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::error::{OptimizeError, OptimizeResult};
use crate::search::SearchMethod;
use crate::space::ParameterSet;
use crate::types::{HistoricalDataset, TradeOutcome};

/// Score given to failed or timed-out candidates
pub const WORST_SCORE: f64 = -9999.0;

// ============================================================================
// Simulator contract
// ============================================================================

/// Strategy-specific backtest. Must be a pure function of its inputs.
pub trait StrategySimulator: Send + Sync {
    fn simulate(
        &self,
        params: &ParameterSet,
        dataset: &HistoricalDataset,
    ) -> anyhow::Result<Vec<TradeOutcome>>;
}

impl<F> StrategySimulator for F
where
    F: Fn(&ParameterSet, &HistoricalDataset) -> anyhow::Result<Vec<TradeOutcome>> + Send + Sync,
{
    fn simulate(
        &self,
        params: &ParameterSet,
        dataset: &HistoricalDataset,
    ) -> anyhow::Result<Vec<TradeOutcome>> {
        self(params, dataset)
    }
}

/// Wrap a closure as a shareable simulator
pub fn simulator_fn<F>(f: F) -> Arc<dyn StrategySimulator>
where
    F: Fn(&ParameterSet, &HistoricalDataset) -> anyhow::Result<Vec<TradeOutcome>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// Composite score weights:
/// `win_rate * winRate + profit * (profit / profit_normalizer) - drawdown * maxDrawdown`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub win_rate: f64,
    pub profit: f64,
    pub drawdown: f64,
    /// Profit divisor; also the starting capital of the drawdown equity curve
    pub profit_normalizer: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            win_rate: 0.6,
            profit: 0.4,
            drawdown: 0.0,
            profit_normalizer: 10_000.0,
        }
    }
}

impl ScoreWeights {
    pub fn validate(&self) -> OptimizeResult<()> {
        let all_finite = [self.win_rate, self.profit, self.drawdown, self.profit_normalizer]
            .iter()
            .all(|w| w.is_finite());
        if !all_finite {
            return Err(OptimizeError::Configuration(
                "Score weights must be finite".to_string(),
            ));
        }
        if self.profit_normalizer <= 0.0 {
            return Err(OptimizeError::Configuration(
                "profit_normalizer must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

struct RegisteredSimulator {
    simulator: Arc<dyn StrategySimulator>,
    weights: ScoreWeights,
}

/// Strategy id → simulator and score weights
#[derive(Default)]
pub struct SimulatorRegistry {
    entries: RwLock<HashMap<String, RegisteredSimulator>>,
}

impl SimulatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the simulator for `strategy_id`
    pub fn register(
        &self,
        strategy_id: &str,
        simulator: Arc<dyn StrategySimulator>,
        weights: ScoreWeights,
    ) -> OptimizeResult<()> {
        weights.validate()?;
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                strategy_id.to_string(),
                RegisteredSimulator { simulator, weights },
            );
        debug!(strategy = %strategy_id, "Simulator registered");
        Ok(())
    }

    /// Override the weights of an already registered strategy
    pub fn set_weights(&self, strategy_id: &str, weights: ScoreWeights) -> OptimizeResult<()> {
        weights.validate()?;
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let entry = entries
            .get_mut(strategy_id)
            .ok_or_else(|| OptimizeError::unknown_strategy(strategy_id))?;
        entry.weights = weights;
        Ok(())
    }

    pub fn contains(&self, strategy_id: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(strategy_id)
    }

    fn lookup(&self, strategy_id: &str) -> OptimizeResult<(Arc<dyn StrategySimulator>, ScoreWeights)> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(strategy_id)
            .map(|entry| (entry.simulator.clone(), entry.weights))
            .ok_or_else(|| OptimizeError::unknown_strategy(strategy_id))
    }
}

// ============================================================================
// Evaluation result
// ============================================================================

/// Scored outcome of one candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub params: ParameterSet,
    pub score: f64,
    pub profit: Decimal,
    /// Fraction of trades with positive PnL, in [0, 1]
    pub win_rate: f64,
    /// Peak-to-trough fraction of the reconstructed equity curve
    pub max_drawdown: f64,
    pub trades_count: u32,
    pub timestamp: DateTime<Utc>,
    pub search_method: Option<SearchMethod>,
}

impl EvaluationResult {
    /// Placeholder for a failed candidate
    pub fn worst_case(params: ParameterSet) -> Self {
        Self {
            params,
            score: WORST_SCORE,
            profit: Decimal::ZERO,
            win_rate: 0.0,
            max_drawdown: 0.0,
            trades_count: 0,
            timestamp: Utc::now(),
            search_method: None,
        }
    }

    pub fn with_method(mut self, method: SearchMethod) -> Self {
        self.search_method = Some(method);
        self
    }

    /// Same candidate and metrics, ignoring when it was produced
    pub fn same_outcome(&self, other: &EvaluationResult) -> bool {
        self.params == other.params
            && self.score == other.score
            && self.profit == other.profit
            && self.win_rate == other.win_rate
            && self.max_drawdown == other.max_drawdown
            && self.trades_count == other.trades_count
    }
}

/// Score a finished trade list
pub fn score_trades(
    params: &ParameterSet,
    trades: &[TradeOutcome],
    weights: &ScoreWeights,
) -> EvaluationResult {
    if trades.is_empty() {
        return EvaluationResult {
            params: params.clone(),
            score: 0.0,
            profit: Decimal::ZERO,
            win_rate: 0.0,
            max_drawdown: 0.0,
            trades_count: 0,
            timestamp: Utc::now(),
            search_method: None,
        };
    }

    let profit: Decimal = trades.iter().map(|t| t.pnl).sum();
    let wins = trades.iter().filter(|t| t.pnl > Decimal::ZERO).count();
    let win_rate = wins as f64 / trades.len() as f64;

    // Equity curve starts at the normalizer capital
    let mut equity = Decimal::from_f64_retain(weights.profit_normalizer).unwrap_or(Decimal::ZERO);
    let mut peak = equity;
    let mut max_drawdown = 0.0f64;
    for trade in trades {
        equity += trade.pnl;
        if equity > peak {
            peak = equity;
        }
        if peak > Decimal::ZERO {
            let dd = ((peak - equity) / peak).to_f64().unwrap_or(0.0);
            max_drawdown = max_drawdown.max(dd);
        }
    }

    let normalized_profit = profit.to_f64().unwrap_or(0.0) / weights.profit_normalizer;
    let score = weights.win_rate * win_rate + weights.profit * normalized_profit
        - weights.drawdown * max_drawdown;

    EvaluationResult {
        params: params.clone(),
        score,
        profit,
        win_rate,
        max_drawdown,
        trades_count: trades.len() as u32,
        timestamp: Utc::now(),
        search_method: None,
    }
}

// ============================================================================
// Evaluator
// ============================================================================

/// Stateless scorer; every call works on its own inputs only
#[derive(Clone)]
pub struct FitnessEvaluator {
    registry: Arc<SimulatorRegistry>,
}

impl FitnessEvaluator {
    pub fn new(registry: Arc<SimulatorRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SimulatorRegistry> {
        &self.registry
    }

    pub fn evaluate(
        &self,
        strategy_id: &str,
        params: &ParameterSet,
        dataset: &HistoricalDataset,
    ) -> OptimizeResult<EvaluationResult> {
        let (simulator, weights) = self.registry.lookup(strategy_id)?;
        if params.strategy_id() != strategy_id {
            return Err(OptimizeError::Configuration(format!(
                "Parameter set belongs to {}, not {strategy_id}",
                params.strategy_id()
            )));
        }

        let trades = catch_unwind(AssertUnwindSafe(|| simulator.simulate(params, dataset)))
            .map_err(|panic| OptimizeError::Simulation {
                strategy_id: strategy_id.to_string(),
                message: panic_message(panic),
            })?
            .map_err(|e| OptimizeError::Simulation {
                strategy_id: strategy_id.to_string(),
                message: format!("{e:#}"),
            })?;

        let result = score_trades(params, &trades, &weights);
        if !result.score.is_finite() {
            return Err(OptimizeError::Simulation {
                strategy_id: strategy_id.to_string(),
                message: "Simulator produced a non-finite score".to_string(),
            });
        }
        Ok(result)
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("simulator panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("simulator panicked: {s}")
    } else {
        "simulator panicked".to_string()
    }
}

// ============================================================================
// Evaluation pool
// ============================================================================

/// Outcome of one candidate inside a search. Failed candidates carry a
/// worst-case result so selection keeps working.
#[derive(Debug, Clone)]
pub struct Trial {
    pub result: EvaluationResult,
    pub error: Option<OptimizeError>,
}

impl Trial {
    pub fn success(result: EvaluationResult) -> Self {
        Self {
            result,
            error: None,
        }
    }

    pub fn failed(params: ParameterSet, error: OptimizeError, method: SearchMethod) -> Self {
        Self {
            result: EvaluationResult::worst_case(params).with_method(method),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn score(&self) -> f64 {
        self.result.score
    }
}

/// Bounded pool for candidate evaluations, shared by every run
#[derive(Clone)]
pub struct EvaluationPool {
    evaluator: FitnessEvaluator,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl EvaluationPool {
    pub fn new(evaluator: FitnessEvaluator, workers: usize, timeout: Duration) -> Self {
        let workers = workers.max(1);
        info!(workers, timeout_secs = timeout.as_secs_f64(), "Evaluation pool ready");
        Self {
            evaluator,
            permits: Arc::new(Semaphore::new(workers)),
            timeout,
        }
    }

    pub fn evaluator(&self) -> &FitnessEvaluator {
        &self.evaluator
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Evaluate candidates in parallel. Output order matches input order.
    ///
    /// Errors, panics and timeouts never escape: they become failed trials.
    /// A timed-out simulator keeps its worker slot until it actually returns.
    pub async fn evaluate_batch(
        &self,
        strategy_id: &str,
        candidates: Vec<ParameterSet>,
        dataset: &HistoricalDataset,
        method: SearchMethod,
    ) -> Vec<Trial> {
        let futures = candidates.into_iter().map(|params| {
            let permits = self.permits.clone();
            let evaluator = self.evaluator.clone();
            let dataset = dataset.clone();
            let strategy = strategy_id.to_string();
            let timeout = self.timeout;

            async move {
                let permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return Trial::failed(params, OptimizeError::Cancelled, method),
                };

                let job_params = params.clone();
                let job_strategy = strategy.clone();
                // The slot stays taken until the simulator returns, even past a timeout
                let handle = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    evaluator.evaluate(&job_strategy, &job_params, &dataset)
                });

                match tokio::time::timeout(timeout, handle).await {
                    Ok(Ok(Ok(result))) => Trial::success(result.with_method(method)),
                    Ok(Ok(Err(e))) => {
                        debug!(strategy = %strategy, error = %e, "Candidate evaluation failed");
                        Trial::failed(params, e, method)
                    }
                    Ok(Err(join_err)) => {
                        let e = OptimizeError::Simulation {
                            strategy_id: strategy.clone(),
                            message: format!("evaluation task aborted: {join_err}"),
                        };
                        warn!(strategy = %strategy, error = %e, "Candidate evaluation aborted");
                        Trial::failed(params, e, method)
                    }
                    Err(_) => {
                        warn!(
                            strategy = %strategy,
                            timeout_secs = timeout.as_secs_f64(),
                            "Candidate evaluation timed out"
                        );
                        let e = OptimizeError::EvaluationTimeout {
                            strategy_id: strategy.clone(),
                            after: timeout,
                        };
                        Trial::failed(params, e, method)
                    }
                }
            }
        });

        join_all(futures).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::{ParameterSpec, StrategySpace};
    use crate::types::test_support::ascending_dataset;
    use crate::types::TradeSide;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rust_decimal_macros::dec;

    fn trade(pnl: Decimal) -> TradeOutcome {
        TradeOutcome {
            entry_time: 0,
            exit_time: 1,
            side: TradeSide::Buy,
            entry_price: dec!(100),
            exit_price: dec!(100) + pnl,
            size: dec!(1),
            pnl,
            pnl_pct: pnl,
        }
    }

    fn space() -> StrategySpace {
        StrategySpace::new("s", vec![ParameterSpec::integer("n", 1, 10).unwrap()]).unwrap()
    }

    fn candidate() -> ParameterSet {
        space().sample(&mut StdRng::seed_from_u64(1))
    }

    fn evaluator_with(sim: Arc<dyn StrategySimulator>) -> FitnessEvaluator {
        let registry = Arc::new(SimulatorRegistry::new());
        registry.register("s", sim, ScoreWeights::default()).unwrap();
        FitnessEvaluator::new(registry)
    }

    #[test]
    fn test_score_trades_composite() {
        let trades = vec![trade(dec!(1000)), trade(dec!(-500)), trade(dec!(500))];
        let r = score_trades(&candidate(), &trades, &ScoreWeights::default());
        assert_eq!(r.trades_count, 3);
        assert_eq!(r.profit, dec!(1000));
        assert!((r.win_rate - 2.0 / 3.0).abs() < 1e-12);
        // 0.6 * 2/3 + 0.4 * 1000/10000
        assert!((r.score - 0.44).abs() < 1e-9);
        // Equity 10000 -> 11000 -> 10500: 500/11000
        assert!((r.max_drawdown - 500.0 / 11000.0).abs() < 1e-9);
    }

    #[test]
    fn test_drawdown_weight_penalizes() {
        let trades = vec![trade(dec!(1000)), trade(dec!(-1100))];
        let weights = ScoreWeights {
            drawdown: 1.0,
            ..ScoreWeights::default()
        };
        let r = score_trades(&candidate(), &trades, &weights);
        let expected = 0.6 * 0.5 + 0.4 * (-100.0 / 10_000.0) - 1100.0 / 11_000.0;
        assert!((r.score - expected).abs() < 1e-9);
    }

    #[test]
    fn test_zero_trades_scores_zero() {
        let eval = evaluator_with(simulator_fn(|_, _| Ok(Vec::new())));
        let r = eval.evaluate("s", &candidate(), &ascending_dataset(10)).unwrap();
        assert_eq!(r.score, 0.0);
        assert_eq!(r.trades_count, 0);
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let eval = evaluator_with(simulator_fn(|_, _| Ok(Vec::new())));
        let err = eval
            .evaluate("other", &candidate(), &ascending_dataset(10))
            .unwrap_err();
        assert!(matches!(err, OptimizeError::Configuration(_)));
    }

    #[test]
    fn test_simulator_error_and_panic_become_simulation_errors() {
        let failing = evaluator_with(simulator_fn(|_, _| anyhow::bail!("no data")));
        let err = failing
            .evaluate("s", &candidate(), &ascending_dataset(10))
            .unwrap_err();
        assert!(matches!(err, OptimizeError::Simulation { .. }));

        let panicking = evaluator_with(simulator_fn(|_, _| panic!("boom")));
        let err = panicking
            .evaluate("s", &candidate(), &ascending_dataset(10))
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let registry = SimulatorRegistry::new();
        let bad = ScoreWeights {
            profit_normalizer: 0.0,
            ..ScoreWeights::default()
        };
        let sim = simulator_fn(|_, _| Ok(Vec::new()));
        assert!(registry.register("s", sim, bad).is_err());
    }

    #[tokio::test]
    async fn test_pool_absorbs_timeouts_and_keeps_order() {
        let eval = evaluator_with(simulator_fn(|p, _| {
            if p.get_int("n") == Some(10) {
                std::thread::sleep(Duration::from_millis(500));
            }
            Ok(vec![trade(Decimal::from(p.get_int("n").unwrap_or(0)))])
        }));
        let pool = EvaluationPool::new(eval, 2, Duration::from_millis(100));
        let space = space();
        let candidates: Vec<ParameterSet> = [3.0, 10.0, 5.0]
            .iter()
            .map(|&n| space.with_value(&space.sample(&mut StdRng::seed_from_u64(0)), "n", n))
            .collect();

        let trials = pool
            .evaluate_batch("s", candidates, &ascending_dataset(10), SearchMethod::Grid)
            .await;

        assert_eq!(trials.len(), 3);
        assert!(trials[0].is_success());
        assert_eq!(trials[0].result.params.get_int("n"), Some(3));
        assert!(matches!(
            trials[1].error,
            Some(OptimizeError::EvaluationTimeout { .. })
        ));
        assert_eq!(trials[1].score(), WORST_SCORE);
        assert_eq!(trials[1].result.params.get_int("n"), Some(10));
        assert!(trials[2].is_success());
        assert_eq!(trials[2].result.search_method, Some(SearchMethod::Grid));
    }

    #[tokio::test]
    async fn test_timed_out_evaluation_keeps_its_slot() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, pk) = (running.clone(), peak.clone());
        let eval = evaluator_with(simulator_fn(move |p, _| {
            let now = r.fetch_add(1, Ordering::SeqCst) + 1;
            pk.fetch_max(now, Ordering::SeqCst);
            if p.get_int("n") != Some(1) {
                std::thread::sleep(Duration::from_millis(200));
            }
            r.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![trade(Decimal::ONE)])
        }));
        let pool = EvaluationPool::new(eval, 1, Duration::from_millis(50));
        let space = space();
        let candidates: Vec<ParameterSet> = [7.0, 8.0, 1.0]
            .iter()
            .map(|&n| space.with_value(&space.sample(&mut StdRng::seed_from_u64(0)), "n", n))
            .collect();

        let trials = pool
            .evaluate_batch("s", candidates, &ascending_dataset(10), SearchMethod::Grid)
            .await;

        assert!(matches!(
            trials[0].error,
            Some(OptimizeError::EvaluationTimeout { .. })
        ));
        assert!(matches!(
            trials[1].error,
            Some(OptimizeError::EvaluationTimeout { .. })
        ));
        assert!(trials[2].is_success());
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}

//! Bounded grid search
//!
//! Cartesian product of evenly spaced points per parameter, walked in
//! nested-loop order with the first declared parameter outermost, evaluated
//! batch by batch until the ceiling.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{OptimizeError, OptimizeResult};
use crate::search::{
    BestTracker, MethodRequest, SearchContext, SearchMethod, SearchOutcome, SearchStrategy,
};
use crate::space::{ParameterSet, StrategySpace};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Points per parameter
    pub resolution: usize,
    /// Maximum combinations evaluated
    pub ceiling: usize,
    /// Combinations handed to the evaluation pool at once
    pub batch_size: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            resolution: 4,
            ceiling: 50,
            batch_size: 10,
        }
    }
}

impl GridConfig {
    pub fn validate(&self) -> OptimizeResult<()> {
        if self.resolution == 0 || self.ceiling == 0 || self.batch_size == 0 {
            return Err(OptimizeError::Configuration(
                "grid: resolution, ceiling and batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Odometer over the grid axes; the last parameter turns fastest
pub struct GridIter {
    space: StrategySpace,
    axes: Vec<Vec<f64>>,
    cursor: Option<Vec<usize>>,
}

impl GridIter {
    pub fn new(space: &StrategySpace, resolution: usize) -> Self {
        let axes: Vec<Vec<f64>> = space
            .specs()
            .iter()
            .map(|spec| spec.grid_points(resolution))
            .collect();
        let cursor = if axes.iter().any(|axis| axis.is_empty()) {
            None
        } else {
            Some(vec![0; axes.len()])
        };
        Self {
            space: space.clone(),
            axes,
            cursor,
        }
    }

    /// Size of the full Cartesian product, saturating at `usize::MAX`
    pub fn combinations(&self) -> usize {
        self.axes
            .iter()
            .try_fold(1usize, |acc, axis| acc.checked_mul(axis.len()))
            .unwrap_or(usize::MAX)
    }
}

impl Iterator for GridIter {
    type Item = ParameterSet;

    fn next(&mut self) -> Option<ParameterSet> {
        let cursor = self.cursor.as_mut()?;

        let mut dim = 0;
        let axes = &self.axes;
        let set = self.space.assemble(|_| {
            let value = axes[dim][cursor[dim]];
            dim += 1;
            value
        });

        let mut wrapped = true;
        for d in (0..axes.len()).rev() {
            cursor[d] += 1;
            if cursor[d] < axes[d].len() {
                wrapped = false;
                break;
            }
            cursor[d] = 0;
        }
        if wrapped {
            self.cursor = None;
        }
        Some(set)
    }
}

pub struct GridSearch {
    config: GridConfig,
}

impl GridSearch {
    pub fn new(config: GridConfig) -> OptimizeResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Combinations this search would evaluate, in order
    pub fn plan(&self, space: &StrategySpace) -> impl Iterator<Item = ParameterSet> {
        GridIter::new(space, self.config.resolution).take(self.config.ceiling)
    }
}

#[async_trait]
impl SearchStrategy for GridSearch {
    fn method(&self) -> MethodRequest {
        MethodRequest::Grid
    }

    async fn search(&self, ctx: &SearchContext) -> OptimizeResult<SearchOutcome> {
        let grid = GridIter::new(ctx.space(), self.config.resolution);
        let combinations = grid.combinations();
        let total = combinations.min(self.config.ceiling);
        info!(
            strategy = %ctx.strategy_id(),
            combinations,
            evaluating = total,
            "Starting grid search"
        );
        ctx.progress().add_total(total);

        let mut tracker = BestTracker::new();
        let mut plan = grid.take(self.config.ceiling).peekable();
        let mut done = 0usize;

        while plan.peek().is_some() {
            if ctx.should_stop() {
                break;
            }
            let batch: Vec<ParameterSet> = plan.by_ref().take(self.config.batch_size).collect();
            let trials = ctx.evaluate(batch, SearchMethod::Grid, &mut tracker).await;
            if trials.is_empty() {
                break;
            }
            done += trials.len();
            ctx.progress().set_phase(format!("grid {done}/{total}"));
            tracker.checkpoint();
        }

        let stopped = ctx.is_cancelled() || ctx.out_of_time();
        let outcome = tracker.finish(SearchMethod::Grid, stopped)?;
        info!(
            strategy = %ctx.strategy_id(),
            score = outcome.best.score,
            evaluations = outcome.evaluations,
            "Grid search finished"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::simulator_fn;
    use crate::search::test_support::*;
    use crate::search::RunConstraints;
    use crate::space::ParameterSpec;
    use std::sync::{Arc, Mutex};

    fn cube_space() -> StrategySpace {
        StrategySpace::new(
            "cube",
            vec![
                ParameterSpec::integer("a", 0, 3).unwrap(),
                ParameterSpec::integer("b", 10, 40).unwrap(),
                ParameterSpec::integer("c", 1, 100).unwrap(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_iter_nested_loop_order() {
        let space = cube_space();
        let grid = GridIter::new(&space, 4);
        assert_eq!(grid.combinations(), 64);
        let sets: Vec<ParameterSet> = grid.collect();
        assert_eq!(sets.len(), 64);
        assert_eq!(sets[0].get("a"), Some(0.0));
        assert_eq!(sets[0].get("c"), Some(1.0));
        assert_eq!(sets[1].get("c"), Some(34.0));
        assert_eq!(sets[4].get("b"), Some(20.0));
        assert_eq!(sets[16].get("a"), Some(1.0));
        assert_eq!(sets[63].get("a"), Some(3.0));
        assert_eq!(sets[63].get("c"), Some(100.0));
    }

    #[tokio::test]
    async fn test_ceiling_stops_at_fifty_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let ctx = context_for(
            cube_space(),
            simulator_fn(move |p, _| {
                recorder.lock().unwrap().push(p.clone());
                Ok(vec![trade_with_pnl(p.get("c").unwrap_or(0.0))])
            }),
            RunConstraints::default(),
        );

        // One candidate per batch, so evaluation order is the dispatch order
        let search = GridSearch::new(GridConfig {
            batch_size: 1,
            ..GridConfig::default()
        })
        .unwrap();
        let outcome = search.search(&ctx).await.unwrap();
        assert_eq!(outcome.evaluations, 50);
        assert_eq!(ctx.evaluations(), 50);

        let expected: Vec<ParameterSet> = search.plan(ctx.space()).collect();
        assert_eq!(expected.len(), 50);
        assert_eq!(*seen.lock().unwrap(), expected);
        assert_eq!(expected[0].get("a"), Some(0.0));
        assert_eq!(expected[49].get("a"), Some(3.0));
        assert_eq!(expected[49].get("c"), Some(34.0));

        // Highest c inside the first 50 combinations, first one wins ties
        assert_eq!(outcome.best.params, expected[3]);
        assert_eq!(outcome.method_used, SearchMethod::Grid);
    }

    fn wide_space() -> StrategySpace {
        let specs = (0..32)
            .map(|i| ParameterSpec::integer(format!("p{i}"), 0, 9).unwrap())
            .collect();
        StrategySpace::new("wide", specs).unwrap()
    }

    #[test]
    fn test_huge_grid_size_saturates() {
        let grid = GridIter::new(&wide_space(), 4);
        assert_eq!(grid.combinations(), usize::MAX);
    }

    #[tokio::test]
    async fn test_huge_grid_respects_ceiling() {
        let ctx = context_for(
            wide_space(),
            simulator_fn(|p, _| Ok(vec![trade_with_pnl(p.get("p31").unwrap_or(0.0))])),
            RunConstraints::default(),
        );
        let search = GridSearch::new(GridConfig::default()).unwrap();
        let outcome = search.search(&ctx).await.unwrap();
        assert_eq!(outcome.evaluations, 50);
        assert_eq!(ctx.progress().progress_pct(), 100.0);
    }

    #[tokio::test]
    async fn test_small_grid_evaluated_fully() {
        let ctx = gap_context(0);
        let search = GridSearch::new(GridConfig {
            resolution: 3,
            ..GridConfig::default()
        })
        .unwrap();
        let outcome = search.search(&ctx).await.unwrap();
        assert_eq!(outcome.evaluations, 9);
        // ema_fast = 8, ema_slow = 50 is the widest gap on the grid
        assert_eq!(outcome.best.params.get("ema_fast"), Some(8.0));
        assert_eq!(outcome.best.params.get("ema_slow"), Some(50.0));
    }

    #[test]
    fn test_invalid_config() {
        assert!(GridSearch::new(GridConfig {
            resolution: 0,
            ..GridConfig::default()
        })
        .is_err());
    }
}

//! Evolutionary search
//!
//! Generational genetic algorithm over a strategy's parameter space:
//! tournament selection without replacement, uniform crossover, per-parameter
//! mutation and elitism. Individuals that already carry a score (elites, or a
//! population carried forward unchanged) are never evaluated twice.

use async_trait::async_trait;
use rand::seq::index::sample;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{debug, info};

use crate::error::{OptimizeError, OptimizeResult};
use crate::evaluator::EvaluationResult;
use crate::search::{
    BestTracker, MethodRequest, SearchContext, SearchMethod, SearchOutcome, SearchStrategy,
};
use crate::space::{ParameterSet, StrategySpace};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneticConfig {
    pub population_size: usize,
    pub generations: usize,
    pub mutation_rate: f64,
    pub elite_size: usize,
    pub tournament_size: usize,
}

impl Default for GeneticConfig {
    fn default() -> Self {
        Self {
            population_size: 20,
            generations: 10,
            mutation_rate: 0.1,
            elite_size: 5,
            tournament_size: 3,
        }
    }
}

impl GeneticConfig {
    pub fn validate(&self) -> OptimizeResult<()> {
        let fail = |msg: &str| Err(OptimizeError::Configuration(format!("genetic: {msg}")));
        if self.population_size < 2 {
            return fail("population_size must be at least 2");
        }
        if self.generations == 0 {
            return fail("generations must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.mutation_rate) {
            return fail("mutation_rate must lie in [0, 1]");
        }
        if self.elite_size >= self.population_size {
            return fail("elite_size must be smaller than population_size");
        }
        if self.tournament_size == 0 || self.tournament_size > self.population_size {
            return fail("tournament_size must lie in [1, population_size]");
        }
        Ok(())
    }

    /// Evaluations of a full run without early stopping, assuming the
    /// population never stalls
    pub fn max_evaluations(&self) -> usize {
        self.population_size
            + (self.generations.saturating_sub(1)) * (self.population_size - self.elite_size)
    }
}

/// Evolutionary state, published on the run's progress handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneticPhase {
    Initialized,
    EvaluatingGeneration(usize),
    Selecting(usize),
    Breeding(usize),
    Terminated,
}

impl std::fmt::Display for GeneticPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GeneticPhase::Initialized => write!(f, "initialized"),
            GeneticPhase::EvaluatingGeneration(g) => write!(f, "evaluating generation {}", g + 1),
            GeneticPhase::Selecting(g) => write!(f, "selecting from generation {}", g + 1),
            GeneticPhase::Breeding(g) => write!(f, "breeding generation {}", g + 2),
            GeneticPhase::Terminated => write!(f, "terminated"),
        }
    }
}

#[derive(Debug, Clone)]
struct Individual {
    params: ParameterSet,
    result: Option<EvaluationResult>,
}

impl Individual {
    fn unscored(params: ParameterSet) -> Self {
        Self {
            params,
            result: None,
        }
    }

    fn fitness(&self) -> f64 {
        self.result.as_ref().map_or(f64::NEG_INFINITY, |r| r.score)
    }
}

fn by_fitness_desc(a: &Individual, b: &Individual) -> Ordering {
    b.fitness()
        .partial_cmp(&a.fitness())
        .unwrap_or(Ordering::Equal)
}

// ============================================================================
// Operators
// ============================================================================

/// Pick `tournament_size` distinct individuals and keep the fittest
fn tournament<'a>(population: &'a [Individual], size: usize, rng: &mut impl Rng) -> &'a Individual {
    let contenders = sample(rng, population.len(), size.min(population.len()));
    let mut winner = &population[contenders.index(0)];
    for idx in contenders.iter().skip(1) {
        if population[idx].fitness() > winner.fitness() {
            winner = &population[idx];
        }
    }
    winner
}

/// Uniform crossover; the child belongs to parent A's strategy
pub fn crossover(
    space: &StrategySpace,
    parent_a: &ParameterSet,
    parent_b: &ParameterSet,
    rng: &mut impl Rng,
) -> ParameterSet {
    space.assemble(|spec| {
        let a = parent_a.get(spec.name()).unwrap_or(spec.lower());
        let b = parent_b.get(spec.name()).unwrap_or(a);
        if rng.gen_bool(0.5) {
            a
        } else {
            b
        }
    })
}

/// Perturb each parameter with probability `rate`, then clamp
pub fn mutate(
    space: &StrategySpace,
    params: &ParameterSet,
    rate: f64,
    rng: &mut impl Rng,
) -> ParameterSet {
    space.assemble(|spec| {
        let current = params.get(spec.name()).unwrap_or(spec.lower());
        if rng.gen_bool(rate) {
            spec.perturb(current, rng)
        } else {
            current
        }
    })
}

// ============================================================================
// Search
// ============================================================================

pub struct GeneticSearch {
    config: GeneticConfig,
}

impl GeneticSearch {
    pub fn new(config: GeneticConfig) -> OptimizeResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &GeneticConfig {
        &self.config
    }

    fn set_phase(ctx: &SearchContext, phase: GeneticPhase) {
        debug!(strategy = %ctx.strategy_id(), phase = %phase, "Genetic phase");
        ctx.progress().set_phase(phase.to_string());
    }

    /// Score every individual that has no result yet
    async fn evaluate_population(
        &self,
        ctx: &SearchContext,
        population: &mut [Individual],
        tracker: &mut BestTracker,
    ) {
        let pending: Vec<usize> = population
            .iter()
            .enumerate()
            .filter(|(_, ind)| ind.result.is_none())
            .map(|(i, _)| i)
            .collect();
        if pending.is_empty() {
            return;
        }

        let candidates = pending
            .iter()
            .map(|&i| population[i].params.clone())
            .collect();
        let trials = ctx.evaluate(candidates, SearchMethod::Genetic, tracker).await;

        for (slot, &i) in pending.iter().enumerate() {
            population[i].result = Some(match trials.get(slot) {
                Some(trial) => trial.result.clone(),
                // Cut off by the evaluation ceiling
                None => EvaluationResult::worst_case(population[i].params.clone())
                    .with_method(SearchMethod::Genetic),
            });
        }
    }

    fn breed(
        &self,
        ctx: &SearchContext,
        population: &[Individual],
        rng: &mut impl Rng,
    ) -> Vec<Individual> {
        let cfg = &self.config;
        let space = ctx.space();

        let mut ranked = population.to_vec();
        ranked.sort_by(by_fitness_desc);

        let mating_pool: Vec<&Individual> = (0..cfg.population_size)
            .map(|_| tournament(&ranked, cfg.tournament_size, rng))
            .collect();

        let mut next: Vec<Individual> = ranked.iter().take(cfg.elite_size).cloned().collect();
        while next.len() < cfg.population_size {
            let parent_a = mating_pool[rng.gen_range(0..mating_pool.len())];
            let parent_b = mating_pool[rng.gen_range(0..mating_pool.len())];
            let child = crossover(space, &parent_a.params, &parent_b.params, rng);
            let child = mutate(space, &child, cfg.mutation_rate, rng);
            next.push(Individual::unscored(child));
        }
        next
    }
}

#[async_trait]
impl SearchStrategy for GeneticSearch {
    fn method(&self) -> MethodRequest {
        MethodRequest::Genetic
    }

    async fn search(&self, ctx: &SearchContext) -> OptimizeResult<SearchOutcome> {
        let cfg = &self.config;
        let mut rng = ctx.rng();
        let mut tracker = BestTracker::new();

        info!(
            strategy = %ctx.strategy_id(),
            population = cfg.population_size,
            generations = cfg.generations,
            "Starting genetic search"
        );

        Self::set_phase(ctx, GeneticPhase::Initialized);
        ctx.progress().add_total(cfg.max_evaluations());
        let mut population: Vec<Individual> = ctx
            .space()
            .sample_uniform(cfg.population_size, &mut rng)
            .into_iter()
            .map(Individual::unscored)
            .collect();

        for generation in 0..cfg.generations {
            if ctx.should_stop() {
                break;
            }

            Self::set_phase(ctx, GeneticPhase::EvaluatingGeneration(generation));
            self.evaluate_population(ctx, &mut population, &mut tracker).await;
            tracker.checkpoint();

            debug!(
                strategy = %ctx.strategy_id(),
                generation,
                best = tracker.best().map(|b| b.score),
                "Generation evaluated"
            );

            if generation + 1 == cfg.generations || ctx.should_stop() {
                break;
            }

            Self::set_phase(ctx, GeneticPhase::Selecting(generation));
            let fitness_sum: f64 = population.iter().map(|ind| ind.fitness()).sum();
            if fitness_sum == 0.0 {
                debug!(
                    strategy = %ctx.strategy_id(),
                    generation,
                    "Zero total fitness, carrying population forward"
                );
                continue;
            }

            Self::set_phase(ctx, GeneticPhase::Breeding(generation));
            population = self.breed(ctx, &population, &mut rng);
        }

        Self::set_phase(ctx, GeneticPhase::Terminated);
        let stopped = ctx.is_cancelled() || ctx.out_of_time();
        let outcome = tracker.finish(SearchMethod::Genetic, stopped)?;

        info!(
            strategy = %ctx.strategy_id(),
            score = outcome.best.score,
            evaluations = outcome.evaluations,
            "Genetic search finished"
        );
        Ok(outcome)
    }
}

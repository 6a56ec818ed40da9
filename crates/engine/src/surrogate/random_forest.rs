//! Random-forest regression surrogate
//!
//! Bagged regression trees with a random feature subset per split. Small and
//! dependency-free; the corpora it sees are tens of points.

use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::Rng;

use super::{RegressionModel, RegressionModelFactory, SurrogateConfig};
use crate::error::{OptimizeError, OptimizeResult};

pub struct RandomForestFactory {
    config: SurrogateConfig,
}

impl RandomForestFactory {
    pub fn new(config: SurrogateConfig) -> Self {
        Self { config }
    }
}

impl RegressionModelFactory for RandomForestFactory {
    fn name(&self) -> &'static str {
        "random-forest"
    }

    fn create(&self) -> OptimizeResult<Box<dyn RegressionModel>> {
        Ok(Box::new(RandomForest::new(
            self.config.forest_trees,
            self.config.forest_max_depth,
            self.config.forest_min_samples_split,
        )))
    }
}

#[derive(Debug, Clone)]
enum Node {
    Leaf(f64),
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    fn predict(&self, x: &[f64]) -> f64 {
        match self {
            Node::Leaf(value) => *value,
            Node::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                if x.get(*feature).copied().unwrap_or(0.0) <= *threshold {
                    left.predict(x)
                } else {
                    right.predict(x)
                }
            }
        }
    }
}

struct TreeBuilder<'a> {
    xs: &'a [Vec<f64>],
    ys: &'a [f64],
    max_depth: usize,
    min_samples_split: usize,
    features_per_split: usize,
}

impl TreeBuilder<'_> {
    fn mean(&self, idx: &[usize]) -> f64 {
        idx.iter().map(|&i| self.ys[i]).sum::<f64>() / idx.len() as f64
    }

    fn sse(&self, idx: &[usize]) -> f64 {
        let mean = self.mean(idx);
        idx.iter().map(|&i| (self.ys[i] - mean).powi(2)).sum()
    }

    fn build(&self, idx: &[usize], depth: usize, rng: &mut StdRng) -> Node {
        if depth >= self.max_depth || idx.len() < self.min_samples_split {
            return Node::Leaf(self.mean(idx));
        }

        let dims = self.xs[idx[0]].len();
        let features = sample(rng, dims, self.features_per_split.min(dims));
        let parent_sse = self.sse(idx);
        let mut best: Option<(f64, usize, f64)> = None;

        for feature in features.iter() {
            let mut values: Vec<f64> = idx.iter().map(|&i| self.xs[i][feature]).collect();
            values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            values.dedup();
            for pair in values.windows(2) {
                let threshold = (pair[0] + pair[1]) / 2.0;
                let (left, right): (Vec<usize>, Vec<usize>) =
                    idx.iter().partition(|&&i| self.xs[i][feature] <= threshold);
                let cost = self.sse(&left) + self.sse(&right);
                if best.map_or(true, |(c, _, _)| cost < c) {
                    best = Some((cost, feature, threshold));
                }
            }
        }

        match best {
            Some((cost, feature, threshold)) if cost < parent_sse => {
                let (left, right): (Vec<usize>, Vec<usize>) =
                    idx.iter().partition(|&&i| self.xs[i][feature] <= threshold);
                Node::Split {
                    feature,
                    threshold,
                    left: Box::new(self.build(&left, depth + 1, rng)),
                    right: Box::new(self.build(&right, depth + 1, rng)),
                }
            }
            _ => Node::Leaf(self.mean(idx)),
        }
    }
}

pub struct RandomForest {
    trees: Vec<Node>,
    n_trees: usize,
    max_depth: usize,
    min_samples_split: usize,
}

impl RandomForest {
    pub fn new(n_trees: usize, max_depth: usize, min_samples_split: usize) -> Self {
        Self {
            trees: Vec::new(),
            n_trees: n_trees.max(1),
            max_depth: max_depth.max(1),
            min_samples_split: min_samples_split.max(2),
        }
    }

    pub fn is_fitted(&self) -> bool {
        !self.trees.is_empty()
    }
}

impl RegressionModel for RandomForest {
    fn fit(&mut self, xs: &[Vec<f64>], ys: &[f64], rng: &mut StdRng) -> OptimizeResult<()> {
        if xs.is_empty() || xs.len() != ys.len() {
            return Err(OptimizeError::Configuration(format!(
                "random forest needs matching, non-empty samples ({} inputs, {} targets)",
                xs.len(),
                ys.len()
            )));
        }

        let dims = xs[0].len();
        let builder = TreeBuilder {
            xs,
            ys,
            max_depth: self.max_depth,
            min_samples_split: self.min_samples_split,
            features_per_split: ((dims as f64).sqrt().ceil() as usize).max(1),
        };

        self.trees = (0..self.n_trees)
            .map(|_| {
                let bootstrap: Vec<usize> =
                    (0..xs.len()).map(|_| rng.gen_range(0..xs.len())).collect();
                builder.build(&bootstrap, 0, rng)
            })
            .collect();
        Ok(())
    }

    fn predict(&self, x: &[f64]) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        self.trees.iter().map(|t| t.predict(x)).sum::<f64>() / self.trees.len() as f64
    }
}

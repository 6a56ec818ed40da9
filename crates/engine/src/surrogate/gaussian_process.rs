//! Gaussian-process sequential optimizer
//!
//! RBF kernel over the unit cube, standardized targets, upper confidence
//! bound acquisition maximized over random candidates. The first
//! `initial_random_trials` asks are uniform draws.

use rand::rngs::StdRng;
use rand::Rng;

use super::{SequentialOptimizer, SequentialOptimizerFactory, SurrogateConfig};
use crate::error::{OptimizeError, OptimizeResult};

pub struct GaussianProcessFactory {
    config: SurrogateConfig,
}

impl GaussianProcessFactory {
    pub fn new(config: SurrogateConfig) -> Self {
        Self { config }
    }
}

impl SequentialOptimizerFactory for GaussianProcessFactory {
    fn name(&self) -> &'static str {
        "gaussian-process-ucb"
    }

    fn create(&self, dimensions: usize) -> OptimizeResult<Box<dyn SequentialOptimizer>> {
        if dimensions == 0 {
            return Err(OptimizeError::DependencyUnavailable {
                mode: self.name().to_string(),
                reason: "cannot model a zero-dimensional space".to_string(),
            });
        }
        Ok(Box::new(GaussianProcessOptimizer::new(
            dimensions,
            self.config.clone(),
        )))
    }
}

/// Fitted posterior, recomputed after every `tell`
struct Posterior {
    alpha: Vec<f64>,
    k_inv: Vec<f64>,
    y_mean: f64,
    y_std: f64,
}

pub struct GaussianProcessOptimizer {
    dimensions: usize,
    config: SurrogateConfig,
    xs: Vec<Vec<f64>>,
    ys: Vec<f64>,
    asked: usize,
    posterior: Option<Posterior>,
}

impl GaussianProcessOptimizer {
    pub fn new(dimensions: usize, config: SurrogateConfig) -> Self {
        Self {
            dimensions,
            config,
            xs: Vec::new(),
            ys: Vec::new(),
            asked: 0,
            posterior: None,
        }
    }

    pub fn observations(&self) -> usize {
        self.xs.len()
    }

    fn kernel(&self, a: &[f64], b: &[f64]) -> f64 {
        let sq_dist: f64 = a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum();
        (-sq_dist / (2.0 * self.config.length_scale.powi(2))).exp()
    }

    fn refit(&mut self) {
        let n = self.xs.len();
        if n < 2 {
            self.posterior = None;
            return;
        }

        let y_mean = self.ys.iter().sum::<f64>() / n as f64;
        let var = self.ys.iter().map(|y| (y - y_mean).powi(2)).sum::<f64>() / n as f64;
        let y_std = if var > 1e-12 { var.sqrt() } else { 1.0 };
        let y: Vec<f64> = self.ys.iter().map(|v| (v - y_mean) / y_std).collect();

        let mut k = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..n {
                k[i * n + j] = self.kernel(&self.xs[i], &self.xs[j]);
            }
            k[i * n + i] += self.config.noise_variance;
        }

        self.posterior = invert(&k, n).map(|k_inv| {
            let alpha = (0..n)
                .map(|i| (0..n).map(|j| k_inv[i * n + j] * y[j]).sum())
                .collect();
            Posterior {
                alpha,
                k_inv,
                y_mean,
                y_std,
            }
        });
    }

    /// Posterior mean and standard deviation in the original score scale
    pub fn predict(&self, x: &[f64]) -> Option<(f64, f64)> {
        let post = self.posterior.as_ref()?;
        let n = self.xs.len();
        let k_star: Vec<f64> = self.xs.iter().map(|xi| self.kernel(x, xi)).collect();

        let mean: f64 = k_star.iter().zip(&post.alpha).map(|(k, a)| k * a).sum();
        let mut reduction = 0.0;
        for i in 0..n {
            for j in 0..n {
                reduction += k_star[i] * post.k_inv[i * n + j] * k_star[j];
            }
        }
        let variance = (1.0 + self.config.noise_variance - reduction).max(1e-12);

        Some((
            post.y_mean + mean * post.y_std,
            variance.sqrt() * post.y_std,
        ))
    }

    fn random_point(&self, rng: &mut StdRng) -> Vec<f64> {
        (0..self.dimensions).map(|_| rng.gen_range(0.0..=1.0)).collect()
    }
}

impl SequentialOptimizer for GaussianProcessOptimizer {
    fn ask(&mut self, rng: &mut StdRng) -> Vec<f64> {
        self.asked += 1;
        if self.asked <= self.config.initial_random_trials || self.posterior.is_none() {
            return self.random_point(rng);
        }

        let beta = self.config.ucb_beta;
        let mut best_point = self.random_point(rng);
        let mut best_acq = f64::NEG_INFINITY;
        for _ in 0..self.config.candidates_per_ask {
            let point = self.random_point(rng);
            if let Some((mean, std)) = self.predict(&point) {
                let acq = mean + beta * std;
                if acq > best_acq {
                    best_acq = acq;
                    best_point = point;
                }
            }
        }
        best_point
    }

    fn tell(&mut self, point: Vec<f64>, score: f64) {
        if !score.is_finite() || point.len() != self.dimensions {
            return;
        }
        self.xs.push(point);
        self.ys.push(score);
        self.refit();
    }
}

/// Gauss-Jordan inverse with partial pivoting; `None` when singular
fn invert(matrix: &[f64], n: usize) -> Option<Vec<f64>> {
    let mut a = matrix.to_vec();
    let mut inv = vec![0.0; n * n];
    for i in 0..n {
        inv[i * n + i] = 1.0;
    }

    for col in 0..n {
        let pivot_row = (col..n).max_by(|&r1, &r2| {
            a[r1 * n + col]
                .abs()
                .partial_cmp(&a[r2 * n + col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if a[pivot_row * n + col].abs() < 1e-12 {
            return None;
        }
        if pivot_row != col {
            for j in 0..n {
                a.swap(col * n + j, pivot_row * n + j);
                inv.swap(col * n + j, pivot_row * n + j);
            }
        }

        let pivot = a[col * n + col];
        for j in 0..n {
            a[col * n + j] /= pivot;
            inv[col * n + j] /= pivot;
        }

        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = a[row * n + col];
            if factor == 0.0 {
                continue;
            }
            for j in 0..n {
                a[row * n + j] -= factor * a[col * n + j];
                inv[row * n + j] -= factor * inv[col * n + j];
            }
        }
    }
    Some(inv)
}

//! Background re-optimization
//!
//! Periodically re-runs strategies whose persisted best is missing or older
//! than the staleness window. Failed runs back off exponentially per
//! strategy. Nothing here blocks the caller: [`ReoptimizationScheduler::spawn`]
//! moves the loop onto its own task.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::orchestrator::{OptimizationOrchestrator, OptimizationRun};
use crate::search::{MethodRequest, RunConstraints};

const SHUTDOWN_POLL_MS: u64 = 500;

#[derive(Debug, Clone, Copy)]
struct Backoff {
    failures: u32,
    retry_at: DateTime<Utc>,
}

pub struct ReoptimizationScheduler {
    orchestrator: Arc<OptimizationOrchestrator>,
    method: MethodRequest,
    staleness: chrono::Duration,
    check_interval: Duration,
    backoff_initial: chrono::Duration,
    backoff_max: chrono::Duration,
    backoff: Mutex<HashMap<String, Backoff>>,
}

impl ReoptimizationScheduler {
    /// Timing comes from the orchestrator's own configuration
    pub fn new(orchestrator: Arc<OptimizationOrchestrator>) -> Self {
        let config: &OrchestratorConfig = &orchestrator.config().orchestrator;
        let backoff_initial = chrono::Duration::seconds(config.backoff_initial_secs as i64);
        let backoff_max = chrono::Duration::seconds(config.backoff_max_secs as i64);
        Self {
            method: config.default_method,
            staleness: config.staleness(),
            check_interval: config.check_interval(),
            backoff_initial,
            backoff_max,
            backoff: Mutex::new(HashMap::new()),
            orchestrator,
        }
    }

    pub fn with_method(mut self, method: MethodRequest) -> Self {
        self.method = method;
        self
    }

    /// Next retry time of a strategy that is backing off
    pub fn retry_at(&self, strategy_id: &str) -> Option<DateTime<Utc>> {
        self.backoff
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(strategy_id)
            .map(|b| b.retry_at)
    }

    /// Strategies due at `now`: no persisted best, or a best older than the
    /// staleness window. Skips in-flight runs and strategies backing off.
    pub async fn due_strategies(&self, now: DateTime<Utc>) -> Vec<String> {
        let active = self.orchestrator.active_runs();
        let mut due = Vec::new();

        for strategy_id in self.orchestrator.space().strategies() {
            if active.contains(&strategy_id) {
                continue;
            }
            if self.retry_at(&strategy_id).is_some_and(|at| at > now) {
                debug!(strategy = %strategy_id, "Backing off, skipping");
                continue;
            }

            match self.orchestrator.store().load_best(&strategy_id).await {
                Ok(Some(best)) if now - best.timestamp < self.staleness => {}
                Ok(best) => {
                    info!(
                        strategy = %strategy_id,
                        last_optimized = ?best.map(|b| b.timestamp),
                        "Strategy parameters are stale"
                    );
                    due.push(strategy_id);
                }
                Err(e) => {
                    warn!(strategy = %strategy_id, error = %e, "Staleness check failed");
                }
            }
        }
        due
    }

    /// One scheduling pass: run every due strategy and update backoff
    pub async fn check_once(&self, now: DateTime<Utc>) -> Vec<OptimizationRun> {
        let due = self.due_strategies(now).await;
        if due.is_empty() {
            return Vec::new();
        }

        info!(count = due.len(), method = %self.method, "Re-optimizing stale strategies");
        let runs = self
            .orchestrator
            .run_many(&due, self.method, RunConstraints::default())
            .await;

        let mut backoff = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
        for run in &runs {
            if run.is_completed() {
                backoff.remove(&run.strategy_id);
                continue;
            }
            let failures = backoff
                .get(&run.strategy_id)
                .map_or(1, |b| b.failures.saturating_add(1));
            let delay = self.delay_after(failures);
            warn!(
                strategy = %run.strategy_id,
                failures,
                retry_in_secs = delay.num_seconds(),
                error = run.error_reason.as_deref().unwrap_or("unknown"),
                "Re-optimization failed, backing off"
            );
            backoff.insert(
                run.strategy_id.clone(),
                Backoff {
                    failures,
                    retry_at: now + delay,
                },
            );
        }
        runs
    }

    /// `initial * 2^(failures - 1)`, capped
    fn delay_after(&self, failures: u32) -> chrono::Duration {
        let factor = 2i32.saturating_pow(failures.saturating_sub(1).min(30));
        self.backoff_initial
            .checked_mul(factor)
            .map_or(self.backoff_max, |d| d.min(self.backoff_max))
    }

    /// Run the scheduling loop on its own task until `shutdown` is set
    pub fn spawn(self: Arc<Self>, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.check_interval.as_secs(),
                staleness_days = self.staleness.num_days(),
                "Re-optimization scheduler starting"
            );

            loop {
                if shutdown.load(Ordering::Relaxed) {
                    info!("Re-optimization scheduler cancelled");
                    break;
                }

                let runs = self.check_once(Utc::now()).await;
                if !runs.is_empty() {
                    let completed = runs.iter().filter(|r| r.is_completed()).count();
                    info!(total = runs.len(), completed, "Re-optimization pass finished");
                }

                // Wait before the next pass, staying responsive to shutdown
                let ticks = (self.check_interval.as_millis() as u64 / SHUTDOWN_POLL_MS).max(1);
                for _ in 0..ticks {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(SHUTDOWN_POLL_MS)).await;
                }
            }

            info!("Re-optimization scheduler stopped");
        })
    }
}

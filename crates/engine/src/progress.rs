//! Shared progress and cancellation handle for a single optimization run

use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    RwLock,
};

/// Lifecycle of an optimization run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Shared between the orchestrator, the running search and any observer
/// (the operator tool polls it while a run is in flight).
pub struct RunProgress {
    pub status: RwLock<RunStatus>,
    /// Free-form phase label, e.g. the evolutionary state or "trial 12/50"
    pub phase: RwLock<String>,
    pub total: AtomicU32,
    pub completed: AtomicU32,
    pub failed: AtomicU32,
    pub cancelled: AtomicBool,
    pub best_score: RwLock<Option<f64>>,
}

impl RunProgress {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(RunStatus::Pending),
            phase: RwLock::new(String::new()),
            total: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            failed: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            best_score: RwLock::new(None),
        }
    }

    pub fn set_status(&self, status: RunStatus) {
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = status;
    }

    pub fn status(&self) -> RunStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_phase(&self, phase: impl Into<String>) {
        *self.phase.write().unwrap_or_else(|e| e.into_inner()) = phase.into();
    }

    pub fn phase(&self) -> String {
        self.phase.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn add_total(&self, n: usize) {
        self.total.fetch_add(n as u32, Ordering::Relaxed);
    }

    pub fn record_evaluation(&self, success: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_best_score(&self, score: f64) {
        *self.best_score.write().unwrap_or_else(|e| e.into_inner()) = Some(score);
    }

    pub fn best_score(&self) -> Option<f64> {
        *self.best_score.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Request cooperative cancellation; honored at the next batch boundary
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u32 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Get progress as percentage
    pub fn progress_pct(&self) -> f32 {
        let total = self.total.load(Ordering::Relaxed);
        let done = self.completed.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            (done as f32 / total as f32 * 100.0).min(100.0)
        }
    }

    pub fn is_running(&self) -> bool {
        self.status() == RunStatus::Running
    }
}

impl Default for RunProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_pct_and_counters() {
        let p = RunProgress::new();
        assert_eq!(p.progress_pct(), 0.0);
        p.add_total(4);
        p.record_evaluation(true);
        p.record_evaluation(false);
        assert_eq!(p.progress_pct(), 50.0);
        assert_eq!(p.failed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_cancel_flag_and_status() {
        let p = RunProgress::default();
        assert_eq!(p.status(), RunStatus::Pending);
        p.set_status(RunStatus::Running);
        assert!(p.is_running());
        assert!(!p.is_cancelled());
        p.cancel();
        assert!(p.is_cancelled());
        assert_eq!(RunStatus::Completed.to_string(), "completed");
    }
}

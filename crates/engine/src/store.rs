//! Result store
//!
//! Append-only record of every completed run's best result. `load_best`
//! always scans the full history of a strategy; nothing is cached.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use persistence::{
    Database, DbError, OptimizationResultRecord, OptimizationRunRecord, ResultRepository,
    RunRepository,
};
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::error::{OptimizeError, OptimizeResult};
use crate::evaluator::EvaluationResult;
use crate::orchestrator::OptimizationRun;
use crate::search::SearchMethod;
use crate::space::ParameterSet;

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Append one finalized best result
    async fn save(
        &self,
        strategy_id: &str,
        result: &EvaluationResult,
        method: SearchMethod,
        run_id: Option<&str>,
    ) -> OptimizeResult<()>;

    /// Highest score ever saved for the strategy; ties go to the most recent
    async fn load_best(&self, strategy_id: &str) -> OptimizeResult<Option<EvaluationResult>>;

    /// Every saved result for the strategy, newest first
    async fn history(&self, strategy_id: &str) -> OptimizeResult<Vec<EvaluationResult>>;

    /// Write a finalized run to the run ledger
    async fn record_run(&self, run: &OptimizationRun) -> OptimizeResult<()>;
}

/// Best of `results` under the store's ordering: score, then timestamp, then
/// position (later wins). `results` must be in insertion order.
pub fn select_best<'a>(
    results: impl IntoIterator<Item = &'a EvaluationResult>,
) -> Option<&'a EvaluationResult> {
    results.into_iter().fold(None, |best, candidate| match best {
        None => Some(candidate),
        Some(current) => {
            let ord = candidate
                .score
                .partial_cmp(&current.score)
                .unwrap_or(Ordering::Equal)
                .then(candidate.timestamp.cmp(&current.timestamp));
            if ord == Ordering::Less {
                Some(current)
            } else {
                Some(candidate)
            }
        }
    })
}

// ============================================================================
// SQLite
// ============================================================================

/// SQLite-backed store; writes are serialized through a mutex
pub struct SqliteResultStore {
    db: Arc<Database>,
    write_lock: tokio::sync::Mutex<()>,
}

impl SqliteResultStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    fn to_record(
        strategy_id: &str,
        result: &EvaluationResult,
        method: SearchMethod,
        run_id: Option<&str>,
    ) -> OptimizeResult<OptimizationResultRecord> {
        let parameters = serde_json::to_string(result.params.values())
            .map_err(|e| OptimizeError::Persistence(format!("encode parameters: {e}")))?;
        Ok(OptimizationResultRecord {
            id: None,
            strategy_id: strategy_id.to_string(),
            params_hash: result.params.params_hash(),
            parameters,
            score: result.score,
            profit: result.profit.to_string(),
            win_rate: result.win_rate,
            max_drawdown: result.max_drawdown,
            trades_count: i64::from(result.trades_count),
            timestamp_ms: result.timestamp.timestamp_millis(),
            search_method: method.as_str().to_string(),
            run_id: run_id.map(str::to_string),
        })
    }

    fn from_record(record: OptimizationResultRecord) -> OptimizeResult<EvaluationResult> {
        let id = record.id.unwrap_or_default();
        let corrupt = |reason: String| OptimizeError::from(DbError::Corrupt { id, reason });

        let values: BTreeMap<String, f64> = serde_json::from_str(&record.parameters)
            .map_err(|e| corrupt(format!("parameters: {e}")))?;
        let profit: Decimal = record
            .profit
            .parse()
            .map_err(|e| corrupt(format!("profit: {e}")))?;
        let timestamp: DateTime<Utc> = Utc
            .timestamp_millis_opt(record.timestamp_ms)
            .single()
            .ok_or_else(|| corrupt(format!("timestamp {}", record.timestamp_ms)))?;
        let method: SearchMethod = record
            .search_method
            .parse()
            .map_err(|e: OptimizeError| corrupt(e.to_string()))?;

        Ok(EvaluationResult {
            params: ParameterSet::from_stored(&record.strategy_id, values),
            score: record.score,
            profit,
            win_rate: record.win_rate,
            max_drawdown: record.max_drawdown,
            trades_count: u32::try_from(record.trades_count).unwrap_or(0),
            timestamp,
            search_method: Some(method),
        })
    }
}

#[async_trait]
impl ResultStore for SqliteResultStore {
    async fn save(
        &self,
        strategy_id: &str,
        result: &EvaluationResult,
        method: SearchMethod,
        run_id: Option<&str>,
    ) -> OptimizeResult<()> {
        let record = Self::to_record(strategy_id, result, method, run_id)?;
        let _guard = self.write_lock.lock().await;
        let id = ResultRepository::new(self.db.pool()).save(&record).await?;
        info!(
            strategy = %strategy_id,
            id,
            score = result.score,
            method = %method,
            "Saved optimization result"
        );
        Ok(())
    }

    async fn load_best(&self, strategy_id: &str) -> OptimizeResult<Option<EvaluationResult>> {
        // Newest first; reverse to insertion order for `select_best`
        let mut history = self.history(strategy_id).await?;
        history.reverse();
        let best = select_best(&history).cloned();
        debug!(
            strategy = %strategy_id,
            scanned = history.len(),
            best = best.as_ref().map(|b| b.score),
            "Loaded best result"
        );
        Ok(best)
    }

    async fn history(&self, strategy_id: &str) -> OptimizeResult<Vec<EvaluationResult>> {
        let records = ResultRepository::new(self.db.pool())
            .get_all_for_strategy(strategy_id)
            .await?;
        records.into_iter().map(Self::from_record).collect()
    }

    async fn record_run(&self, run: &OptimizationRun) -> OptimizeResult<()> {
        let record = OptimizationRunRecord {
            id: run.id.clone(),
            strategy_id: run.strategy_id.clone(),
            requested_method: run.requested_method.as_str().to_string(),
            search_method: run.search_method.map(|m| m.as_str().to_string()),
            fallback_from: run.fallback_from.map(|m| m.as_str().to_string()),
            status: run.status.as_str().to_string(),
            start_time_ms: run.start_time.timestamp_millis(),
            end_time_ms: run.end_time.map(|t| t.timestamp_millis()),
            best_score: run.best_result.as_ref().map(|r| r.score),
            evaluations: run.evaluations as i64,
            error_reason: run.error_reason.clone(),
        };
        let _guard = self.write_lock.lock().await;
        RunRepository::new(self.db.pool()).save(&record).await?;
        Ok(())
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Mutex-guarded in-memory store for tests and dry runs
#[derive(Default)]
pub struct MemoryResultStore {
    results: Mutex<Vec<(String, EvaluationResult)>>,
    runs: Mutex<Vec<OptimizationRun>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> Vec<OptimizationRun> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.results.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn save(
        &self,
        strategy_id: &str,
        result: &EvaluationResult,
        method: SearchMethod,
        _run_id: Option<&str>,
    ) -> OptimizeResult<()> {
        let stored = result.clone().with_method(method);
        self.results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((strategy_id.to_string(), stored));
        Ok(())
    }

    async fn load_best(&self, strategy_id: &str) -> OptimizeResult<Option<EvaluationResult>> {
        let results = self.results.lock().unwrap_or_else(|e| e.into_inner());
        Ok(select_best(
            results
                .iter()
                .filter(|(id, _)| id == strategy_id)
                .map(|(_, r)| r),
        )
        .cloned())
    }

    async fn history(&self, strategy_id: &str) -> OptimizeResult<Vec<EvaluationResult>> {
        let results = self.results.lock().unwrap_or_else(|e| e.into_inner());
        let mut history: Vec<EvaluationResult> = results
            .iter()
            .filter(|(id, _)| id == strategy_id)
            .map(|(_, r)| r.clone())
            .collect();
        // Newest first; stable sort keeps later inserts ahead on equal timestamps
        history.reverse();
        history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(history)
    }

    async fn record_run(&self, run: &OptimizationRun) -> OptimizeResult<()> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(run.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::{ParameterSpec, StrategySpace};
    use chrono::Duration;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rust_decimal_macros::dec;

    fn result(score: f64, at: DateTime<Utc>, fast: f64) -> EvaluationResult {
        let space = StrategySpace::new(
            "ema_rsi",
            vec![ParameterSpec::integer("ema_fast", 8, 20).unwrap()],
        )
        .unwrap();
        let params = space.with_value(&space.sample(&mut StdRng::seed_from_u64(0)), "ema_fast", fast);
        EvaluationResult {
            params,
            score,
            profit: dec!(250.5),
            win_rate: 0.6,
            max_drawdown: 0.05,
            trades_count: 7,
            timestamp: at,
            search_method: None,
        }
    }

    fn base_time() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap()
    }

    async fn sqlite_store() -> SqliteResultStore {
        SqliteResultStore::new(Arc::new(Database::in_memory().await.unwrap()))
    }

    #[test]
    fn test_select_best_tie_breaks_on_recency() {
        let t = base_time();
        let older = result(0.8, t, 10.0);
        let newer = result(0.8, t + Duration::seconds(5), 11.0);
        let lower = result(0.5, t + Duration::seconds(10), 12.0);
        let all = vec![newer.clone(), older, lower];
        assert_eq!(select_best(&all).unwrap().params, newer.params);
    }

    #[tokio::test]
    async fn test_sqlite_load_best_scans_all_records() {
        let store = sqlite_store().await;
        let t = base_time();
        store
            .save("ema_rsi", &result(0.9, t, 10.0), SearchMethod::Genetic, None)
            .await
            .unwrap();
        // A later, worse record must not shadow the global best
        store
            .save("ema_rsi", &result(0.4, t + Duration::days(1), 12.0), SearchMethod::Grid, Some("r2"))
            .await
            .unwrap();

        let best = store.load_best("ema_rsi").await.unwrap().unwrap();
        assert_eq!(best.score, 0.9);
        assert_eq!(best.params.get("ema_fast"), Some(10.0));
        assert_eq!(best.search_method, Some(SearchMethod::Genetic));
        assert_eq!(best.profit, dec!(250.5));
        assert_eq!(best.timestamp, t);

        let history = store.history("ema_rsi").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].score, 0.4);
        assert!(store.load_best("macd").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_ties_go_to_most_recent() {
        let store = sqlite_store().await;
        let t = base_time();
        store
            .save("ema_rsi", &result(0.7, t, 10.0), SearchMethod::Genetic, None)
            .await
            .unwrap();
        store
            .save("ema_rsi", &result(0.7, t + Duration::hours(1), 14.0), SearchMethod::Grid, None)
            .await
            .unwrap();
        let best = store.load_best("ema_rsi").await.unwrap().unwrap();
        assert_eq!(best.params.get("ema_fast"), Some(14.0));
    }

    #[tokio::test]
    async fn test_memory_store_matches_sqlite_semantics() {
        let store = MemoryResultStore::new();
        let t = base_time();
        store
            .save("ema_rsi", &result(0.7, t, 10.0), SearchMethod::Genetic, None)
            .await
            .unwrap();
        store
            .save("ema_rsi", &result(0.7, t + Duration::hours(1), 14.0), SearchMethod::Grid, None)
            .await
            .unwrap();
        store
            .save("macd", &result(0.99, t, 9.0), SearchMethod::Grid, None)
            .await
            .unwrap();

        let best = store.load_best("ema_rsi").await.unwrap().unwrap();
        assert_eq!(best.params.get("ema_fast"), Some(14.0));
        assert_eq!(best.search_method, Some(SearchMethod::Grid));
        assert_eq!(store.history("ema_rsi").await.unwrap().len(), 2);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_corrupt_record_surfaces_persistence_error() {
        let store = sqlite_store().await;
        let mut record =
            SqliteResultStore::to_record("ema_rsi", &result(0.5, base_time(), 10.0), SearchMethod::Grid, None)
                .unwrap();
        record.parameters = "not json".to_string();
        ResultRepository::new(store.database().pool())
            .save(&record)
            .await
            .unwrap();

        let err = store.load_best("ema_rsi").await.unwrap_err();
        assert!(matches!(err, OptimizeError::Persistence(_)));
    }
}

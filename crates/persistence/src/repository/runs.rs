//! Run ledger — one row per finalized optimization run

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OptimizationRunRecord {
    pub id: String,
    pub strategy_id: String,
    pub requested_method: String,
    pub search_method: Option<String>,
    pub fallback_from: Option<String>,
    pub status: String,
    pub start_time_ms: i64,
    pub end_time_ms: Option<i64>,
    pub best_score: Option<f64>,
    pub evaluations: i64,
    pub error_reason: Option<String>,
}

/// Repository for the run ledger
pub struct RunRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> RunRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a finalized run (upsert by id so a retried write is harmless)
    pub async fn save(&self, record: &OptimizationRunRecord) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO optimization_runs (
                id, strategy_id, requested_method, search_method, fallback_from,
                status, start_time_ms, end_time_ms, best_score, evaluations, error_reason
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO UPDATE SET
                search_method = excluded.search_method,
                fallback_from = excluded.fallback_from,
                status = excluded.status,
                end_time_ms = excluded.end_time_ms,
                best_score = excluded.best_score,
                evaluations = excluded.evaluations,
                error_reason = excluded.error_reason
            "#,
        )
        .bind(&record.id)
        .bind(&record.strategy_id)
        .bind(&record.requested_method)
        .bind(&record.search_method)
        .bind(&record.fallback_from)
        .bind(&record.status)
        .bind(record.start_time_ms)
        .bind(record.end_time_ms)
        .bind(record.best_score)
        .bind(record.evaluations)
        .bind(&record.error_reason)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<OptimizationRunRecord>> {
        let record = sqlx::query_as::<_, OptimizationRunRecord>(
            r#"
            SELECT id, strategy_id, requested_method, search_method, fallback_from,
                   status, start_time_ms, end_time_ms, best_score, evaluations, error_reason
            FROM optimization_runs
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    /// Most recent runs for a strategy, newest first
    pub async fn get_recent(
        &self,
        strategy_id: &str,
        limit: i64,
    ) -> DbResult<Vec<OptimizationRunRecord>> {
        let records = sqlx::query_as::<_, OptimizationRunRecord>(
            r#"
            SELECT id, strategy_id, requested_method, search_method, fallback_from,
                   status, start_time_ms, end_time_ms, best_score, evaluations, error_reason
            FROM optimization_runs
            WHERE strategy_id = ?
            ORDER BY start_time_ms DESC
            LIMIT ?
            "#,
        )
        .bind(strategy_id)
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn failed_run(id: &str, start: i64) -> OptimizationRunRecord {
        OptimizationRunRecord {
            id: id.to_string(),
            strategy_id: "macd".to_string(),
            requested_method: "auto".to_string(),
            search_method: None,
            fallback_from: None,
            status: "failed".to_string(),
            start_time_ms: start,
            end_time_ms: Some(start + 50),
            best_score: None,
            evaluations: 0,
            error_reason: Some("Unknown strategy: macd".to_string()),
        }
    }

    #[tokio::test]
    async fn test_save_and_fetch_run() {
        let db = Database::in_memory().await.unwrap();
        let repo = RunRepository::new(db.pool());

        repo.save(&failed_run("a", 10)).await.unwrap();
        let fetched = repo.get_by_id("a").await.unwrap().unwrap();
        assert_eq!(fetched.status, "failed");
        assert_eq!(fetched.error_reason.as_deref(), Some("Unknown strategy: macd"));
        assert!(repo.get_by_id("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resave_overwrites_status() {
        let db = Database::in_memory().await.unwrap();
        let repo = RunRepository::new(db.pool());

        repo.save(&failed_run("a", 10)).await.unwrap();
        let mut completed = failed_run("a", 10);
        completed.status = "completed".to_string();
        completed.best_score = Some(0.8);
        completed.error_reason = None;
        repo.save(&completed).await.unwrap();

        let recent = repo.get_recent("macd", 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].status, "completed");
        assert_eq!(recent[0].best_score, Some(0.8));
    }
}

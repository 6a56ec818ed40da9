//! Optimization results repository — append-only store of finalized bests

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A finalized best result as stored on disk
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OptimizationResultRecord {
    pub id: Option<i64>,
    pub strategy_id: String,
    pub params_hash: String,
    /// JSON object: parameter name → number
    pub parameters: String,
    pub score: f64,
    pub profit: String,
    pub win_rate: f64,
    pub max_drawdown: f64,
    pub trades_count: i64,
    pub timestamp_ms: i64,
    pub search_method: String,
    pub run_id: Option<String>,
}

/// Repository for optimization results
pub struct ResultRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ResultRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a record. Never updates existing rows.
    pub async fn save(&self, record: &OptimizationResultRecord) -> DbResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO optimization_results (
                strategy_id, params_hash, parameters, score, profit,
                win_rate, max_drawdown, trades_count, timestamp_ms,
                search_method, run_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.strategy_id)
        .bind(&record.params_hash)
        .bind(&record.parameters)
        .bind(record.score)
        .bind(&record.profit)
        .bind(record.win_rate)
        .bind(record.max_drawdown)
        .bind(record.trades_count)
        .bind(record.timestamp_ms)
        .bind(&record.search_method)
        .bind(&record.run_id)
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Every record ever saved for a strategy, newest first
    pub async fn get_all_for_strategy(
        &self,
        strategy_id: &str,
    ) -> DbResult<Vec<OptimizationResultRecord>> {
        let records = sqlx::query_as::<_, OptimizationResultRecord>(
            r#"
            SELECT id, strategy_id, params_hash, parameters, score, profit,
                   win_rate, max_drawdown, trades_count, timestamp_ms,
                   search_method, run_id
            FROM optimization_results
            WHERE strategy_id = ?
            ORDER BY timestamp_ms DESC, id DESC
            "#,
        )
        .bind(strategy_id)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Distinct strategy ids with at least one stored result
    pub async fn list_strategies(&self) -> DbResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT strategy_id FROM optimization_results ORDER BY strategy_id",
        )
        .fetch_all(self.pool)
        .await?;

        Ok(rows.into_iter().map(|(s,)| s).collect())
    }

    pub async fn count_for_strategy(&self, strategy_id: &str) -> DbResult<i64> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM optimization_results WHERE strategy_id = ?")
                .bind(strategy_id)
                .fetch_one(self.pool)
                .await?;

        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn record(strategy: &str, score: f64, ts: i64) -> OptimizationResultRecord {
        OptimizationResultRecord {
            id: None,
            strategy_id: strategy.to_string(),
            params_hash: format!("hash-{score}-{ts}"),
            parameters: r#"{"ema_fast":10.0}"#.to_string(),
            score,
            profit: "125.50".to_string(),
            win_rate: 0.55,
            max_drawdown: 0.04,
            trades_count: 12,
            timestamp_ms: ts,
            search_method: "genetic".to_string(),
            run_id: Some("run-1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_save_is_append_only() {
        let db = Database::in_memory().await.unwrap();
        let repo = ResultRepository::new(db.pool());

        let first = repo.save(&record("ema_rsi", 0.5, 1_000)).await.unwrap();
        // Identical content still appends a new row
        let second = repo.save(&record("ema_rsi", 0.5, 1_000)).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(repo.count_for_strategy("ema_rsi").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_get_all_for_strategy_filters_and_orders() {
        let db = Database::in_memory().await.unwrap();
        let repo = ResultRepository::new(db.pool());

        repo.save(&record("ema_rsi", 0.3, 1_000)).await.unwrap();
        repo.save(&record("macd", 0.9, 2_000)).await.unwrap();
        repo.save(&record("ema_rsi", 0.7, 3_000)).await.unwrap();

        let rows = repo.get_all_for_strategy("ema_rsi").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timestamp_ms, 3_000);
        assert_eq!(rows[1].timestamp_ms, 1_000);
        assert_eq!(rows[0].profit, "125.50");

        let strategies = repo.list_strategies().await.unwrap();
        assert_eq!(strategies, vec!["ema_rsi".to_string(), "macd".to_string()]);
    }
}

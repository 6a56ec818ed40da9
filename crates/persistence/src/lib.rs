//! Persistence layer for the optimization engine
//!
//! SQLite storage for finalized optimization results (append-only) and the
//! run ledger.

pub mod repository;
pub mod schema;

pub use repository::*;

pub use sqlx::sqlite::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: i64, reason: String },

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) a file-backed database
    pub async fn new(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| DbError::Connection(format!("{}: {e}", parent.display())))?;
            }
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let db = Self { pool };
        db.run_migrations().await?;
        db.configure_pragmas(true).await?;

        debug!(path = %path.display(), "Database opened");
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    ///
    /// A single connection keeps every query on the same in-memory file.
    pub async fn in_memory() -> DbResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let db = Self { pool };
        db.run_migrations().await?;
        db.configure_pragmas(false).await?;

        Ok(db)
    }

    /// Execute each schema statement individually
    async fn run_migrations(&self) -> DbResult<()> {
        for statement in schema::CREATE_TABLES.split(';') {
            let sql: String = statement
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");
            let sql = sql.trim();
            if sql.is_empty() {
                continue;
            }
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| DbError::Migration(format!("{e}: {sql}")))?;
        }

        Ok(())
    }

    async fn configure_pragmas(&self, file_backed: bool) -> DbResult<()> {
        if file_backed {
            // In-memory databases stay in the default journal mode
            sqlx::query("PRAGMA journal_mode=WAL")
                .execute(&self.pool)
                .await
                .map_err(|e| DbError::Connection(format!("WAL pragma failed: {e}")))?;

            sqlx::query("PRAGMA synchronous=NORMAL")
                .execute(&self.pool)
                .await
                .map_err(|e| DbError::Connection(format!("synchronous pragma failed: {e}")))?;
        }

        sqlx::query("PRAGMA busy_timeout=5000")
            .execute(&self.pool)
            .await
            .map_err(|e| DbError::Connection(format!("busy_timeout pragma failed: {e}")))?;

        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database_migrates() {
        let db = Database::in_memory().await.unwrap();
        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        assert!(names.contains(&"optimization_results"));
        assert!(names.contains(&"optimization_runs"));

        let columns: Vec<(i64, String, String, i64, Option<String>, i64)> =
            sqlx::query_as("PRAGMA table_info(optimization_results)")
                .fetch_all(db.pool())
                .await
                .unwrap();
        assert!(columns.iter().any(|(_, name, ..)| name == "run_id"));
    }

    #[tokio::test]
    async fn test_file_database_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("hyperopt.db");

        let db = Database::new(&path).await.unwrap();
        drop(db);

        // Second open replays migrations against an existing schema
        let db = Database::new(&path).await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM optimization_results")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}

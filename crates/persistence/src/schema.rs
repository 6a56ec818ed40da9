//! Database schema definitions

/// SQL to create all tables
/// NOTE: profit is stored as TEXT to preserve rust_decimal::Decimal precision
pub const CREATE_TABLES: &str = r#"
-- Finalized best result of each completed run (append-only)
CREATE TABLE IF NOT EXISTS optimization_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    strategy_id TEXT NOT NULL,
    params_hash TEXT NOT NULL,
    parameters TEXT NOT NULL,
    score REAL NOT NULL,
    profit TEXT NOT NULL DEFAULT '0',
    win_rate REAL NOT NULL DEFAULT 0,
    max_drawdown REAL NOT NULL DEFAULT 0,
    trades_count INTEGER NOT NULL DEFAULT 0,
    timestamp_ms INTEGER NOT NULL,
    search_method TEXT NOT NULL,
    run_id TEXT,
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- One row per finalized optimization run
CREATE TABLE IF NOT EXISTS optimization_runs (
    id TEXT PRIMARY KEY,
    strategy_id TEXT NOT NULL,
    requested_method TEXT NOT NULL,
    search_method TEXT,
    fallback_from TEXT,
    status TEXT NOT NULL,
    start_time_ms INTEGER NOT NULL,
    end_time_ms INTEGER,
    best_score REAL,
    evaluations INTEGER NOT NULL DEFAULT 0,
    error_reason TEXT
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_results_strategy ON optimization_results(strategy_id);
CREATE INDEX IF NOT EXISTS idx_runs_strategy ON optimization_runs(strategy_id, start_time_ms DESC)
"#;

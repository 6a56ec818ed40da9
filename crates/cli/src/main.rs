//! Hyperopt — operator tool for the strategy optimization engine
//!
//! Usage:
//!   hyperopt run --candles btc_1h.json --strategy ema_rsi,macd   — Optimize now
//!   hyperopt best --strategy ema_rsi                             — Show the stored best
//!   hyperopt watch --candles btc_1h.json                         — Re-optimize stale strategies
//!   hyperopt spaces                                              — List parameter spaces

use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use engine::{
    register_builtin_strategies, BuiltinStrategy, HistoricalDataset, MethodRequest,
    OptimizationOrchestrator, OptimizationRun, OptimizerConfig, ParamKind, ParameterSpace,
    ReoptimizationScheduler, ResultStore, RunConstraints, RunStatus, SimulatorRegistry,
    SqliteResultStore, StaticDataSource, SurrogateBackends,
};
use persistence::{Database, ResultRepository, RunRepository};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));

#[derive(Parser)]
#[command(name = "hyperopt")]
#[command(about = "Strategy hyperparameter optimization", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Optional JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Optimize one or more strategies against a candle file
    Run {
        /// JSON array of klines
        #[arg(long)]
        candles: String,
        /// Strategies to optimize (comma-separated, default: all built-in)
        #[arg(long, value_delimiter = ',')]
        strategy: Vec<String>,
        /// genetic, surrogate, grid or auto (default from config)
        #[arg(short, long)]
        method: Option<String>,
        /// Seed for reproducible runs
        #[arg(long)]
        seed: Option<u64>,
        /// Cap on evaluator calls per run
        #[arg(long)]
        max_evaluations: Option<usize>,
        /// Wall-clock budget per run, in seconds
        #[arg(long)]
        time_budget: Option<u64>,
        #[arg(long, default_value = "BTCUSDT")]
        symbol: String,
        #[arg(long, default_value = "1h")]
        timeframe: String,
        /// Optional JSON export of the finished runs
        #[arg(long)]
        export: Option<String>,
    },
    /// Show the best stored parameters
    Best {
        /// Strategy to show (default: every strategy with results)
        #[arg(long)]
        strategy: Option<String>,
        /// Also list this many recent runs
        #[arg(long, default_value_t = 0)]
        runs: i64,
    },
    /// Keep strategies fresh: re-optimize any whose best is stale, until Ctrl+C
    Watch {
        /// JSON array of klines
        #[arg(long)]
        candles: String,
        /// genetic, surrogate, grid or auto (default from config)
        #[arg(short, long)]
        method: Option<String>,
        #[arg(long, default_value = "BTCUSDT")]
        symbol: String,
        #[arg(long, default_value = "1h")]
        timeframe: String,
    },
    /// List the built-in strategies and their parameter spaces
    Spaces,
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,persistence=debug,hyperopt=debug,sqlx=warn")
    } else {
        EnvFilter::new("info,engine=info,hyperopt=info,sqlx=warn")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

fn load_config(path: Option<&str>) -> anyhow::Result<OptimizerConfig> {
    match path {
        Some(path) => {
            let config = OptimizerConfig::from_json_file(path)?;
            info!("Configuration loaded: {}", path);
            Ok(config)
        }
        None => Ok(OptimizerConfig::default()),
    }
}

async fn open_database() -> anyhow::Result<Arc<Database>> {
    let db_path =
        std::env::var("HYPEROPT_DB_PATH").unwrap_or_else(|_| "data/hyperopt.db".to_string());
    let db = Database::new(&db_path).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        anyhow::anyhow!("Database initialization failed: {}", e)
    })?;
    info!("Database initialized: {}", db_path);
    Ok(Arc::new(db))
}

/// Orchestrator over the built-in strategies, the SQLite store and one dataset
async fn build_orchestrator(
    config: OptimizerConfig,
    dataset: HistoricalDataset,
) -> anyhow::Result<Arc<OptimizationOrchestrator>> {
    let db = open_database().await?;
    let space = Arc::new(ParameterSpace::new());
    let registry = Arc::new(SimulatorRegistry::new());
    register_builtin_strategies(&space, &registry, config.score_weights)?;

    let backends = SurrogateBackends::detect(&config.surrogate);
    let orchestrator = OptimizationOrchestrator::new(
        config,
        space,
        registry,
        Arc::new(SqliteResultStore::new(db)),
        Arc::new(StaticDataSource::new(dataset)),
        backends,
    )?;
    Ok(Arc::new(orchestrator))
}

fn load_candles(path: &str, symbol: &str, timeframe: &str) -> anyhow::Result<HistoricalDataset> {
    let dataset = HistoricalDataset::from_json_file(path, symbol, timeframe)?;
    println!(
        "Candles: {} ({} {} bars)",
        path,
        dataset.len(),
        dataset.timeframe()
    );
    Ok(dataset)
}

fn resolve_method(arg: Option<&str>, config: &OptimizerConfig) -> anyhow::Result<MethodRequest> {
    Ok(match arg {
        Some(method) => method.parse()?,
        None => config.orchestrator.default_method,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            candles,
            strategy,
            method,
            seed,
            max_evaluations,
            time_budget,
            symbol,
            timeframe,
            export,
        } => {
            let constraints = RunConstraints {
                seed,
                evaluation_ceiling: max_evaluations,
                time_budget: time_budget.map(Duration::from_secs),
            };
            let method = resolve_method(method.as_deref(), &config)?;
            let dataset = load_candles(&candles, &symbol, &timeframe)?;
            cmd_run(config, dataset, strategy, method, constraints, export).await?;
        }
        Commands::Best { strategy, runs } => {
            cmd_best(strategy, runs).await?;
        }
        Commands::Watch {
            candles,
            method,
            symbol,
            timeframe,
        } => {
            let method = resolve_method(method.as_deref(), &config)?;
            let dataset = load_candles(&candles, &symbol, &timeframe)?;
            cmd_watch(config, dataset, method).await?;
        }
        Commands::Spaces => cmd_spaces()?,
    }

    Ok(())
}

// ============================================================================
// Run command
// ============================================================================

async fn cmd_run(
    config: OptimizerConfig,
    dataset: HistoricalDataset,
    strategies: Vec<String>,
    method: MethodRequest,
    constraints: RunConstraints,
    export: Option<String>,
) -> anyhow::Result<()> {
    println!("\n=== Hyperopt v{} ===", APP_VERSION);

    let orchestrator = build_orchestrator(config, dataset).await?;
    let strategies = if strategies.is_empty() {
        orchestrator.space().strategies()
    } else {
        strategies
    };
    println!(
        "Strategies: {} | Method: {} | Seed: {}",
        strategies.join(", "),
        method,
        constraints
            .seed
            .map_or_else(|| "random".to_string(), |s| s.to_string())
    );
    println!("Press Ctrl+C to stop early and keep the best so far\n");

    // Ctrl+C cancels every run cooperatively
    let orchestrator_for_ctrlc = orchestrator.clone();
    let strategies_for_ctrlc = strategies.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl+C received, requesting cancel...");
        for strategy_id in &strategies_for_ctrlc {
            orchestrator_for_ctrlc.cancel(strategy_id);
        }
    });

    let run_handle = {
        let orchestrator = orchestrator.clone();
        let strategies = strategies.clone();
        tokio::spawn(async move {
            orchestrator
                .run_many(&strategies, method, constraints)
                .await
        })
    };

    // Progress display loop
    while !run_handle.is_finished() {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let line: Vec<String> = strategies
            .iter()
            .filter_map(|id| {
                orchestrator.progress(id).map(|p| {
                    let best = p
                        .best_score()
                        .map_or_else(|| "-".to_string(), |s| format!("{:.3}", s));
                    format!("{} {:.0}% best {}", id, p.progress_pct(), best)
                })
            })
            .collect();
        if !line.is_empty() {
            print!("\r  {}          ", line.join(" | "));
        }
    }
    println!();

    let runs = run_handle.await?;
    print_runs(&runs);

    if let Some(export_path) = export {
        let json = serde_json::to_string_pretty(&runs)?;
        std::fs::write(&export_path, &json)?;
        println!("\nRuns exported to {}", export_path);
    }

    if runs.iter().all(|r| r.status == RunStatus::Failed) {
        anyhow::bail!("every optimization run failed");
    }
    Ok(())
}

fn print_runs(runs: &[OptimizationRun]) {
    println!("\nOptimization runs:");
    println!(
        "  {:<16} {:<10} {:<22} {:>9} {:>7} {:>12} {:>6}",
        "Strategy", "Status", "Method", "Score", "WR%", "Profit", "Evals"
    );
    println!("  {}", "-".repeat(90));
    for run in runs {
        let method = match (run.search_method, run.fallback_from) {
            (Some(used), Some(from)) => format!("{} (from {})", used, from),
            (Some(used), None) => used.to_string(),
            (None, _) => run.requested_method.to_string(),
        };
        match &run.best_result {
            Some(best) => println!(
                "  {:<16} {:<10} {:<22} {:>9.4} {:>6.1}% {:>+12.2} {:>6}",
                run.strategy_id,
                run.status,
                method,
                best.score,
                best.win_rate * 100.0,
                best.profit,
                run.evaluations,
            ),
            None => println!(
                "  {:<16} {:<10} {:<22} {}",
                run.strategy_id,
                run.status,
                method,
                run.error_reason.as_deref().unwrap_or("no result"),
            ),
        }
        if let Some(best) = &run.best_result {
            let params: Vec<String> = best
                .params
                .values()
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect();
            println!("  {:<16} {}", "", params.join(" "));
        }
    }
}

// ============================================================================
// Best command
// ============================================================================

async fn cmd_best(strategy: Option<String>, recent_runs: i64) -> anyhow::Result<()> {
    let db = open_database().await?;
    let strategies = match strategy {
        Some(id) => vec![id],
        None => ResultRepository::new(db.pool()).list_strategies().await?,
    };
    if strategies.is_empty() {
        println!("\nNo optimization results stored yet.");
        return Ok(());
    }

    let store = SqliteResultStore::new(db.clone());
    for strategy_id in &strategies {
        let Some(best) = store.load_best(strategy_id).await? else {
            println!("\n{}: no results", strategy_id);
            continue;
        };
        let saved = store.history(strategy_id).await?.len();
        println!(
            "\n{} — score {:.4} | WR {:.1}% | profit {:+.2} | DD {:.1}% | {} trades | {} ({} results stored)",
            strategy_id,
            best.score,
            best.win_rate * 100.0,
            best.profit,
            best.max_drawdown * 100.0,
            best.trades_count,
            best.search_method
                .map_or_else(|| "unknown".to_string(), |m| m.to_string()),
            saved,
        );
        println!("  found {}", best.timestamp.format("%Y-%m-%d %H:%M:%S UTC"));
        for (name, value) in best.params.values() {
            println!("  {:<24} {}", name, value);
        }

        if recent_runs > 0 {
            let runs = RunRepository::new(db.pool())
                .get_recent(strategy_id, recent_runs)
                .await?;
            println!("  Recent runs:");
            for run in runs {
                let started = Utc
                    .timestamp_millis_opt(run.start_time_ms)
                    .single()
                    .map_or_else(|| "?".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string());
                println!(
                    "    {} {:<10} {:<22} evals {:>4} {}",
                    started,
                    run.status,
                    run.search_method.as_deref().unwrap_or(&run.requested_method),
                    run.evaluations,
                    run.error_reason.as_deref().unwrap_or(""),
                );
            }
        }
    }
    Ok(())
}

// ============================================================================
// Watch command
// ============================================================================

async fn cmd_watch(
    config: OptimizerConfig,
    dataset: HistoricalDataset,
    method: MethodRequest,
) -> anyhow::Result<()> {
    println!("\n=== Hyperopt v{} — watch ===", APP_VERSION);
    println!(
        "Staleness: {} days | Check every {}s | Method: {}",
        config.orchestrator.staleness_days, config.orchestrator.check_interval_secs, method
    );
    println!("Press Ctrl+C to stop\n");

    let orchestrator = build_orchestrator(config, dataset).await?;
    let scheduler = Arc::new(ReoptimizationScheduler::new(orchestrator.clone()).with_method(method));
    let shutdown = Arc::new(AtomicBool::new(false));
    let handle = scheduler.spawn(shutdown.clone());

    tokio::signal::ctrl_c().await.ok();
    info!("Ctrl+C received, stopping scheduler...");
    shutdown.store(true, Ordering::Relaxed);
    for strategy_id in orchestrator.active_runs() {
        orchestrator.cancel(&strategy_id);
    }
    handle.await?;
    Ok(())
}

// ============================================================================
// Spaces command
// ============================================================================

fn cmd_spaces() -> anyhow::Result<()> {
    for strategy in BuiltinStrategy::ALL {
        println!("\n{}", strategy.id());
        for spec in strategy.specs()? {
            let kind = match spec.kind() {
                ParamKind::Integer => "int",
                ParamKind::Real => "real",
            };
            println!(
                "  {:<24} {:<5} [{}, {}]",
                spec.name(),
                kind,
                spec.lower(),
                spec.upper()
            );
        }
    }
    Ok(())
}

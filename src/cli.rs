//! CLI definition and dispatch.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing::Level;

use crate::adapters::csv_bar_adapter::CsvBarAdapter;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::adapters::json_report_adapter::JsonReportAdapter;
use crate::adapters::json_store_adapter::JsonStoreAdapter;
use crate::adapters::sqlite_ledger_adapter::SqliteLedgerAdapter;
use crate::domain::audit::AuditLog;
use crate::domain::backtest::{self, BacktestConfig};
use crate::domain::engine::{EngineConfig, StopFlag, TradingEngine};
use crate::domain::error::TradeloopError;
use crate::domain::lock::EngineLock;
use crate::domain::safety::SafetyPolicy;
use crate::domain::sim_broker::HistoricalBroker;
use crate::ports::clock_port::SystemClock;
use crate::ports::config_port::ConfigPort;
use crate::ports::data_port::BarDataPort;
use crate::ports::report_port::ReportPort;
use crate::ports::store_port::StrategyStorePort;

#[derive(Parser, Debug)]
#[command(name = "tradeloop", about = "Strategy evaluation engine and backtester")]
pub struct Cli {
    /// Log verbosity level
    #[arg(short, long, default_value = "info")]
    pub verbosity: Level,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the evaluation engine over a bar replay (paper trading)
    Run {
        #[arg(short, long)]
        config: PathBuf,
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
        /// Evaluate and log without routing orders
        #[arg(long)]
        dry_run: bool,
        /// Break a stale engine lock before starting
        #[arg(long)]
        force: bool,
    },
    /// Run a backtest for one stored strategy
    Backtest {
        #[arg(short, long)]
        config: PathBuf,
        /// Strategy id from the store
        #[arg(short, long)]
        strategy: String,
        /// Results directory override
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate the strategy store
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Info,
}

pub fn run(cli: Cli) -> ExitCode {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    match cli.command {
        Command::Run {
            config,
            once,
            dry_run,
            force,
        } => run_engine(&config, once, dry_run, force),
        Command::Backtest {
            config,
            strategy,
            output,
        } => run_backtest(&config, &strategy, output.as_deref()),
        Command::Validate { config } => run_validate(&config),
        Command::Info => run_info(),
    }
}

fn fail(err: &TradeloopError) -> ExitCode {
    eprintln!("error [{}]: {err}", err.code());
    err.into()
}

fn load_config(path: &Path) -> Result<FileConfigAdapter, TradeloopError> {
    FileConfigAdapter::from_file(path).map_err(|e| TradeloopError::ConfigParse {
        file: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn config_dir(config: &FileConfigAdapter, config_path: &Path) -> PathBuf {
    config.get_path("engine", "config_dir").unwrap_or_else(|| {
        config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    })
}

fn policy_from_config(config: &dyn ConfigPort) -> SafetyPolicy {
    let defaults = SafetyPolicy::default();
    SafetyPolicy {
        max_position_notional: config.get_double(
            "safety",
            "max_position_notional",
            defaults.max_position_notional,
        ),
        max_position_qty: config.get_int(
            "safety",
            "max_position_qty",
            i64::from(defaults.max_position_qty),
        ) as u32,
        daily_loss_limit: config.get_double(
            "safety",
            "daily_loss_limit",
            defaults.daily_loss_limit,
        ),
        max_daily_trades: config.get_int(
            "safety",
            "max_daily_trades",
            i64::from(defaults.max_daily_trades),
        ) as u32,
        allow_production: config.get_bool("safety", "allow_production", defaults.allow_production),
        duplicate_window_seconds: config.get_int(
            "safety",
            "duplicate_window_seconds",
            defaults.duplicate_window_seconds,
        ),
    }
}

fn parse_ini_date(
    config: &dyn ConfigPort,
    key: &str,
    end_of_day: bool,
) -> Result<Option<DateTime<Utc>>, TradeloopError> {
    let Some(raw) = config.get_string("backtest", key) else {
        return Ok(None);
    };
    let date =
        NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|_| TradeloopError::ConfigInvalid {
            section: "backtest".into(),
            key: key.into(),
            reason: format!("invalid date `{raw}`, expected YYYY-MM-DD"),
        })?;
    let time = if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    Ok(time.map(|t| t.and_utc()))
}

fn build_paper_broker(
    config: &FileConfigAdapter,
    store: &JsonStoreAdapter,
) -> Result<HistoricalBroker, TradeloopError> {
    let broker_type = config
        .get_string("broker", "type")
        .unwrap_or_else(|| "paper".to_string());
    if broker_type != "paper" {
        return Err(TradeloopError::ConfigInvalid {
            section: "broker".into(),
            key: "type".into(),
            reason: format!("unsupported broker type `{broker_type}`; this build ships `paper`"),
        });
    }

    let data_dir = config
        .get_path("data", "dir")
        .ok_or_else(|| TradeloopError::ConfigMissing {
            section: "data".into(),
            key: "dir".into(),
        })?;
    let bars = CsvBarAdapter::new(data_dir);
    let cash = config.get_double("paper", "cash", 100_000.0);

    let mut broker = HistoricalBroker::new(cash);
    let mut symbols: Vec<String> = store
        .load_all()?
        .into_iter()
        .filter(|s| !s.is_terminal())
        .map(|s| s.symbol)
        .collect();
    symbols.sort();
    symbols.dedup();
    for symbol in symbols {
        broker.load_bars(&symbol, bars.fetch_bars(&symbol, None, None)?);
    }
    Ok(broker)
}

fn run_engine(config_path: &Path, once: bool, dry_run: bool, force: bool) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => return fail(&e),
    };
    let dir = config_dir(&config, config_path);

    if force {
        if let Err(e) = EngineLock::force_break(&dir) {
            return fail(&e);
        }
    }

    let store = JsonStoreAdapter::new(&dir);
    let broker = match build_paper_broker(&config, &store) {
        Ok(broker) => broker,
        Err(e) => return fail(&e),
    };

    let ledger_path = config
        .get_path("ledger", "path")
        .unwrap_or_else(|| dir.join("ledger.db"));
    let ledger = match SqliteLedgerAdapter::from_path(&ledger_path, 2) {
        Ok(ledger) => ledger,
        Err(e) => return fail(&e),
    };

    let audit_dir = config
        .get_path("audit", "dir")
        .unwrap_or_else(|| dir.join("audit"));
    let max_file_bytes = config.get_int("audit", "max_file_bytes", 10 * 1024 * 1024) as u64;
    let audit = AuditLog::new(audit_dir, "engine", max_file_bytes);

    let engine_config = EngineConfig {
        poll_interval: Duration::from_secs(
            config.get_int("engine", "poll_interval_secs", 60).max(1) as u64,
        ),
        dry_run,
        production: false,
        config_dir: dir,
        ..EngineConfig::default()
    };

    let mut engine = TradingEngine::new(
        broker,
        Box::new(store),
        Box::new(ledger),
        audit,
        Box::new(SystemClock),
        policy_from_config(&config),
        engine_config,
    );

    if once {
        return match engine.run_cycle() {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => fail(&e),
        };
    }

    install_interrupt_handler(engine.stop_flag());
    match engine.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => fail(&e),
    }
}

/// Translate Ctrl-C / SIGTERM into the engine's cooperative stop flag; the
/// current cycle completes before shutdown.
fn install_interrupt_handler(stop: StopFlag) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::error!(error = %e, "signal handler unavailable");
                return;
            }
        };
        runtime.block_on(async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = match signal(SignalKind::terminate()) {
                    Ok(sigterm) => sigterm,
                    Err(_) => return,
                };
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }
        });
        tracing::info!("interrupt received, stopping after current cycle");
        stop.trigger();
    });
}

fn run_backtest(config_path: &Path, strategy_id: &str, output: Option<&Path>) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => return fail(&e),
    };
    let dir = config_dir(&config, config_path);
    let store = JsonStoreAdapter::new(&dir);

    let strategy = match store.load(strategy_id) {
        Ok(strategy) => strategy,
        Err(e) => return fail(&e),
    };

    let data_dir = match config.get_path("data", "dir") {
        Some(data_dir) => data_dir,
        None => {
            return fail(&TradeloopError::ConfigMissing {
                section: "data".into(),
                key: "dir".into(),
            })
        }
    };

    let backtest_config = BacktestConfig {
        initial_cash: config.get_double("backtest", "initial_cash", 100_000.0),
        start: match parse_ini_date(&config, "start_date", false) {
            Ok(start) => start,
            Err(e) => return fail(&e),
        },
        end: match parse_ini_date(&config, "end_date", true) {
            Ok(end) => end,
            Err(e) => return fail(&e),
        },
        policy: SafetyPolicy::unrestricted(),
    };

    let bars = match CsvBarAdapter::new(data_dir).fetch_bars(
        &strategy.symbol,
        backtest_config.start,
        backtest_config.end,
    ) {
        Ok(bars) => bars,
        Err(e) => return fail(&e),
    };

    let result = match backtest::run_backtest(&strategy, &bars, &backtest_config, &StopFlag::new())
    {
        Ok(result) => result,
        Err(e) => return fail(&e),
    };

    let results_dir = output
        .map(Path::to_path_buf)
        .or_else(|| config.get_path("results", "dir"))
        .unwrap_or_else(|| dir.join("backtests"));
    let report = JsonReportAdapter::new(results_dir);
    let location = match report.write(&result) {
        Ok(location) => location,
        Err(e) => return fail(&e),
    };

    eprintln!(
        "backtest {}: {} bars, {} trades, return {:.2} ({:.2}%), max drawdown {:.2}",
        result.id,
        result.equity_curve.len(),
        result.metrics.total_trades,
        result.metrics.total_return,
        result.metrics.total_return_pct,
        result.metrics.max_drawdown,
    );
    eprintln!("written to {location}");
    ExitCode::SUCCESS
}

fn run_validate(config_path: &Path) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => return fail(&e),
    };
    let dir = config_dir(&config, config_path);
    let store = JsonStoreAdapter::new(&dir);

    let strategies = match store.load_all() {
        Ok(strategies) => strategies,
        Err(e) => return fail(&e),
    };

    let mut failures = 0usize;
    for strategy in &strategies {
        match strategy.validate() {
            Ok(()) => eprintln!("{}: ok ({})", strategy.id, strategy.params.name()),
            Err(e) => {
                failures += 1;
                eprintln!("{}: {e}", strategy.id);
            }
        }
    }
    eprintln!(
        "{} strategies, {} invalid",
        strategies.len(),
        failures
    );
    if failures > 0 {
        return fail(&TradeloopError::Validation {
            reason: format!("{failures} invalid strategies"),
        });
    }
    ExitCode::SUCCESS
}

fn run_info() -> ExitCode {
    eprintln!("tradeloop {}", env!("CARGO_PKG_VERSION"));
    eprintln!("Strategy evaluation engine and bar-replay backtester");
    ExitCode::SUCCESS
}

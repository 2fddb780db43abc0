//! CLI definition and dispatch.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use crate::adapters::csv_adapter::CsvAdapter;
use crate::adapters::file_cache_adapter::FileCacheAdapter;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::domain::backtest::{BacktestEngine, BacktestResult};
use crate::domain::cache::ArtifactCache;
use crate::domain::config_validation::{
    build_backtest_config, build_cache_settings, build_data_settings, build_membership,
    build_preselection, build_strategy, validate_config,
};
use crate::domain::error::FactorsimError;
use crate::domain::portfolio::{EquityPoint, RebalanceEvent};
use crate::ports::config_port::ConfigPort;
use crate::ports::data_port::DataPort;

#[derive(Parser, Debug)]
#[command(name = "factorsim", about = "Point-in-time factor portfolio backtester")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a backtest
    Backtest {
        #[arg(short, long)]
        config: PathBuf,
        /// Write the equity curve as CSV
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Write the rebalance ledger as CSV
        #[arg(long)]
        ledger: Option<PathBuf>,
        /// Ignore the [cache] section for this run
        #[arg(long)]
        no_cache: bool,
    },
    /// Validate a configuration file
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// List assets available in the data directory
    ListSymbols {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Delete every cached artifact
    ClearCache {
        #[arg(short, long)]
        config: PathBuf,
    },
}

pub fn run(cli: Cli) -> ExitCode {
    let result = match cli.command {
        Command::Backtest {
            config,
            output,
            ledger,
            no_cache,
        } => run_backtest(&config, output.as_deref(), ledger.as_deref(), !no_cache),
        Command::Validate { config } => run_validate(&config),
        Command::ListSymbols { config } => run_list_symbols(&config),
        Command::ClearCache { config } => run_clear_cache(&config),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            (&e).into()
        }
    }
}

pub fn load_config(path: &Path) -> Result<FileConfigAdapter, FactorsimError> {
    FileConfigAdapter::from_file(path)
}

/// Build the engine from configuration and run it against `data_port`.
pub fn run_backtest_pipeline(
    config: &dyn ConfigPort,
    data_port: &dyn DataPort,
    use_cache: bool,
) -> Result<BacktestResult, FactorsimError> {
    let bt_config = build_backtest_config(config)?;
    let data = build_data_settings(config)?;

    let codes = match data.codes {
        Some(codes) => codes,
        None => data_port.list_symbols()?,
    };
    if codes.is_empty() {
        return Err(FactorsimError::Data {
            reason: format!("no assets found in {}", data.dir.display()),
        });
    }

    eprintln!(
        "Running backtest: {} assets, {} to {}",
        codes.len(),
        bt_config.start_date,
        bt_config.end_date
    );
    let prices = data_port.fetch_prices(&codes, data.history_start, bt_config.end_date)?;
    eprintln!("  Processing: {} dates", prices.len());

    let mut engine = BacktestEngine::new(bt_config, prices, build_strategy(config)?)?;
    if let Some(presel) = build_preselection(config)? {
        engine = engine.with_preselection(presel)?;
    }
    if let Some(policy) = build_membership(config)? {
        engine = engine.with_membership(policy)?;
    }
    if use_cache {
        if let Some(settings) = build_cache_settings(config)? {
            eprintln!("  Cache: {}", settings.dir.display());
            let store = FileCacheAdapter::new(settings.dir);
            engine = engine.with_cache(ArtifactCache::new(Box::new(store), settings.max_age));
        }
    }
    engine.run()
}

fn run_backtest(
    config_path: &Path,
    output: Option<&Path>,
    ledger: Option<&Path>,
    use_cache: bool,
) -> Result<(), FactorsimError> {
    eprintln!("Loading config from {}", config_path.display());
    let adapter = load_config(config_path)?;
    validate_config(&adapter)?;
    let data = build_data_settings(&adapter)?;
    let data_port = CsvAdapter::new(data.dir);

    let result = run_backtest_pipeline(&adapter, &data_port, use_cache)?;
    print_summary(&result);

    if let Some(path) = output {
        write_equity_curve(path, &result.equity_curve)?;
        eprintln!("\nEquity curve written to: {}", path.display());
    }
    if let Some(path) = ledger {
        write_ledger(path, &result.rebalances)?;
        eprintln!("Rebalance ledger written to: {}", path.display());
    }
    Ok(())
}

fn print_summary(result: &BacktestResult) {
    let m = &result.metrics;
    eprintln!("\n=== Results ===");
    eprintln!("Final Value:      {:.2}", m.final_value);
    eprintln!("Total Return:     {:.2}%", m.total_return * 100.0);
    eprintln!("Annualized:       {:.2}%", m.annualized_return * 100.0);
    eprintln!("Volatility:       {:.2}%", m.annualized_volatility * 100.0);
    eprintln!("Sharpe Ratio:     {:.2}", m.sharpe_ratio);
    eprintln!("Sortino Ratio:    {:.2}", m.sortino_ratio);
    eprintln!(
        "Max Drawdown:     -{:.1}% ({} days)",
        m.max_drawdown * 100.0,
        m.max_drawdown_duration
    );
    eprintln!("Calmar Ratio:     {:.2}", m.calmar_ratio);
    eprintln!("Rebalances:       {}", m.num_rebalances);
    eprintln!("Total Costs:      {:.2}", m.total_costs_f64());
    eprintln!("Avg Turnover:     {:.1}%", m.avg_turnover * 100.0);

    if !result.final_state.holdings.is_empty() {
        eprintln!("\n=== Final Holdings ===");
        for (asset, shares) in &result.final_state.holdings {
            eprintln!("  {asset}: {shares}");
        }
    }
}

fn csv_error(path: &Path, e: impl std::fmt::Display) -> FactorsimError {
    FactorsimError::Data {
        reason: format!("failed to write {}: {}", path.display(), e),
    }
}

pub fn write_equity_curve(path: &Path, curve: &[EquityPoint]) -> Result<(), FactorsimError> {
    let mut wtr = csv::Writer::from_path(path).map_err(|e| csv_error(path, e))?;
    wtr.write_record(["date", "equity"])
        .map_err(|e| csv_error(path, e))?;
    for point in curve {
        wtr.write_record([point.date.to_string(), format!("{:.2}", point.equity)])
            .map_err(|e| csv_error(path, e))?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_ledger(path: &Path, events: &[RebalanceEvent]) -> Result<(), FactorsimError> {
    let mut wtr = csv::Writer::from_path(path).map_err(|e| csv_error(path, e))?;
    wtr.write_record([
        "date",
        "trigger",
        "asset",
        "shares",
        "total_cost",
        "value_before",
        "value_after",
        "cash_before",
        "cash_after",
        "turnover",
    ])
    .map_err(|e| csv_error(path, e))?;
    for event in events {
        for (asset, shares) in &event.trades {
            wtr.write_record([
                event.date.to_string(),
                event.trigger.to_string(),
                asset.clone(),
                shares.to_string(),
                event.total_cost.round_dp(2).to_string(),
                format!("{:.2}", event.value_before),
                format!("{:.2}", event.value_after),
                event.cash_before.round_dp(2).to_string(),
                event.cash_after.round_dp(2).to_string(),
                format!("{:.4}", event.turnover),
            ])
            .map_err(|e| csv_error(path, e))?;
        }
    }
    wtr.flush()?;
    Ok(())
}

fn run_validate(config_path: &Path) -> Result<(), FactorsimError> {
    let adapter = load_config(config_path)?;
    validate_config(&adapter)?;
    eprintln!("Configuration is valid: {}", config_path.display());
    Ok(())
}

fn run_list_symbols(config_path: &Path) -> Result<(), FactorsimError> {
    let adapter = load_config(config_path)?;
    let data = build_data_settings(&adapter)?;
    let symbols = CsvAdapter::new(data.dir).list_symbols()?;
    if symbols.is_empty() {
        eprintln!("No symbols found");
    }
    for symbol in symbols {
        println!("{symbol}");
    }
    Ok(())
}

fn run_clear_cache(config_path: &Path) -> Result<(), FactorsimError> {
    let adapter = load_config(config_path)?;
    let Some(settings) = build_cache_settings(&adapter)? else {
        eprintln!("Cache is not enabled");
        return Ok(());
    };
    let cache = ArtifactCache::new(Box::new(FileCacheAdapter::new(&settings.dir)), None);
    let removed = cache.clear();
    eprintln!("Removed {removed} cache entries from {}", settings.dir.display());
    Ok(())
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveTime};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use strategy_engine::{
    load_universe, BacktestConfig, BacktestResult, DataProvider, Diagnostic, EngineSettings,
    InMemoryProvider, JsonFileRepository, JsonLinesNotifier, LogNotifier, MarketService,
    ScanResult, SignalNotifier, StrategyRegistry, SyntheticUniverse,
};

#[derive(Parser, Debug)]
#[command(name = "strategy-engine")]
#[command(version = "0.1.0")]
#[command(about = "Sector market scanner and strategy backtest engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON settings file (analysis, backtest, retry sections)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    data: DataArgs,

    /// Output format (json, text)
    #[arg(short, long, default_value = "json", global = true)]
    output: String,

    /// Pretty print JSON output
    #[arg(long, global = true)]
    pretty: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log format (pretty, json)
    #[arg(long, default_value = "pretty", global = true)]
    log_format: String,
}

#[derive(Args, Debug)]
struct DataArgs {
    /// Directory laid out as <sector>/<symbol>.csv|json. Synthetic data when absent.
    #[arg(short = 'd', long, global = true)]
    data_dir: Option<PathBuf>,

    /// Symbols generated per sector (synthetic data)
    #[arg(long, default_value = "10", global = true)]
    symbols_per_sector: usize,

    /// Trading days generated per symbol (synthetic data)
    #[arg(long, default_value = "250", global = true)]
    days: usize,

    /// First generated trading day (synthetic data)
    #[arg(long, default_value = "2024-01-01", global = true)]
    data_start: NaiveDate,

    /// Seed for synthetic data
    #[arg(long, default_value = "7", global = true)]
    seed: u64,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan sectors for current trading signals
    Scan(ScanArgs),
    /// Replay strategies over a date range
    Backtest(BacktestArgs),
}

#[derive(Args, Debug)]
struct StrategyArgs {
    /// Sector codes, comma separated
    #[arg(short, long, value_delimiter = ',')]
    sectors: Vec<String>,

    /// Strategies to run, comma separated (momentum, volume, sentiment, t_plus_one)
    #[arg(long)]
    strategies: Option<String>,

    /// Minimum signal confidence (0-100]
    #[arg(short, long)]
    threshold: Option<f64>,

    /// Largest fraction of cash per entry (0-1]
    #[arg(long)]
    max_position: Option<f64>,
}

#[derive(Args, Debug)]
struct ScanArgs {
    #[command(flatten)]
    strategy: StrategyArgs,

    /// Scanner worker threads
    #[arg(short, long)]
    workers: Option<usize>,

    /// Work items per batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Evaluate as of this date's close instead of now
    #[arg(long)]
    as_of: Option<NaiveDate>,

    /// Append signals as JSON lines to this file
    #[arg(long)]
    notify_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct BacktestArgs {
    #[command(flatten)]
    strategy: StrategyArgs,

    /// First day of the backtest (defaults to the first day with data)
    #[arg(long)]
    start: Option<NaiveDate>,

    /// Last day of the backtest (defaults to the last day with data)
    #[arg(long)]
    end: Option<NaiveDate>,

    /// Initial capital
    #[arg(short, long)]
    capital: Option<f64>,

    /// Flat cost per closed trade
    #[arg(long)]
    cost: Option<f64>,

    /// A-share costs: 100-share lots, 0.03% commission, 0.1% stamp tax
    #[arg(long)]
    a_share: bool,

    /// Commission as a fraction of traded value, both ways
    #[arg(long)]
    commission_rate: Option<f64>,

    /// Stamp tax as a fraction of sale value
    #[arg(long)]
    stamp_tax_rate: Option<f64>,

    /// Share quantities round down to multiples of this
    #[arg(long)]
    lot_size: Option<f64>,

    /// Annual risk-free rate for the Sharpe ratio
    #[arg(long)]
    risk_free_rate: Option<f64>,

    /// Consecutive days without data before a data-quality warning
    #[arg(long)]
    max_gap_days: Option<usize>,

    /// Save the final portfolio as JSON under this directory
    #[arg(long)]
    save_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, &cli.log_format);

    let mut settings = match &cli.config {
        Some(path) => EngineSettings::load_json(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => EngineSettings::default(),
    }
    .with_env_overrides()?;

    let strategy_args = match &cli.command {
        Command::Scan(args) => &args.strategy,
        Command::Backtest(args) => &args.strategy,
    };
    apply_strategy_args(&mut settings, strategy_args);
    let registry = match &strategy_args.strategies {
        Some(names) => StrategyRegistry::from_names(names)?,
        None => StrategyRegistry::all(),
    };

    match &cli.command {
        Command::Scan(args) => {
            if let Some(workers) = args.workers {
                settings.analysis.max_concurrent_workers = workers;
            }
            if let Some(batch_size) = args.batch_size {
                settings.analysis.batch_size = batch_size;
            }
        }
        Command::Backtest(args) => {
            settings.backtest = apply_backtest_args(settings.backtest, args);
        }
    }
    settings.validate()?;

    let provider = Arc::new(load_provider(&cli.data, &settings.analysis.sectors)?);

    match &cli.command {
        Command::Scan(args) => {
            let notifier: Arc<dyn SignalNotifier> = match &args.notify_file {
                Some(path) => Arc::new(JsonLinesNotifier::new(path)?),
                None => Arc::new(LogNotifier),
            };
            let mut service = MarketService::new(provider, registry, settings.retry.clone())
                .with_notifier(notifier);
            if let Some(day) = args.as_of {
                let as_of = day
                    .and_time(NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN))
                    .and_utc();
                service = service.with_scan_as_of(as_of);
            }

            let result = service.scan_market(&settings.analysis.sectors, &settings.analysis)?;
            match cli.output.as_str() {
                "text" => print_scan_report(&result),
                _ => print_json(&result, cli.pretty)?,
            }
        }
        Command::Backtest(args) => {
            let Some((first, last)) = provider.available_range() else {
                bail!("no market data available");
            };
            let start = args.start.unwrap_or(first);
            let end = args.end.unwrap_or(last);

            let mut service = MarketService::new(provider, registry, settings.retry.clone());
            if let Some(dir) = &args.save_dir {
                service = service.with_repository(Arc::new(JsonFileRepository::new(dir)?));
            }

            info!(%start, %end, "Running backtest");
            let result = service.run_backtest(start, end, &settings)?;
            match cli.output.as_str() {
                "text" => print_backtest_report(&result),
                _ => print_json(&result, cli.pretty)?,
            }
        }
    }

    Ok(())
}

fn apply_strategy_args(settings: &mut EngineSettings, args: &StrategyArgs) {
    if !args.sectors.is_empty() {
        settings.analysis.sectors = args.sectors.clone();
    }
    if let Some(threshold) = args.threshold {
        settings.analysis.confidence_threshold = threshold;
    }
    if let Some(max_position) = args.max_position {
        settings.analysis.max_position_size = max_position;
    }
}

fn apply_backtest_args(mut config: BacktestConfig, args: &BacktestArgs) -> BacktestConfig {
    if args.a_share {
        let preset = BacktestConfig::a_share();
        config = config
            .with_lot_size(preset.lot_size)
            .with_commission_rate(preset.commission_rate)
            .with_stamp_tax_rate(preset.stamp_tax_rate);
    }
    if let Some(capital) = args.capital {
        config = config.with_capital(capital);
    }
    if let Some(cost) = args.cost {
        config = config.with_transaction_cost(cost);
    }
    if let Some(rate) = args.commission_rate {
        config = config.with_commission_rate(rate);
    }
    if let Some(rate) = args.stamp_tax_rate {
        config = config.with_stamp_tax_rate(rate);
    }
    if let Some(lot_size) = args.lot_size {
        config = config.with_lot_size(lot_size);
    }
    if let Some(rate) = args.risk_free_rate {
        config = config.with_risk_free_rate(rate);
    }
    if let Some(days) = args.max_gap_days {
        config = config.with_max_gap_days(days);
    }
    config
}

fn load_provider(args: &DataArgs, sectors: &[String]) -> Result<InMemoryProvider> {
    match &args.data_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "Loading market data");
            Ok(load_universe(dir)?)
        }
        None => {
            info!(
                sectors = ?sectors,
                symbols_per_sector = args.symbols_per_sector,
                days = args.days,
                seed = args.seed,
                "Generating synthetic market data"
            );
            Ok(
                SyntheticUniverse::new(sectors.to_vec(), args.data_start, args.days)
                    .with_symbols_per_sector(args.symbols_per_sector)
                    .with_seed(args.seed)
                    .build(),
            )
        }
    }
}

fn init_logging(log_level: &str, log_format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let subscriber = tracing_subscriber::registry().with(filter);

    // Reports go to stdout, logs to stderr
    if log_format == "json" {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_current_span(true);
        let _ = subscriber.with(fmt_layer).try_init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false);
        let _ = subscriber.with(fmt_layer).try_init();
    }
}

fn print_json<T: serde::Serialize>(value: &T, pretty: bool) -> Result<()> {
    let json = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", json);
    Ok(())
}

fn print_scan_report(result: &ScanResult) {
    println!();
    println!("================================================================");
    println!("  MARKET SCAN");
    println!("================================================================");
    println!();
    println!("  Items evaluated:  {:>8}", result.items_evaluated);
    println!("  Signals:          {:>8}", result.signals.len());
    if result.cancelled {
        println!("  (scan cancelled, partial result)");
    }
    println!();
    println!("----------------------------------------------------------------");
    for signal in &result.signals {
        println!(
            "  {:<12} {:<6} {:>6.1}  {:<11} ${:>9.2}  size {:>5.1}%  {}",
            signal.symbol,
            format!("{:?}", signal.direction).to_uppercase(),
            signal.confidence,
            signal.strategy,
            signal.price,
            signal.position_size * 100.0,
            signal.reason
        );
    }
    print_diagnostics(&result.diagnostics);
    println!("================================================================");
}

fn print_backtest_report(result: &BacktestResult) {
    let m = &result.metrics;

    println!();
    println!("================================================================");
    println!("  BACKTEST REPORT");
    println!("================================================================");
    println!();
    println!("  Period: {} to {}", result.start_date, result.end_date);
    println!("  Duration: {} trading days", result.equity_curve.len());
    println!("  Execution Time: {}ms", result.execution_time_ms);
    if result.cancelled {
        println!("  (backtest cancelled, partial result)");
    }
    println!();
    println!("----------------------------------------------------------------");
    println!("  CAPITAL");
    println!("----------------------------------------------------------------");
    println!("  Initial Capital:  ${:>12.2}", result.initial_capital);
    println!("  Final Equity:     ${:>12.2}", result.final_equity);
    println!("  Total Return:     {:>12.2}%", m.total_return * 100.0);
    println!();
    println!("----------------------------------------------------------------");
    println!("  RISK METRICS");
    println!("----------------------------------------------------------------");
    println!("  Volatility (Ann): {:>12.2}%", m.annualized_volatility * 100.0);
    println!("  Sharpe Ratio:     {:>12.3}", m.sharpe_ratio);
    println!("  Sortino Ratio:    {:>12.3}", m.sortino_ratio);
    println!("  Max Drawdown:     {:>12.2}%", m.max_drawdown * 100.0);
    println!("  Calmar Ratio:     {:>12.3}", m.calmar_ratio);
    println!();
    println!("----------------------------------------------------------------");
    println!("  TRADE STATISTICS");
    println!("----------------------------------------------------------------");
    println!("  Signals Applied:  {:>12}", result.total_signals);
    println!("  Rejected:         {:>12}", result.rejected_signals);
    println!("  Total Trades:     {:>12}", m.trade_count);
    println!("  Winning Trades:   {:>12}", m.winning_trades);
    println!("  Losing Trades:    {:>12}", m.losing_trades);
    println!("  Win Rate:         {:>12.1}%", m.win_rate * 100.0);
    println!("  Profit Factor:    {:>12.3}", m.profit_factor);
    println!("  Profit/Loss:      {:>12.3}", m.profit_loss_ratio);
    println!("  Recovery Factor:  {:>12.3}", m.recovery_factor);
    println!("  Max Loss Streak:  {:>12}", m.max_consecutive_losses);
    println!("  Avg Holding:      {:>12.1} days", m.avg_holding_days);
    println!("  Best Trade:       ${:>12.2}", m.best_trade);
    println!("  Worst Trade:      ${:>12.2}", m.worst_trade);
    if let Some(id) = &result.portfolio_id {
        println!("  Saved Portfolio:  {:>12}", id);
    }
    println!();

    if !result.trades.is_empty() {
        println!("  RECENT TRADES (last 5)");
        println!("----------------------------------------------------------------");
        for trade in result.trades.iter().rev().take(5) {
            println!(
                "  {:<10} {} -> {} | P&L: ${:+.2} ({:+.1}%) | {} days",
                trade.symbol,
                trade.entry_date.format("%Y-%m-%d"),
                trade.exit_date.format("%Y-%m-%d"),
                trade.pnl,
                trade.pnl_pct,
                trade.holding_days
            );
        }
        println!();
    }

    print_diagnostics(&result.diagnostics);
    println!("================================================================");
}

fn print_diagnostics(diagnostics: &[Diagnostic]) {
    if diagnostics.is_empty() {
        return;
    }
    println!("----------------------------------------------------------------");
    println!("  DIAGNOSTICS ({})", diagnostics.len());
    println!("----------------------------------------------------------------");
    for diagnostic in diagnostics.iter().take(20) {
        println!("  {}", diagnostic);
    }
    if diagnostics.len() > 20 {
        println!("  ... {} more", diagnostics.len() - 20);
    }
    println!();
}

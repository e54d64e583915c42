//! Command-line interface for the rolling backtest engine.

use stagger::analytics::{AnalysisConfig, PerformanceAnalyzer, PerformanceReport, ResultFormatter};
use stagger::config::BacktestFileConfig;
use stagger::data::{
    load_benchmark, load_price_table, load_rank_matrix, load_tradability_mask, load_trading_days,
    load_weight_matrix, DataConfig,
};
use stagger::engine::{BacktestConfig, BacktestResult, RollingBacktestEngine};
use stagger::error::{BacktestError, Result};
use stagger::export::{export_weight_matrix_csv, ExportConfig, Exporter};
use stagger::metadata::{track_inputs, DataFileMetadata};
use stagger::portfolio::CostModel;
use stagger::selection::{select_top_n, TradabilityMask};
use stagger::types::{
    BenchmarkKind, BenchmarkSeries, PriceField, PriceTable, TradingCalendar, WeightMatrix,
};

use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Stagger - staggered rolling rebalance backtester.
#[derive(Parser)]
#[command(name = "stagger")]
#[command(version)]
#[command(about = "Backtest target-weight schedules with staggered sub-portfolios")]
#[command(long_about = None)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text", global = true)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a backtest from explicit input files
    Run {
        /// Wide weight matrix CSV (date x instrument)
        #[arg(short, long)]
        weights: PathBuf,

        /// Long VWAP CSV (order_book_id, datetime, unadjusted_vwap, post_vwap)
        #[arg(short, long)]
        prices: PathBuf,

        /// Benchmark CSV (datetime, value), required for an index benchmark
        #[arg(short, long)]
        benchmark: Option<PathBuf>,

        /// Index file or equal-weight average of the traded universe
        #[arg(long, value_enum, default_value = "index")]
        benchmark_type: BenchmarkKindArg,

        /// Wide tradability mask CSV applied to the equal-weight benchmark
        #[arg(short, long)]
        mask: Option<PathBuf>,

        /// Trading-day calendar CSV
        #[arg(short, long)]
        trading_days: Option<PathBuf>,

        /// Initial capital
        #[arg(short, long, default_value = "10000000")]
        capital: f64,

        /// Number of staggered sub-portfolios
        #[arg(short = 'n', long, default_value = "5")]
        portfolios: usize,

        /// Trading days between rebalances of one sub-portfolio
        #[arg(short, long, default_value = "5")]
        frequency: usize,

        /// VWAP variant for execution and valuation
        #[arg(long, value_enum, default_value = "adjusted")]
        price_field: PriceFieldArg,

        /// Trade whole lots of this size instead of fractional shares
        #[arg(long)]
        lot_size: Option<f64>,

        /// Stamp tax rate on sells
        #[arg(long, default_value = "0.0005")]
        stamp_tax: f64,

        /// Transfer fee rate on both sides
        #[arg(long, default_value = "0.00001")]
        transfer_fee: f64,

        /// Commission rate on buys
        #[arg(long, default_value = "0.0002")]
        commission: f64,

        /// Minimum charge per fee component
        #[arg(long, default_value = "5.0")]
        min_fee: f64,

        /// Annual risk-free rate
        #[arg(long, default_value = "0.03")]
        risk_free: f64,

        /// Benchmark label (defaults to the benchmark column name)
        #[arg(long)]
        benchmark_name: Option<String>,

        /// First simulated date (YYYY-MM-DD)
        #[arg(long)]
        start: Option<NaiveDate>,

        /// Last simulated date (YYYY-MM-DD)
        #[arg(long)]
        end: Option<NaiveDate>,

        /// Directory for CSV/JSON results
        #[arg(long)]
        save_dir: Option<PathBuf>,

        /// File name prefix for saved results
        #[arg(long, default_value = "stagger")]
        prefix: String,

        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// Run a backtest from a configuration file
    RunConfig {
        /// Path to TOML configuration file
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Generate an example configuration file
    Init {
        /// Output path for config file
        #[arg(short = 'f', long, default_value = "stagger.toml")]
        file: PathBuf,
    },

    /// Turn a rank table into an equal-weight weight matrix
    Select {
        /// Long rank CSV (datetime, order_book_id, rank)
        #[arg(short, long)]
        ranks: PathBuf,

        /// Names held per date
        #[arg(short = 'k', long, default_value = "50")]
        rank_n: usize,

        /// Wide tradability mask CSV
        #[arg(short, long)]
        mask: Option<PathBuf>,

        /// Output weight matrix CSV
        #[arg(short = 'w', long)]
        weights: PathBuf,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
    Csv,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum PriceFieldArg {
    /// Post-adjusted VWAP
    Adjusted,
    /// Raw VWAP
    Unadjusted,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum BenchmarkKindArg {
    /// Benchmark index read from --benchmark
    Index,
    /// Equal-weight average of the instruments in the weight matrix
    EqualWeight,
}

impl From<BenchmarkKindArg> for BenchmarkKind {
    fn from(arg: BenchmarkKindArg) -> Self {
        match arg {
            BenchmarkKindArg::Index => BenchmarkKind::Index,
            BenchmarkKindArg::EqualWeight => BenchmarkKind::EqualWeight,
        }
    }
}

impl From<PriceFieldArg> for PriceField {
    fn from(arg: PriceFieldArg) -> Self {
        match arg {
            PriceFieldArg::Adjusted => PriceField::Adjusted,
            PriceFieldArg::Unadjusted => PriceField::Unadjusted,
        }
    }
}

impl Cli {
    /// Initialize logging based on verbosity level.
    pub fn init_logging(&self) {
        let level = match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };

        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .with_writer(std::io::stderr)
            .finish();

        if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
            eprintln!("Failed to set tracing subscriber: {}", e);
        }
    }
}

/// Loaded inputs for one run.
struct RunInputs {
    weights: WeightMatrix,
    prices: PriceTable,
    benchmark: BenchmarkSeries,
    calendar: Option<TradingCalendar>,
    files: Vec<DataFileMetadata>,
}

/// How the benchmark series is obtained.
struct BenchmarkSource {
    kind: BenchmarkKind,
    name: Option<String>,
    field: PriceField,
}

/// Weights generated from a ranking, with the universe and mask behind them.
struct RankedSelection {
    weights: WeightMatrix,
    universe: BTreeSet<String>,
    mask: Option<TradabilityMask>,
}

/// Input file locations for one run.
struct InputPaths {
    weights: PathBuf,
    prices: PathBuf,
    benchmark: Option<PathBuf>,
    trading_days: Option<PathBuf>,
    mask: Option<PathBuf>,
}

impl InputPaths {
    fn load(
        &self,
        data_config: &DataConfig,
        source: &BenchmarkSource,
        selection: Option<RankedSelection>,
    ) -> Result<RunInputs> {
        let (weights, universe, mask) = match selection {
            Some(s) => (s.weights, Some(s.universe), s.mask),
            None => (load_weight_matrix(&self.weights, data_config)?, None, None),
        };
        let prices = load_price_table(&self.prices, data_config)?;

        let mut files: Vec<(&str, &Path)> = vec![
            ("weights", self.weights.as_path()),
            ("prices", self.prices.as_path()),
        ];

        let benchmark = match source.kind {
            BenchmarkKind::Index => {
                let path = self.benchmark.as_ref().ok_or_else(|| {
                    BacktestError::ConfigError("an index benchmark needs a benchmark file".to_string())
                })?;
                files.push(("benchmark", path.as_path()));
                load_benchmark(path, data_config)?
            }
            BenchmarkKind::EqualWeight => {
                let universe = universe.unwrap_or_else(|| weights.instruments());
                let mask = match (mask, &self.mask) {
                    (Some(m), _) => Some(m),
                    (None, Some(path)) => Some(load_tradability_mask(path, data_config)?),
                    (None, None) => None,
                };
                if let Some(path) = &self.mask {
                    files.push(("mask", path.as_path()));
                }
                info!(
                    "Building equal-weight benchmark over {} instruments",
                    universe.len()
                );
                let name = source.name.clone().unwrap_or_else(|| "equal_weight".to_string());
                BenchmarkSeries::equal_weight(name, &prices, &universe, mask.as_ref(), source.field)?
            }
        };

        let calendar = self
            .trading_days
            .as_ref()
            .map(|p| load_trading_days(p, data_config))
            .transpose()?;
        if let Some(p) = &self.trading_days {
            files.push(("trading_days", p.as_path()));
        }

        Ok(RunInputs {
            weights,
            prices,
            benchmark,
            calendar,
            files: track_inputs(files),
        })
    }
}

/// Run the CLI application.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    cli.init_logging();

    match &cli.command {
        Commands::Run {
            weights,
            prices,
            benchmark,
            benchmark_type,
            mask,
            trading_days,
            capital,
            portfolios,
            frequency,
            price_field,
            lot_size,
            stamp_tax,
            transfer_fee,
            commission,
            min_fee,
            risk_free,
            benchmark_name,
            start,
            end,
            save_dir,
            prefix,
            no_progress,
        } => {
            let config = BacktestConfig {
                initial_capital: *capital,
                portfolio_count: *portfolios,
                rebalance_frequency: *frequency,
                cost_model: CostModel {
                    stamp_tax_rate: *stamp_tax,
                    transfer_fee_rate: *transfer_fee,
                    commission_rate: *commission,
                    min_transaction_fee: *min_fee,
                },
                price_field: (*price_field).into(),
                fractional_shares: lot_size.is_none(),
                lot_size: lot_size.unwrap_or(100.0),
                show_progress: !no_progress,
                start_date: *start,
                end_date: *end,
            };
            config.validate()?;

            let paths = InputPaths {
                weights: weights.clone(),
                prices: prices.clone(),
                benchmark: benchmark.clone(),
                trading_days: trading_days.clone(),
                mask: mask.clone(),
            };
            let source = BenchmarkSource {
                kind: (*benchmark_type).into(),
                name: benchmark_name.clone(),
                field: config.price_field,
            };
            let inputs = paths.load(&DataConfig::default(), &source, None)?;
            let analysis = AnalysisConfig {
                risk_free_rate: *risk_free,
                benchmark_name: benchmark_name
                    .clone()
                    .unwrap_or_else(|| inputs.benchmark.name.clone()),
                rebalances_per_year: None,
            };
            let output_dir = save_dir.as_ref().map(|d| (d.clone(), prefix.clone()));
            execute(inputs, config, analysis, output_dir, cli.output)
        }

        Commands::RunConfig { config } => run_from_config(config, cli.output),

        Commands::Init { file } => init_config(file),

        Commands::Select {
            ranks,
            rank_n,
            mask,
            weights,
        } => select_weights(ranks, *rank_n, mask.as_ref(), weights),
    }
}

fn execute(
    inputs: RunInputs,
    config: BacktestConfig,
    analysis: AnalysisConfig,
    output_dir: Option<(PathBuf, String)>,
    output: OutputFormat,
) -> Result<()> {
    let mut engine = RollingBacktestEngine::new(config);
    let mut analyzer = PerformanceAnalyzer::new(analysis);
    if let Some(calendar) = inputs.calendar {
        engine = engine.with_calendar(calendar.clone());
        analyzer = analyzer.with_calendar(calendar);
    }

    let mut result = engine.run(&inputs.weights, &inputs.prices)?;
    result.inputs = inputs.files;
    let report = analyzer.analyze(&result, &inputs.benchmark)?;

    print_output(&result, &report, output);

    if let Some((dir, prefix)) = output_dir {
        let written = Exporter::new(result)
            .with_report(report)
            .export_all(&dir, &prefix)?;
        if output == OutputFormat::Text {
            println!("Saved {} files to {}", written.len(), dir.display());
        }
    }
    Ok(())
}

fn print_output(result: &BacktestResult, report: &PerformanceReport, output: OutputFormat) {
    match output {
        OutputFormat::Text => ResultFormatter::print_report(result, report),
        OutputFormat::Json => println!("{}", ResultFormatter::to_json(report)),
        OutputFormat::Csv => {
            println!("{}", ResultFormatter::csv_header());
            println!("{}", ResultFormatter::to_csv_line(&report.metrics));
        }
    }
}

fn init_config(output: &PathBuf) -> Result<()> {
    use std::fs;

    let example = BacktestFileConfig::example();
    fs::write(output, example)?;
    println!("Created example configuration file: {}", output.display());
    println!("\nEdit this file to point at your inputs, then run:");
    println!("  stagger run-config -c {}", output.display());
    Ok(())
}

fn run_from_config(config_path: &PathBuf, output: OutputFormat) -> Result<()> {
    let file_config = BacktestFileConfig::load(config_path)?;
    let backtest_config = file_config.to_backtest_config()?;
    let data_config = file_config.to_data_config();
    let base = config_path.parent();

    let required = |name: &str, value: &Option<String>| -> Result<PathBuf> {
        value
            .as_deref()
            .map(|p| BacktestFileConfig::resolve(base, p))
            .ok_or_else(|| BacktestError::ConfigError(format!("No [data].{} path in config", name)))
    };

    let mask_path = file_config
        .data
        .mask
        .as_deref()
        .map(|m| BacktestFileConfig::resolve(base, m));

    // Rankings take precedence over a weights file.
    let (weights_path, selection) = match &file_config.data.ranks {
        Some(ranks) => {
            let ranks_path = BacktestFileConfig::resolve(base, ranks);
            let rank_matrix = load_rank_matrix(&ranks_path, &data_config)?;
            let mask = mask_path
                .as_ref()
                .map(|m| load_tradability_mask(m, &data_config))
                .transpose()?;
            let weights = select_top_n(&rank_matrix, file_config.selection.rank_n, mask.as_ref())?;
            let selection = RankedSelection {
                weights,
                universe: rank_matrix.instruments(),
                mask,
            };
            (ranks_path, Some(selection))
        }
        None => (required("weights", &file_config.data.weights)?, None),
    };

    let source = BenchmarkSource {
        kind: file_config.analysis.benchmark_type,
        name: Some(file_config.analysis.benchmark_name.clone()),
        field: backtest_config.price_field,
    };
    let benchmark = match source.kind {
        BenchmarkKind::Index => Some(required("benchmark", &file_config.data.benchmark)?),
        BenchmarkKind::EqualWeight => None,
    };
    let paths = InputPaths {
        weights: weights_path,
        prices: required("prices", &file_config.data.prices)?,
        benchmark,
        trading_days: file_config
            .data
            .trading_days
            .as_deref()
            .map(|p| BacktestFileConfig::resolve(base, p)),
        mask: mask_path,
    };
    let inputs = paths.load(&data_config, &source, selection)?;

    let output_dir = file_config.output.dir.as_deref().map(|d| {
        (
            BacktestFileConfig::resolve(base, d),
            file_config.output.prefix.clone(),
        )
    });

    info!("Running configuration {}", config_path.display());
    execute(
        inputs,
        backtest_config,
        file_config.to_analysis_config(),
        output_dir,
        output,
    )
}

fn select_weights(
    ranks: &PathBuf,
    rank_n: usize,
    mask: Option<&PathBuf>,
    output: &PathBuf,
) -> Result<()> {
    let data_config = DataConfig::default();
    let rank_matrix = load_rank_matrix(ranks, &data_config)?;
    let mask = mask
        .map(|m| load_tradability_mask(m, &data_config))
        .transpose()?;

    let weights = select_top_n(&rank_matrix, rank_n, mask.as_ref())?;
    export_weight_matrix_csv(&weights, output, &ExportConfig::default())?;

    println!(
        "Wrote {} weight rows over {} instruments to {}",
        weights.len(),
        weights.instruments().len(),
        output.display()
    );
    Ok(())
}

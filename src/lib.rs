//! Stagger - a staggered rolling rebalance backtester.
//!
//! # Overview
//!
//! A target-weight schedule is traded by several sub-portfolios that start on
//! evenly spaced trading-day offsets and each rebalance every `frequency`
//! trading days. Their summed value forms the account series, which the
//! analyzer compares against a benchmark.
//!
//! - **Staggered execution**: `count` sub-portfolios, offsets `round(i * freq / count)`
//! - **A-share costs**: stamp tax, transfer fee, and commission with a per-component floor
//! - **Data gaps**: halted or never-priced names are reported, never silently traded
//! - **Benchmark-relative analytics**: alpha/beta, tracking error, information ratio, excess metrics
//! - **Ranked selection**: rank matrix to equal-weight targets with a tradability mask
//! - **Configuration files**: TOML-based configuration for reproducible runs
//!
//! # Quick Start
//!
//! ```no_run
//! use stagger::{
//!     analytics::PerformanceAnalyzer,
//!     data::{load_benchmark, load_price_table, load_weight_matrix, DataConfig},
//!     engine::{BacktestConfig, RollingBacktestEngine},
//! };
//!
//! let data_config = DataConfig::default();
//! let weights = load_weight_matrix("cache/weights.csv", &data_config).unwrap();
//! let prices = load_price_table("cache/vwap.csv", &data_config).unwrap();
//! let benchmark = load_benchmark("cache/benchmark.csv", &data_config).unwrap();
//!
//! let config = BacktestConfig {
//!     portfolio_count: 4,
//!     rebalance_frequency: 8,
//!     ..Default::default()
//! };
//! let result = RollingBacktestEngine::new(config).run(&weights, &prices).unwrap();
//! let report = PerformanceAnalyzer::with_defaults()
//!     .analyze(&result, &benchmark)
//!     .unwrap();
//!
//! println!("Annual return: {:.2}%", report.metrics.annualized_return * 100.0);
//! println!("Information ratio: {:.2}", report.metrics.information_ratio);
//! ```
//!
//! # Modules
//!
//! - [`types`]: Weight matrices, price tables, calendars, account and turnover series
//! - [`schedule`]: Staggered rebalance offsets
//! - [`portfolio`]: Sub-portfolio state, cost model, and rebalance execution
//! - [`engine`]: Rolling rebalance engine
//! - [`analytics`]: Performance metrics and reporting
//! - [`selection`]: Rank matrix to weight matrix
//! - [`data`]: CSV loaders
//! - [`export`]: CSV and JSON result writers
//! - [`config`]: TOML configuration file support
//! - [`metadata`]: Input file sizes and checksums, configuration hashing

pub mod analytics;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod export;
pub mod metadata;
pub mod portfolio;
pub mod schedule;
pub mod selection;
pub mod types;

// Re-exports for convenience
pub use analytics::{
    AnalysisConfig, AnnualReturn, CumulativeReturnTable, PerformanceAnalyzer, PerformanceMetrics,
    PerformanceReport, ResultFormatter,
};
pub use engine::{BacktestConfig, BacktestResult, RollingBacktestEngine};
pub use error::{BacktestError, Result};
pub use portfolio::{CostModel, SubPortfolio};
pub use schedule::RebalanceSchedule;
pub use selection::{select_top_n, RankMatrix, TradabilityMask};
pub use types::{
    AccountResult, BenchmarkKind, BenchmarkSeries, Diagnostic, ExecutionPrice, GapKind, PriceField,
    PriceTable, TradingCalendar, TurnoverTable, WeightMatrix,
};

// Data handling re-exports
pub use data::{
    load_benchmark, load_price_table, load_rank_matrix, load_tradability_mask, load_trading_days,
    load_weight_matrix, DataConfig,
};

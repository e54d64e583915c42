//! Configuration file support for rolling backtests.
//!
//! Allows loading a full run (inputs, engine, costs, analysis, output) from
//! a TOML file for reproducibility.

use crate::analytics::AnalysisConfig;
use crate::data::DataConfig;
use crate::engine::BacktestConfig;
use crate::error::{BacktestError, Result};
use crate::portfolio::CostModel;
use crate::types::{BenchmarkKind, PriceField};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Complete run configuration loaded from a file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BacktestFileConfig {
    /// Engine settings.
    #[serde(default)]
    pub backtest: BacktestSettings,
    /// Transaction cost settings.
    #[serde(default)]
    pub costs: CostSettings,
    /// Input file locations.
    #[serde(default)]
    pub data: DataSettings,
    /// Rank-based weight generation.
    #[serde(default)]
    pub selection: SelectionSettings,
    /// Performance analysis settings.
    #[serde(default)]
    pub analysis: AnalysisSettings,
    /// Where results go.
    #[serde(default)]
    pub output: OutputSettings,
}

/// Engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BacktestSettings {
    /// Initial capital across all sub-portfolios.
    #[serde(default = "default_capital")]
    pub initial_capital: f64,
    /// Number of staggered sub-portfolios.
    #[serde(default = "default_portfolio_count")]
    pub portfolio_count: usize,
    /// Trading days between rebalances of one sub-portfolio.
    #[serde(default = "default_frequency")]
    pub rebalance_frequency: usize,
    /// "adjusted" or "unadjusted".
    #[serde(default)]
    pub price_field: PriceField,
    /// Allow fractional shares.
    #[serde(default = "default_true")]
    pub fractional_shares: bool,
    /// Board lot when fractional shares are off.
    #[serde(default = "default_lot_size")]
    pub lot_size: f64,
    /// Start date (YYYY-MM-DD format).
    #[serde(default)]
    pub start_date: Option<String>,
    /// End date (YYYY-MM-DD format).
    #[serde(default)]
    pub end_date: Option<String>,
}

fn default_capital() -> f64 { 10_000_000.0 }
fn default_portfolio_count() -> usize { 5 }
fn default_frequency() -> usize { 5 }
fn default_true() -> bool { true }
fn default_lot_size() -> f64 { 100.0 }

impl Default for BacktestSettings {
    fn default() -> Self {
        Self {
            initial_capital: default_capital(),
            portfolio_count: default_portfolio_count(),
            rebalance_frequency: default_frequency(),
            price_field: PriceField::Adjusted,
            fractional_shares: true,
            lot_size: default_lot_size(),
            start_date: None,
            end_date: None,
        }
    }
}

/// Transaction cost settings, as decimal rates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostSettings {
    /// Stamp tax on sells.
    #[serde(default = "default_stamp_tax")]
    pub stamp_tax_rate: f64,
    /// Transfer fee on both sides.
    #[serde(default = "default_transfer_fee")]
    pub transfer_fee_rate: f64,
    /// Brokerage commission on buys.
    #[serde(default = "default_commission")]
    pub commission_rate: f64,
    /// Floor applied to each charged fee component.
    #[serde(default = "default_min_fee")]
    pub min_transaction_fee: f64,
}

fn default_stamp_tax() -> f64 { 0.0005 }
fn default_transfer_fee() -> f64 { 0.00001 }
fn default_commission() -> f64 { 0.0002 }
fn default_min_fee() -> f64 { 5.0 }

impl Default for CostSettings {
    fn default() -> Self {
        Self {
            stamp_tax_rate: default_stamp_tax(),
            transfer_fee_rate: default_transfer_fee(),
            commission_rate: default_commission(),
            min_transaction_fee: default_min_fee(),
        }
    }
}

/// Input file locations.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DataSettings {
    /// Wide weight matrix. Required unless `ranks` is set.
    pub weights: Option<String>,
    /// Long VWAP table.
    pub prices: Option<String>,
    /// Benchmark series.
    pub benchmark: Option<String>,
    /// Trading-day calendar.
    pub trading_days: Option<String>,
    /// Long rank table used to generate weights.
    pub ranks: Option<String>,
    /// Wide tradability mask applied during selection.
    pub mask: Option<String>,
    /// Date format in the CSV files.
    pub date_format: Option<String>,
    /// CSV delimiter. Auto-detected when unset.
    pub delimiter: Option<char>,
}

/// Rank-based weight generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectionSettings {
    /// Names held per rebalance.
    #[serde(default = "default_rank_n")]
    pub rank_n: usize,
}

fn default_rank_n() -> usize { 50 }

impl Default for SelectionSettings {
    fn default() -> Self {
        Self {
            rank_n: default_rank_n(),
        }
    }
}

/// Performance analysis settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisSettings {
    /// Annual risk-free rate as decimal.
    #[serde(default = "default_risk_free")]
    pub risk_free_rate: f64,
    /// Benchmark label.
    #[serde(default = "default_benchmark_name")]
    pub benchmark_name: String,
    /// "index" reads `[data].benchmark`; "equal_weight" builds the benchmark
    /// from the prices of the traded universe.
    #[serde(default)]
    pub benchmark_type: BenchmarkKind,
    /// Override for turnover annualization.
    #[serde(default)]
    pub rebalances_per_year: Option<f64>,
}

fn default_risk_free() -> f64 { 0.03 }
fn default_benchmark_name() -> String { "000852.XSHG".to_string() }

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            risk_free_rate: default_risk_free(),
            benchmark_name: default_benchmark_name(),
            benchmark_type: BenchmarkKind::Index,
            rebalances_per_year: None,
        }
    }
}

/// Output settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputSettings {
    /// Directory for CSV/JSON results. Nothing is written when unset.
    #[serde(default)]
    pub dir: Option<String>,
    /// File name prefix.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Show progress bar.
    #[serde(default = "default_true")]
    pub show_progress: bool,
}

fn default_prefix() -> String { "stagger".to_string() }

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            dir: None,
            prefix: default_prefix(),
            show_progress: true,
        }
    }
}

fn parse_config_date(field: &str, value: Option<&String>) -> Result<Option<NaiveDate>> {
    value
        .map(|s| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| {
                BacktestError::ConfigError(format!("invalid {} '{}': {}", field, s, e))
            })
        })
        .transpose()
}

impl BacktestFileConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = fs::read_to_string(path)?;
        let config: BacktestFileConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| BacktestError::ConfigError(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Convert to BacktestConfig for the engine.
    pub fn to_backtest_config(&self) -> Result<BacktestConfig> {
        let cost_model = CostModel {
            stamp_tax_rate: self.costs.stamp_tax_rate,
            transfer_fee_rate: self.costs.transfer_fee_rate,
            commission_rate: self.costs.commission_rate,
            min_transaction_fee: self.costs.min_transaction_fee,
        };

        let config = BacktestConfig {
            initial_capital: self.backtest.initial_capital,
            portfolio_count: self.backtest.portfolio_count,
            rebalance_frequency: self.backtest.rebalance_frequency,
            cost_model,
            price_field: self.backtest.price_field,
            fractional_shares: self.backtest.fractional_shares,
            lot_size: self.backtest.lot_size,
            show_progress: self.output.show_progress,
            start_date: parse_config_date("start_date", self.backtest.start_date.as_ref())?,
            end_date: parse_config_date("end_date", self.backtest.end_date.as_ref())?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Convert to AnalysisConfig for the analyzer.
    pub fn to_analysis_config(&self) -> AnalysisConfig {
        AnalysisConfig {
            risk_free_rate: self.analysis.risk_free_rate,
            benchmark_name: self.analysis.benchmark_name.clone(),
            rebalances_per_year: self.analysis.rebalances_per_year,
        }
    }

    /// CSV reader settings for the input files.
    pub fn to_data_config(&self) -> DataConfig {
        DataConfig {
            date_format: self.data.date_format.clone(),
            delimiter: self.data.delimiter.and_then(|c| u8::try_from(c).ok()),
            ..Default::default()
        }
    }

    /// Resolve a configured path relative to the config file's directory.
    pub fn resolve(base: Option<&Path>, path: &str) -> PathBuf {
        let p = PathBuf::from(path);
        match base {
            Some(dir) if p.is_relative() => dir.join(p),
            _ => p,
        }
    }

    /// Generate an example configuration file content.
    pub fn example() -> String {
        r#"# Stagger Rolling Backtest Configuration
# Paths are relative to this file.

[backtest]
initial_capital = 10000000.0
portfolio_count = 5        # staggered sub-portfolios
rebalance_frequency = 5    # trading days between rebalances of one sub-portfolio
price_field = "adjusted"   # or "unadjusted"
fractional_shares = true
lot_size = 100.0           # used when fractional_shares = false
# start_date = "2020-01-01"
# end_date = "2024-12-31"

[costs]
stamp_tax_rate = 0.0005      # sells
transfer_fee_rate = 0.00001  # both sides
commission_rate = 0.0002     # buys
min_transaction_fee = 5.0    # per charged component

[data]
weights = "cache/portfolio_weights.csv"
prices = "cache/vwap_df.csv"
benchmark = "cache/benchmark.csv"
trading_days = "cache/trading_days.csv"
# Generate weights from a ranking instead of reading them:
# ranks = "cache/ranks.csv"
# mask = "cache/combo_mask.csv"
# date_format = "%Y-%m-%d"

[selection]
rank_n = 50

[analysis]
risk_free_rate = 0.03
benchmark_name = "000852.XSHG"
benchmark_type = "index"   # or "equal_weight" over the traded universe
# rebalances_per_year = 50.4

[output]
# dir = "results"
prefix = "stagger"
show_progress = true
"#
        .to_string()
    }
}

//! Error types for the rebalance engine and analyzer.

use chrono::NaiveDate;
use thiserror::Error;

/// Main error type for the backtest pipeline.
///
/// Only fatal conditions are represented here. Data gaps and statistical
/// degeneracy are reported through [`crate::types::Diagnostic`] instead.
#[derive(Error, Debug)]
pub enum BacktestError {
    #[error("Data error: {0}")]
    DataError(String),

    #[error("CSV parsing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParseError(#[from] chrono::ParseError),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error(
        "Benchmark covers {benchmark_start} to {benchmark_end} but the account series spans {account_start} to {account_end}"
    )]
    BenchmarkMisaligned {
        benchmark_start: NaiveDate,
        benchmark_end: NaiveDate,
        account_start: NaiveDate,
        account_end: NaiveDate,
    },

    #[error("No data loaded")]
    NoData,

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type alias for backtest operations.
pub type Result<T> = std::result::Result<T, BacktestError>;

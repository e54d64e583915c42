//! Export utilities for rolling backtest results.
//!
//! Flat CSV files for the account series, the wide turnover table, the
//! cumulative-return table, metrics, and annual returns, plus a JSON run
//! summary. Undefined values are written as empty CSV cells and JSON nulls.

use crate::analytics::{PerformanceMetrics, PerformanceReport};
use crate::engine::{BacktestConfig, BacktestResult};
use crate::error::Result;
use crate::metadata::DataFileMetadata;
use crate::types::WeightMatrix;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Configuration for exports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Date format for CSV exports.
    pub date_format: String,
    /// Decimal precision for numeric values.
    pub precision: usize,
    /// Whether to include headers in CSV.
    pub include_headers: bool,
    /// Delimiter for CSV files.
    pub delimiter: char,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            date_format: "%Y-%m-%d".to_string(),
            precision: 6,
            include_headers: true,
            delimiter: ',',
        }
    }
}

impl ExportConfig {
    /// Fixed-precision cell. Undefined values become an empty cell.
    pub fn number(&self, value: f64) -> String {
        if value.is_finite() {
            format!("{:.prec$}", value, prec = self.precision)
        } else {
            String::new()
        }
    }

    fn optional(&self, value: Option<f64>) -> String {
        value.map(|v| self.number(v)).unwrap_or_default()
    }

    fn date(&self, date: NaiveDate) -> String {
        date.format(&self.date_format).to_string()
    }

    fn join(&self, fields: Vec<String>) -> String {
        fields.join(&self.delimiter.to_string())
    }
}

/// Run summary written as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub config: BacktestConfig,
    pub config_hash: String,
    pub inputs: Vec<DataFileMetadata>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub trading_days: usize,
    pub final_value: f64,
    pub total_fees: f64,
    pub data_gaps: usize,
    pub metrics: Option<PerformanceMetrics>,
    pub diagnostics: Vec<String>,
}

impl RunSummary {
    pub fn from_result(result: &BacktestResult, report: Option<&PerformanceReport>) -> Self {
        let mut diagnostics: Vec<String> = result.diagnostics.iter().map(|d| d.to_string()).collect();
        if let Some(report) = report {
            diagnostics.extend(report.diagnostics.iter().map(|d| d.to_string()));
        }
        Self {
            config: result.config.clone(),
            config_hash: result.config_hash.clone(),
            inputs: result.inputs.clone(),
            start_date: result.start_date,
            end_date: result.end_date,
            trading_days: result.trading_days,
            final_value: result.final_value(),
            total_fees: result.total_fees,
            data_gaps: result.data_gap_count(),
            metrics: report.map(|r| r.metrics.clone()),
            diagnostics,
        }
    }
}

/// Exporter for backtest results.
pub struct Exporter {
    result: BacktestResult,
    report: Option<PerformanceReport>,
    config: ExportConfig,
}

impl Exporter {
    /// Create a new exporter.
    pub fn new(result: BacktestResult) -> Self {
        Self {
            result,
            report: None,
            config: ExportConfig::default(),
        }
    }

    /// Attach analyzer output so report tables can be exported too.
    pub fn with_report(mut self, report: PerformanceReport) -> Self {
        self.report = Some(report);
        self
    }

    fn create(path: impl AsRef<Path>) -> Result<BufWriter<File>> {
        Ok(BufWriter::new(File::create(path)?))
    }

    /// Export the daily account series, one column per sub-portfolio value.
    pub fn export_account_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = Self::create(path)?;
        let cfg = &self.config;

        if cfg.include_headers {
            let mut header = vec![
                "date".to_string(),
                "total_value".to_string(),
                "cash".to_string(),
                "positions_value".to_string(),
            ];
            header.extend((0..self.result.portfolios.len()).map(|i| format!("portfolio_{}", i)));
            writeln!(writer, "{}", cfg.join(header))?;
        }

        for point in &self.result.account.points {
            let mut row = vec![
                cfg.date(point.date),
                cfg.number(point.total_value),
                cfg.number(point.cash),
                cfg.number(point.positions_value),
            ];
            row.extend(point.sub_values.iter().map(|v| cfg.number(*v)));
            writeln!(writer, "{}", cfg.join(row))?;
        }

        writer.flush()?;
        Ok(())
    }

    /// Export turnover as date x sub-portfolio. Cells without a rebalance, and
    /// first deployments, are empty.
    pub fn export_turnover_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = Self::create(path)?;
        let cfg = &self.config;
        let table = &self.result.turnover;

        if cfg.include_headers {
            let mut header = vec!["date".to_string()];
            header.extend(
                table
                    .portfolios
                    .iter()
                    .map(|p| format!("portfolio_{}_offset_{}", p.index, p.offset)),
            );
            writeln!(writer, "{}", cfg.join(header))?;
        }

        for (date, cells) in table.to_wide() {
            let mut row = vec![cfg.date(date)];
            row.extend(cells.into_iter().map(|c| cfg.optional(c)));
            writeln!(writer, "{}", cfg.join(row))?;
        }

        writer.flush()?;
        Ok(())
    }

    /// Export strategy/benchmark/alpha cumulative multipliers.
    pub fn export_cumulative_csv(&self, path: impl AsRef<Path>) -> Result<bool> {
        let Some(report) = &self.report else {
            return Ok(false);
        };
        let mut writer = Self::create(path)?;
        let cfg = &self.config;

        if cfg.include_headers {
            writeln!(
                writer,
                "{}",
                cfg.join(vec![
                    "date".to_string(),
                    "strategy".to_string(),
                    report.cumulative.benchmark_name.clone(),
                    "alpha".to_string(),
                ])
            )?;
        }
        for p in &report.cumulative.points {
            writeln!(
                writer,
                "{}",
                cfg.join(vec![
                    cfg.date(p.date),
                    cfg.number(p.strategy),
                    cfg.number(p.benchmark),
                    cfg.number(p.alpha),
                ])
            )?;
        }

        writer.flush()?;
        Ok(true)
    }

    /// Export scalar metrics as `metric,value` rows.
    pub fn export_metrics_csv(&self, path: impl AsRef<Path>) -> Result<bool> {
        let Some(report) = &self.report else {
            return Ok(false);
        };
        let mut writer = Self::create(path)?;
        let cfg = &self.config;

        if cfg.include_headers {
            writeln!(writer, "{}", cfg.join(vec!["metric".into(), "value".into()]))?;
        }
        for (name, value) in report.metrics.entries() {
            writeln!(writer, "{}", cfg.join(vec![name.to_string(), cfg.number(value)]))?;
        }
        let dates = [
            ("max_drawdown_peak", report.metrics.max_drawdown_peak),
            ("max_drawdown_trough", report.metrics.max_drawdown_trough),
        ];
        for (name, date) in dates {
            let value = date.map(|d| cfg.date(d)).unwrap_or_default();
            writeln!(writer, "{}", cfg.join(vec![name.to_string(), value]))?;
        }

        writer.flush()?;
        Ok(true)
    }

    /// Export per-calendar-year returns.
    pub fn export_annual_csv(&self, path: impl AsRef<Path>) -> Result<bool> {
        let Some(report) = &self.report else {
            return Ok(false);
        };
        let mut writer = Self::create(path)?;
        let cfg = &self.config;

        if cfg.include_headers {
            writeln!(
                writer,
                "{}",
                cfg.join(vec![
                    "year".into(),
                    "strategy".into(),
                    "benchmark".into(),
                    "alpha".into()
                ])
            )?;
        }
        for row in &report.annual_returns {
            writeln!(
                writer,
                "{}",
                cfg.join(vec![
                    row.year.to_string(),
                    cfg.number(row.strategy),
                    cfg.number(row.benchmark),
                    cfg.number(row.alpha),
                ])
            )?;
        }

        writer.flush()?;
        Ok(true)
    }

    /// Export the run summary to JSON.
    pub fn export_summary_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let summary = RunSummary::from_result(&self.result, self.report.as_ref());
        let json = serde_json::to_string_pretty(&summary)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Write every available export into `dir` as `<prefix>_<kind>.<ext>`.
    /// Returns the paths written.
    pub fn export_all(&self, dir: impl AsRef<Path>, prefix: &str) -> Result<Vec<PathBuf>> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = |kind: &str, ext: &str| dir.join(format!("{}_{}.{}", prefix, kind, ext));

        let mut written = Vec::new();

        let account = path("account", "csv");
        self.export_account_csv(&account)?;
        written.push(account);

        let turnover = path("turnover", "csv");
        self.export_turnover_csv(&turnover)?;
        written.push(turnover);

        let cumulative = path("cumulative", "csv");
        if self.export_cumulative_csv(&cumulative)? {
            written.push(cumulative);
        }

        let metrics = path("metrics", "csv");
        if self.export_metrics_csv(&metrics)? {
            written.push(metrics);
        }

        let annual = path("annual", "csv");
        if self.export_annual_csv(&annual)? {
            written.push(annual);
        }

        let summary = path("summary", "json");
        self.export_summary_json(&summary)?;
        written.push(summary);

        info!("Wrote {} result files to {}", written.len(), dir.display());
        Ok(written)
    }
}

/// Write a weight matrix in the wide layout `load_weight_matrix` reads.
pub fn export_weight_matrix_csv(
    weights: &WeightMatrix,
    path: impl AsRef<Path>,
    config: &ExportConfig,
) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    let instruments: BTreeSet<String> = weights.instruments();

    if config.include_headers {
        let mut header = vec!["datetime".to_string()];
        header.extend(instruments.iter().cloned());
        writeln!(writer, "{}", config.join(header))?;
    }

    for (date, row) in weights.rows() {
        let mut fields = vec![config.date(*date)];
        fields.extend(
            instruments
                .iter()
                .map(|id| config.optional(row.get(id).copied())),
        );
        writeln!(writer, "{}", config.join(fields))?;
    }

    writer.flush()?;
    Ok(())
}

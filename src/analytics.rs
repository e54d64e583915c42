//! Performance analytics and reporting.
//!
//! Every annualized figure uses the 252 trading-day convention. Ratios whose
//! denominator is zero or undefined are reported as NaN together with a
//! [`Diagnostic::Degenerate`] entry rather than being coerced to a number.

use crate::engine::BacktestResult;
use crate::error::{BacktestError, Result};
use crate::export::ExportConfig;
use crate::types::{AccountResult, BenchmarkSeries, Diagnostic, TradingCalendar, TurnoverTable};
use chrono::{Datelike, NaiveDate};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tabled::{builder::Builder, settings::Style};
use tracing::{info, warn};

/// Trading days per year used for annualization.
pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Fewest paired observations the alpha/beta regression accepts.
pub const MIN_REGRESSION_OBSERVATIONS: usize = 6;

/// Denominators at or below this magnitude are treated as zero.
const ZERO_TOLERANCE: f64 = 1e-14;

/// Analyzer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisConfig {
    /// Annual risk-free rate (as decimal, e.g., 0.03 for 3%).
    pub risk_free_rate: f64,
    /// Label for the benchmark column.
    pub benchmark_name: String,
    /// Rebalances per year used to annualize turnover. Defaults to
    /// `252 / rebalance_frequency` when unset.
    #[serde(default)]
    pub rebalances_per_year: Option<f64>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            risk_free_rate: 0.03,
            benchmark_name: "000852.XSHG".to_string(),
            rebalances_per_year: None,
        }
    }
}

/// Cumulative multipliers on one date, all based at 1.0 before the first date.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CumulativeReturnPoint {
    pub date: NaiveDate,
    pub strategy: f64,
    pub benchmark: f64,
    /// Strategy cumulative divided by benchmark cumulative.
    pub alpha: f64,
}

/// Date-indexed strategy/benchmark/alpha cumulative multipliers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CumulativeReturnTable {
    pub benchmark_name: String,
    pub points: Vec<CumulativeReturnPoint>,
}

impl CumulativeReturnTable {
    pub fn strategy(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.strategy).collect()
    }

    pub fn benchmark(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.benchmark).collect()
    }

    pub fn alpha(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.alpha).collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Scalar performance results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Final strategy cumulative value minus one.
    pub total_return: f64,
    /// (1 + total)^(252/N) - 1.
    pub annualized_return: f64,
    pub benchmark_total_return: f64,
    pub benchmark_annualized_return: f64,
    /// OLS intercept of annualized excess strategy on benchmark returns.
    pub alpha: f64,
    /// OLS slope of the same regression.
    pub beta: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
    pub downside_volatility: f64,
    pub sortino_ratio: f64,
    pub tracking_error: f64,
    pub information_ratio: f64,
    pub max_drawdown: f64,
    pub max_drawdown_peak: Option<NaiveDate>,
    pub max_drawdown_trough: Option<NaiveDate>,
    pub calmar_ratio: f64,
    /// Final alpha-series value minus one.
    pub excess_total_return: f64,
    pub excess_annualized_return: f64,
    pub excess_volatility: f64,
    pub excess_sharpe: f64,
    pub excess_max_drawdown: f64,
    /// Fraction of days with a positive alpha-series return.
    pub win_rate: f64,
    /// |mean positive alpha-day return / mean negative alpha-day return|.
    pub profit_loss_ratio: f64,
    /// Mean of all defined per-rebalance turnover values.
    pub average_turnover: f64,
    /// `average_turnover` times rebalances per year.
    pub annual_turnover: f64,
    /// Number of cumulative-return observations.
    pub observations: usize,
}

impl PerformanceMetrics {
    /// Scalar metrics in a fixed order with stable names.
    pub fn entries(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("total_return", self.total_return),
            ("annualized_return", self.annualized_return),
            ("benchmark_total_return", self.benchmark_total_return),
            ("benchmark_annualized_return", self.benchmark_annualized_return),
            ("alpha", self.alpha),
            ("beta", self.beta),
            ("volatility", self.volatility),
            ("sharpe_ratio", self.sharpe_ratio),
            ("downside_volatility", self.downside_volatility),
            ("sortino_ratio", self.sortino_ratio),
            ("tracking_error", self.tracking_error),
            ("information_ratio", self.information_ratio),
            ("max_drawdown", self.max_drawdown),
            ("calmar_ratio", self.calmar_ratio),
            ("excess_total_return", self.excess_total_return),
            ("excess_annualized_return", self.excess_annualized_return),
            ("excess_volatility", self.excess_volatility),
            ("excess_sharpe", self.excess_sharpe),
            ("excess_max_drawdown", self.excess_max_drawdown),
            ("win_rate", self.win_rate),
            ("profit_loss_ratio", self.profit_loss_ratio),
            ("average_turnover", self.average_turnover),
            ("annual_turnover", self.annual_turnover),
        ]
    }

    /// Same as [`entries`](Self::entries), keyed by name.
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        self.entries()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }
}

/// Compounded returns within one calendar year.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnnualReturn {
    pub year: i32,
    pub strategy: f64,
    pub benchmark: f64,
    pub alpha: f64,
}

/// Everything the analyzer produces for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub cumulative: CumulativeReturnTable,
    pub metrics: PerformanceMetrics,
    pub annual_returns: Vec<AnnualReturn>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Peak-to-trough decline of a value series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Drawdown {
    /// Largest (peak - value) / peak, in [0, 1] for positive series.
    pub max_drawdown: f64,
    /// Index of the running peak preceding the trough; `None` when there is no drawdown.
    pub peak: Option<usize>,
    pub trough: Option<usize>,
}

/// Largest relative decline from a running peak.
pub fn max_drawdown(values: &[f64]) -> Drawdown {
    let mut running_peak = f64::NEG_INFINITY;
    let mut peak_idx = 0;
    let mut best = Drawdown {
        max_drawdown: 0.0,
        peak: None,
        trough: None,
    };
    for (i, &v) in values.iter().enumerate() {
        if v > running_peak {
            running_peak = v;
            peak_idx = i;
        }
        if running_peak > 0.0 {
            let dd = (running_peak - v) / running_peak;
            if dd > best.max_drawdown {
                best = Drawdown {
                    max_drawdown: dd,
                    peak: Some(peak_idx),
                    trough: Some(i),
                };
            }
        }
    }
    best
}

/// Simple returns of `values` against a starting `base`.
pub fn simple_returns(base: f64, values: &[f64]) -> Vec<f64> {
    let mut prev = base;
    values
        .iter()
        .map(|&v| {
            let r = v / prev - 1.0;
            prev = v;
            r
        })
        .collect()
}

/// Running product of (1 + r), based at 1.0.
pub fn cumulative_product(returns: &[f64]) -> Vec<f64> {
    let mut acc = 1.0;
    returns
        .iter()
        .map(|r| {
            acc *= 1.0 + r;
            acc
        })
        .collect()
}

/// Arithmetic mean; NaN for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1 denominator); NaN below two observations.
pub fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return f64::NAN;
    }
    let m = mean(values);
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    (ss / (values.len() - 1) as f64).sqrt()
}

/// (1 + total)^(252 / n) - 1.
pub fn annualize(total_return: f64, observations: usize) -> f64 {
    if observations == 0 {
        return f64::NAN;
    }
    (1.0 + total_return).powf(TRADING_DAYS_PER_YEAR / observations as f64) - 1.0
}

/// Ordinary least squares `y = intercept + slope * x` over finite pairs.
///
/// Returns `None` when fewer than [`MIN_REGRESSION_OBSERVATIONS`] finite pairs
/// remain or `x` has no variance.
pub fn ols_intercept_slope(y: &[f64], x: &[f64]) -> Option<(f64, f64)> {
    let pairs: Vec<(f64, f64)> = y
        .iter()
        .zip(x.iter())
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .map(|(a, b)| (*a, *b))
        .collect();
    if pairs.len() < MIN_REGRESSION_OBSERVATIONS {
        return None;
    }
    let n = pairs.len() as f64;
    let x_mean = pairs.iter().map(|(_, b)| b).sum::<f64>() / n;
    let y_mean = pairs.iter().map(|(a, _)| a).sum::<f64>() / n;
    let sxx: f64 = pairs.iter().map(|(_, b)| (b - x_mean).powi(2)).sum();
    let sxy: f64 = pairs
        .iter()
        .map(|(a, b)| (b - x_mean) * (a - y_mean))
        .sum();
    if sxx <= ZERO_TOLERANCE {
        return None;
    }
    let slope = sxy / sxx;
    Some((y_mean - slope * x_mean, slope))
}

/// Turns an account series and a benchmark into return/risk statistics.
pub struct PerformanceAnalyzer {
    config: AnalysisConfig,
    calendar: Option<TradingCalendar>,
}

impl PerformanceAnalyzer {
    pub fn new(config: AnalysisConfig) -> Self {
        Self {
            config,
            calendar: None,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(AnalysisConfig::default())
    }

    /// Use the calendar to find the trading day before the first account date,
    /// whose benchmark value becomes the base.
    pub fn with_calendar(mut self, calendar: TradingCalendar) -> Self {
        self.calendar = Some(calendar);
        self
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Analyze a finished engine run.
    pub fn analyze(
        &self,
        result: &BacktestResult,
        benchmark: &BenchmarkSeries,
    ) -> Result<PerformanceReport> {
        self.analyze_account(
            &result.account,
            &result.turnover,
            result.config.rebalance_frequency,
            benchmark,
        )
    }

    /// Analyze an account series directly.
    pub fn analyze_account(
        &self,
        account: &AccountResult,
        turnover: &TurnoverTable,
        rebalance_frequency: usize,
        benchmark: &BenchmarkSeries,
    ) -> Result<PerformanceReport> {
        let (Some(first), Some(last)) = (account.first_date(), account.last_date()) else {
            return Err(BacktestError::NoData);
        };
        let (Some(bench_first), Some(bench_last)) = (benchmark.first_date(), benchmark.last_date())
        else {
            return Err(BacktestError::InvalidInput(format!(
                "benchmark series {} is empty",
                benchmark.name
            )));
        };
        if bench_first > first || bench_last < last {
            return Err(BacktestError::BenchmarkMisaligned {
                benchmark_start: bench_first,
                benchmark_end: bench_last,
                account_start: first,
                account_end: last,
            });
        }

        let mut diagnostics = Vec::new();
        let rf = self.config.risk_free_rate;
        let dates = account.dates();
        let n = dates.len();

        // Coverage check above guarantees a value at or before every date.
        let bench_values: Vec<f64> = dates
            .iter()
            .map(|d| benchmark.value_at_or_before(*d).unwrap_or(f64::NAN))
            .collect();
        let bench_base = self.benchmark_base(benchmark, first, &bench_values);

        let strategy_returns = simple_returns(account.initial_capital, &account.values());
        let benchmark_returns = simple_returns(bench_base, &bench_values);
        let strategy_cum = cumulative_product(&strategy_returns);
        let benchmark_cum = cumulative_product(&benchmark_returns);
        let alpha_cum: Vec<f64> = strategy_cum
            .iter()
            .zip(benchmark_cum.iter())
            .map(|(s, b)| s / b)
            .collect();
        let alpha_returns = simple_returns(1.0, &alpha_cum);

        let cumulative = CumulativeReturnTable {
            benchmark_name: self.config.benchmark_name.clone(),
            points: dates
                .iter()
                .enumerate()
                .map(|(i, &date)| CumulativeReturnPoint {
                    date,
                    strategy: strategy_cum[i],
                    benchmark: benchmark_cum[i],
                    alpha: alpha_cum[i],
                })
                .collect(),
        };

        let last_of = |series: &[f64]| series.last().copied().unwrap_or(f64::NAN);
        let total_return = last_of(&strategy_cum) - 1.0;
        let annualized_return = annualize(total_return, n);
        let benchmark_total_return = last_of(&benchmark_cum) - 1.0;
        let benchmark_annualized_return = annualize(benchmark_total_return, n);

        let sqrt_year = TRADING_DAYS_PER_YEAR.sqrt();
        let volatility = sample_std(&strategy_returns) * sqrt_year;
        let sharpe_ratio = ratio(&mut diagnostics, "sharpe_ratio", annualized_return - rf, volatility);

        let negatives: Vec<f64> = strategy_returns.iter().copied().filter(|r| *r < 0.0).collect();
        let downside_volatility = sample_std(&negatives) * sqrt_year;
        let sortino_ratio = ratio(
            &mut diagnostics,
            "sortino_ratio",
            annualized_return - rf,
            downside_volatility,
        );

        let active: Vec<f64> = strategy_returns
            .iter()
            .zip(benchmark_returns.iter())
            .map(|(s, b)| s - b)
            .collect();
        let tracking_error = sample_std(&active) * sqrt_year;
        let information_ratio = ratio(
            &mut diagnostics,
            "information_ratio",
            annualized_return - benchmark_annualized_return,
            tracking_error,
        );

        let drawdown = max_drawdown(&strategy_cum);
        let calmar_ratio = ratio(
            &mut diagnostics,
            "calmar_ratio",
            annualized_return,
            drawdown.max_drawdown,
        );

        let (alpha, beta) = self.regression(&strategy_returns, &benchmark_returns, &mut diagnostics);

        let excess_total_return = last_of(&alpha_cum) - 1.0;
        let excess_annualized_return = annualize(excess_total_return, n);
        let excess_volatility = sample_std(&alpha_returns) * sqrt_year;
        let excess_sharpe = ratio(
            &mut diagnostics,
            "excess_sharpe",
            excess_annualized_return - rf,
            excess_volatility,
        );
        let excess_max_drawdown = max_drawdown(&alpha_cum).max_drawdown;

        let wins: Vec<f64> = alpha_returns.iter().copied().filter(|r| *r > 0.0).collect();
        let losses: Vec<f64> = alpha_returns.iter().copied().filter(|r| *r < 0.0).collect();
        let win_rate = wins.len() as f64 / n as f64;
        let profit_loss_ratio = if wins.is_empty() || losses.is_empty() {
            degenerate(
                &mut diagnostics,
                "profit_loss_ratio",
                "no winning or no losing alpha days",
            );
            f64::NAN
        } else {
            (mean(&wins) / mean(&losses)).abs()
        };

        let average_turnover = match turnover.mean() {
            Some(m) => m,
            None => {
                degenerate(&mut diagnostics, "average_turnover", "no turnover after first deployment");
                f64::NAN
            }
        };
        let rebalances_per_year = self
            .config
            .rebalances_per_year
            .unwrap_or(TRADING_DAYS_PER_YEAR / rebalance_frequency.max(1) as f64);
        let annual_turnover = average_turnover * rebalances_per_year;

        let metrics = PerformanceMetrics {
            total_return,
            annualized_return,
            benchmark_total_return,
            benchmark_annualized_return,
            alpha,
            beta,
            volatility,
            sharpe_ratio,
            downside_volatility,
            sortino_ratio,
            tracking_error,
            information_ratio,
            max_drawdown: drawdown.max_drawdown,
            max_drawdown_peak: drawdown.peak.map(|i| dates[i]),
            max_drawdown_trough: drawdown.trough.map(|i| dates[i]),
            calmar_ratio,
            excess_total_return,
            excess_annualized_return,
            excess_volatility,
            excess_sharpe,
            excess_max_drawdown,
            win_rate,
            profit_loss_ratio,
            average_turnover,
            annual_turnover,
            observations: n,
        };

        let annual_returns = annual_returns(&dates, &strategy_returns, &benchmark_returns, &alpha_returns);

        info!(
            "Analysis complete: {:.2}% total, {:.2}% annualized, {:.2}% max DD over {} days",
            total_return * 100.0,
            annualized_return * 100.0,
            drawdown.max_drawdown * 100.0,
            n
        );

        Ok(PerformanceReport {
            cumulative,
            metrics,
            annual_returns,
            diagnostics,
        })
    }

    /// Benchmark value one trading day before `first`. Falls back to the last
    /// observation before `first`, then to the value on `first` itself.
    fn benchmark_base(&self, benchmark: &BenchmarkSeries, first: NaiveDate, aligned: &[f64]) -> f64 {
        let from_calendar = self
            .calendar
            .as_ref()
            .and_then(|c| c.previous(first))
            .and_then(|prev| benchmark.value_at_or_before(prev));
        from_calendar
            .or_else(|| benchmark.value_before(first))
            .or_else(|| aligned.first().copied())
            .unwrap_or(f64::NAN)
    }

    fn regression(
        &self,
        strategy_returns: &[f64],
        benchmark_returns: &[f64],
        diagnostics: &mut Vec<Diagnostic>,
    ) -> (f64, f64) {
        let rf = self.config.risk_free_rate;
        let y: Vec<f64> = strategy_returns
            .iter()
            .map(|r| r * TRADING_DAYS_PER_YEAR - rf)
            .collect();
        let x: Vec<f64> = benchmark_returns
            .iter()
            .map(|r| r * TRADING_DAYS_PER_YEAR - rf)
            .collect();
        match ols_intercept_slope(&y, &x) {
            Some(fit) => fit,
            None => {
                degenerate(
                    diagnostics,
                    "alpha/beta",
                    "fewer than 6 valid observations or flat benchmark, using alpha=0, beta=1",
                );
                (0.0, 1.0)
            }
        }
    }
}

fn degenerate(diagnostics: &mut Vec<Diagnostic>, metric: &str, reason: &str) {
    let diagnostic = Diagnostic::Degenerate {
        metric: metric.to_string(),
        reason: reason.to_string(),
    };
    warn!("{}", diagnostic);
    diagnostics.push(diagnostic);
}

/// `numerator / denominator`, or NaN with a diagnostic when the denominator is
/// zero or undefined.
fn ratio(diagnostics: &mut Vec<Diagnostic>, metric: &str, numerator: f64, denominator: f64) -> f64 {
    if !denominator.is_finite() || denominator.abs() <= ZERO_TOLERANCE {
        degenerate(diagnostics, metric, "denominator is zero or undefined");
        return f64::NAN;
    }
    numerator / denominator
}

fn annual_returns(
    dates: &[NaiveDate],
    strategy: &[f64],
    benchmark: &[f64],
    alpha: &[f64],
) -> Vec<AnnualReturn> {
    let mut years: BTreeMap<i32, (f64, f64, f64)> = BTreeMap::new();
    for (i, date) in dates.iter().enumerate() {
        let entry = years.entry(date.year()).or_insert((1.0, 1.0, 1.0));
        entry.0 *= 1.0 + strategy[i];
        entry.1 *= 1.0 + benchmark[i];
        entry.2 *= 1.0 + alpha[i];
    }
    years
        .into_iter()
        .map(|(year, (s, b, a))| AnnualReturn {
            year,
            strategy: s - 1.0,
            benchmark: b - 1.0,
            alpha: a - 1.0,
        })
        .collect()
}

/// Format results for terminal display.
pub struct ResultFormatter;

impl ResultFormatter {
    /// Print a comprehensive results report to stdout.
    pub fn print_report(result: &BacktestResult, report: &PerformanceReport) {
        let m = &report.metrics;

        println!();
        println!("{}", "═".repeat(60).blue());
        println!("{}", " BACKTEST RESULTS ".bold().blue());
        println!("{}", "═".repeat(60).blue());
        println!();

        println!("{}", "Overview".bold().underline());
        println!("  Sub-portfolios:  {}", result.config.portfolio_count);
        println!("  Rebalance Every: {} days", result.config.rebalance_frequency);
        println!("  Period:          {} to {}", result.start_date, result.end_date);
        println!("  Trading Days:    {}", result.trading_days);
        println!("  Benchmark:       {}", report.cumulative.benchmark_name);
        println!();

        println!("{}", "Performance".bold().underline());
        println!("  Initial Capital: {:>14.2}", result.config.initial_capital);
        println!(
            "  Final Value:     {:>14.2}  {}",
            result.final_value(),
            Self::format_pct_change(m.total_return * 100.0)
        );
        println!("  Total Return:    {:>13.2}%", m.total_return * 100.0);
        println!("  Annual Return:   {:>13.2}%", m.annualized_return * 100.0);
        println!("  Benchmark Total: {:>13.2}%", m.benchmark_total_return * 100.0);
        println!("  Benchmark Annual:{:>13.2}%", m.benchmark_annualized_return * 100.0);
        println!();

        println!("{}", "Risk Metrics".bold().underline());
        println!("  Volatility:      {:>13.2}%", m.volatility * 100.0);
        println!("  Downside Vol:    {:>13.2}%", m.downside_volatility * 100.0);
        println!("  Max Drawdown:    {:>13.2}%", -m.max_drawdown * 100.0);
        println!("  Sharpe Ratio:    {:>14.2}", m.sharpe_ratio);
        println!("  Sortino Ratio:   {:>14.2}", m.sortino_ratio);
        println!("  Calmar Ratio:    {:>14.2}", m.calmar_ratio);
        println!();

        println!("{}", "Benchmark Relative".bold().underline());
        println!("  Alpha:           {:>14.4}", m.alpha);
        println!("  Beta:            {:>14.4}", m.beta);
        println!("  Tracking Error:  {:>13.2}%", m.tracking_error * 100.0);
        println!("  Information:     {:>14.2}", m.information_ratio);
        println!("  Excess Total:    {:>13.2}%", m.excess_total_return * 100.0);
        println!("  Excess Annual:   {:>13.2}%", m.excess_annualized_return * 100.0);
        println!("  Excess Vol:      {:>13.2}%", m.excess_volatility * 100.0);
        println!("  Excess Sharpe:   {:>14.2}", m.excess_sharpe);
        println!("  Excess Max DD:   {:>13.2}%", -m.excess_max_drawdown * 100.0);
        println!("  Daily Win Rate:  {:>13.2}%", m.win_rate * 100.0);
        println!("  Profit/Loss:     {:>14.2}", m.profit_loss_ratio);
        println!();

        println!("{}", "Trading".bold().underline());
        println!("  Avg Turnover:    {:>13.2}%", m.average_turnover * 100.0);
        println!("  Annual Turnover: {:>14.2}", m.annual_turnover);
        println!("  Fees Paid:       {:>14.2}", result.total_fees);
        println!("  Data Gaps:       {:>14}", result.data_gap_count());
        println!();

        if !report.annual_returns.is_empty() {
            println!("{}", "Annual Returns".bold().underline());
            Self::print_annual_returns(&report.annual_returns);
            println!();
        }

        println!("{}", "═".repeat(60).blue());
    }

    /// Format percentage change with color.
    fn format_pct_change(pct: f64) -> String {
        if pct >= 0.0 {
            format!("(+{:.2}%)", pct).green().to_string()
        } else {
            format!("({:.2}%)", pct).red().to_string()
        }
    }

    /// Print yearly returns as a table.
    pub fn print_annual_returns(annual: &[AnnualReturn]) {
        let mut builder = Builder::new();
        builder.push_record(["Year", "Strategy %", "Benchmark %", "Alpha %"]);
        for row in annual {
            builder.push_record([
                row.year.to_string(),
                format!("{:.2}", row.strategy * 100.0),
                format!("{:.2}", row.benchmark * 100.0),
                format!("{:.2}", row.alpha * 100.0),
            ]);
        }
        let table = builder.build().with(Style::rounded()).to_string();
        println!("{}", table);
    }

    /// Export the report to JSON. Undefined metrics serialize as null.
    pub fn to_json(report: &PerformanceReport) -> String {
        serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_string())
    }

    /// Export metrics to a CSV line matching [`csv_header`](Self::csv_header).
    /// Undefined metrics are written as empty cells, as in the exported files.
    pub fn to_csv_line(metrics: &PerformanceMetrics) -> String {
        let cells = ExportConfig::default();
        metrics
            .entries()
            .iter()
            .map(|(_, v)| cells.number(*v))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Get CSV header.
    pub fn csv_header() -> String {
        PerformanceMetrics::entries(&Self::empty_metrics())
            .iter()
            .map(|(k, _)| *k)
            .collect::<Vec<_>>()
            .join(",")
    }

    fn empty_metrics() -> PerformanceMetrics {
        PerformanceMetrics {
            total_return: f64::NAN,
            annualized_return: f64::NAN,
            benchmark_total_return: f64::NAN,
            benchmark_annualized_return: f64::NAN,
            alpha: f64::NAN,
            beta: f64::NAN,
            volatility: f64::NAN,
            sharpe_ratio: f64::NAN,
            downside_volatility: f64::NAN,
            sortino_ratio: f64::NAN,
            tracking_error: f64::NAN,
            information_ratio: f64::NAN,
            max_drawdown: f64::NAN,
            max_drawdown_peak: None,
            max_drawdown_trough: None,
            calmar_ratio: f64::NAN,
            excess_total_return: f64::NAN,
            excess_annualized_return: f64::NAN,
            excess_volatility: f64::NAN,
            excess_sharpe: f64::NAN,
            excess_max_drawdown: f64::NAN,
            win_rate: f64::NAN,
            profit_loss_ratio: f64::NAN,
            average_turnover: f64::NAN,
            annual_turnover: f64::NAN,
            observations: 0,
        }
    }
}

//! Staggered rolling rebalance engine.
//!
//! Capital is split evenly across `portfolio_count` sub-portfolios. Each one
//! rebalances to the weight row of the day on its own phase of a
//! `rebalance_frequency`-day cycle, so no single rebalance date moves the
//! whole account. The simulation is a single chronological fold over the
//! trading-day grid; every input is materialized before the loop starts.

use crate::error::{BacktestError, Result};
use crate::metadata::{compute_config_hash, DataFileMetadata};
use crate::portfolio::{CostModel, ExecutionSettings, SubPortfolio};
use crate::schedule::RebalanceSchedule;
use crate::types::{
    AccountPoint, AccountResult, Diagnostic, PriceField, PriceMap, PriceTable,
    SubPortfolioTurnover, TradingCalendar, TurnoverTable, WeightMatrix,
};
use chrono::NaiveDate;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Configuration for the rolling rebalance engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BacktestConfig {
    /// Total starting capital, split evenly across sub-portfolios.
    pub initial_capital: f64,
    /// Number of staggered sub-portfolios.
    pub portfolio_count: usize,
    /// Trading days between two rebalances of the same sub-portfolio.
    pub rebalance_frequency: usize,
    /// Transaction cost configuration.
    pub cost_model: CostModel,
    /// VWAP variant used for execution and valuation.
    #[serde(default)]
    pub price_field: PriceField,
    /// Allow fractional shares. When false, share counts are floored to `lot_size`.
    pub fractional_shares: bool,
    /// Board lot used when fractional shares are disabled.
    #[serde(default = "default_lot_size")]
    pub lot_size: f64,
    /// Show progress bar during the simulation.
    pub show_progress: bool,
    /// Start date filter (optional).
    pub start_date: Option<NaiveDate>,
    /// End date filter (optional).
    pub end_date: Option<NaiveDate>,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_capital: 10_000_000.0,
            portfolio_count: 5,
            rebalance_frequency: 5,
            cost_model: CostModel::default(),
            price_field: PriceField::Adjusted,
            fractional_shares: true,
            lot_size: default_lot_size(),
            show_progress: true,
            start_date: None,
            end_date: None,
        }
    }
}

fn default_lot_size() -> f64 {
    100.0
}

impl BacktestConfig {
    /// Check the scalar configuration before any simulation work.
    pub fn validate(&self) -> Result<()> {
        if self.portfolio_count == 0 {
            return Err(BacktestError::ConfigError(
                "portfolio_count must be at least 1".to_string(),
            ));
        }
        if self.rebalance_frequency == 0 {
            return Err(BacktestError::ConfigError(
                "rebalance_frequency must be at least 1 trading day".to_string(),
            ));
        }
        if !self.initial_capital.is_finite() || self.initial_capital <= 0.0 {
            return Err(BacktestError::ConfigError(format!(
                "initial_capital must be positive, got {}",
                self.initial_capital
            )));
        }
        if !self.fractional_shares && !(self.lot_size.is_finite() && self.lot_size > 0.0) {
            return Err(BacktestError::ConfigError(format!(
                "lot_size must be positive when fractional shares are disabled, got {}",
                self.lot_size
            )));
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(BacktestError::ConfigError(format!(
                    "start_date {} is after end_date {}",
                    start, end
                )));
            }
        }
        self.cost_model.validate()
    }

    fn execution_settings(&self) -> ExecutionSettings {
        ExecutionSettings {
            cost_model: self.cost_model.clone(),
            fractional_shares: self.fractional_shares,
            lot_size: self.lot_size,
        }
    }
}

/// Results from a rolling rebalance run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    /// Configuration used.
    pub config: BacktestConfig,
    /// Per-day account values.
    pub account: AccountResult,
    /// Per-sub-portfolio turnover records.
    pub turnover: TurnoverTable,
    /// Final state of every sub-portfolio.
    pub portfolios: Vec<SubPortfolio>,
    /// Fees paid across all sub-portfolios.
    pub total_fees: f64,
    /// Data gaps and other recoverable conditions.
    pub diagnostics: Vec<Diagnostic>,
    /// First simulated date.
    pub start_date: NaiveDate,
    /// Last simulated date.
    pub end_date: NaiveDate,
    /// Number of simulated trading days.
    pub trading_days: usize,
    /// SHA256 hash of the configuration for change detection.
    #[serde(default)]
    pub config_hash: String,
    /// Size and checksum of every input file the run was built from.
    #[serde(default)]
    pub inputs: Vec<DataFileMetadata>,
}

impl BacktestResult {
    pub fn final_value(&self) -> f64 {
        self.account
            .final_value()
            .unwrap_or(self.config.initial_capital)
    }

    /// Simple return over the whole run.
    pub fn total_return(&self) -> f64 {
        self.final_value() / self.config.initial_capital - 1.0
    }

    /// Number of data-gap diagnostics.
    pub fn data_gap_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| matches!(d, Diagnostic::DataGap { .. }))
            .count()
    }
}

/// Mutable state carried from one simulated day to the next.
struct SimulationState {
    portfolios: Vec<SubPortfolio>,
    marks: PriceMap,
    marked_through: Option<NaiveDate>,
    points: Vec<AccountPoint>,
    diagnostics: Vec<Diagnostic>,
}

/// The rolling rebalance engine.
pub struct RollingBacktestEngine {
    config: BacktestConfig,
    calendar: Option<TradingCalendar>,
}

impl RollingBacktestEngine {
    /// Create a new engine.
    pub fn new(config: BacktestConfig) -> Self {
        Self {
            config,
            calendar: None,
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(BacktestConfig::default())
    }

    /// Simulate on an explicit trading-day calendar instead of the weight
    /// matrix's own dates.
    pub fn with_calendar(mut self, calendar: TradingCalendar) -> Self {
        self.calendar = Some(calendar);
        self
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    /// The trading-day grid the simulation walks: the calendar (or the weight
    /// dates) clipped to the weight matrix span and the configured window.
    pub fn simulation_dates(&self, weights: &WeightMatrix) -> Vec<NaiveDate> {
        let (Some(first), Some(last)) = (weights.first_date(), weights.last_date()) else {
            return Vec::new();
        };
        let start = self.config.start_date.map_or(first, |s| s.max(first));
        let end = self.config.end_date.map_or(last, |e| e.min(last));
        if start > end {
            return Vec::new();
        }

        match &self.calendar {
            Some(calendar) => calendar.between(start, end),
            None => weights
                .dates()
                .into_iter()
                .filter(|d| *d >= start && *d <= end)
                .collect(),
        }
    }

    /// Run the simulation.
    pub fn run(&self, weights: &WeightMatrix, prices: &PriceTable) -> Result<BacktestResult> {
        self.config.validate()?;
        if weights.is_empty() {
            return Err(BacktestError::ConfigError("weight matrix is empty".to_string()));
        }
        if prices.is_empty() {
            return Err(BacktestError::ConfigError("price table is empty".to_string()));
        }
        weights.validate()?;

        let dates = self.simulation_dates(weights);
        let (Some(&start_date), Some(&end_date)) = (dates.first(), dates.last()) else {
            return Err(BacktestError::ConfigError(
                "no trading dates in the simulation window".to_string(),
            ));
        };

        let count = self.config.portfolio_count;
        let schedule = RebalanceSchedule::new(count, self.config.rebalance_frequency, dates.len());
        let settings = self.config.execution_settings();
        let field = self.config.price_field;

        info!(
            "Running rolling backtest: {} sub-portfolios, rebalance every {} days, {} to {} ({} days)",
            count,
            self.config.rebalance_frequency,
            start_date,
            end_date,
            dates.len()
        );
        debug!("Sub-portfolio offsets: {:?}", schedule.offsets());

        let capital_per_portfolio = self.config.initial_capital / count as f64;
        let mut state = SimulationState {
            portfolios: schedule
                .offsets()
                .iter()
                .enumerate()
                .map(|(i, &offset)| SubPortfolio::new(i, offset, capital_per_portfolio))
                .collect(),
            marks: PriceMap::new(),
            marked_through: None,
            points: Vec::with_capacity(dates.len()),
            diagnostics: Vec::new(),
        };

        for (portfolio, offset) in schedule.never_deployed() {
            let diagnostic = Diagnostic::NeverDeployed { portfolio, offset };
            warn!("{}", diagnostic);
            state.diagnostics.push(diagnostic);
        }

        // Setup progress bar
        let progress = if self.config.show_progress {
            let pb = ProgressBar::new(dates.len() as u64);
            let style = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
                .map(|s| s.progress_chars("#>-"))
                .unwrap_or_else(|_| ProgressStyle::default_bar());
            pb.set_style(style);
            Some(pb)
        } else {
            None
        };

        for (day, &date) in dates.iter().enumerate() {
            self.step(&mut state, day, date, weights, prices, &schedule, &settings, field);

            if let Some(ref pb) = progress {
                pb.inc(1);
            }
        }

        if let Some(pb) = progress {
            pb.finish_with_message("Backtest complete");
        }

        let result = self.calculate_results(state, start_date, end_date, dates.len());

        info!(
            "Backtest complete: final value {:.2} ({:+.2}%), fees {:.2}, {} data gaps",
            result.final_value(),
            result.total_return() * 100.0,
            result.total_fees,
            result.data_gap_count()
        );

        Ok(result)
    }

    /// Advance the simulation by one trading day.
    #[allow(clippy::too_many_arguments)]
    fn step(
        &self,
        state: &mut SimulationState,
        day: usize,
        date: NaiveDate,
        weights: &WeightMatrix,
        prices: &PriceTable,
        schedule: &RebalanceSchedule,
        settings: &ExecutionSettings,
        field: PriceField,
    ) {
        prices.advance_marks(&mut state.marks, state.marked_through, date, field);
        state.marked_through = Some(date);
        let today = prices.prices_on(date, field);

        for portfolio in state.portfolios.iter_mut() {
            if !schedule.is_rebalance_day(portfolio.index, day) {
                continue;
            }
            match weights.row(date) {
                Some(row) if !row.is_empty() => {
                    let report = portfolio.rebalance(date, row, &today, &state.marks, settings);
                    debug!(
                        "{} sub-portfolio {}: pre-value {:.2}, sold {:.2}, bought {:.2}, fees {:.2}, turnover {:?}",
                        date,
                        portfolio.index,
                        report.pre_value,
                        report.sold_notional,
                        report.bought_notional,
                        report.fees,
                        report.turnover
                    );
                    for gap in report.gaps {
                        warn!("{}", gap);
                        state.diagnostics.push(gap);
                    }
                }
                _ => debug!(
                    "{} sub-portfolio {}: no weight row, holding positions",
                    date, portfolio.index
                ),
            }
        }

        let sub_values: Vec<f64> = state
            .portfolios
            .iter()
            .map(|p| p.valuation(&state.marks))
            .collect();
        let cash: f64 = state.portfolios.iter().map(|p| p.cash).sum();
        let positions_value: f64 = state
            .portfolios
            .iter()
            .map(|p| p.positions_value(&state.marks))
            .sum();
        let total_value: f64 = sub_values.iter().sum();

        state.points.push(AccountPoint {
            date,
            total_value,
            cash,
            positions_value,
            sub_values,
        });
    }

    /// Calculate results from the final simulation state.
    fn calculate_results(
        &self,
        state: SimulationState,
        start_date: NaiveDate,
        end_date: NaiveDate,
        trading_days: usize,
    ) -> BacktestResult {
        let turnover = TurnoverTable {
            portfolios: state
                .portfolios
                .iter()
                .map(|p| SubPortfolioTurnover {
                    index: p.index,
                    offset: p.offset,
                    records: p.turnover.clone(),
                })
                .collect(),
        };
        let total_fees = state.portfolios.iter().map(|p| p.fees_paid).sum();

        BacktestResult {
            config: self.config.clone(),
            account: AccountResult {
                initial_capital: self.config.initial_capital,
                points: state.points,
            },
            turnover,
            portfolios: state.portfolios,
            total_fees,
            diagnostics: state.diagnostics,
            start_date,
            end_date,
            trading_days,
            config_hash: compute_config_hash(&self.config),
            inputs: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use crate::types::{ExecutionPrice, GapKind};

    fn trading_days(n: usize) -> Vec<NaiveDate> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        start
            .iter_days()
            .filter(|d| chrono::Datelike::weekday(d).number_from_monday() <= 5)
            .take(n)
            .collect()
    }

    fn test_config(portfolio_count: usize, rebalance_frequency: usize) -> BacktestConfig {
        BacktestConfig {
            initial_capital: 1_000_000.0,
            portfolio_count,
            rebalance_frequency,
            cost_model: CostModel::zero(),
            show_progress: false,
            ..Default::default()
        }
    }

    fn constant_inputs(days: &[NaiveDate], price: f64) -> (WeightMatrix, PriceTable) {
        let mut weights = WeightMatrix::new();
        let mut prices = PriceTable::new();
        for &date in days {
            weights.insert(date, "000001.XSHE", 1.0);
            prices.insert("000001.XSHE", date, ExecutionPrice::flat(price));
        }
        (weights, prices)
    }

    #[test]
    fn test_config_validation() {
        assert!(test_config(1, 1).validate().is_ok());
        assert!(matches!(
            test_config(0, 5).validate(),
            Err(BacktestError::ConfigError(_))
        ));
        assert!(matches!(
            test_config(5, 0).validate(),
            Err(BacktestError::ConfigError(_))
        ));
        let negative_capital = BacktestConfig {
            initial_capital: -1.0,
            ..test_config(1, 1)
        };
        assert!(negative_capital.validate().is_err());
    }

    #[test]
    fn test_empty_inputs_rejected() {
        let engine = RollingBacktestEngine::new(test_config(1, 1));
        let days = trading_days(3);
        let (weights, prices) = constant_inputs(&days, 10.0);

        assert!(matches!(
            engine.run(&WeightMatrix::new(), &prices),
            Err(BacktestError::ConfigError(_))
        ));
        assert!(matches!(
            engine.run(&weights, &PriceTable::new()),
            Err(BacktestError::ConfigError(_))
        ));
    }

    #[test]
    fn test_negative_weight_rejected() {
        let engine = RollingBacktestEngine::new(test_config(1, 1));
        let days = trading_days(3);
        let (mut weights, prices) = constant_inputs(&days, 10.0);
        weights.insert(days[1], "000002.XSHE", -0.5);

        assert!(matches!(
            engine.run(&weights, &prices),
            Err(BacktestError::ConfigError(_))
        ));
    }

    #[test]
    fn test_constant_price_keeps_value() {
        let days = trading_days(10);
        let (weights, prices) = constant_inputs(&days, 10.0);
        let engine = RollingBacktestEngine::new(test_config(2, 4));
        let result = engine.run(&weights, &prices).unwrap();

        assert_eq!(result.trading_days, 10);
        assert_eq!(result.account.len(), 10);
        for point in &result.account.points {
            assert_eq!(point.total_value, 1_000_000.0);
        }
        assert_eq!(result.total_fees, 0.0);
        assert!(result.diagnostics.is_empty());
    }

    #[test]
    fn test_sub_portfolios_deploy_on_their_offsets() {
        let days = trading_days(12);
        let (weights, prices) = constant_inputs(&days, 10.0);
        let engine = RollingBacktestEngine::new(test_config(4, 8));
        let result = engine.run(&weights, &prices).unwrap();

        let first_dates: Vec<NaiveDate> = result
            .turnover
            .portfolios
            .iter()
            .map(|p| p.records[0].date)
            .collect();
        assert_eq!(first_dates, vec![days[0], days[2], days[4], days[6]]);

        // Before its offset a sub-portfolio is all cash.
        let day1 = &result.account.points[1];
        assert_eq!(day1.sub_values[1], 250_000.0);
        assert_eq!(result.portfolios[1].turnover.len(), 2);
    }

    #[test]
    fn test_reconciliation_each_day() {
        let days = trading_days(15);
        let mut weights = WeightMatrix::new();
        let mut prices = PriceTable::new();
        for (i, &date) in days.iter().enumerate() {
            let drift = 1.0 + 0.01 * i as f64;
            prices.insert("A", date, ExecutionPrice::flat(10.0 * drift));
            prices.insert("B", date, ExecutionPrice::flat(20.0 / drift));
            let w = if i % 2 == 0 { 0.7 } else { 0.3 };
            weights.insert(date, "A", w);
            weights.insert(date, "B", 1.0 - w);
        }
        let config = BacktestConfig {
            cost_model: CostModel::default(),
            ..test_config(3, 5)
        };
        let result = RollingBacktestEngine::new(config).run(&weights, &prices).unwrap();

        for point in &result.account.points {
            let sum: f64 = point.sub_values.iter().sum();
            assert_eq!(point.total_value, sum);
            assert!((point.cash + point.positions_value - point.total_value).abs() < 1e-6);
        }
        assert!(result.total_fees > 0.0);
    }

    #[test]
    fn test_missing_weight_row_holds() {
        let days = trading_days(6);
        let (mut weights, prices) = constant_inputs(&days, 10.0);
        weights.set_row(days[0], BTreeMap::new());
        let result = RollingBacktestEngine::new(test_config(1, 1))
            .run(&weights, &prices)
            .unwrap();

        // First non-empty row is the deployment; no record for the empty day.
        let records = &result.turnover.portfolios[0].records;
        assert_eq!(records[0].date, days[1]);
        assert_eq!(records[0].turnover, None);
        assert_eq!(records.len(), 5);
    }

    #[test]
    fn test_data_gap_is_recorded_not_fatal() {
        let days = trading_days(4);
        let (mut weights, prices) = constant_inputs(&days, 10.0);
        weights.insert(days[0], "000001.XSHE", 0.5);
        weights.insert(days[0], "600000.XSHG", 0.5);

        let result = RollingBacktestEngine::new(test_config(1, 2))
            .run(&weights, &prices)
            .unwrap();

        assert_eq!(result.data_gap_count(), 1);
        assert!(matches!(
            result.diagnostics[0],
            Diagnostic::DataGap { kind: GapKind::NeverPriced, .. }
        ));
        assert!((result.account.points[0].cash - 500_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_calendar_and_window_clip_grid() {
        let days = trading_days(10);
        let (weights, prices) = constant_inputs(&days[2..8], 10.0);
        let config = BacktestConfig {
            start_date: Some(days[3]),
            ..test_config(1, 1)
        };
        let engine = RollingBacktestEngine::new(config).with_calendar(TradingCalendar::new(days.clone()));

        assert_eq!(engine.simulation_dates(&weights), days[3..8].to_vec());
    }

    #[test]
    fn test_forward_fill_marks_between_grid_days() {
        let days = trading_days(5);
        let mut weights = WeightMatrix::new();
        weights.insert(days[0], "A", 1.0);
        weights.insert(days[4], "A", 1.0);
        let mut prices = PriceTable::new();
        prices.insert("A", days[0], ExecutionPrice::flat(10.0));
        prices.insert("A", days[2], ExecutionPrice::flat(12.0));

        // Without a calendar the grid is the two weight dates; the day-2 price
        // still marks the position on the second grid day.
        let result = RollingBacktestEngine::new(test_config(1, 10))
            .run(&weights, &prices)
            .unwrap();
        assert_eq!(result.account.len(), 2);
        assert!((result.account.points[1].total_value - 1_200_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_never_deployed_diagnostic() {
        let days = trading_days(3);
        let (weights, prices) = constant_inputs(&days, 10.0);
        let result = RollingBacktestEngine::new(test_config(3, 9))
            .run(&weights, &prices)
            .unwrap();

        let never: Vec<_> = result
            .diagnostics
            .iter()
            .filter(|d| matches!(d, Diagnostic::NeverDeployed { .. }))
            .collect();
        assert_eq!(never.len(), 2);
        assert!((result.account.points[2].total_value - 1_000_000.0).abs() < 1e-6);
    }
}

//! Core data types shared by the rebalance engine and the analyzer.

use crate::error::{BacktestError, Result};
use crate::selection::TradabilityMask;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Bound;

/// Latest known price per instrument, used for mark-to-market.
pub type PriceMap = BTreeMap<String, f64>;

/// Which VWAP variant drives execution and valuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PriceField {
    /// Raw traded VWAP.
    Unadjusted,
    /// Corporate-action adjusted (post-adjusted) VWAP.
    #[default]
    Adjusted,
}

impl fmt::Display for PriceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriceField::Unadjusted => write!(f, "unadjusted"),
            PriceField::Adjusted => write!(f, "adjusted"),
        }
    }
}

/// Pair of execution prices for one (instrument, date).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ExecutionPrice {
    pub unadjusted: Option<f64>,
    pub adjusted: Option<f64>,
}

impl ExecutionPrice {
    pub fn new(unadjusted: Option<f64>, adjusted: Option<f64>) -> Self {
        Self {
            unadjusted,
            adjusted,
        }
    }

    /// Same price for both variants.
    pub fn flat(price: f64) -> Self {
        Self::new(Some(price), Some(price))
    }

    /// Usable price for the requested variant. Non-finite and non-positive
    /// values count as missing.
    pub fn get(&self, field: PriceField) -> Option<f64> {
        let value = match field {
            PriceField::Unadjusted => self.unadjusted,
            PriceField::Adjusted => self.adjusted,
        };
        value.filter(|p| p.is_finite() && *p > 0.0)
    }
}

/// Day-indexed target weights per instrument.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightMatrix {
    rows: BTreeMap<NaiveDate, BTreeMap<String, f64>>,
}

impl WeightMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a single cell, creating the row if needed.
    pub fn insert(&mut self, date: NaiveDate, instrument: impl Into<String>, weight: f64) {
        self.rows
            .entry(date)
            .or_default()
            .insert(instrument.into(), weight);
    }

    /// Replace a whole row. An empty row marks a date with no rebalance signal.
    pub fn set_row(&mut self, date: NaiveDate, row: BTreeMap<String, f64>) {
        self.rows.insert(date, row);
    }

    pub fn row(&self, date: NaiveDate) -> Option<&BTreeMap<String, f64>> {
        self.rows.get(&date)
    }

    pub fn rows(&self) -> impl Iterator<Item = (&NaiveDate, &BTreeMap<String, f64>)> {
        self.rows.iter()
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        self.rows.keys().copied().collect()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.rows.keys().next().copied()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.rows.keys().next_back().copied()
    }

    /// Every instrument that appears in at least one row.
    pub fn instruments(&self) -> BTreeSet<String> {
        self.rows
            .values()
            .flat_map(|row| row.keys().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Reject negative or non-finite weights. Rows that do not sum to one are
    /// accepted as partial investment.
    pub fn validate(&self) -> Result<()> {
        for (date, row) in &self.rows {
            for (instrument, weight) in row {
                if !weight.is_finite() {
                    return Err(BacktestError::ConfigError(format!(
                        "non-finite weight {} for {} on {}",
                        weight, instrument, date
                    )));
                }
                if *weight < 0.0 {
                    return Err(BacktestError::ConfigError(format!(
                        "negative weight {} for {} on {}",
                        weight, instrument, date
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Sparse (instrument, date) -> execution price table, stored date-major.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceTable {
    by_date: BTreeMap<NaiveDate, BTreeMap<String, ExecutionPrice>>,
}

impl PriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, instrument: impl Into<String>, date: NaiveDate, price: ExecutionPrice) {
        self.by_date
            .entry(date)
            .or_default()
            .insert(instrument.into(), price);
    }

    pub fn get(&self, instrument: &str, date: NaiveDate) -> Option<&ExecutionPrice> {
        self.by_date.get(&date).and_then(|row| row.get(instrument))
    }

    /// Usable price of one variant on exactly `date`.
    pub fn price(&self, instrument: &str, date: NaiveDate, field: PriceField) -> Option<f64> {
        self.get(instrument, date).and_then(|p| p.get(field))
    }

    /// All usable prices of one variant on exactly `date`.
    pub fn prices_on(&self, date: NaiveDate, field: PriceField) -> PriceMap {
        self.by_date
            .get(&date)
            .map(|row| {
                row.iter()
                    .filter_map(|(id, p)| p.get(field).map(|v| (id.clone(), v)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Fold every usable price in `(after, through]` into `marks`, oldest first.
    /// Passing `None` for `after` starts from the beginning of the table.
    pub fn advance_marks(
        &self,
        marks: &mut PriceMap,
        after: Option<NaiveDate>,
        through: NaiveDate,
        field: PriceField,
    ) {
        let lower = match after {
            Some(d) => Bound::Excluded(d),
            None => Bound::Unbounded,
        };
        for (_, row) in self.by_date.range((lower, Bound::Included(through))) {
            for (id, p) in row {
                if let Some(v) = p.get(field) {
                    marks.insert(id.clone(), v);
                }
            }
        }
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        self.by_date.keys().copied().collect()
    }

    pub fn instruments(&self) -> BTreeSet<String> {
        self.by_date
            .values()
            .flat_map(|row| row.keys().cloned())
            .collect()
    }

    /// Number of (instrument, date) rows.
    pub fn len(&self) -> usize {
        self.by_date.values().map(|row| row.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_date.values().all(|row| row.is_empty())
    }
}

/// Ordered, de-duplicated list of valid trading dates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradingCalendar {
    dates: Vec<NaiveDate>,
}

impl TradingCalendar {
    pub fn new(mut dates: Vec<NaiveDate>) -> Self {
        dates.sort_unstable();
        dates.dedup();
        Self { dates }
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    /// Trading dates within `[start, end]`.
    pub fn between(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        self.dates
            .iter()
            .copied()
            .filter(|d| *d >= start && *d <= end)
            .collect()
    }

    /// The trading date immediately before `date`.
    pub fn previous(&self, date: NaiveDate) -> Option<NaiveDate> {
        let idx = self.dates.partition_point(|d| *d < date);
        idx.checked_sub(1).map(|i| self.dates[i])
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

/// Where the benchmark series comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BenchmarkKind {
    /// A published index level read from a file.
    #[default]
    Index,
    /// Daily equal-weight average return of a stock universe, compounded.
    EqualWeight,
}

impl fmt::Display for BenchmarkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BenchmarkKind::Index => write!(f, "index"),
            BenchmarkKind::EqualWeight => write!(f, "equal_weight"),
        }
    }
}

/// Date-indexed benchmark price series.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkSeries {
    pub name: String,
    points: BTreeMap<NaiveDate, f64>,
}

impl BenchmarkSeries {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            points: BTreeMap::new(),
        }
    }

    pub fn from_points(name: impl Into<String>, points: impl IntoIterator<Item = (NaiveDate, f64)>) -> Self {
        Self {
            name: name.into(),
            points: points.into_iter().collect(),
        }
    }

    /// Equal-weight benchmark over `universe`, one point per price table date.
    ///
    /// Each day's return is the plain mean of the simple returns of universe
    /// members priced that day, measured against their last known price.
    /// Members masked as untradable that day are left out of the mean. The
    /// level starts at 1.0 on the first date and stays flat on days with no
    /// contributing member.
    pub fn equal_weight(
        name: impl Into<String>,
        prices: &PriceTable,
        universe: &BTreeSet<String>,
        mask: Option<&TradabilityMask>,
        field: PriceField,
    ) -> Result<Self> {
        if universe.is_empty() {
            return Err(BacktestError::DataError(
                "equal-weight benchmark needs a non-empty universe".to_string(),
            ));
        }

        let mut last = PriceMap::new();
        let mut level = 1.0;
        let mut points = BTreeMap::new();
        for (date, row) in &prices.by_date {
            let mut sum = 0.0;
            let mut count = 0usize;
            for id in universe {
                let Some(price) = row.get(id).and_then(|p| p.get(field)) else {
                    continue;
                };
                let Some(prev) = last.insert(id.clone(), price) else {
                    continue;
                };
                if mask.map_or(true, |m| m.is_tradable(*date, id)) {
                    sum += price / prev - 1.0;
                    count += 1;
                }
            }
            if count > 0 {
                level *= 1.0 + sum / count as f64;
            }
            points.insert(*date, level);
        }

        if points.is_empty() {
            return Err(BacktestError::NoData);
        }
        Ok(Self {
            name: name.into(),
            points,
        })
    }

    pub fn insert(&mut self, date: NaiveDate, value: f64) {
        self.points.insert(date, value);
    }

    /// Forward-filled value as of `date`.
    pub fn value_at_or_before(&self, date: NaiveDate) -> Option<f64> {
        self.points.range(..=date).next_back().map(|(_, v)| *v)
    }

    /// Last observation strictly before `date`.
    pub fn value_before(&self, date: NaiveDate) -> Option<f64> {
        self.points.range(..date).next_back().map(|(_, v)| *v)
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.points.keys().next().copied()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.points.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Account state at the close of one simulated day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountPoint {
    pub date: NaiveDate,
    /// Sum of `sub_values`.
    pub total_value: f64,
    pub cash: f64,
    pub positions_value: f64,
    /// Valuation of each sub-portfolio, indexed by sub-portfolio.
    pub sub_values: Vec<f64>,
}

/// Per-day total account value series.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountResult {
    pub initial_capital: f64,
    pub points: Vec<AccountPoint>,
}

impl AccountResult {
    pub fn dates(&self) -> Vec<NaiveDate> {
        self.points.iter().map(|p| p.date).collect()
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.total_value).collect()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.points.first().map(|p| p.date)
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.points.last().map(|p| p.date)
    }

    pub fn final_value(&self) -> Option<f64> {
        self.points.last().map(|p| p.total_value)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Turnover of one rebalance. `None` marks the initial cash deployment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TurnoverRecord {
    pub date: NaiveDate,
    pub turnover: Option<f64>,
}

/// Turnover history of a single sub-portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubPortfolioTurnover {
    pub index: usize,
    pub offset: usize,
    pub records: Vec<TurnoverRecord>,
}

/// Turnover records for every sub-portfolio.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnoverTable {
    pub portfolios: Vec<SubPortfolioTurnover>,
}

impl TurnoverTable {
    /// Every defined turnover value across all sub-portfolios.
    pub fn non_null(&self) -> Vec<f64> {
        self.portfolios
            .iter()
            .flat_map(|p| p.records.iter().filter_map(|r| r.turnover))
            .collect()
    }

    /// Mean of the defined turnover values, `None` when there are none.
    pub fn mean(&self) -> Option<f64> {
        let values = self.non_null();
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    }

    /// Date x sub-portfolio layout. A cell is `None` when the sub-portfolio
    /// did not rebalance that day or when it was its first deployment.
    pub fn to_wide(&self) -> Vec<(NaiveDate, Vec<Option<f64>>)> {
        let mut grid: BTreeMap<NaiveDate, Vec<Option<f64>>> = BTreeMap::new();
        let width = self.portfolios.len();
        for (col, portfolio) in self.portfolios.iter().enumerate() {
            for record in &portfolio.records {
                grid.entry(record.date).or_insert_with(|| vec![None; width])[col] = record.turnover;
            }
        }
        grid.into_iter().collect()
    }
}

/// Why an instrument could not be traded on a rebalance date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GapKind {
    /// Priced earlier but not on the rebalance date.
    Halted,
    /// Never priced up to and including the rebalance date.
    NeverPriced,
    /// Held position that should be sold but has no price; kept at its last price.
    FrozenHolding,
}

impl fmt::Display for GapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GapKind::Halted => write!(f, "halted"),
            GapKind::NeverPriced => write!(f, "never priced"),
            GapKind::FrozenHolding => write!(f, "frozen holding"),
        }
    }
}

/// Recoverable condition attached to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Diagnostic {
    /// An instrument was skipped at a rebalance for lack of a price.
    DataGap {
        date: NaiveDate,
        portfolio: usize,
        instrument: String,
        kind: GapKind,
    },
    /// Buy orders existed but no share count fit the cash left after fees.
    BuysUnaffordable {
        date: NaiveDate,
        portfolio: usize,
        cash: f64,
    },
    /// A sub-portfolio whose offset falls beyond the last simulated date.
    NeverDeployed { portfolio: usize, offset: usize },
    /// A metric fell back to its defined default or is undefined.
    Degenerate { metric: String, reason: String },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::DataGap {
                date,
                portfolio,
                instrument,
                kind,
            } => write!(
                f,
                "data gap on {} in sub-portfolio {}: {} ({})",
                date, portfolio, instrument, kind
            ),
            Diagnostic::BuysUnaffordable {
                date,
                portfolio,
                cash,
            } => write!(
                f,
                "no buy affordable on {} in sub-portfolio {}: cash {:.2} after fees",
                date, portfolio, cash
            ),
            Diagnostic::NeverDeployed { portfolio, offset } => write!(
                f,
                "sub-portfolio {} never deployed (offset {} beyond simulation window)",
                portfolio, offset
            ),
            Diagnostic::Degenerate { metric, reason } => write!(f, "{}: {}", metric, reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    #[test]
    fn test_execution_price_field_selection() {
        let p = ExecutionPrice::new(Some(10.0), Some(25.0));
        assert_eq!(p.get(PriceField::Unadjusted), Some(10.0));
        assert_eq!(p.get(PriceField::Adjusted), Some(25.0));

        let bad = ExecutionPrice::new(Some(f64::NAN), Some(0.0));
        assert_eq!(bad.get(PriceField::Unadjusted), None);
        assert_eq!(bad.get(PriceField::Adjusted), None);
    }

    #[test]
    fn test_weight_matrix_rejects_negative_weight() {
        let mut weights = WeightMatrix::new();
        weights.insert(d(2), "A", 0.6);
        weights.insert(d(2), "B", -0.1);
        assert!(matches!(
            weights.validate(),
            Err(BacktestError::ConfigError(_))
        ));
    }

    #[test]
    fn test_weight_matrix_accepts_partial_row() {
        let mut weights = WeightMatrix::new();
        weights.insert(d(2), "A", 0.3);
        weights.set_row(d(3), BTreeMap::new());
        assert!(weights.validate().is_ok());
        assert_eq!(weights.len(), 2);
        assert_eq!(weights.first_date(), Some(d(2)));
        assert_eq!(weights.last_date(), Some(d(3)));
    }

    #[test]
    fn test_prices_on_skips_missing_variant() {
        let mut prices = PriceTable::new();
        prices.insert("A", d(2), ExecutionPrice::flat(10.0));
        prices.insert("B", d(2), ExecutionPrice::new(Some(11.0), None));

        let adjusted = prices.prices_on(d(2), PriceField::Adjusted);
        assert_eq!(adjusted.len(), 1);
        assert_eq!(adjusted.get("A"), Some(&10.0));
        assert_eq!(prices.prices_on(d(2), PriceField::Unadjusted).get("B"), Some(&11.0));
        assert!(prices.prices_on(d(3), PriceField::Adjusted).is_empty());
        assert_eq!(prices.len(), 2);
    }

    #[test]
    fn test_equal_weight_benchmark_compounds_masked_mean() {
        let mut prices = PriceTable::new();
        for (id, values) in [
            ("A", [Some(10.0), Some(11.0), Some(11.0), None]),
            ("B", [Some(20.0), Some(19.0), Some(22.0), Some(24.2)]),
            ("C", [Some(5.0), Some(10.0), Some(20.0), Some(40.0)]),
        ] {
            for (i, v) in values.iter().enumerate() {
                if let Some(v) = v {
                    prices.insert(id, d(2 + i as u32), ExecutionPrice::flat(*v));
                }
            }
        }
        let universe: BTreeSet<String> = ["A", "B"].iter().map(|s| s.to_string()).collect();
        let mut mask = TradabilityMask::new();
        mask.insert(d(4), "B", false);

        let bench = BenchmarkSeries::equal_weight("EW", &prices, &universe, Some(&mask), PriceField::Adjusted)
            .unwrap();

        assert_eq!(bench.name, "EW");
        assert_eq!(bench.len(), 4);
        assert_eq!(bench.value_at_or_before(d(2)), Some(1.0));
        // (+10% and -5%) / 2
        assert!((bench.value_at_or_before(d(3)).unwrap() - 1.025).abs() < 1e-12);
        // B is masked, A is flat
        assert!((bench.value_at_or_before(d(4)).unwrap() - 1.025).abs() < 1e-12);
        // A has no price, B gains 10% from its last price
        assert!((bench.value_at_or_before(d(5)).unwrap() - 1.1275).abs() < 1e-12);
    }

    #[test]
    fn test_equal_weight_benchmark_without_mask_uses_every_member() {
        let mut prices = PriceTable::new();
        prices.insert("A", d(2), ExecutionPrice::flat(10.0));
        prices.insert("B", d(2), ExecutionPrice::flat(10.0));
        prices.insert("A", d(3), ExecutionPrice::flat(12.0));
        prices.insert("B", d(3), ExecutionPrice::flat(9.0));
        let universe: BTreeSet<String> = ["A", "B"].iter().map(|s| s.to_string()).collect();

        let bench = BenchmarkSeries::equal_weight("EW", &prices, &universe, None, PriceField::Adjusted)
            .unwrap();
        assert!((bench.value_at_or_before(d(3)).unwrap() - 1.05).abs() < 1e-12);
    }

    #[test]
    fn test_equal_weight_benchmark_rejects_empty_universe() {
        let mut prices = PriceTable::new();
        prices.insert("A", d(2), ExecutionPrice::flat(10.0));
        assert!(matches!(
            BenchmarkSeries::equal_weight("EW", &prices, &BTreeSet::new(), None, PriceField::Adjusted),
            Err(BacktestError::DataError(_))
        ));
        let universe: BTreeSet<String> = ["A"].iter().map(|s| s.to_string()).collect();
        assert!(matches!(
            BenchmarkSeries::equal_weight("EW", &PriceTable::new(), &universe, None, PriceField::Adjusted),
            Err(BacktestError::NoData)
        ));
    }

    #[test]
    fn test_advance_marks_respects_bounds() {
        let mut prices = PriceTable::new();
        prices.insert("A", d(2), ExecutionPrice::flat(10.0));
        prices.insert("A", d(3), ExecutionPrice::flat(12.0));
        prices.insert("B", d(4), ExecutionPrice::flat(5.0));

        let mut marks = PriceMap::new();
        prices.advance_marks(&mut marks, None, d(2), PriceField::Adjusted);
        assert_eq!(marks.get("A"), Some(&10.0));
        assert!(!marks.contains_key("B"));

        prices.advance_marks(&mut marks, Some(d(2)), d(4), PriceField::Adjusted);
        assert_eq!(marks.get("A"), Some(&12.0));
        assert_eq!(marks.get("B"), Some(&5.0));
    }

    #[test]
    fn test_calendar_previous() {
        let cal = TradingCalendar::new(vec![d(5), d(2), d(3), d(3)]);
        assert_eq!(cal.len(), 3);
        assert_eq!(cal.previous(d(3)), Some(d(2)));
        assert_eq!(cal.previous(d(4)), Some(d(3)));
        assert_eq!(cal.previous(d(2)), None);
        assert_eq!(cal.between(d(3), d(5)), vec![d(3), d(5)]);
    }

    #[test]
    fn test_turnover_table_wide_layout() {
        let table = TurnoverTable {
            portfolios: vec![
                SubPortfolioTurnover {
                    index: 0,
                    offset: 0,
                    records: vec![
                        TurnoverRecord { date: d(2), turnover: None },
                        TurnoverRecord { date: d(4), turnover: Some(0.6) },
                    ],
                },
                SubPortfolioTurnover {
                    index: 1,
                    offset: 1,
                    records: vec![TurnoverRecord { date: d(3), turnover: None }],
                },
            ],
        };

        let wide = table.to_wide();
        assert_eq!(wide.len(), 3);
        assert_eq!(wide[2], (d(4), vec![Some(0.6), None]));
        assert_eq!(table.mean(), Some(0.6));
    }
}

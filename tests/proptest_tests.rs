//! Property-based tests using proptest for invariant testing.
//!
//! These tests verify that, under random weights and prices:
//! 1. The account total always equals the sum of sub-portfolio valuations
//! 2. Turnover after the first deployment stays within [0, 1]
//! 3. Max drawdown stays within [0, 1] and is zero only for non-decreasing paths
//! 4. Repeated runs are bit-identical

use chrono::NaiveDate;
use proptest::prelude::*;

use stagger::analytics::{max_drawdown, PerformanceAnalyzer};
use stagger::engine::{BacktestConfig, RollingBacktestEngine};
use stagger::portfolio::CostModel;
use stagger::types::{BenchmarkSeries, ExecutionPrice, PriceTable, WeightMatrix};

const INSTRUMENTS: [&str; 3] = ["000001.XSHE", "600000.XSHG", "300750.XSHE"];

// ============================================================================
// Input Generators
// ============================================================================

#[derive(Debug, Clone)]
struct Scenario {
    weights: Vec<Vec<f64>>,
    prices: Vec<Vec<Option<f64>>>,
    portfolio_count: usize,
    rebalance_frequency: usize,
    with_costs: bool,
}

fn scenario_strategy() -> impl Strategy<Value = Scenario> {
    (15usize..50).prop_flat_map(|days| {
        (
            prop::collection::vec(prop::collection::vec(0.0..1.0f64, INSTRUMENTS.len()), days),
            prop::collection::vec(
                prop::collection::vec(
                    prop::option::weighted(0.9, 1.0..100.0f64),
                    INSTRUMENTS.len(),
                ),
                days,
            ),
            1usize..6,
            1usize..10,
            any::<bool>(),
        )
            .prop_map(
                |(weights, prices, portfolio_count, rebalance_frequency, with_costs)| Scenario {
                    weights,
                    prices,
                    portfolio_count,
                    rebalance_frequency,
                    with_costs,
                },
            )
    })
}

fn day(i: usize) -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 1, 2).unwrap() + chrono::Duration::days(i as i64)
}

fn build_inputs(s: &Scenario) -> (WeightMatrix, PriceTable, BenchmarkSeries) {
    let mut weights = WeightMatrix::new();
    for (i, row) in s.weights.iter().enumerate() {
        let total: f64 = row.iter().sum();
        let scale = if total > 1.0 { 1.0 / total } else { 1.0 };
        weights.set_row(
            day(i + 1),
            INSTRUMENTS
                .iter()
                .zip(row.iter())
                .map(|(id, w)| (id.to_string(), w * scale))
                .collect(),
        );
    }

    let mut prices = PriceTable::new();
    for (i, row) in s.prices.iter().enumerate() {
        for (id, price) in INSTRUMENTS.iter().zip(row.iter()) {
            if let Some(p) = price {
                prices.insert(*id, day(i + 1), ExecutionPrice::flat(*p));
            }
        }
    }

    let mut bench = BenchmarkSeries::new("BENCH");
    for i in 0..=s.weights.len() {
        bench.insert(day(i), 1000.0 + (i as f64 * 0.8).sin() * 25.0);
    }

    (weights, prices, bench)
}

fn config_for(s: &Scenario) -> BacktestConfig {
    BacktestConfig {
        initial_capital: 1_000_000.0,
        portfolio_count: s.portfolio_count,
        rebalance_frequency: s.rebalance_frequency,
        cost_model: if s.with_costs {
            CostModel::default()
        } else {
            CostModel::zero()
        },
        show_progress: false,
        ..Default::default()
    }
}

// ============================================================================
// Engine Invariants
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn account_total_equals_sum_of_sub_portfolios(s in scenario_strategy()) {
        let (weights, prices, _) = build_inputs(&s);
        let result = RollingBacktestEngine::new(config_for(&s)).run(&weights, &prices).unwrap();

        for point in &result.account.points {
            prop_assert_eq!(point.sub_values.len(), s.portfolio_count);
            let sum: f64 = point.sub_values.iter().sum();
            prop_assert_eq!(point.total_value, sum);
            prop_assert!(point.cash >= 0.0);
        }
    }

    #[test]
    fn turnover_after_first_deployment_is_bounded(s in scenario_strategy()) {
        let (weights, prices, _) = build_inputs(&s);
        let result = RollingBacktestEngine::new(config_for(&s)).run(&weights, &prices).unwrap();

        for portfolio in &result.turnover.portfolios {
            if let Some(first) = portfolio.records.first() {
                prop_assert!(first.turnover.is_none());
            }
            for record in portfolio.records.iter().skip(1) {
                prop_assert!(record.turnover.is_some(), "missing turnover on {}", record.date);
                if let Some(t) = record.turnover {
                    prop_assert!((-1e-12..=1.0 + 1e-9).contains(&t), "turnover {} out of range", t);
                }
            }
        }
    }

    #[test]
    fn max_drawdown_is_a_fraction(s in scenario_strategy()) {
        let (weights, prices, bench) = build_inputs(&s);
        let result = RollingBacktestEngine::new(config_for(&s)).run(&weights, &prices).unwrap();
        let report = PerformanceAnalyzer::with_defaults().analyze(&result, &bench).unwrap();

        let mdd = report.metrics.max_drawdown;
        prop_assert!((0.0..=1.0).contains(&mdd));

        let cumulative = report.cumulative.strategy();
        let non_decreasing = cumulative.windows(2).all(|w| w[1] >= w[0]);
        prop_assert_eq!(mdd == 0.0, non_decreasing);
    }

    #[test]
    fn repeated_runs_are_identical(s in scenario_strategy()) {
        let (weights, prices, bench) = build_inputs(&s);
        let engine = RollingBacktestEngine::new(config_for(&s));
        let analyzer = PerformanceAnalyzer::with_defaults();

        let first = engine.run(&weights, &prices).unwrap();
        let second = engine.run(&weights, &prices).unwrap();
        prop_assert_eq!(&first.account, &second.account);
        prop_assert_eq!(&first.turnover, &second.turnover);

        let a = analyzer.analyze(&first, &bench).unwrap().metrics.to_map();
        let b = analyzer.analyze(&second, &bench).unwrap().metrics.to_map();
        for (key, value) in &a {
            prop_assert_eq!(value.to_bits(), b[key].to_bits());
        }
    }
}

// ============================================================================
// Drawdown Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn drawdown_of_positive_series_is_bounded(values in prop::collection::vec(0.01..1000.0f64, 1..200)) {
        let dd = max_drawdown(&values);
        prop_assert!(dd.max_drawdown >= 0.0 && dd.max_drawdown < 1.0);
        if let (Some(peak), Some(trough)) = (dd.peak, dd.trough) {
            prop_assert!(peak < trough);
            prop_assert!(values[peak] > values[trough]);
        }
    }

    #[test]
    fn sorted_series_has_no_drawdown(mut values in prop::collection::vec(0.01..1000.0f64, 1..100)) {
        values.sort_by(|a, b| a.total_cmp(b));
        let dd = max_drawdown(&values);
        prop_assert_eq!(dd.max_drawdown, 0.0);
        prop_assert!(dd.peak.is_none());
    }
}

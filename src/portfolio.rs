//! Sub-portfolio state, transaction costs, and rebalance execution.

use crate::error::{BacktestError, Result};
use crate::types::{Diagnostic, GapKind, PriceMap, TurnoverRecord};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Halvings used when searching for the largest affordable buy size.
const BISECTION_STEPS: usize = 64;

/// A-share style transaction cost model.
///
/// Sells pay stamp tax and transfer fee; buys pay commission and transfer fee.
/// Each charged component is floored at `min_transaction_fee`, per instrument
/// transaction. A component whose rate is zero is not charged at all.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostModel {
    /// Stamp tax on sell notional.
    pub stamp_tax_rate: f64,
    /// Exchange transfer fee on both sides.
    pub transfer_fee_rate: f64,
    /// Broker commission on buy notional.
    pub commission_rate: f64,
    /// Floor applied to each charged fee component.
    pub min_transaction_fee: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            stamp_tax_rate: 0.0005,
            transfer_fee_rate: 0.00001,
            commission_rate: 0.0002,
            min_transaction_fee: 5.0,
        }
    }
}

impl CostModel {
    /// Create a zero-cost model.
    pub fn zero() -> Self {
        Self {
            stamp_tax_rate: 0.0,
            transfer_fee_rate: 0.0,
            commission_rate: 0.0,
            min_transaction_fee: 0.0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("stamp_tax_rate", self.stamp_tax_rate),
            ("transfer_fee_rate", self.transfer_fee_rate),
            ("commission_rate", self.commission_rate),
            ("min_transaction_fee", self.min_transaction_fee),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(BacktestError::ConfigError(format!(
                    "{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }

    fn component(&self, notional: f64, rate: f64) -> f64 {
        if notional <= 0.0 || rate <= 0.0 {
            0.0
        } else {
            (notional * rate).max(self.min_transaction_fee)
        }
    }

    /// Fees deducted from the proceeds of a sell.
    pub fn sell_fees(&self, notional: f64) -> f64 {
        self.component(notional, self.stamp_tax_rate)
            + self.component(notional, self.transfer_fee_rate)
    }

    /// Fees added to the cost of a buy.
    pub fn buy_fees(&self, notional: f64) -> f64 {
        self.component(notional, self.commission_rate)
            + self.component(notional, self.transfer_fee_rate)
    }
}

/// Execution knobs shared by every sub-portfolio.
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub cost_model: CostModel,
    pub fractional_shares: bool,
    pub lot_size: f64,
}

impl ExecutionSettings {
    /// Floor a share count to whole lots unless fractional shares are allowed.
    pub fn round_shares(&self, shares: f64) -> f64 {
        if self.fractional_shares || self.lot_size <= 0.0 {
            shares.max(0.0)
        } else {
            ((shares / self.lot_size).floor() * self.lot_size).max(0.0)
        }
    }

    /// Largest factor in `[0, 1]` by which buy orders can be shrunk so that
    /// their cost including fees fits in `cash`.
    ///
    /// Floored fees make the cost a step function of the scale, so the factor
    /// is found by bisection rather than by solving the proportional part.
    fn affordable_scale(&self, orders: &[BuyOrder], cash: f64) -> f64 {
        if orders.is_empty() || cash <= 0.0 {
            return 0.0;
        }
        let total = |scale: f64| -> f64 {
            orders
                .iter()
                .map(|o| {
                    let notional = o.shares * scale * o.price;
                    notional + self.cost_model.buy_fees(notional)
                })
                .sum()
        };

        if total(1.0) <= cash {
            return 1.0;
        }
        let (mut lo, mut hi) = (0.0, 1.0);
        for _ in 0..BISECTION_STEPS {
            let mid = 0.5 * (lo + hi);
            if total(mid) <= cash {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Largest share count up to `shares` whose cost including fees is at
    /// most `cash`, respecting lot rounding.
    fn fit_shares(&self, shares: f64, price: f64, cash: f64) -> f64 {
        let fits = |s: f64| {
            let notional = s * price;
            notional + self.cost_model.buy_fees(notional) <= cash
        };
        if fits(shares) {
            return shares;
        }
        let (mut lo, mut hi) = (0.0, shares);
        for _ in 0..BISECTION_STEPS {
            let mid = 0.5 * (lo + hi);
            if fits(self.round_shares(mid)) {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        let fitted = self.round_shares(lo);
        if fits(fitted) {
            fitted
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone)]
struct BuyOrder {
    instrument: String,
    shares: f64,
    price: f64,
}

/// What happened during one rebalance of one sub-portfolio.
#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceReport {
    pub date: NaiveDate,
    pub pre_value: f64,
    pub sold_notional: f64,
    pub bought_notional: f64,
    pub fees: f64,
    pub turnover: Option<f64>,
    pub gaps: Vec<Diagnostic>,
}

/// One independently managed capital pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubPortfolio {
    pub index: usize,
    /// Phase within the rebalance cycle, in trading days.
    pub offset: usize,
    pub cash: f64,
    /// Instrument -> share count.
    pub holdings: BTreeMap<String, f64>,
    pub turnover: Vec<TurnoverRecord>,
    pub fees_paid: f64,
    deployed: bool,
}

impl SubPortfolio {
    pub fn new(index: usize, offset: usize, capital: f64) -> Self {
        Self {
            index,
            offset,
            cash: capital,
            holdings: BTreeMap::new(),
            turnover: Vec::new(),
            fees_paid: 0.0,
            deployed: false,
        }
    }

    /// Whether the sub-portfolio has executed its first rebalance.
    pub fn is_deployed(&self) -> bool {
        self.deployed
    }

    /// Mark-to-market value of held shares. A holding with no mark is valued at zero.
    pub fn positions_value(&self, marks: &PriceMap) -> f64 {
        self.holdings
            .iter()
            .map(|(id, shares)| shares * marks.get(id).copied().unwrap_or(0.0))
            .sum()
    }

    /// Cash plus mark-to-market value of held shares.
    pub fn valuation(&self, marks: &PriceMap) -> f64 {
        self.cash + self.positions_value(marks)
    }

    /// Trade towards `weights` at today's prices.
    ///
    /// `today` holds the prices quoted on `date`; `marks` must already include
    /// them. Instruments without a price today cannot be traded: a positive
    /// target is left as cash and a held position stays frozen.
    pub fn rebalance(
        &mut self,
        date: NaiveDate,
        weights: &BTreeMap<String, f64>,
        today: &PriceMap,
        marks: &PriceMap,
        settings: &ExecutionSettings,
    ) -> RebalanceReport {
        let pre_value = self.valuation(marks);
        let mut gaps = Vec::new();

        let mut targets: BTreeMap<String, f64> = BTreeMap::new();
        for (instrument, &weight) in weights {
            if weight <= 0.0 {
                continue;
            }
            match today.get(instrument) {
                Some(&price) => {
                    let shares = settings.round_shares(weight * pre_value / price);
                    targets.insert(instrument.clone(), shares);
                }
                None => {
                    let kind = if marks.contains_key(instrument) {
                        GapKind::Halted
                    } else {
                        GapKind::NeverPriced
                    };
                    gaps.push(Diagnostic::DataGap {
                        date,
                        portfolio: self.index,
                        instrument: instrument.clone(),
                        kind,
                    });
                }
            }
        }

        let mut sold = 0.0;
        let mut fees = 0.0;
        let held: Vec<(String, f64)> = self
            .holdings
            .iter()
            .map(|(id, shares)| (id.clone(), *shares))
            .collect();
        for (instrument, shares) in held {
            let Some(&price) = today.get(&instrument) else {
                let targeted = weights.get(&instrument).is_some_and(|w| *w > 0.0);
                if !targeted {
                    gaps.push(Diagnostic::DataGap {
                        date,
                        portfolio: self.index,
                        instrument: instrument.clone(),
                        kind: GapKind::FrozenHolding,
                    });
                }
                continue;
            };
            let target = targets.get(&instrument).copied().unwrap_or(0.0);
            if target >= shares {
                continue;
            }
            let notional = (shares - target) * price;
            let fee = settings.cost_model.sell_fees(notional);
            self.cash += notional - fee;
            fees += fee;
            sold += notional;
            if target > 0.0 {
                self.holdings.insert(instrument, target);
            } else {
                self.holdings.remove(&instrument);
            }
        }

        let orders: Vec<BuyOrder> = targets
            .iter()
            .filter_map(|(instrument, &target)| {
                let current = self.holdings.get(instrument).copied().unwrap_or(0.0);
                let price = today.get(instrument).copied()?;
                (target > current).then(|| BuyOrder {
                    instrument: instrument.clone(),
                    shares: target - current,
                    price,
                })
            })
            .collect();

        let scale = settings.affordable_scale(&orders, self.cash);
        if scale < 1.0 && !orders.is_empty() {
            debug!(
                "Sub-portfolio {} on {}: buys scaled by {:.6} to fit cash",
                self.index, date, scale
            );
        }

        let mut bought = 0.0;
        for order in &orders {
            // Summation order differs from the scale search, so each buy is
            // trimmed again against the cash actually left.
            let wanted = settings.round_shares(order.shares * scale);
            let shares = settings.fit_shares(wanted, order.price, self.cash);
            if shares <= 0.0 {
                continue;
            }
            let notional = shares * order.price;
            let fee = settings.cost_model.buy_fees(notional);
            self.cash -= notional + fee;
            fees += fee;
            bought += notional;
            *self.holdings.entry(order.instrument.clone()).or_insert(0.0) += shares;
        }
        if !orders.is_empty() && bought == 0.0 {
            gaps.push(Diagnostic::BuysUnaffordable {
                date,
                portfolio: self.index,
                cash: self.cash,
            });
        }

        let turnover = if !self.deployed || pre_value <= 0.0 {
            None
        } else {
            Some((sold + bought) / (2.0 * pre_value))
        };
        self.deployed = true;
        self.fees_paid += fees;
        self.turnover.push(TurnoverRecord { date, turnover });

        RebalanceReport {
            date,
            pre_value,
            sold_notional: sold,
            bought_notional: bought,
            fees,
            turnover,
            gaps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    fn prices(entries: &[(&str, f64)]) -> PriceMap {
        entries.iter().map(|(id, p)| (id.to_string(), *p)).collect()
    }

    fn weights(entries: &[(&str, f64)]) -> BTreeMap<String, f64> {
        entries.iter().map(|(id, w)| (id.to_string(), *w)).collect()
    }

    fn frictionless() -> ExecutionSettings {
        ExecutionSettings {
            cost_model: CostModel::zero(),
            fractional_shares: true,
            lot_size: 100.0,
        }
    }

    #[test]
    fn test_fee_components_floored_per_transaction() {
        let cost = CostModel {
            stamp_tax_rate: 0.001,
            transfer_fee_rate: 0.00001,
            commission_rate: 0.0003,
            min_transaction_fee: 5.0,
        };
        // 10_000 notional: stamp 10, transfer floored to 5
        assert!((cost.sell_fees(10_000.0) - 15.0).abs() < 1e-9);
        // commission 3 -> 5, transfer -> 5
        assert!((cost.buy_fees(10_000.0) - 10.0).abs() < 1e-9);
        assert_eq!(cost.buy_fees(0.0), 0.0);
    }

    #[test]
    fn test_zero_rate_component_not_charged() {
        let cost = CostModel {
            stamp_tax_rate: 0.0,
            transfer_fee_rate: 0.0,
            commission_rate: 0.0,
            min_transaction_fee: 5.0,
        };
        assert_eq!(cost.sell_fees(1_000.0), 0.0);
        assert_eq!(cost.buy_fees(1_000.0), 0.0);
    }

    #[test]
    fn test_cost_model_validation() {
        assert!(CostModel::default().validate().is_ok());
        let bad = CostModel {
            commission_rate: -0.001,
            ..CostModel::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_round_shares_to_lots() {
        let settings = ExecutionSettings {
            cost_model: CostModel::zero(),
            fractional_shares: false,
            lot_size: 100.0,
        };
        assert_eq!(settings.round_shares(1_234.5), 1_200.0);
        assert_eq!(settings.round_shares(99.0), 0.0);
        assert_eq!(frictionless().round_shares(1_234.5), 1_234.5);
    }

    #[test]
    fn test_first_rebalance_deploys_cash_without_turnover() {
        let mut sub = SubPortfolio::new(0, 0, 1_000.0);
        let today = prices(&[("A", 10.0), ("B", 20.0)]);
        let report = sub.rebalance(
            d(1),
            &weights(&[("A", 0.5), ("B", 0.5)]),
            &today,
            &today,
            &frictionless(),
        );

        assert_eq!(report.turnover, None);
        assert!(sub.is_deployed());
        assert!((sub.holdings["A"] - 50.0).abs() < 1e-9);
        assert!((sub.holdings["B"] - 25.0).abs() < 1e-9);
        assert!(sub.cash.abs() < 1e-9);
        assert!((sub.valuation(&today) - 1_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_full_flip_turnover_is_one() {
        let mut sub = SubPortfolio::new(0, 0, 1_000.0);
        let today = prices(&[("A", 10.0), ("B", 20.0)]);
        sub.rebalance(d(1), &weights(&[("A", 1.0)]), &today, &today, &frictionless());

        let today = prices(&[("A", 12.5), ("B", 20.0)]);
        let report = sub.rebalance(d(2), &weights(&[("B", 1.0)]), &today, &today, &frictionless());

        let turnover = report.turnover.unwrap();
        assert!((turnover - 1.0).abs() < 1e-12, "turnover {}", turnover);
        assert!(!sub.holdings.contains_key("A"));
        assert!((sub.holdings["B"] * 20.0 - 1_250.0).abs() < 1e-6);
    }

    #[test]
    fn test_unchanged_weights_have_zero_turnover() {
        let mut sub = SubPortfolio::new(0, 0, 1_000.0);
        let today = prices(&[("A", 10.0)]);
        sub.rebalance(d(1), &weights(&[("A", 1.0)]), &today, &today, &frictionless());
        let report = sub.rebalance(d(2), &weights(&[("A", 1.0)]), &today, &today, &frictionless());
        assert!(report.turnover.unwrap().abs() < 1e-12);
    }

    #[test]
    fn test_missing_price_leaves_target_in_cash() {
        let mut sub = SubPortfolio::new(3, 0, 1_000.0);
        let today = prices(&[("A", 10.0)]);
        let report = sub.rebalance(
            d(1),
            &weights(&[("A", 0.5), ("B", 0.5)]),
            &today,
            &today,
            &frictionless(),
        );

        assert!((sub.cash - 500.0).abs() < 1e-9);
        assert_eq!(report.gaps.len(), 1);
        assert!(matches!(
            &report.gaps[0],
            Diagnostic::DataGap { portfolio: 3, kind: GapKind::NeverPriced, instrument, .. } if instrument == "B"
        ));
    }

    #[test]
    fn test_halted_holding_is_frozen() {
        let mut sub = SubPortfolio::new(0, 0, 1_000.0);
        let day1 = prices(&[("A", 10.0), ("B", 10.0)]);
        sub.rebalance(d(1), &weights(&[("A", 1.0)]), &day1, &day1, &frictionless());

        // A is halted on day 2; its mark stays at the last known price.
        let today = prices(&[("B", 10.0)]);
        let marks = prices(&[("A", 10.0), ("B", 10.0)]);
        let report = sub.rebalance(d(2), &weights(&[("B", 1.0)]), &today, &marks, &frictionless());

        assert!((sub.holdings["A"] - 100.0).abs() < 1e-9);
        assert!(!sub.holdings.contains_key("B"));
        assert_eq!(report.turnover, Some(0.0));
        assert!(matches!(
            report.gaps[0],
            Diagnostic::DataGap { kind: GapKind::FrozenHolding, .. }
        ));
    }

    #[test]
    fn test_fees_never_overdraw_cash() {
        let settings = ExecutionSettings {
            cost_model: CostModel {
                stamp_tax_rate: 0.001,
                transfer_fee_rate: 0.0001,
                commission_rate: 0.0003,
                min_transaction_fee: 5.0,
            },
            fractional_shares: true,
            lot_size: 100.0,
        };
        let mut sub = SubPortfolio::new(0, 0, 10_000.0);
        let today = prices(&[("A", 10.0), ("B", 20.0)]);
        let report = sub.rebalance(
            d(1),
            &weights(&[("A", 0.5), ("B", 0.5)]),
            &today,
            &today,
            &settings,
        );

        assert!(sub.cash >= 0.0);
        assert!(report.fees > 0.0);
        assert!((sub.valuation(&today) + report.fees - 10_000.0).abs() < 1e-6);
        assert!((sub.fees_paid - report.fees).abs() < 1e-12);
    }

    #[test]
    fn test_sells_fund_buys() {
        let settings = ExecutionSettings {
            cost_model: CostModel {
                stamp_tax_rate: 0.001,
                transfer_fee_rate: 0.0,
                commission_rate: 0.001,
                min_transaction_fee: 0.0,
            },
            fractional_shares: true,
            lot_size: 100.0,
        };
        let mut sub = SubPortfolio::new(0, 0, 1_000.0);
        let today = prices(&[("A", 10.0), ("B", 10.0)]);
        sub.rebalance(d(1), &weights(&[("A", 1.0)]), &today, &today, &settings);
        let report = sub.rebalance(d(2), &weights(&[("B", 1.0)]), &today, &today, &settings);

        assert!(report.sold_notional > 0.0);
        assert!(report.bought_notional > 0.0);
        assert!(report.bought_notional < report.sold_notional);
        assert!(sub.cash >= 0.0);
        let turnover = report.turnover.unwrap();
        assert!(turnover > 0.99 && turnover <= 1.0, "turnover {}", turnover);
    }

    fn basket(n: usize, price: f64) -> (PriceMap, BTreeMap<String, f64>) {
        let ids: Vec<String> = (0..n).map(|k| format!("{:06}.XSHE", k)).collect();
        let today = ids.iter().map(|id| (id.clone(), price)).collect();
        let targets = ids.iter().map(|id| (id.clone(), 1.0 / n as f64)).collect();
        (today, targets)
    }

    fn default_costs() -> ExecutionSettings {
        ExecutionSettings {
            cost_model: CostModel::default(),
            fractional_shares: true,
            lot_size: 100.0,
        }
    }

    #[test]
    fn test_floored_fees_dominating_cash_still_buy() {
        // 50 buys at 10.0 of floored fees each leave about 500 for shares.
        let (today, targets) = basket(50, 10.0);
        let mut sub = SubPortfolio::new(0, 0, 1_000.0);
        let report = sub.rebalance(d(1), &targets, &today, &today, &default_costs());

        assert!((report.fees - 500.0).abs() < 1e-9, "fees {}", report.fees);
        assert!(report.bought_notional > 499.0, "bought {}", report.bought_notional);
        assert!(sub.cash >= 0.0);
        assert_eq!(sub.holdings.len(), 50);
        assert!(report.gaps.is_empty());
    }

    #[test]
    fn test_buys_conserve_cash() {
        let (today, targets) = basket(50, 10.0);
        let mut sub = SubPortfolio::new(0, 0, 1_000.0);
        let report = sub.rebalance(d(1), &targets, &today, &today, &default_costs());

        let spent = report.bought_notional + report.fees;
        assert!(spent <= 1_000.0 + 1e-9);
        assert!((sub.cash + spent - 1_000.0).abs() < 1e-9, "cash {}", sub.cash);
        assert!((sub.valuation(&today) + report.fees - 1_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_unaffordable_buys_are_reported() {
        // Fixed fees alone (500) exceed the 400 of cash.
        let (today, targets) = basket(50, 10.0);
        let mut sub = SubPortfolio::new(2, 0, 400.0);
        let report = sub.rebalance(d(1), &targets, &today, &today, &default_costs());

        assert_eq!(report.bought_notional, 0.0);
        assert_eq!(sub.cash, 400.0);
        assert!(sub.holdings.is_empty());
        assert!(matches!(
            report.gaps.as_slice(),
            [Diagnostic::BuysUnaffordable { portfolio: 2, .. }]
        ));
    }

    #[test]
    fn test_lot_rounding_never_overdraws() {
        let settings = ExecutionSettings {
            cost_model: CostModel::default(),
            fractional_shares: false,
            lot_size: 100.0,
        };
        let mut sub = SubPortfolio::new(0, 0, 100_000.0);
        let today = prices(&[("A", 9.99), ("B", 33.33)]);
        let report = sub.rebalance(
            d(1),
            &weights(&[("A", 0.5), ("B", 0.5)]),
            &today,
            &today,
            &settings,
        );

        assert!(sub.cash >= 0.0);
        for shares in sub.holdings.values() {
            assert_eq!(shares % 100.0, 0.0);
        }
        assert!((sub.cash + report.bought_notional + report.fees - 100_000.0).abs() < 1e-6);
    }
}

//! Ranked stock selection.
//!
//! A rank matrix holds one cross-sectional ranking per date (lower is better).
//! Selection keeps the best `rank_n` tradable names, moves the pick to the
//! following rank date so a ranking is only traded after it is observed, and
//! weights the picks equally.

use crate::error::{BacktestError, Result};
use crate::types::WeightMatrix;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Date -> instrument -> rank. Lower ranks are better.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankMatrix {
    rows: BTreeMap<NaiveDate, BTreeMap<String, f64>>,
}

impl RankMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, date: NaiveDate, instrument: impl Into<String>, rank: f64) {
        self.rows.entry(date).or_default().insert(instrument.into(), rank);
    }

    pub fn row(&self, date: NaiveDate) -> Option<&BTreeMap<String, f64>> {
        self.rows.get(&date)
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        self.rows.keys().copied().collect()
    }

    /// Every instrument ranked on at least one date.
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
}

/// Date -> instrument -> tradable flag. Instruments absent from a row are
/// treated as tradable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradabilityMask {
    rows: BTreeMap<NaiveDate, BTreeMap<String, bool>>,
}

impl TradabilityMask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, date: NaiveDate, instrument: impl Into<String>, tradable: bool) {
        self.rows
            .entry(date)
            .or_default()
            .insert(instrument.into(), tradable);
    }

    pub fn is_tradable(&self, date: NaiveDate, instrument: &str) -> bool {
        self.rows
            .get(&date)
            .and_then(|row| row.get(instrument))
            .copied()
            .unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// The `rank_n` best-ranked tradable instruments on `date`, best first.
/// Non-finite ranks are skipped; equal ranks fall back to instrument id order.
pub fn top_ranked(
    ranks: &BTreeMap<String, f64>,
    date: NaiveDate,
    rank_n: usize,
    mask: Option<&TradabilityMask>,
) -> Vec<String> {
    let mut candidates: Vec<(&String, f64)> = ranks
        .iter()
        .filter(|(_, r)| r.is_finite())
        .filter(|(id, _)| mask.map_or(true, |m| m.is_tradable(date, id)))
        .map(|(id, r)| (id, *r))
        .collect();
    candidates.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
    candidates
        .into_iter()
        .take(rank_n)
        .map(|(id, _)| id.clone())
        .collect()
}

/// Build equal-weight targets from a rank matrix.
///
/// The pick made from the ranking on date `t` becomes the weight row of the
/// next date in the rank matrix. The last ranking has no following date and is
/// dropped, as are dates with nothing selected.
pub fn select_top_n(
    ranks: &RankMatrix,
    rank_n: usize,
    mask: Option<&TradabilityMask>,
) -> Result<WeightMatrix> {
    if rank_n == 0 {
        return Err(BacktestError::ConfigError(
            "rank_n must be at least 1".to_string(),
        ));
    }
    if ranks.is_empty() {
        return Err(BacktestError::NoData);
    }

    let dates = ranks.dates();
    let mut weights = WeightMatrix::new();
    for pair in dates.windows(2) {
        let (observed, traded) = (pair[0], pair[1]);
        let Some(row) = ranks.row(observed) else {
            continue;
        };
        let picks = top_ranked(row, observed, rank_n, mask);
        if picks.is_empty() {
            debug!("No tradable names ranked on {}", observed);
            continue;
        }
        let weight = 1.0 / picks.len() as f64;
        weights.set_row(traded, picks.into_iter().map(|id| (id, weight)).collect());
    }

    info!(
        "Selected top {} names on {} of {} ranking dates",
        rank_n,
        weights.len(),
        ranks.len()
    );
    Ok(weights)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    fn sample_ranks() -> RankMatrix {
        let mut ranks = RankMatrix::new();
        for (day, row) in [
            (4, [("A", 1.0), ("B", 2.0), ("C", 3.0)]),
            (5, [("A", 3.0), ("B", 1.0), ("C", 2.0)]),
            (6, [("A", 2.0), ("B", 3.0), ("C", 1.0)]),
        ] {
            for (id, rank) in row {
                ranks.insert(d(day), id, rank);
            }
        }
        ranks
    }

    #[test]
    fn test_selection_shifts_to_next_rank_date() {
        let weights = select_top_n(&sample_ranks(), 2, None).unwrap();

        assert_eq!(weights.dates(), vec![d(5), d(6)]);
        let first = weights.row(d(5)).unwrap();
        assert_eq!(first.keys().cloned().collect::<Vec<_>>(), vec!["A", "B"]);
        assert!((first["A"] - 0.5).abs() < 1e-12);
        let second = weights.row(d(6)).unwrap();
        assert_eq!(second.keys().cloned().collect::<Vec<_>>(), vec!["B", "C"]);
    }

    #[test]
    fn test_rank_matrix_instruments() {
        let mut ranks = sample_ranks();
        ranks.insert(d(7), "D", 1.0);
        let ids: Vec<String> = ranks.instruments().into_iter().collect();
        assert_eq!(ids, vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn test_mask_excludes_untradable_names() {
        let mut mask = TradabilityMask::new();
        mask.insert(d(4), "A", false);

        let weights = select_top_n(&sample_ranks(), 2, Some(&mask)).unwrap();
        let first = weights.row(d(5)).unwrap();
        assert_eq!(first.keys().cloned().collect::<Vec<_>>(), vec!["B", "C"]);
    }

    #[test]
    fn test_ties_broken_by_instrument_id() {
        let mut row = BTreeMap::new();
        row.insert("Z".to_string(), 1.0);
        row.insert("M".to_string(), 1.0);
        row.insert("A".to_string(), 2.0);
        row.insert("Q".to_string(), f64::NAN);
        assert_eq!(top_ranked(&row, d(1), 2, None), vec!["M", "Z"]);
    }

    #[test]
    fn test_fewer_candidates_than_rank_n() {
        let weights = select_top_n(&sample_ranks(), 10, None).unwrap();
        let row = weights.row(d(5)).unwrap();
        assert_eq!(row.len(), 3);
        let total: f64 = row.values().sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_fully_masked_date_is_dropped() {
        let mut mask = TradabilityMask::new();
        for id in ["A", "B", "C"] {
            mask.insert(d(4), id, false);
        }
        let weights = select_top_n(&sample_ranks(), 1, Some(&mask)).unwrap();
        assert_eq!(weights.dates(), vec![d(6)]);
    }

    #[test]
    fn test_rank_n_zero_rejected() {
        assert!(matches!(
            select_top_n(&sample_ranks(), 0, None),
            Err(BacktestError::ConfigError(_))
        ));
    }
}

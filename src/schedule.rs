//! Staggered rebalance calendar for the sub-portfolios.
//!
//! Sub-portfolio `i` of `count` starts at trading-day offset
//! `round(i * frequency / count)` and rebalances every `frequency` trading
//! days after that. Offsets are positions in the simulation grid, not
//! calendar days.

use serde::{Deserialize, Serialize};

/// Starting offset of sub-portfolio `index`.
pub fn rebalance_offset(index: usize, portfolio_count: usize, rebalance_frequency: usize) -> usize {
    if portfolio_count == 0 {
        return 0;
    }
    (index as f64 * rebalance_frequency as f64 / portfolio_count as f64).round() as usize
}

/// Rebalance offsets of every sub-portfolio over a grid of `len` days.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceSchedule {
    offsets: Vec<usize>,
    frequency: usize,
    len: usize,
}

impl RebalanceSchedule {
    pub fn new(portfolio_count: usize, rebalance_frequency: usize, len: usize) -> Self {
        let offsets = (0..portfolio_count)
            .map(|i| rebalance_offset(i, portfolio_count, rebalance_frequency))
            .collect();
        Self {
            offsets,
            frequency: rebalance_frequency,
            len,
        }
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn offset(&self, portfolio: usize) -> Option<usize> {
        self.offsets.get(portfolio).copied()
    }

    pub fn frequency(&self) -> usize {
        self.frequency
    }

    /// Whether `portfolio` rebalances on grid position `day`.
    pub fn is_rebalance_day(&self, portfolio: usize, day: usize) -> bool {
        match self.offset(portfolio) {
            Some(offset) if self.frequency > 0 && day < self.len && day >= offset => {
                (day - offset) % self.frequency == 0
            }
            _ => false,
        }
    }

    /// Sub-portfolios whose first rebalance falls outside the grid.
    pub fn never_deployed(&self) -> Vec<(usize, usize)> {
        self.offsets
            .iter()
            .enumerate()
            .filter(|(_, offset)| **offset >= self.len)
            .map(|(i, offset)| (i, *offset))
            .collect()
    }
}

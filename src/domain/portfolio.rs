//! Portfolio state, equity tracking and the rebalance ledger record.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use super::error::FactorsimError;

/// Decimal places kept for cash amounts.
pub const MONEY_DP: u32 = 8;

/// Convert a float amount into cash precision.
pub fn to_money(value: f64) -> Result<Decimal, FactorsimError> {
    Decimal::from_f64(value)
        .map(|d| d.round_dp(MONEY_DP))
        .ok_or_else(|| FactorsimError::Costing {
            reason: format!("amount {value} is not representable as cash"),
        })
}

pub fn money_to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub equity: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioState {
    pub cash: Decimal,
    pub holdings: BTreeMap<String, i64>,
}

impl PortfolioState {
    pub fn new(initial_capital: Decimal) -> Self {
        PortfolioState {
            cash: initial_capital,
            holdings: BTreeMap::new(),
        }
    }

    pub fn shares(&self, code: &str) -> i64 {
        self.holdings.get(code).copied().unwrap_or(0)
    }

    pub fn has_position(&self, code: &str) -> bool {
        self.shares(code) != 0
    }

    pub fn position_count(&self) -> usize {
        self.holdings.len()
    }

    /// Value of all positions at the given prices. Positions without a price count as zero.
    pub fn positions_value(&self, price_map: &HashMap<String, f64>) -> f64 {
        self.holdings
            .iter()
            .filter_map(|(code, &qty)| price_map.get(code).map(|&price| qty as f64 * price))
            .sum()
    }

    pub fn total_value(&self, price_map: &HashMap<String, f64>) -> f64 {
        money_to_f64(self.cash) + self.positions_value(price_map)
    }

    /// Apply signed share deltas and a net cash change in one step, dropping
    /// positions that end at zero shares.
    pub(crate) fn apply(&mut self, trades: &BTreeMap<String, i64>, cash_delta: Decimal) {
        self.cash += cash_delta;
        for (code, &delta) in trades {
            let entry = self.holdings.entry(code.clone()).or_insert(0);
            *entry += delta;
        }
        self.holdings.retain(|_, qty| *qty != 0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceTrigger {
    Initial,
    Scheduled,
}

impl fmt::Display for RebalanceTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebalanceTrigger::Initial => write!(f, "initial"),
            RebalanceTrigger::Scheduled => write!(f, "scheduled"),
        }
    }
}

/// One executed rebalance. Appended to the ledger and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceEvent {
    pub date: NaiveDate,
    pub trigger: RebalanceTrigger,
    pub trades: BTreeMap<String, i64>,
    pub total_cost: Decimal,
    pub value_before: f64,
    pub value_after: f64,
    pub cash_before: Decimal,
    pub cash_after: Decimal,
    /// Traded notional divided by the pre-trade portfolio value.
    pub turnover: f64,
}

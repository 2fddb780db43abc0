//! Transaction costs and cash-constrained trade sizing.
//!
//! cost = max(commission_rate * value, commission_min if buy else 0)
//!        + value * slippage_bps / 10_000
//! where value = |shares| * price. Batch costing sums per-asset costs with no
//! cross-asset netting.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::warn;

use super::error::FactorsimError;

/// Fraction of available cash that scaled-down buys (plus costs) may consume.
pub const CASH_BUFFER: f64 = 0.95;

const MAX_SCALE_ATTEMPTS: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct CostModel {
    pub commission_rate: f64,
    pub commission_min: f64,
    pub slippage_bps: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        CostModel {
            commission_rate: 0.0,
            commission_min: 0.0,
            slippage_bps: 0.0,
        }
    }
}

/// Priced batch of trades.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TradeCosts {
    pub per_asset: BTreeMap<String, f64>,
    pub buy_value: f64,
    pub sell_value: f64,
    pub buy_cost: f64,
    pub sell_cost: f64,
}

impl TradeCosts {
    pub fn total_cost(&self) -> f64 {
        self.buy_cost + self.sell_cost
    }

    /// Cash consumed by buys including their costs.
    pub fn buy_outlay(&self) -> f64 {
        self.buy_value + self.buy_cost
    }

    /// Cash received from sells net of their costs.
    pub fn sell_proceeds(&self) -> f64 {
        self.sell_value - self.sell_cost
    }

    /// Signed change in cash if the batch is executed.
    pub fn cash_delta(&self) -> f64 {
        self.sell_proceeds() - self.buy_outlay()
    }
}

impl CostModel {
    pub fn new(
        commission_rate: f64,
        commission_min: f64,
        slippage_bps: f64,
    ) -> Result<Self, FactorsimError> {
        let model = CostModel {
            commission_rate,
            commission_min,
            slippage_bps,
        };
        model.validate()?;
        Ok(model)
    }

    pub fn validate(&self) -> Result<(), FactorsimError> {
        for (key, value) in [
            ("commission_rate", self.commission_rate),
            ("commission_min", self.commission_min),
            ("slippage_bps", self.slippage_bps),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(FactorsimError::invalid(
                    "backtest",
                    key,
                    format!("{key} must be non-negative"),
                ));
            }
        }
        Ok(())
    }

    pub fn cost(&self, shares: i64, price: f64, is_buy: bool) -> Result<f64, FactorsimError> {
        if shares < 0 {
            return Err(FactorsimError::Costing {
                reason: format!("negative share count {shares}"),
            });
        }
        if !price.is_finite() || price <= 0.0 {
            return Err(FactorsimError::Costing {
                reason: format!("non-positive price {price}"),
            });
        }
        let value = shares as f64 * price;
        let floor = if is_buy { self.commission_min } else { 0.0 };
        let commission = (self.commission_rate * value).max(floor);
        Ok(commission + value * self.slippage_bps / 10_000.0)
    }

    /// Price a map of signed share deltas. Zero deltas are ignored.
    pub fn batch_cost(
        &self,
        trades: &BTreeMap<String, i64>,
        price_map: &HashMap<String, f64>,
    ) -> Result<TradeCosts, FactorsimError> {
        let mut costs = TradeCosts::default();
        for (code, &delta) in trades {
            if delta == 0 {
                continue;
            }
            let price = *price_map.get(code).ok_or_else(|| FactorsimError::Costing {
                reason: format!("no price for {code}"),
            })?;
            let is_buy = delta > 0;
            let cost = self.cost(delta.abs(), price, is_buy)?;
            let value = delta.unsigned_abs() as f64 * price;
            if is_buy {
                costs.buy_value += value;
                costs.buy_cost += cost;
            } else {
                costs.sell_value += value;
                costs.sell_cost += cost;
            }
            costs.per_asset.insert(code.clone(), cost);
        }
        Ok(costs)
    }

    /// Fit a trade batch into the available cash.
    ///
    /// Sells of assets in `forced` (delisted, ineligible or untradeable holdings)
    /// always execute in full and their proceeds count as available cash. When the
    /// remaining buys plus their costs exceed that cash plus the other sells, every
    /// other trade is scaled by one common factor (truncated to whole shares) so the
    /// scaled buys fit within `CASH_BUFFER` of the cash left after the scaled sells.
    /// If rounding and minimum commissions still leave a shortfall, the factor keeps
    /// shrinking; as a last resort only the sells are kept.
    pub fn fit_to_cash(
        &self,
        trades: BTreeMap<String, i64>,
        price_map: &HashMap<String, f64>,
        cash: f64,
        forced: &BTreeSet<String>,
    ) -> Result<(BTreeMap<String, i64>, TradeCosts), FactorsimError> {
        let (forced_sells, trades): (BTreeMap<String, i64>, BTreeMap<String, i64>) = trades
            .into_iter()
            .filter(|(_, delta)| *delta != 0)
            .partition(|(code, delta)| *delta < 0 && forced.contains(code));
        let forced_costs = self.batch_cost(&forced_sells, price_map)?;
        let cash = cash + forced_costs.sell_proceeds();

        let costs = self.batch_cost(&trades, price_map)?;
        if costs.buy_outlay() <= cash + costs.sell_proceeds() {
            return self.with_forced(trades, forced_sells, price_map);
        }

        let net_need = costs.buy_outlay() - CASH_BUFFER * costs.sell_proceeds();
        let mut factor = if net_need > 0.0 {
            (CASH_BUFFER * cash.max(0.0) / net_need).clamp(0.0, 1.0)
        } else {
            1.0
        };
        warn!(
            buy_outlay = costs.buy_outlay(),
            cash,
            factor,
            forced = forced_sells.len(),
            "buys exceed available cash, scaling trades down"
        );

        for _ in 0..MAX_SCALE_ATTEMPTS {
            let scaled = scale_trades(&trades, factor);
            let scaled_costs = self.batch_cost(&scaled, price_map)?;
            if scaled_costs.buy_outlay() <= cash + scaled_costs.sell_proceeds() {
                return self.with_forced(scaled, forced_sells, price_map);
            }
            factor *= 0.9;
        }

        warn!("unable to fit buys into available cash, executing sells only");
        let sells: BTreeMap<String, i64> = trades.into_iter().filter(|(_, d)| *d < 0).collect();
        self.with_forced(sells, forced_sells, price_map)
    }

    fn with_forced(
        &self,
        mut trades: BTreeMap<String, i64>,
        forced_sells: BTreeMap<String, i64>,
        price_map: &HashMap<String, f64>,
    ) -> Result<(BTreeMap<String, i64>, TradeCosts), FactorsimError> {
        trades.extend(forced_sells);
        let costs = self.batch_cost(&trades, price_map)?;
        Ok((trades, costs))
    }
}

/// Multiply every delta by `factor`, truncating toward zero and dropping zeros.
fn scale_trades(trades: &BTreeMap<String, i64>, factor: f64) -> BTreeMap<String, i64> {
    trades
        .iter()
        .filter_map(|(code, &delta)| {
            let scaled = (delta as f64 * factor).trunc() as i64;
            (scaled != 0).then(|| (code.clone(), scaled))
        })
        .collect()
}

//! Performance metrics derived from the equity curve and rebalance ledger.

use super::portfolio::{EquityPoint, RebalanceEvent, money_to_f64};
use rust_decimal::Decimal;

const TRADING_DAYS_PER_YEAR: f64 = 252.0;

#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceMetrics {
    pub total_return: f64,
    pub annualized_return: f64,
    pub annualized_volatility: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub max_drawdown: f64,
    /// Longest run of trading days spent below a prior peak.
    pub max_drawdown_duration: i64,
    pub calmar_ratio: f64,
    pub num_rebalances: usize,
    pub total_costs: Decimal,
    pub avg_turnover: f64,
    pub final_value: f64,
}

impl PerformanceMetrics {
    pub fn compute(
        equity_curve: &[EquityPoint],
        rebalances: &[RebalanceEvent],
        initial_capital: f64,
        risk_free_rate: f64,
    ) -> Self {
        let final_value = equity_curve
            .last()
            .map(|p| p.equity)
            .unwrap_or(initial_capital);

        let total_return = if initial_capital > 0.0 {
            (final_value - initial_capital) / initial_capital
        } else {
            0.0
        };

        let trading_days = equity_curve.len() as f64;
        let years = trading_days / TRADING_DAYS_PER_YEAR;
        let annualized_return = if years > 0.0 && total_return.is_finite() && total_return > -1.0
        {
            (1.0 + total_return).powf(1.0 / years) - 1.0
        } else {
            0.0
        };

        let (max_drawdown, max_drawdown_duration) = compute_drawdown(equity_curve);

        let daily_rf = risk_free_rate / TRADING_DAYS_PER_YEAR;
        let risk = compute_risk_adjusted(equity_curve, daily_rf);

        let calmar_ratio = if max_drawdown > 0.0 {
            annualized_return / max_drawdown
        } else {
            0.0
        };

        let total_costs = rebalances.iter().map(|r| r.total_cost).sum();
        let avg_turnover = if rebalances.is_empty() {
            0.0
        } else {
            rebalances.iter().map(|r| r.turnover).sum::<f64>() / rebalances.len() as f64
        };

        PerformanceMetrics {
            total_return,
            annualized_return,
            annualized_volatility: risk.volatility,
            sharpe_ratio: risk.sharpe,
            sortino_ratio: risk.sortino,
            max_drawdown,
            max_drawdown_duration,
            calmar_ratio,
            num_rebalances: rebalances.len(),
            total_costs,
            avg_turnover,
            final_value,
        }
    }

    pub fn total_costs_f64(&self) -> f64 {
        money_to_f64(self.total_costs)
    }
}

fn compute_drawdown(equity_curve: &[EquityPoint]) -> (f64, i64) {
    let Some(first) = equity_curve.first() else {
        return (0.0, 0);
    };

    let mut peak = first.equity;
    let mut max_dd = 0.0_f64;
    let mut max_dd_duration = 0i64;
    let mut current_dd_duration = 0i64;

    for point in equity_curve {
        if point.equity >= peak {
            peak = point.equity;
            current_dd_duration = 0;
        } else if peak > 0.0 {
            let dd = (peak - point.equity) / peak;
            max_dd = max_dd.max(dd);
            current_dd_duration += 1;
            max_dd_duration = max_dd_duration.max(current_dd_duration);
        }
    }

    (max_dd, max_dd_duration)
}

struct RiskAdjusted {
    volatility: f64,
    sharpe: f64,
    sortino: f64,
}

fn compute_risk_adjusted(equity_curve: &[EquityPoint], daily_rf: f64) -> RiskAdjusted {
    let none = RiskAdjusted {
        volatility: 0.0,
        sharpe: 0.0,
        sortino: 0.0,
    };
    if equity_curve.len() < 2 {
        return none;
    }

    let returns: Vec<f64> = equity_curve
        .windows(2)
        .map(|w| {
            let prev = w[0].equity;
            let curr = w[1].equity;
            if prev > 0.0 { (curr - prev) / prev } else { 0.0 }
        })
        .collect();

    let n = returns.len() as f64;
    let mean: f64 = returns.iter().sum::<f64>() / n;
    let variance: f64 = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let stddev = variance.sqrt();
    let annualizer = TRADING_DAYS_PER_YEAR.sqrt();

    let excess_return = mean - daily_rf;

    let sharpe = if stddev > 0.0 {
        (excess_return / stddev) * annualizer
    } else {
        0.0
    };

    let downside_sq: f64 = returns
        .iter()
        .filter(|&&r| r < daily_rf)
        .map(|&r| (r - daily_rf).powi(2))
        .sum();
    let downside_stddev = (downside_sq / n).sqrt();

    let sortino = if downside_stddev > 0.0 {
        (excess_return / downside_stddev) * annualizer
    } else {
        0.0
    };

    RiskAdjusted {
        volatility: stddev * annualizer,
        sharpe,
        sortino,
    }
}

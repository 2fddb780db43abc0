//! Allocation strategies: turn a return history into target weights.

use std::collections::BTreeMap;

use super::error::FactorsimError;
use super::table::ReturnTable;

const WEIGHT_TOLERANCE: f64 = 1e-9;
const MIN_VOL: f64 = 1e-8;

pub type Weights = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AllocationConstraints {
    /// Upper bound on any single weight.
    pub max_weight: Option<f64>,
}

/// Builds long-only target weights that sum to 1.0 over the assets of `returns`.
pub trait AllocationStrategy {
    fn name(&self) -> &str;

    /// Rows of history required before [`AllocationStrategy::construct`] succeeds.
    fn min_history_periods(&self) -> usize;

    fn construct(
        &self,
        returns: &ReturnTable,
        constraints: &AllocationConstraints,
    ) -> Result<Weights, FactorsimError>;
}

fn require_history(
    strategy: &dyn AllocationStrategy,
    returns: &ReturnTable,
) -> Result<(), FactorsimError> {
    let need = strategy.min_history_periods();
    if returns.len() < need {
        return Err(FactorsimError::InsufficientData {
            context: format!("{} allocation", strategy.name()),
            have: returns.len(),
            need,
        });
    }
    Ok(())
}

/// Clamp weights to `max_weight`, handing the excess to uncapped assets in
/// proportion to their weight.
pub fn apply_max_weight(mut weights: Weights, max_weight: f64) -> Result<Weights, FactorsimError> {
    if weights.is_empty() {
        return Ok(weights);
    }
    if max_weight.is_nan()
        || max_weight <= 0.0
        || (weights.len() as f64) * max_weight < 1.0 - WEIGHT_TOLERANCE
    {
        return Err(FactorsimError::ConstraintViolation {
            reason: format!(
                "max_weight {max_weight} cannot hold {} assets fully invested",
                weights.len()
            ),
        });
    }

    loop {
        let over: Vec<String> = weights
            .iter()
            .filter(|&(_, &w)| w > max_weight + WEIGHT_TOLERANCE)
            .map(|(a, _)| a.clone())
            .collect();
        if over.is_empty() {
            return Ok(weights);
        }
        let excess: f64 = over.iter().map(|a| weights[a] - max_weight).sum();
        for a in &over {
            weights.insert(a.clone(), max_weight);
        }
        let free: f64 = weights.values().filter(|&&w| w < max_weight - WEIGHT_TOLERANCE).sum();
        if free <= 0.0 {
            return Err(FactorsimError::ConstraintViolation {
                reason: format!("no uncapped assets left to absorb excess weight {excess}"),
            });
        }
        for w in weights.values_mut() {
            if *w < max_weight - WEIGHT_TOLERANCE {
                *w += excess * *w / free;
            }
        }
    }
}

fn finish(
    weights: Weights,
    constraints: &AllocationConstraints,
) -> Result<Weights, FactorsimError> {
    match constraints.max_weight {
        Some(cap) => apply_max_weight(weights, cap),
        None => Ok(weights),
    }
}

#[derive(Debug, Clone, Default)]
pub struct EqualWeight;

impl AllocationStrategy for EqualWeight {
    fn name(&self) -> &str {
        "equal_weight"
    }

    fn min_history_periods(&self) -> usize {
        1
    }

    fn construct(
        &self,
        returns: &ReturnTable,
        constraints: &AllocationConstraints,
    ) -> Result<Weights, FactorsimError> {
        require_history(self, returns)?;
        let n = returns.assets().len();
        if n == 0 {
            return Ok(Weights::new());
        }
        let w = 1.0 / n as f64;
        let weights = returns.assets().iter().map(|a| (a.clone(), w)).collect();
        finish(weights, constraints)
    }
}

/// Weights proportional to 1 / stddev of returns over a trailing window.
#[derive(Debug, Clone)]
pub struct InverseVolatility {
    pub lookback: usize,
}

impl Default for InverseVolatility {
    fn default() -> Self {
        InverseVolatility { lookback: 63 }
    }
}

impl AllocationStrategy for InverseVolatility {
    fn name(&self) -> &str {
        "inverse_volatility"
    }

    fn min_history_periods(&self) -> usize {
        self.lookback.max(2)
    }

    fn construct(
        &self,
        returns: &ReturnTable,
        constraints: &AllocationConstraints,
    ) -> Result<Weights, FactorsimError> {
        require_history(self, returns)?;
        let window = returns.tail(self.lookback);

        let mut inverse = Weights::new();
        for (col, asset) in window.assets().iter().enumerate() {
            let values: Vec<f64> = window.column(col).flatten().collect();
            if values.len() < 2 {
                continue;
            }
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                / (values.len() - 1) as f64;
            inverse.insert(asset.clone(), 1.0 / var.sqrt().max(MIN_VOL));
        }

        let total: f64 = inverse.values().sum();
        if total <= 0.0 {
            return Err(FactorsimError::InsufficientData {
                context: "inverse_volatility allocation (no asset with two valid returns)".into(),
                have: 0,
                need: 2,
            });
        }
        let weights = inverse.into_iter().map(|(a, v)| (a, v / total)).collect();
        finish(weights, constraints)
    }
}

/// Build a strategy from its configuration name.
pub fn strategy_from_name(
    name: &str,
    lookback: usize,
) -> Result<Box<dyn AllocationStrategy>, FactorsimError> {
    match name.trim().to_lowercase().as_str() {
        "equal_weight" | "equal" => Ok(Box::new(EqualWeight)),
        "inverse_volatility" | "inverse_vol" => Ok(Box::new(InverseVolatility { lookback })),
        other => Err(FactorsimError::invalid(
            "allocation",
            "strategy",
            format!("unknown strategy '{other}' (expected equal_weight or inverse_volatility)"),
        )),
    }
}

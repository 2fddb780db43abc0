//! Factor preselection: momentum, low-volatility and combined scores with a
//! deterministic top-K cut.
//!
//! Momentum = prod(1 + r) - 1 over the trailing lookback window minus the most
//! recent `skip` rows. Low-vol = 1 / (stddev + 1e-8) over the lookback window.
//! Combined = w_m * z(momentum) + w_v * z(low_vol).

use chrono::NaiveDate;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::cache::{ArtifactCache, CachePayload, DateRange, EntryKind};
use super::error::FactorsimError;
use super::table::ReturnTable;

pub const VOL_EPSILON: f64 = 1e-8;
pub const MIN_ZSCORE_STD: f64 = 1e-8;
const WEIGHT_TOLERANCE: f64 = 1e-6;

pub type FactorScores = BTreeMap<String, Option<f64>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactorMethod {
    Momentum,
    LowVol,
    Combined,
}

impl fmt::Display for FactorMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactorMethod::Momentum => write!(f, "momentum"),
            FactorMethod::LowVol => write!(f, "low_vol"),
            FactorMethod::Combined => write!(f, "combined"),
        }
    }
}

impl FromStr for FactorMethod {
    type Err = FactorsimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "momentum" => Ok(FactorMethod::Momentum),
            "low_vol" | "lowvol" | "low_volatility" => Ok(FactorMethod::LowVol),
            "combined" => Ok(FactorMethod::Combined),
            other => Err(FactorsimError::invalid(
                "preselection",
                "method",
                format!("unknown method '{other}' (expected momentum, low_vol or combined)"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreselectionConfig {
    pub method: FactorMethod,
    pub top_k: usize,
    pub lookback: usize,
    pub skip: usize,
    pub momentum_weight: f64,
    pub low_vol_weight: f64,
    pub min_periods: usize,
}

impl Default for PreselectionConfig {
    fn default() -> Self {
        PreselectionConfig {
            method: FactorMethod::Momentum,
            top_k: 10,
            lookback: 252,
            skip: 21,
            momentum_weight: 0.5,
            low_vol_weight: 0.5,
            min_periods: 60,
        }
    }
}

impl PreselectionConfig {
    pub fn validate(&self) -> Result<(), FactorsimError> {
        if self.top_k == 0 {
            return Err(FactorsimError::invalid(
                "preselection",
                "top_k",
                "top_k must be at least 1",
            ));
        }
        if self.lookback == 0 {
            return Err(FactorsimError::invalid(
                "preselection",
                "lookback",
                "lookback must be at least 1",
            ));
        }
        if self.skip >= self.lookback {
            return Err(FactorsimError::invalid(
                "preselection",
                "skip",
                "skip must be less than lookback",
            ));
        }
        if self.min_periods > self.lookback {
            return Err(FactorsimError::invalid(
                "preselection",
                "min_periods",
                "min_periods must not exceed lookback",
            ));
        }
        if self.method == FactorMethod::Combined {
            if self.momentum_weight < 0.0 || self.low_vol_weight < 0.0 {
                return Err(FactorsimError::invalid(
                    "preselection",
                    "momentum_weight",
                    "factor weights must be non-negative",
                ));
            }
            if (self.momentum_weight + self.low_vol_weight - 1.0).abs() > WEIGHT_TOLERANCE {
                return Err(FactorsimError::invalid(
                    "preselection",
                    "momentum_weight",
                    "momentum_weight + low_vol_weight must equal 1.0",
                ));
            }
        }
        Ok(())
    }

    /// Parameters that affect scores. `top_k` only affects the cut, not the scores.
    pub fn cache_params(&self) -> BTreeMap<String, String> {
        [
            ("method", self.method.to_string()),
            ("lookback", self.lookback.to_string()),
            ("skip", self.skip.to_string()),
            ("momentum_weight", self.momentum_weight.to_string()),
            ("low_vol_weight", self.low_vol_weight.to_string()),
            ("min_periods", self.min_periods.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

/// One asset's position in a ranking. Ranks start at 1.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedAsset {
    pub asset: String,
    pub score: f64,
    pub rank: usize,
}

fn valid_values(table: &ReturnTable, col: usize) -> Vec<f64> {
    table.column(col).flatten().collect()
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1). `None` below two observations.
fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

/// Compounded return over `window` after dropping its last `skip` rows.
pub fn momentum_scores(window: &ReturnTable, skip: usize) -> FactorScores {
    let scored = window.head(window.len().saturating_sub(skip));
    scored
        .assets()
        .iter()
        .enumerate()
        .map(|(col, asset)| {
            let values = valid_values(&scored, col);
            let score = if values.is_empty() {
                None
            } else {
                Some(values.iter().fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0)
            };
            (asset.clone(), score)
        })
        .collect()
}

/// Inverse volatility over `window`; higher is better.
pub fn low_vol_scores(window: &ReturnTable) -> FactorScores {
    window
        .assets()
        .iter()
        .enumerate()
        .map(|(col, asset)| {
            let score = sample_std(&valid_values(window, col)).map(|s| 1.0 / (s + VOL_EPSILON));
            (asset.clone(), score)
        })
        .collect()
}

/// Standardize valid scores. Missing stays missing; no dispersion maps to zero.
pub fn zscore(scores: &FactorScores) -> FactorScores {
    let values: Vec<f64> = scores.values().flatten().copied().collect();
    if values.is_empty() {
        return scores.clone();
    }
    let m = mean(&values);
    let std = sample_std(&values).unwrap_or(0.0);
    scores
        .iter()
        .map(|(asset, score)| {
            let z = score.map(|s| {
                if std < MIN_ZSCORE_STD {
                    0.0
                } else {
                    (s - m) / std
                }
            });
            (asset.clone(), z)
        })
        .collect()
}

/// Factor scores from rows strictly before `rebalance_date` (all rows when `None`).
pub fn compute_scores(
    returns: &ReturnTable,
    rebalance_date: Option<NaiveDate>,
    config: &PreselectionConfig,
) -> Result<FactorScores, FactorsimError> {
    let history = match rebalance_date {
        Some(date) => returns.rows_before(date),
        None => returns.clone(),
    };
    scores_from_history(&history, config)
}

fn scores_from_history(
    history: &ReturnTable,
    config: &PreselectionConfig,
) -> Result<FactorScores, FactorsimError> {
    if history.len() < config.min_periods {
        return Err(FactorsimError::InsufficientData {
            context: format!("{} preselection", config.method),
            have: history.len(),
            need: config.min_periods,
        });
    }

    let window = history.tail(config.lookback);
    // Too few observations in the lookback window makes a score meaningless.
    let sparse: Vec<String> = window
        .assets()
        .iter()
        .enumerate()
        .filter(|(col, _)| window.column(*col).flatten().count() < config.min_periods)
        .map(|(_, asset)| asset.clone())
        .collect();
    let dense = |mut scores: FactorScores| {
        for asset in &sparse {
            scores.insert(asset.clone(), None);
        }
        scores
    };

    let scores = match config.method {
        FactorMethod::Momentum => dense(momentum_scores(&window, config.skip)),
        FactorMethod::LowVol => dense(low_vol_scores(&window)),
        FactorMethod::Combined => {
            let momentum = zscore(&dense(momentum_scores(&window, config.skip)));
            let low_vol = zscore(&dense(low_vol_scores(&window)));
            momentum
                .into_iter()
                .map(|(asset, m)| {
                    let v = low_vol.get(&asset).copied().flatten();
                    let combined = match (m, v) {
                        (Some(m), Some(v)) => {
                            Some(config.momentum_weight * m + config.low_vol_weight * v)
                        }
                        _ => None,
                    };
                    (asset, combined)
                })
                .collect()
        }
    };
    Ok(scores)
}

/// [`compute_scores`] memoized through the cache when one is supplied.
pub fn compute_scores_cached(
    cache: Option<&ArtifactCache>,
    returns: &ReturnTable,
    rebalance_date: Option<NaiveDate>,
    config: &PreselectionConfig,
) -> Result<FactorScores, FactorsimError> {
    let history = match rebalance_date {
        Some(date) => returns.rows_before(date),
        None => returns.clone(),
    };
    let (Some(cache), Some(first), Some(last)) = (cache, history.first_date(), history.last_date())
    else {
        return scores_from_history(&history, config);
    };

    let params = config.cache_params();
    let range = DateRange::new(first, rebalance_date.unwrap_or(last));
    if let Some(CachePayload::FactorScores(scores)) =
        cache.get(EntryKind::FactorScores, &history, &params, range)
    {
        return Ok(scores);
    }

    let scores = scores_from_history(&history, config)?;
    cache.put(&history, &params, range, CachePayload::FactorScores(scores.clone()));
    Ok(scores)
}

/// Valid scores ordered best first; equal scores ordered by ascending asset id.
pub fn rank(scores: &FactorScores) -> Vec<RankedAsset> {
    let mut valid: Vec<(&String, f64)> = scores
        .iter()
        .filter_map(|(asset, score)| score.map(|s| (asset, s)))
        .collect();
    valid.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(b.0))
    });
    valid
        .into_iter()
        .enumerate()
        .map(|(i, (asset, score))| RankedAsset {
            asset: asset.clone(),
            score,
            rank: i + 1,
        })
        .collect()
}

/// The best `k` assets, returned in alphabetical order.
///
/// Ties straddling the cutoff are resolved by asset id because [`rank`] orders
/// equal scores alphabetically, so exactly `k` assets are kept.
pub fn select_top_k(scores: &FactorScores, k: usize) -> Vec<String> {
    let mut selected: Vec<String> = rank(scores)
        .into_iter()
        .take(k)
        .map(|r| r.asset)
        .collect();
    selected.sort();
    selected
}

pub fn select(
    returns: &ReturnTable,
    rebalance_date: Option<NaiveDate>,
    config: &PreselectionConfig,
) -> Result<Vec<String>, FactorsimError> {
    let scores = compute_scores(returns, rebalance_date, config)?;
    Ok(select_top_k(&scores, config.top_k))
}

//! Membership policy: narrows churn between consecutive preselections.

use std::collections::{BTreeSet, HashMap};
use tracing::info;

use super::error::FactorsimError;
use super::preselection::RankedAsset;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MembershipPolicy {
    pub enabled: bool,
    /// Holdings ranked at or above this position are kept.
    pub buffer_rank: Option<usize>,
    /// Holdings held for fewer rebalances than this are kept.
    pub min_holding_periods: Option<usize>,
    /// Advisory turnover ceiling. Reported, never enforced.
    pub max_turnover: Option<f64>,
    pub max_new_assets: Option<usize>,
    pub max_removed_assets: Option<usize>,
}

impl MembershipPolicy {
    pub fn validate(&self) -> Result<(), FactorsimError> {
        if let Some(t) = self.max_turnover {
            if !(0.0..=1.0).contains(&t) {
                return Err(FactorsimError::invalid(
                    "membership",
                    "max_turnover",
                    format!("must be between 0 and 1, got {t}"),
                ));
            }
        }
        if self.buffer_rank == Some(0) {
            return Err(FactorsimError::invalid(
                "membership",
                "buffer_rank",
                "buffer_rank must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Candidate assets for the next allocation, sorted alphabetically.
///
/// Starts from the raw top-k of `ranked`, adds protected holdings (too young to
/// sell, or still inside the rank buffer), then caps additions and removals
/// relative to `current_holdings`. Caps keep the best-ranked assets.
pub fn apply(
    current_holdings: &BTreeSet<String>,
    ranked: &[RankedAsset],
    policy: &MembershipPolicy,
    holding_periods: Option<&HashMap<String, usize>>,
    top_k: usize,
) -> Vec<String> {
    let raw: BTreeSet<String> = ranked.iter().take(top_k).map(|r| r.asset.clone()).collect();
    if !policy.enabled {
        return raw.into_iter().collect();
    }

    let rank_of: HashMap<&str, usize> = ranked.iter().map(|r| (r.asset.as_str(), r.rank)).collect();
    // Unranked assets sort after every ranked one, then by name.
    let order = |asset: &String| {
        let rank = rank_of.get(asset.as_str()).copied().unwrap_or(usize::MAX);
        (rank, asset.clone())
    };

    let mut candidates = raw;

    if let (Some(min_periods), Some(periods)) = (policy.min_holding_periods, holding_periods) {
        for held in current_holdings {
            if periods.get(held).copied().unwrap_or(0) < min_periods {
                candidates.insert(held.clone());
            }
        }
    }

    if let Some(buffer) = policy.buffer_rank {
        for held in current_holdings {
            if rank_of.get(held.as_str()).is_some_and(|&r| r <= buffer) {
                candidates.insert(held.clone());
            }
        }
    }

    if let Some(max_new) = policy.max_new_assets {
        let mut added: Vec<String> = candidates.difference(current_holdings).cloned().collect();
        if added.len() > max_new {
            added.sort_by_key(order);
            for dropped in &added[max_new..] {
                candidates.remove(dropped);
            }
        }
    }

    if let Some(max_removed) = policy.max_removed_assets {
        let mut removed: Vec<String> = current_holdings.difference(&candidates).cloned().collect();
        if removed.len() > max_removed {
            removed.sort_by_key(order);
            let keep_back = removed.len() - max_removed;
            for kept in &removed[..keep_back] {
                candidates.insert(kept.clone());
            }
        }
    }

    if let Some(max_turnover) = policy.max_turnover {
        let added = candidates.difference(current_holdings).count();
        let removed = current_holdings.difference(&candidates).count();
        let base = current_holdings.len().max(candidates.len()).max(1);
        let turnover = (added + removed) as f64 / (2 * base) as f64;
        if turnover > max_turnover {
            info!(
                turnover,
                max_turnover,
                added,
                removed,
                "membership turnover above advisory limit"
            );
        }
    }

    candidates.into_iter().collect()
}

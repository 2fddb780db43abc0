//! Point-in-time eligibility and delisting detection.
//!
//! Eligibility for an as-of date only reads rows dated strictly before it.

use chrono::{Duration, NaiveDate};
use std::collections::{BTreeMap, BTreeSet};

use super::cache::{ArtifactCache, CachePayload, DateRange, EntryKind};
use super::table::ReturnTable;

pub type EligibilityMask = BTreeMap<String, bool>;

/// Thresholds for point-in-time filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct PitConfig {
    pub enabled: bool,
    pub min_history_days: i64,
    pub min_price_rows: usize,
    pub delisting_lookforward_days: i64,
}

impl Default for PitConfig {
    fn default() -> Self {
        PitConfig {
            enabled: false,
            min_history_days: 252,
            min_price_rows: 200,
            delisting_lookforward_days: 5,
        }
    }
}

impl PitConfig {
    pub fn cache_params(&self) -> BTreeMap<String, String> {
        [
            ("min_history_days".to_string(), self.min_history_days.to_string()),
            ("min_price_rows".to_string(), self.min_price_rows.to_string()),
        ]
        .into_iter()
        .collect()
    }
}

/// Which assets are tradeable as of `as_of`.
///
/// An asset is eligible when it has a valid observation before `as_of`, its first
/// valid observation is at least `min_history_days` calendar days earlier, and it
/// has at least `min_price_rows` valid observations before `as_of`.
pub fn eligibility(
    returns: &ReturnTable,
    as_of: NaiveDate,
    min_history_days: i64,
    min_price_rows: usize,
) -> EligibilityMask {
    let history = returns.rows_before(as_of);
    history
        .assets()
        .iter()
        .enumerate()
        .map(|(col, asset)| {
            let mut first: Option<NaiveDate> = None;
            let mut count = 0usize;
            for (date, _) in history.valid_points(col) {
                first.get_or_insert(date);
                count += 1;
            }
            let eligible = match first {
                Some(first) => {
                    (as_of - first).num_days() >= min_history_days && count >= min_price_rows
                }
                None => false,
            };
            (asset.clone(), eligible)
        })
        .collect()
}

/// [`eligibility`] memoized through the cache when one is supplied.
pub fn eligibility_cached(
    cache: Option<&ArtifactCache>,
    returns: &ReturnTable,
    as_of: NaiveDate,
    config: &PitConfig,
) -> EligibilityMask {
    let history = returns.rows_before(as_of);
    let (Some(cache), Some(first)) = (cache, history.first_date()) else {
        return eligibility(&history, as_of, config.min_history_days, config.min_price_rows);
    };

    let params = config.cache_params();
    let range = DateRange::new(first, as_of);
    if let Some(CachePayload::Eligibility(mask)) =
        cache.get(EntryKind::Eligibility, &history, &params, range)
    {
        return mask;
    }

    let mask = eligibility(&history, as_of, config.min_history_days, config.min_price_rows);
    cache.put(&history, &params, range, CachePayload::Eligibility(mask.clone()));
    mask
}

/// Assets whose data stopped before `current_date` and has not resumed within
/// `[current_date, current_date + lookforward_days]` among the rows present.
///
/// Callers pass tables truncated at the current simulation step. Assets with no
/// data at all before `current_date` have not started and are never delisted.
pub fn detect_delistings(
    returns: &ReturnTable,
    current_date: NaiveDate,
    lookforward_days: i64,
) -> BTreeSet<String> {
    let horizon = current_date + Duration::days(lookforward_days.max(0));
    returns
        .assets()
        .iter()
        .enumerate()
        .filter(|(col, _)| {
            let mut last_before: Option<NaiveDate> = None;
            let mut seen_in_window = false;
            for (date, _) in returns.valid_points(*col) {
                if date < current_date {
                    last_before = Some(date);
                } else if date <= horizon {
                    seen_in_window = true;
                    break;
                } else {
                    break;
                }
            }
            last_before.is_some() && !seen_in_window
        })
        .map(|(_, asset)| asset.clone())
        .collect()
}

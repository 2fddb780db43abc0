//! Date-indexed, asset-keyed numeric tables for prices and returns.
//!
//! Missing observations are explicit `None` gaps, never zero-filled, so that
//! eligibility and delisting logic can see them.

use crate::domain::error::FactorsimError;
use chrono::{Datelike, NaiveDate};
use std::collections::{BTreeSet, HashSet};
use std::ops::Range;
use std::sync::OnceLock;

#[derive(Debug, Clone)]
pub struct AssetTable {
    dates: Vec<NaiveDate>,
    assets: Vec<String>,
    rows: Vec<Vec<Option<f64>>>,
    fingerprint: OnceLock<String>,
}

pub type PriceTable = AssetTable;
pub type ReturnTable = AssetTable;

/// One asset's observations prior to alignment on a shared timeline.
#[derive(Debug, Clone)]
pub struct AssetSeries {
    pub code: String,
    pub points: Vec<(NaiveDate, Option<f64>)>,
}

fn clean(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

impl AssetTable {
    pub fn new(
        dates: Vec<NaiveDate>,
        assets: Vec<String>,
        rows: Vec<Vec<Option<f64>>>,
    ) -> Result<Self, FactorsimError> {
        if rows.len() != dates.len() {
            return Err(FactorsimError::Data {
                reason: format!("{} rows for {} dates", rows.len(), dates.len()),
            });
        }
        if let Some(w) = dates.windows(2).find(|w| w[0] >= w[1]) {
            return Err(FactorsimError::Data {
                reason: format!("dates not strictly increasing at {}", w[1]),
            });
        }
        let mut seen = HashSet::new();
        for asset in &assets {
            if !seen.insert(asset.as_str()) {
                return Err(FactorsimError::Data {
                    reason: format!("duplicate asset column: {asset}"),
                });
            }
        }
        let rows = rows
            .into_iter()
            .enumerate()
            .map(|(i, row)| {
                if row.len() != assets.len() {
                    return Err(FactorsimError::Data {
                        reason: format!(
                            "row {} has {} values for {} assets",
                            dates[i],
                            row.len(),
                            assets.len()
                        ),
                    });
                }
                Ok(row.into_iter().map(clean).collect())
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            dates,
            assets,
            rows,
            fingerprint: OnceLock::new(),
        })
    }

    /// Build from column vectors sharing one date index.
    pub fn from_columns(
        dates: Vec<NaiveDate>,
        columns: Vec<(String, Vec<Option<f64>>)>,
    ) -> Result<Self, FactorsimError> {
        for (name, values) in &columns {
            if values.len() != dates.len() {
                return Err(FactorsimError::Data {
                    reason: format!(
                        "column {name} has {} values for {} dates",
                        values.len(),
                        dates.len()
                    ),
                });
            }
        }
        let rows = (0..dates.len())
            .map(|i| columns.iter().map(|(_, values)| values[i]).collect())
            .collect();
        let assets = columns.into_iter().map(|(name, _)| name).collect();
        Self::new(dates, assets, rows)
    }

    /// Align independent per-asset series on the union of their dates.
    pub fn align(series: Vec<AssetSeries>) -> Result<Self, FactorsimError> {
        let timeline: Vec<NaiveDate> = series
            .iter()
            .flat_map(|s| s.points.iter().map(|(date, _)| *date))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let columns = series
            .into_iter()
            .map(|s| {
                let mut column = vec![None; timeline.len()];
                for (date, value) in s.points {
                    if let Ok(i) = timeline.binary_search(&date) {
                        column[i] = value;
                    }
                }
                (s.code, column)
            })
            .collect();

        Self::from_columns(timeline, columns)
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn assets(&self) -> &[String] {
        &self.assets
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.dates.first().copied()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.dates.last().copied()
    }

    pub fn asset_index(&self, asset: &str) -> Option<usize> {
        self.assets.iter().position(|a| a == asset)
    }

    pub fn row_index(&self, date: NaiveDate) -> Option<usize> {
        self.dates.binary_search(&date).ok()
    }

    pub fn row(&self, row: usize) -> &[Option<f64>] {
        &self.rows[row]
    }

    pub fn value(&self, row: usize, col: usize) -> Option<f64> {
        self.rows.get(row).and_then(|r| r.get(col).copied().flatten())
    }

    pub fn value_at(&self, date: NaiveDate, asset: &str) -> Option<f64> {
        let row = self.row_index(date)?;
        let col = self.asset_index(asset)?;
        self.value(row, col)
    }

    /// Values of one asset column, top to bottom.
    pub fn column(&self, col: usize) -> impl Iterator<Item = Option<f64>> + '_ {
        self.rows.iter().map(move |r| r[col])
    }

    /// Dated valid observations of one asset column.
    pub fn valid_points(&self, col: usize) -> impl Iterator<Item = (NaiveDate, f64)> + '_ {
        self.dates
            .iter()
            .zip(self.rows.iter())
            .filter_map(move |(d, r)| r[col].map(|v| (*d, v)))
    }

    fn slice_rows(&self, range: Range<usize>) -> Self {
        Self {
            dates: self.dates[range.clone()].to_vec(),
            assets: self.assets.clone(),
            rows: self.rows[range].to_vec(),
            fingerprint: OnceLock::new(),
        }
    }

    /// Rows dated strictly before `date`.
    pub fn rows_before(&self, date: NaiveDate) -> Self {
        let end = self.dates.partition_point(|d| *d < date);
        self.slice_rows(0..end)
    }

    /// Rows dated at or before `date`.
    pub fn rows_through(&self, date: NaiveDate) -> Self {
        let end = self.dates.partition_point(|d| *d <= date);
        self.slice_rows(0..end)
    }

    /// Rows dated within `[start, end]`.
    pub fn between(&self, start: NaiveDate, end: NaiveDate) -> Self {
        let lo = self.dates.partition_point(|d| *d < start);
        let hi = self.dates.partition_point(|d| *d <= end).max(lo);
        self.slice_rows(lo..hi)
    }

    /// The last `n` rows (all rows when fewer exist).
    pub fn tail(&self, n: usize) -> Self {
        let start = self.len().saturating_sub(n);
        self.slice_rows(start..self.len())
    }

    /// The first `n` rows (all rows when fewer exist).
    pub fn head(&self, n: usize) -> Self {
        self.slice_rows(0..n.min(self.len()))
    }

    /// Restrict to the given assets, in the given order. Unknown names are ignored.
    pub fn select_assets(&self, assets: &[String]) -> Self {
        let cols: Vec<(usize, String)> = assets
            .iter()
            .filter_map(|a| self.asset_index(a).map(|i| (i, a.clone())))
            .collect();
        Self {
            dates: self.dates.clone(),
            assets: cols.iter().map(|(_, a)| a.clone()).collect(),
            rows: self
                .rows
                .iter()
                .map(|r| cols.iter().map(|(i, _)| r[*i]).collect())
                .collect(),
            fingerprint: OnceLock::new(),
        }
    }

    /// Simple returns between consecutive rows; a gap on either side yields a gap.
    pub fn pct_change(&self) -> Self {
        let rows = (0..self.len())
            .map(|i| {
                (0..self.assets.len())
                    .map(|c| {
                        if i == 0 {
                            return None;
                        }
                        match (self.rows[i - 1][c], self.rows[i][c]) {
                            (Some(prev), Some(curr)) if prev != 0.0 => Some(curr / prev - 1.0),
                            _ => None,
                        }
                    })
                    .collect()
            })
            .collect();
        Self {
            dates: self.dates.clone(),
            assets: self.assets.clone(),
            rows,
            fingerprint: OnceLock::new(),
        }
    }

    /// Content hash over dates, asset order and values. Computed once per table.
    pub fn fingerprint(&self) -> &str {
        self.fingerprint.get_or_init(|| {
            let mut hasher = blake3::Hasher::new();
            for asset in &self.assets {
                hasher.update(asset.as_bytes());
                hasher.update(&[0x1f]);
            }
            hasher.update(&[0x1e]);
            for (date, row) in self.dates.iter().zip(self.rows.iter()) {
                hasher.update(&date.num_days_from_ce().to_le_bytes());
                for value in row {
                    match value {
                        Some(v) => {
                            hasher.update(&[1]);
                            hasher.update(&v.to_bits().to_le_bytes());
                        }
                        None => {
                            hasher.update(&[0]);
                        }
                    }
                }
            }
            hasher.finalize().to_hex().to_string()
        })
    }
}

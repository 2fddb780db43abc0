//! CSV file data adapter.
//!
//! One `<CODE>.csv` per asset with a `date` column and a `close` column. A blank,
//! `NaN` or `null` close is a gap in the series.

use crate::domain::error::FactorsimError;
use crate::domain::table::{AssetSeries, AssetTable, PriceTable};
use crate::ports::data_port::DataPort;
use chrono::NaiveDate;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

pub struct CsvAdapter {
    base_path: PathBuf,
}

impl CsvAdapter {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn csv_path(&self, code: &str) -> PathBuf {
        self.base_path.join(format!("{code}.csv"))
    }

    fn read_series(
        &self,
        code: &str,
        history_start: Option<NaiveDate>,
        end_date: NaiveDate,
    ) -> Result<AssetSeries, FactorsimError> {
        let path = self.csv_path(code);
        if !path.exists() {
            return Err(FactorsimError::NoData {
                code: code.to_string(),
            });
        }
        let content = fs::read_to_string(&path).map_err(|e| FactorsimError::Data {
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;

        let mut rdr = csv::Reader::from_reader(content.as_bytes());
        let headers = rdr.headers().map_err(|e| FactorsimError::Data {
            reason: format!("{}: CSV header error: {}", path.display(), e),
        })?;
        let column = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(name))
                .ok_or_else(|| FactorsimError::Data {
                    reason: format!("{}: missing {} column", path.display(), name),
                })
        };
        let date_col = column("date")?;
        let close_col = column("close")?;

        let mut points = Vec::new();
        for result in rdr.records() {
            let record = result.map_err(|e| FactorsimError::Data {
                reason: format!("{}: CSV parse error: {}", path.display(), e),
            })?;

            let date_str = record.get(date_col).unwrap_or("").trim();
            let date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d").map_err(|e| {
                FactorsimError::Data {
                    reason: format!("{}: invalid date '{}': {}", path.display(), date_str, e),
                }
            })?;
            if date > end_date || history_start.is_some_and(|start| date < start) {
                continue;
            }

            let close = parse_close(record.get(close_col).unwrap_or("")).map_err(|raw| {
                FactorsimError::Data {
                    reason: format!("{}: invalid close '{}' on {}", path.display(), raw, date),
                }
            })?;
            points.push((date, close));
        }

        points.sort_by_key(|(date, _)| *date);
        if let Some(w) = points.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(FactorsimError::Data {
                reason: format!("{}: duplicate date {}", path.display(), w[0].0),
            });
        }
        debug!(%code, rows = points.len(), "loaded price series");
        Ok(AssetSeries {
            code: code.to_string(),
            points,
        })
    }
}

fn parse_close(raw: &str) -> Result<Option<f64>, String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("nan") || raw.eq_ignore_ascii_case("null") {
        return Ok(None);
    }
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() && v > 0.0 => Ok(Some(v)),
        Ok(v) if v.is_nan() => Ok(None),
        _ => Err(raw.to_string()),
    }
}

impl DataPort for CsvAdapter {
    fn fetch_prices(
        &self,
        codes: &[String],
        history_start: Option<NaiveDate>,
        end_date: NaiveDate,
    ) -> Result<PriceTable, FactorsimError> {
        let series = codes
            .iter()
            .map(|code| self.read_series(code, history_start, end_date))
            .collect::<Result<Vec<_>, _>>()?;
        AssetTable::align(series)
    }

    fn list_symbols(&self) -> Result<Vec<String>, FactorsimError> {
        let entries = fs::read_dir(&self.base_path).map_err(|e| FactorsimError::Data {
            reason: format!(
                "failed to read directory {}: {}",
                self.base_path.display(),
                e
            ),
        })?;

        let mut symbols = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| FactorsimError::Data {
                reason: format!("directory entry error: {}", e),
            })?;
            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            if let Some(code) = name_str.strip_suffix(".csv") {
                if !code.is_empty() {
                    symbols.push(code.to_string());
                }
            }
        }

        symbols.sort();
        Ok(symbols)
    }
}

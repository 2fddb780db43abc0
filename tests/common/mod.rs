#![allow(dead_code)]

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use factorsim::domain::allocation::AllocationConstraints;
use factorsim::domain::backtest::{BacktestConfig, RebalanceFrequency};
use factorsim::domain::costs::CostModel;
use factorsim::domain::eligibility::PitConfig;
use factorsim::domain::error::FactorsimError;
use factorsim::domain::table::{AssetTable, PriceTable};
use factorsim::ports::data_port::DataPort;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Monday to Friday dates in `[start, end]`.
pub fn business_days(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut days = Vec::new();
    let mut d = start;
    while d <= end {
        if !matches!(d.weekday(), Weekday::Sat | Weekday::Sun) {
            days.push(d);
        }
        d += Duration::days(1);
    }
    days
}

/// Seeded random-walk closes driven by one shared market factor plus
/// asset-specific noise, so assets are positively correlated.
pub fn synthetic_prices(dates: &[NaiveDate], assets: &[&str], seed: u64) -> PriceTable {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut levels: Vec<f64> = assets.iter().map(|_| 100.0).collect();
    let mut columns: Vec<Vec<Option<f64>>> = assets.iter().map(|_| Vec::new()).collect();

    for (i, _) in dates.iter().enumerate() {
        let market: f64 = rng.gen_range(-0.01..0.01);
        for (a, level) in levels.iter_mut().enumerate() {
            if i > 0 {
                let drift = 0.0002 * (a as f64 + 1.0);
                let noise: f64 = rng.gen_range(-0.008..0.008);
                *level *= 1.0 + drift + market + noise;
            }
            columns[a].push(Some(*level));
        }
    }

    AssetTable::from_columns(
        dates.to_vec(),
        assets
            .iter()
            .map(|a| a.to_string())
            .zip(columns)
            .collect(),
    )
    .unwrap()
}

/// Replace every value of `asset` after row `last_row` with a gap.
pub fn truncate_asset(table: &PriceTable, asset: &str, last_row: usize) -> PriceTable {
    let col = table.asset_index(asset).unwrap();
    let columns = table
        .assets()
        .iter()
        .enumerate()
        .map(|(c, name)| {
            let values = table
                .column(c)
                .enumerate()
                .map(|(r, v)| if c == col && r > last_row { None } else { v })
                .collect();
            (name.clone(), values)
        })
        .collect();
    AssetTable::from_columns(table.dates().to_vec(), columns).unwrap()
}

pub fn sample_config(start: NaiveDate, end: NaiveDate) -> BacktestConfig {
    BacktestConfig {
        start_date: start,
        end_date: end,
        initial_capital: Decimal::new(1_000_000, 0),
        frequency: RebalanceFrequency::Quarterly,
        costs: CostModel::new(0.001, 5.0, 5.0).unwrap(),
        cash_reserve: 0.0,
        risk_free_rate: 0.02,
        pit: PitConfig::default(),
        constraints: AllocationConstraints::default(),
    }
}

/// In-memory data port over one pre-built table.
pub struct MockDataPort {
    pub table: PriceTable,
}

impl MockDataPort {
    pub fn new(table: PriceTable) -> Self {
        Self { table }
    }
}

impl DataPort for MockDataPort {
    fn fetch_prices(
        &self,
        codes: &[String],
        history_start: Option<NaiveDate>,
        end_date: NaiveDate,
    ) -> Result<PriceTable, FactorsimError> {
        if let Some(missing) = codes.iter().find(|c| self.table.asset_index(c).is_none()) {
            return Err(FactorsimError::NoData {
                code: missing.clone(),
            });
        }
        let start = history_start.unwrap_or(NaiveDate::MIN);
        Ok(self.table.select_assets(codes).between(start, end_date))
    }

    fn list_symbols(&self) -> Result<Vec<String>, FactorsimError> {
        let mut symbols = self.table.assets().to_vec();
        symbols.sort();
        Ok(symbols)
    }
}

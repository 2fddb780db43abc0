//! Data access port trait.

use crate::domain::error::FactorsimError;
use crate::domain::table::PriceTable;
use chrono::NaiveDate;

pub trait DataPort {
    /// Close prices for `codes` aligned on a shared date index with explicit gaps.
    /// `history_start` of `None` loads everything available up to `end_date`.
    fn fetch_prices(
        &self,
        codes: &[String],
        history_start: Option<NaiveDate>,
        end_date: NaiveDate,
    ) -> Result<PriceTable, FactorsimError>;

    fn list_symbols(&self) -> Result<Vec<String>, FactorsimError>;
}

//! Domain error types.

use chrono::NaiveDate;

/// Top-level error type for factorsim.
#[derive(Debug, thiserror::Error)]
pub enum FactorsimError {
    #[error("data error: {reason}")]
    Data { reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error("no data for {code}")]
    NoData { code: String },

    #[error("insufficient data for {context}: have {have} rows, need {need}")]
    InsufficientData {
        context: String,
        have: usize,
        need: usize,
    },

    #[error("price data does not cover {boundary} {date} (available: {available})")]
    Coverage {
        boundary: &'static str,
        date: NaiveDate,
        available: String,
    },

    #[error("constraint violation: {reason}")]
    ConstraintViolation { reason: String },

    #[error("costing error: {reason}")]
    Costing { reason: String },

    #[error("rebalance on {date} failed: {source}")]
    Rebalance {
        date: NaiveDate,
        #[source]
        source: Box<FactorsimError>,
    },

    #[error("cache error: {reason}")]
    Cache { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FactorsimError {
    pub(crate) fn invalid(section: &str, key: &str, reason: impl Into<String>) -> Self {
        FactorsimError::ConfigInvalid {
            section: section.to_string(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// True for errors the engine treats as "skip this rebalance".
    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, FactorsimError::InsufficientData { .. })
    }

    pub fn rebalance(date: NaiveDate, source: FactorsimError) -> Self {
        FactorsimError::Rebalance {
            date,
            source: Box::new(source),
        }
    }
}

impl From<&FactorsimError> for std::process::ExitCode {
    fn from(err: &FactorsimError) -> Self {
        let code: u8 = match err {
            FactorsimError::Io(_) | FactorsimError::Cache { .. } => 1,
            FactorsimError::ConfigParse { .. }
            | FactorsimError::ConfigMissing { .. }
            | FactorsimError::ConfigInvalid { .. } => 2,
            FactorsimError::Data { .. } => 3,
            FactorsimError::ConstraintViolation { .. }
            | FactorsimError::Costing { .. }
            | FactorsimError::Rebalance { .. } => 4,
            FactorsimError::NoData { .. }
            | FactorsimError::InsufficientData { .. }
            | FactorsimError::Coverage { .. } => 5,
        };
        std::process::ExitCode::from(code)
    }
}

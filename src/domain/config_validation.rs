//! Configuration validation.
//!
//! Reads raw values through [`ConfigPort`], rejects malformed or out-of-range
//! values with the offending section and key, and builds the validated domain
//! structs. Optional features are off unless their section sets `enabled = true`.

use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::str::FromStr;

use crate::domain::allocation::{AllocationConstraints, AllocationStrategy, strategy_from_name};
use crate::domain::backtest::{BacktestConfig, RebalanceFrequency};
use crate::domain::costs::CostModel;
use crate::domain::eligibility::PitConfig;
use crate::domain::error::FactorsimError;
use crate::domain::membership::MembershipPolicy;
use crate::domain::preselection::{FactorMethod, PreselectionConfig};
use crate::ports::config_port::ConfigPort;

const DEFAULT_ALLOCATION_LOOKBACK: usize = 63;
const DEFAULT_CACHE_DIR: &str = ".factorsim_cache";

/// Where cached artifacts live and how long they stay valid.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSettings {
    pub dir: PathBuf,
    pub max_age: Option<Duration>,
}

/// Price source location and the assets to load.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSettings {
    pub dir: PathBuf,
    /// Explicit asset list. `None` loads every file in `dir`.
    pub codes: Option<Vec<String>>,
    /// Earliest date to load, leaving room for lookback windows before `start_date`.
    pub history_start: Option<NaiveDate>,
}

/// Validate every section without keeping the results.
pub fn validate_config(config: &dyn ConfigPort) -> Result<(), FactorsimError> {
    build_backtest_config(config)?;
    build_preselection(config)?;
    build_membership(config)?;
    build_strategy(config)?;
    build_cache_settings(config)?;
    build_data_settings(config)?;
    Ok(())
}

fn parse<T: FromStr>(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    expected: &str,
) -> Result<Option<T>, FactorsimError> {
    match config.get_string(section, key) {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            FactorsimError::invalid(section, key, format!("'{raw}' is not {expected}"))
        }),
    }
}

fn parse_f64(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
) -> Result<Option<f64>, FactorsimError> {
    match parse::<f64>(config, section, key, "a number")? {
        Some(v) if !v.is_finite() => Err(FactorsimError::invalid(section, key, "must be finite")),
        other => Ok(other),
    }
}

fn non_negative(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: f64,
) -> Result<f64, FactorsimError> {
    let value = parse_f64(config, section, key)?.unwrap_or(default);
    if value < 0.0 {
        return Err(FactorsimError::invalid(
            section,
            key,
            format!("{key} must be non-negative"),
        ));
    }
    Ok(value)
}

fn parse_usize(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
) -> Result<Option<usize>, FactorsimError> {
    parse::<usize>(config, section, key, "a non-negative integer")
}

fn required_date(config: &dyn ConfigPort, key: &str) -> Result<NaiveDate, FactorsimError> {
    let raw = config
        .get_string("backtest", key)
        .ok_or_else(|| FactorsimError::ConfigMissing {
            section: "backtest".to_string(),
            key: key.to_string(),
        })?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|_| {
        FactorsimError::invalid(
            "backtest",
            key,
            format!("invalid {key} format, expected YYYY-MM-DD"),
        )
    })
}

pub fn build_backtest_config(config: &dyn ConfigPort) -> Result<BacktestConfig, FactorsimError> {
    let start_date = required_date(config, "start_date")?;
    let end_date = required_date(config, "end_date")?;

    let initial_capital =
        parse::<Decimal>(config, "backtest", "initial_capital", "a decimal amount")?.ok_or_else(
            || FactorsimError::ConfigMissing {
                section: "backtest".to_string(),
                key: "initial_capital".to_string(),
            },
        )?;

    let frequency = match config.get_string("backtest", "rebalance_frequency") {
        Some(raw) => raw.parse::<RebalanceFrequency>()?,
        None => RebalanceFrequency::Monthly,
    };

    let costs = CostModel::new(
        non_negative(config, "backtest", "commission_rate", 0.0)?,
        non_negative(config, "backtest", "commission_min", 0.0)?,
        non_negative(config, "backtest", "slippage_bps", 0.0)?,
    )?;

    let risk_free_rate = parse_f64(config, "backtest", "risk_free_rate")?.unwrap_or(0.0);
    if !(0.0..1.0).contains(&risk_free_rate) {
        return Err(FactorsimError::invalid(
            "backtest",
            "risk_free_rate",
            "risk_free_rate must be between 0 and 1",
        ));
    }

    let defaults = PitConfig::default();
    let pit = PitConfig {
        enabled: config.get_bool("pit", "enabled", defaults.enabled)?,
        min_history_days: parse::<i64>(config, "pit", "min_history_days", "an integer")?
            .unwrap_or(defaults.min_history_days),
        min_price_rows: parse_usize(config, "pit", "min_price_rows")?
            .unwrap_or(defaults.min_price_rows),
        delisting_lookforward_days: parse::<i64>(
            config,
            "pit",
            "delisting_lookforward_days",
            "an integer",
        )?
        .unwrap_or(defaults.delisting_lookforward_days),
    };

    let backtest = BacktestConfig {
        start_date,
        end_date,
        initial_capital,
        frequency,
        costs,
        cash_reserve: non_negative(config, "backtest", "cash_reserve", 0.0)?,
        risk_free_rate,
        pit,
        constraints: AllocationConstraints {
            max_weight: parse_f64(config, "allocation", "max_weight")?,
        },
    };
    backtest.validate()?;
    Ok(backtest)
}

pub fn build_preselection(
    config: &dyn ConfigPort,
) -> Result<Option<PreselectionConfig>, FactorsimError> {
    if !config.get_bool("preselection", "enabled", false)? {
        return Ok(None);
    }
    let defaults = PreselectionConfig::default();
    let method = match config.get_string("preselection", "method") {
        Some(raw) => raw.parse::<FactorMethod>()?,
        None => defaults.method,
    };
    let presel = PreselectionConfig {
        method,
        top_k: parse_usize(config, "preselection", "top_k")?.unwrap_or(defaults.top_k),
        lookback: parse_usize(config, "preselection", "lookback")?.unwrap_or(defaults.lookback),
        skip: parse_usize(config, "preselection", "skip")?.unwrap_or(defaults.skip),
        momentum_weight: parse_f64(config, "preselection", "momentum_weight")?
            .unwrap_or(defaults.momentum_weight),
        low_vol_weight: parse_f64(config, "preselection", "low_vol_weight")?
            .unwrap_or(defaults.low_vol_weight),
        min_periods: parse_usize(config, "preselection", "min_periods")?
            .unwrap_or(defaults.min_periods),
    };
    presel.validate()?;
    Ok(Some(presel))
}

pub fn build_membership(
    config: &dyn ConfigPort,
) -> Result<Option<MembershipPolicy>, FactorsimError> {
    if !config.has_section("membership") {
        return Ok(None);
    }
    let policy = MembershipPolicy {
        enabled: config.get_bool("membership", "enabled", false)?,
        buffer_rank: parse_usize(config, "membership", "buffer_rank")?,
        min_holding_periods: parse_usize(config, "membership", "min_holding_periods")?,
        max_turnover: parse_f64(config, "membership", "max_turnover")?,
        max_new_assets: parse_usize(config, "membership", "max_new_assets")?,
        max_removed_assets: parse_usize(config, "membership", "max_removed_assets")?,
    };
    policy.validate()?;
    Ok(Some(policy))
}

pub fn build_strategy(
    config: &dyn ConfigPort,
) -> Result<Box<dyn AllocationStrategy>, FactorsimError> {
    let name = config
        .get_string("allocation", "strategy")
        .unwrap_or_else(|| "equal_weight".to_string());
    let lookback =
        parse_usize(config, "allocation", "lookback")?.unwrap_or(DEFAULT_ALLOCATION_LOOKBACK);
    if lookback < 2 {
        return Err(FactorsimError::invalid(
            "allocation",
            "lookback",
            "lookback must be at least 2",
        ));
    }
    strategy_from_name(&name, lookback)
}

pub fn build_cache_settings(
    config: &dyn ConfigPort,
) -> Result<Option<CacheSettings>, FactorsimError> {
    if !config.get_bool("cache", "enabled", false)? {
        return Ok(None);
    }
    let dir = config
        .get_string("cache", "dir")
        .unwrap_or_else(|| DEFAULT_CACHE_DIR.to_string());
    let max_age = match parse::<i64>(config, "cache", "max_age_days", "an integer")? {
        Some(days) if days <= 0 => {
            return Err(FactorsimError::invalid(
                "cache",
                "max_age_days",
                "max_age_days must be positive",
            ));
        }
        Some(days) => Some(Duration::days(days)),
        None => None,
    };
    Ok(Some(CacheSettings {
        dir: PathBuf::from(dir),
        max_age,
    }))
}

pub fn build_data_settings(config: &dyn ConfigPort) -> Result<DataSettings, FactorsimError> {
    let dir = config
        .get_string("data", "dir")
        .ok_or_else(|| FactorsimError::ConfigMissing {
            section: "data".to_string(),
            key: "dir".to_string(),
        })?;
    let codes = config.get_string("data", "codes").map(|raw| {
        raw.split(',')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
    });
    if codes.as_ref().is_some_and(|c| c.is_empty()) {
        return Err(FactorsimError::invalid(
            "data",
            "codes",
            "codes must list at least one asset",
        ));
    }
    let history_start = match config.get_string("data", "history_start") {
        Some(raw) => Some(NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|_| {
            FactorsimError::invalid("data", "history_start", "expected YYYY-MM-DD")
        })?),
        None => None,
    };
    Ok(DataSettings {
        dir: PathBuf::from(dir),
        codes,
        history_start,
    })
}

//! Core domain types and logic.

pub mod allocation;
pub mod backtest;
pub mod cache;
pub mod config_validation;
pub mod costs;
pub mod eligibility;
pub mod error;
pub mod membership;
pub mod metrics;
pub mod portfolio;
pub mod preselection;
pub mod table;

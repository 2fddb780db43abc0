//! Configuration access port trait.
//!
//! Values come back as raw strings; typed parsing and range checks live in
//! `domain::config_validation` so that a malformed value is reported instead of
//! silently replaced by a default.

use crate::domain::error::FactorsimError;

pub trait ConfigPort {
    fn get_string(&self, section: &str, key: &str) -> Option<String>;
    /// `default` when the key is absent; a present value that is not a boolean is an error.
    fn get_bool(&self, section: &str, key: &str, default: bool) -> Result<bool, FactorsimError>;
    fn has_section(&self, section: &str) -> bool;
}

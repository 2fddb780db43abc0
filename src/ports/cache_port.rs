//! Persistent cache storage port.

use crate::domain::cache::CacheEntry;
use crate::domain::error::FactorsimError;

/// Key/value storage for cache entries addressed by their digest.
///
/// Implementations report corruption as an error; callers decide whether that is a miss.
pub trait CachePort {
    fn load(&self, key: &str) -> Result<Option<CacheEntry>, FactorsimError>;

    /// Store an entry. A failed store must not leave a partially written entry behind.
    fn store(&self, entry: &CacheEntry) -> Result<(), FactorsimError>;

    fn remove(&self, key: &str) -> Result<(), FactorsimError>;

    /// Remove every entry, returning how many were removed.
    fn clear(&self) -> Result<usize, FactorsimError>;
}

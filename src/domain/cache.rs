//! Content-addressed cache for factor scores and eligibility masks.
//!
//! An entry is keyed by the dataset fingerprint, a fingerprint of the sorted
//! configuration pairs, the date range and the entry kind. Reads treat any
//! storage problem as a miss; writes never fail the caller.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

use super::table::AssetTable;
use crate::ports::cache_port::CachePort;

/// Hex characters kept from the blake3 digest.
pub const KEY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    FactorScores,
    Eligibility,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKind::FactorScores => write!(f, "factor_scores"),
            EntryKind::Eligibility => write!(f, "eligibility"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        DateRange { start, end }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "values", rename_all = "snake_case")]
pub enum CachePayload {
    FactorScores(BTreeMap<String, Option<f64>>),
    Eligibility(BTreeMap<String, bool>),
}

impl CachePayload {
    pub fn kind(&self) -> EntryKind {
        match self {
            CachePayload::FactorScores(_) => EntryKind::FactorScores,
            CachePayload::Eligibility(_) => EntryKind::Eligibility,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMeta {
    pub key: String,
    pub dataset_fingerprint: String,
    pub config_fingerprint: String,
    pub date_range: DateRange,
    pub entry_kind: EntryKind,
    pub created_at: DateTime<Utc>,
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub meta: CacheMeta,
    pub payload: CachePayload,
}

/// Hash of configuration pairs. `BTreeMap` iteration gives the sorted order.
pub fn config_fingerprint(params: &BTreeMap<String, String>) -> String {
    let mut hasher = blake3::Hasher::new();
    for (key, value) in params {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().to_hex().to_string()
}

pub fn cache_key(
    dataset_fingerprint: &str,
    config_fingerprint: &str,
    range: DateRange,
    kind: EntryKind,
) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(dataset_fingerprint.as_bytes());
    hasher.update(b"|");
    hasher.update(config_fingerprint.as_bytes());
    hasher.update(b"|");
    hasher.update(range.start.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(range.end.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(kind.to_string().as_bytes());
    let mut hex = hasher.finalize().to_hex().to_string();
    hex.truncate(KEY_LEN);
    hex
}

/// Cache front end used by eligibility and preselection.
pub struct ArtifactCache {
    store: Box<dyn CachePort>,
    max_age: Option<Duration>,
}

impl ArtifactCache {
    pub fn new(store: Box<dyn CachePort>, max_age: Option<Duration>) -> Self {
        Self { store, max_age }
    }

    pub fn get(
        &self,
        kind: EntryKind,
        dataset: &AssetTable,
        params: &BTreeMap<String, String>,
        range: DateRange,
    ) -> Option<CachePayload> {
        self.get_at(kind, dataset, params, range, Utc::now())
    }

    /// Like [`ArtifactCache::get`] with an explicit clock for the age check.
    pub fn get_at(
        &self,
        kind: EntryKind,
        dataset: &AssetTable,
        params: &BTreeMap<String, String>,
        range: DateRange,
        now: DateTime<Utc>,
    ) -> Option<CachePayload> {
        let config_fp = config_fingerprint(params);
        let key = cache_key(dataset.fingerprint(), &config_fp, range, kind);

        let entry = match self.store.load(&key) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!(%key, %kind, "cache miss");
                return None;
            }
            Err(e) => {
                warn!(%key, error = %e, "unreadable cache entry, treating as miss");
                return None;
            }
        };

        let meta = &entry.meta;
        if meta.key != key
            || meta.entry_kind != kind
            || meta.dataset_fingerprint != dataset.fingerprint()
            || meta.config_fingerprint != config_fp
            || meta.date_range != range
            || entry.payload.kind() != kind
        {
            warn!(%key, "cache metadata mismatch, treating as miss");
            return None;
        }

        if let Some(max_age) = self.max_age {
            if now - meta.created_at > max_age {
                debug!(%key, "cache entry expired");
                if let Err(e) = self.store.remove(&key) {
                    warn!(%key, error = %e, "failed to remove expired cache entry");
                }
                return None;
            }
        }

        debug!(%key, %kind, "cache hit");
        Some(entry.payload)
    }

    pub fn put(
        &self,
        dataset: &AssetTable,
        params: &BTreeMap<String, String>,
        range: DateRange,
        payload: CachePayload,
    ) {
        let kind = payload.kind();
        let config_fp = config_fingerprint(params);
        let key = cache_key(dataset.fingerprint(), &config_fp, range, kind);
        let entry = CacheEntry {
            meta: CacheMeta {
                key: key.clone(),
                dataset_fingerprint: dataset.fingerprint().to_string(),
                config_fingerprint: config_fp,
                date_range: range,
                entry_kind: kind,
                created_at: Utc::now(),
                params: params.clone(),
            },
            payload,
        };
        if let Err(e) = self.store.store(&entry) {
            warn!(%key, error = %e, "cache write failed, continuing without cache");
        }
    }

    /// Remove every entry. Returns how many were removed.
    pub fn clear(&self) -> usize {
        match self.store.clear() {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "cache clear failed");
                0
            }
        }
    }
}

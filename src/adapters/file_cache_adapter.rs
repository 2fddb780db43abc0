//! Filesystem cache store.
//!
//! Layout: `{cache_dir}/meta/{key}.json` holds the metadata sidecar and
//! `{cache_dir}/data/{key}.json` the payload. Both files are written to `.tmp`
//! first and renamed into place; a failure removes whatever was written.

use crate::domain::cache::{CacheEntry, CacheMeta, CachePayload};
use crate::domain::error::FactorsimError;
use crate::ports::cache_port::CachePort;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub struct FileCacheAdapter {
    cache_dir: PathBuf,
}

fn cache_err(context: &str, e: impl std::fmt::Display) -> FactorsimError {
    FactorsimError::Cache {
        reason: format!("{context}: {e}"),
    }
}

fn remove_if_exists(path: &Path) -> Result<bool, FactorsimError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(cache_err(&format!("remove {}", path.display()), e)),
    }
}

impl FileCacheAdapter {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn meta_dir(&self) -> PathBuf {
        self.cache_dir.join("meta")
    }

    fn data_dir(&self) -> PathBuf {
        self.cache_dir.join("data")
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.meta_dir().join(format!("{key}.json"))
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.data_dir().join(format!("{key}.json"))
    }

    /// Number of entries with a metadata sidecar.
    pub fn len(&self) -> Result<usize, FactorsimError> {
        Ok(self.keys()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, FactorsimError> {
        Ok(self.len()? == 0)
    }

    fn keys(&self) -> Result<Vec<String>, FactorsimError> {
        let entries = match fs::read_dir(self.meta_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(cache_err("read meta dir", e)),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| cache_err("meta dir entry", e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), FactorsimError> {
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, contents).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            cache_err(&format!("write {}", tmp_path.display()), e)
        })?;
        fs::rename(&tmp_path, path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            cache_err("atomic rename failed", e)
        })
    }
}

impl CachePort for FileCacheAdapter {
    fn load(&self, key: &str) -> Result<Option<CacheEntry>, FactorsimError> {
        let meta_raw = match fs::read_to_string(self.meta_path(key)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(cache_err("read metadata", e)),
        };
        let meta: CacheMeta =
            serde_json::from_str(&meta_raw).map_err(|e| cache_err("corrupt metadata", e))?;
        let data_raw =
            fs::read_to_string(self.data_path(key)).map_err(|e| cache_err("read payload", e))?;
        let payload: CachePayload =
            serde_json::from_str(&data_raw).map_err(|e| cache_err("corrupt payload", e))?;
        Ok(Some(CacheEntry { meta, payload }))
    }

    fn store(&self, entry: &CacheEntry) -> Result<(), FactorsimError> {
        let key = &entry.meta.key;
        fs::create_dir_all(self.meta_dir()).map_err(|e| cache_err("create meta dir", e))?;
        fs::create_dir_all(self.data_dir()).map_err(|e| cache_err("create data dir", e))?;

        let payload = serde_json::to_vec(&entry.payload)
            .map_err(|e| cache_err("payload serialization", e))?;
        let meta = serde_json::to_vec_pretty(&entry.meta)
            .map_err(|e| cache_err("meta serialization", e))?;

        // Payload first: a sidecar without its payload would be a corrupt entry.
        Self::write_atomic(&self.data_path(key), &payload)?;
        if let Err(e) = Self::write_atomic(&self.meta_path(key), &meta) {
            let _ = fs::remove_file(self.data_path(key));
            return Err(e);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), FactorsimError> {
        remove_if_exists(&self.meta_path(key))?;
        remove_if_exists(&self.data_path(key))?;
        Ok(())
    }

    fn clear(&self) -> Result<usize, FactorsimError> {
        let keys = self.keys()?;
        for key in &keys {
            self.remove(key)?;
        }
        // Orphaned payloads and temp files from interrupted writes.
        for dir in [self.meta_dir(), self.data_dir()] {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                remove_if_exists(&entry.path())?;
            }
        }
        Ok(keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cache::{ArtifactCache, DateRange, EntryKind, cache_key};
    use crate::domain::table::AssetTable;
    use chrono::{NaiveDate, Utc};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn entry(key: &str) -> CacheEntry {
        CacheEntry {
            meta: CacheMeta {
                key: key.to_string(),
                dataset_fingerprint: "ds".into(),
                config_fingerprint: "cfg".into(),
                date_range: DateRange::new(d(1), d(31)),
                entry_kind: EntryKind::Eligibility,
                created_at: Utc::now(),
                params: BTreeMap::new(),
            },
            payload: CachePayload::Eligibility(
                [("BHP".to_string(), true), ("CBA".to_string(), false)]
                    .into_iter()
                    .collect(),
            ),
        }
    }

    #[test]
    fn store_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = FileCacheAdapter::new(dir.path());
        let e = entry("abc");
        store.store(&e).unwrap();

        assert!(dir.path().join("meta/abc.json").exists());
        assert!(dir.path().join("data/abc.json").exists());
        assert_eq!(store.load("abc").unwrap(), Some(e));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn load_missing_key_is_none() {
        let dir = TempDir::new().unwrap();
        let store = FileCacheAdapter::new(dir.path());
        assert_eq!(store.load("nope").unwrap(), None);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn corrupt_metadata_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = FileCacheAdapter::new(dir.path());
        store.store(&entry("abc")).unwrap();
        fs::write(dir.path().join("meta/abc.json"), "{not json").unwrap();
        assert!(matches!(store.load("abc"), Err(FactorsimError::Cache { .. })));
    }

    #[test]
    fn missing_payload_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = FileCacheAdapter::new(dir.path());
        store.store(&entry("abc")).unwrap();
        fs::remove_file(dir.path().join("data/abc.json")).unwrap();
        assert!(store.load("abc").is_err());
    }

    #[test]
    fn remove_and_clear() {
        let dir = TempDir::new().unwrap();
        let store = FileCacheAdapter::new(dir.path());
        store.store(&entry("a")).unwrap();
        store.store(&entry("b")).unwrap();
        store.store(&entry("c")).unwrap();
        fs::write(dir.path().join("data/orphan.json"), "{}").unwrap();

        store.remove("a").unwrap();
        assert_eq!(store.len().unwrap(), 2);
        assert_eq!(store.clear().unwrap(), 2);
        assert!(store.is_empty().unwrap());
        assert!(!dir.path().join("data/orphan.json").exists());
    }

    #[test]
    fn failed_write_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        // A file where the meta directory should be makes every meta write fail.
        fs::write(dir.path().join("meta"), "blocker").unwrap();
        let store = FileCacheAdapter::new(dir.path());
        assert!(store.store(&entry("abc")).is_err());
        assert!(!dir.path().join("data/abc.json").exists());
    }

    #[test]
    fn factor_scores_round_trip_bit_exact() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let dir = TempDir::new().unwrap();
        let store = FileCacheAdapter::new(dir.path());
        let mut rng = StdRng::seed_from_u64(42);
        let mut scores: BTreeMap<String, Option<f64>> = (0..5_000)
            .map(|i| {
                let scale = 10f64.powi(rng.gen_range(-8..4));
                (format!("A{i:05}"), Some(rng.gen_range(-1.0..1.0) * scale))
            })
            .collect();
        scores.insert("EDGE".into(), Some(-0.00021139732328732654));
        scores.insert("GAP".into(), None);

        let mut e = entry("scores");
        e.meta.entry_kind = EntryKind::FactorScores;
        e.payload = CachePayload::FactorScores(scores.clone());
        store.store(&e).unwrap();

        let Some(CacheEntry {
            payload: CachePayload::FactorScores(loaded),
            ..
        }) = store.load("scores").unwrap()
        else {
            panic!("expected factor scores");
        };
        assert_eq!(loaded.len(), scores.len());
        for (asset, stored) in &scores {
            assert_eq!(
                loaded[asset].map(f64::to_bits),
                stored.map(f64::to_bits),
                "{asset}"
            );
        }
    }

    #[test]
    fn artifact_cache_over_files_survives_corruption() {
        let dir = TempDir::new().unwrap();
        let cache = ArtifactCache::new(Box::new(FileCacheAdapter::new(dir.path())), None);
        let table = AssetTable::from_columns(
            vec![d(1), d(2)],
            vec![("BHP".into(), vec![Some(1.0), Some(2.0)])],
        )
        .unwrap();
        let params: BTreeMap<String, String> = BTreeMap::new();
        let range = DateRange::new(d(1), d(2));
        let payload = CachePayload::FactorScores(
            [("BHP".to_string(), Some(0.5))].into_iter().collect(),
        );

        cache.put(&table, &params, range, payload.clone());
        assert_eq!(
            cache.get(EntryKind::FactorScores, &table, &params, range),
            Some(payload)
        );

        let key = cache_key(
            table.fingerprint(),
            &crate::domain::cache::config_fingerprint(&params),
            range,
            EntryKind::FactorScores,
        );
        fs::write(dir.path().join(format!("data/{key}.json")), "garbage").unwrap();
        assert!(cache
            .get(EntryKind::FactorScores, &table, &params, range)
            .is_none());
    }
}

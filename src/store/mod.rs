//! Measurement result store
//!
//! Results are keyed by image set number and measurement name. Workers record
//! measurements into a local store, save it, and ship the file bytes to the
//! server; the server merges each reported file into the aggregate store.
//!
//! # File format
//!
//! ```text
//! {"image_sets": {"1": {"Count_Nuclei": 12, "Plate": "A01"}, "2": {...}}}
//! ```

use crate::error::BrokerError;
use crate::Result;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

type Measurements = BTreeMap<String, Value>;

/// Accumulator that merges reported result files
pub trait ResultSink: Send {
    /// Merge the result store saved at `path` into this sink.
    ///
    /// Merges in memory only; nothing changes when this fails. Returns the
    /// number of measurements written.
    fn combine_file(&mut self, path: &Path, can_overwrite: bool) -> Result<usize>;

    /// Write everything merged so far to the backing file, if there is one
    fn flush(&mut self) -> Result<()>;

    /// Backing file of the sink, if it has one
    fn location(&self) -> Option<&Path>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasurementStore {
    image_sets: BTreeMap<u64, Measurements>,

    #[serde(skip)]
    path: Option<PathBuf>,
}

impl MeasurementStore {
    /// In-memory store without a backing file
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the store at `path`, starting empty if the file does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            return Self::load(&path);
        }
        Ok(Self {
            image_sets: BTreeMap::new(),
            path: Some(path),
        })
    }

    /// Load an existing store file
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read measurements: {}", path.display()))?;
        let mut store = Self::from_bytes(&bytes)
            .with_context(|| format!("Failed to parse measurements: {}", path.display()))?;
        store.path = Some(path.to_path_buf());
        Ok(store)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("Invalid measurement store")
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("Failed to serialize measurements")
    }

    pub fn record(&mut self, image_set: u64, name: impl Into<String>, value: impl Into<Value>) {
        self.image_sets
            .entry(image_set)
            .or_default()
            .insert(name.into(), value.into());
    }

    pub fn get(&self, image_set: u64, name: &str) -> Option<&Value> {
        self.image_sets.get(&image_set)?.get(name)
    }

    pub fn image_set_count(&self) -> usize {
        self.image_sets.len()
    }

    pub fn image_sets(&self) -> impl Iterator<Item = u64> + '_ {
        self.image_sets.keys().copied()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Merge `other` into this store.
    ///
    /// When `can_overwrite` is false a differing value for an existing measurement
    /// is rejected and nothing is merged. Returns the number of measurements written.
    pub fn combine(
        &mut self,
        other: &MeasurementStore,
        can_overwrite: bool,
    ) -> std::result::Result<usize, BrokerError> {
        if !can_overwrite {
            for (image_set, measurements) in &other.image_sets {
                for (name, value) in measurements {
                    if let Some(existing) = self.get(*image_set, name) {
                        if existing != value {
                            return Err(BrokerError::MeasurementConflict {
                                image_set: *image_set,
                                name: name.clone(),
                            });
                        }
                    }
                }
            }
        }

        let mut written = 0;
        for (image_set, measurements) in &other.image_sets {
            let target = self.image_sets.entry(*image_set).or_default();
            for (name, value) in measurements {
                target.insert(name.clone(), value.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    /// Write the store to its backing file
    pub fn save(&self) -> Result<()> {
        let path = self.path.as_deref()
            .context("Measurement store has no backing file")?;
        self.write_to(path)
    }

    /// Write the store to `path` and make it the backing file
    pub fn save_as(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        self.write_to(&path)?;
        self.path = Some(path);
        Ok(())
    }

    /// Replace the file atomically so a reader never sees a partial store
    fn write_to(&self, path: &Path) -> Result<()> {
        let dir = parent_dir(path);
        let mut file = tempfile::Builder::new()
            .prefix(".workbroker-store-")
            .tempfile_in(dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;

        file.write_all(&self.to_bytes()?)
            .context("Failed to write measurements")?;
        file.flush()?;

        file.persist(path)
            .with_context(|| format!("Failed to save measurements: {}", path.display()))?;
        Ok(())
    }
}

impl ResultSink for MeasurementStore {
    fn combine_file(&mut self, path: &Path, can_overwrite: bool) -> Result<usize> {
        let other = MeasurementStore::load(path)?;
        Ok(self.combine(&other, can_overwrite)?)
    }

    fn flush(&mut self) -> Result<()> {
        match self.path {
            Some(_) => self.save(),
            None => Ok(()),
        }
    }

    fn location(&self) -> Option<&Path> {
        self.path()
    }
}

/// Directory a file lives in, `.` for bare file names
pub fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_record_and_get() {
        let mut store = MeasurementStore::new();
        store.record(1, "Count_Nuclei", 12);
        store.record(1, "Plate", "A01");
        store.record(3, "Count_Nuclei", 7.5);

        assert_eq!(store.get(1, "Count_Nuclei"), Some(&json!(12)));
        assert_eq!(store.get(1, "Plate"), Some(&json!("A01")));
        assert_eq!(store.get(2, "Count_Nuclei"), None);
        assert_eq!(store.image_set_count(), 2);
        assert_eq!(store.image_sets().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_combine_with_overwrite() {
        let mut aggregate = MeasurementStore::new();
        aggregate.record(1, "Count", 1);

        let mut other = MeasurementStore::new();
        other.record(1, "Count", 2);
        other.record(2, "Count", 5);

        assert_eq!(aggregate.combine(&other, true).unwrap(), 2);
        assert_eq!(aggregate.get(1, "Count"), Some(&json!(2)));
        assert_eq!(aggregate.get(2, "Count"), Some(&json!(5)));
    }

    #[test]
    fn test_combine_conflict_without_overwrite() {
        let mut aggregate = MeasurementStore::new();
        aggregate.record(1, "Count", 1);

        let mut other = MeasurementStore::new();
        other.record(2, "Count", 5);
        other.record(1, "Count", 2);

        let err = aggregate.combine(&other, false).unwrap_err();
        assert!(matches!(err, BrokerError::MeasurementConflict { image_set: 1, .. }));
        assert_eq!(aggregate.get(2, "Count"), None);

        // Identical values are not a conflict
        let mut same = MeasurementStore::new();
        same.record(1, "Count", 1);
        assert_eq!(aggregate.combine(&same, false).unwrap(), 1);
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("measurements.json");

        let mut store = MeasurementStore::open(&path).unwrap();
        assert_eq!(store.image_set_count(), 0);
        store.record(4, "Area", 120.5);
        store.save().unwrap();

        let loaded = MeasurementStore::load(&path).unwrap();
        assert_eq!(loaded.get(4, "Area"), Some(&json!(120.5)));
        assert_eq!(loaded.path(), Some(path.as_path()));

        let reopened = MeasurementStore::open(&path).unwrap();
        assert_eq!(reopened.image_set_count(), 1);
    }

    #[test]
    fn test_save_without_path_fails() {
        assert!(MeasurementStore::new().save().is_err());
    }

    #[test]
    fn test_bytes_round_trip_file_format() {
        let mut store = MeasurementStore::new();
        store.record(2, "Count", 3);

        let bytes = store.to_bytes().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"image_sets": {"2": {"Count": 3}}}));

        assert_eq!(MeasurementStore::from_bytes(&bytes).unwrap(), store);
        assert!(MeasurementStore::from_bytes(b"not json").is_err());
    }

    #[test]
    fn test_combine_file_persists_on_flush() {
        let temp_dir = TempDir::new().unwrap();
        let aggregate_path = temp_dir.path().join("aggregate.json");
        let mut aggregate = MeasurementStore::open(&aggregate_path).unwrap();

        let mut result = MeasurementStore::new();
        result.record(7, "Count", 9);
        result.save_as(temp_dir.path().join("result.json")).unwrap();

        let written = aggregate.combine_file(result.path().unwrap(), true).unwrap();
        assert_eq!(written, 1);
        assert!(!aggregate_path.exists());

        aggregate.flush().unwrap();
        let on_disk = MeasurementStore::load(&aggregate_path).unwrap();
        assert_eq!(on_disk.get(7, "Count"), Some(&json!(9)));
        assert_eq!(aggregate.location(), Some(aggregate_path.as_path()));
    }

    #[test]
    fn test_failed_combine_file_leaves_store_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let mut aggregate = MeasurementStore::open(temp_dir.path().join("aggregate.json")).unwrap();
        aggregate.record(1, "Count", 1);
        let before = aggregate.clone();

        let garbage = temp_dir.path().join("garbage.json");
        std::fs::write(&garbage, b"{\"image_sets\": 3}").unwrap();
        assert!(aggregate.combine_file(&garbage, true).is_err());

        let mut conflicting = MeasurementStore::new();
        conflicting.record(2, "Count", 4);
        conflicting.record(1, "Count", 2);
        conflicting.save_as(temp_dir.path().join("conflict.json")).unwrap();
        assert!(aggregate.combine_file(conflicting.path().unwrap(), false).is_err());

        assert_eq!(aggregate, before);
    }

    #[test]
    fn test_flush_without_backing_file_is_noop() {
        let mut store = MeasurementStore::new();
        store.record(1, "Count", 1);
        assert!(store.flush().is_ok());
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir(Path::new("out.json")), Path::new("."));
        assert_eq!(parent_dir(Path::new("/tmp/out.json")), Path::new("/tmp"));
    }
}

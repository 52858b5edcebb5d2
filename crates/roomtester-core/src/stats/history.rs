//! Time-bucketed measurement history
//!
//! Stores one measurement vector per (meter, source, bucket) where a bucket
//! is a 0.1 s cell of playback time. Writes overwrite the bucket (last write
//! wins) and nothing is ever deleted. Every `snapshot_every` writes the whole
//! store is handed to a [`HistoryBackend`] for durable storage.

use crate::audio::buffer::Source;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Width of a history bucket in seconds
pub const BUCKET_SECS: f64 = 0.1;

/// Buckets per second
const BUCKETS_PER_SEC: f64 = 1.0 / BUCKET_SECS;

/// Scaled times this close to a grid line snap onto it
const GRID_SNAP: f64 = 1e-6;

/// Default number of writes between snapshots
pub const DEFAULT_SNAPSHOT_EVERY: u64 = 100;

/// Errors raised by the history store
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("No data for meter '{meter}' in [{start}, {end}]")]
    NoDataInRange { meter: String, start: f64, end: f64 },

    #[error("History persistence failed: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("History serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Index of a 0.1 s cell on the history time grid
///
/// Computed once from seconds and compared as an integer afterwards, so the
/// same playback time always lands in the same bucket. Serialized as the
/// bucket time with one decimal (`"12.3"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Bucket(i64);

impl Bucket {
    /// Bucket containing `secs`
    pub fn from_secs(secs: f64) -> Self {
        if secs.is_nan() {
            return Self(0);
        }
        let scaled = secs * BUCKETS_PER_SEC;
        let nearest = scaled.round();
        let index = if (scaled - nearest).abs() < GRID_SNAP {
            nearest
        } else {
            scaled.floor()
        };
        Self(index as i64)
    }

    /// Start of the bucket in seconds
    pub fn secs(self) -> f64 {
        self.0 as f64 / BUCKETS_PER_SEC
    }
}

impl From<Bucket> for String {
    fn from(bucket: Bucket) -> Self {
        format!("{:.1}", bucket.secs())
    }
}

impl TryFrom<String> for Bucket {
    type Error = std::num::ParseFloatError;

    fn try_from(key: String) -> Result<Self, Self::Error> {
        key.trim().parse::<f64>().map(Bucket::from_secs)
    }
}

/// Floor `secs` onto the 0.1 s grid
///
/// Idempotent and non-decreasing in `secs`.
pub fn time_bucket(secs: f64) -> f64 {
    Bucket::from_secs(secs).secs()
}

/// Bucket -> measurement vector for one source
pub type BucketMap = BTreeMap<Bucket, Vec<f32>>;

/// History of one meter, split by source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeterHistory {
    #[serde(rename = "ref", default)]
    pub reference: BucketMap,
    #[serde(default)]
    pub room: BucketMap,
    #[serde(default)]
    pub processed: BucketMap,
}

impl MeterHistory {
    pub fn get(&self, source: Source) -> &BucketMap {
        match source {
            Source::Reference => &self.reference,
            Source::Room => &self.room,
            Source::Processed => &self.processed,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.reference.is_empty() && self.room.is_empty() && self.processed.is_empty()
    }

    /// Number of reference buckets
    pub fn len(&self) -> usize {
        self.reference.len()
    }
}

/// Serialized form of the whole store: meter -> source -> bucket -> vector
pub type HistoryMap = BTreeMap<String, MeterHistory>;

/// One exported row
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRow {
    pub time: f64,
    pub source: Source,
    pub bands: Vec<f32>,
}

/// Durable storage for history snapshots
pub trait HistoryBackend: Send {
    /// Load the last snapshot; `None` when nothing has been saved yet
    fn load(&self) -> Result<Option<HistoryMap>, HistoryError>;

    /// Replace the stored snapshot
    fn save(&self, history: &HistoryMap) -> Result<(), HistoryError>;
}

/// Backend storing the snapshot as a single JSON file
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HistoryBackend for JsonFileBackend {
    fn load(&self) -> Result<Option<HistoryMap>, HistoryError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        let history = serde_json::from_str(&content)?;
        Ok(Some(history))
    }

    fn save(&self, history: &HistoryMap) -> Result<(), HistoryError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string(history)?;
        // Write then rename so a crash never leaves a truncated file
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-memory history with batched snapshots
pub struct HistoryStore {
    meters: HistoryMap,
    backend: Option<Box<dyn HistoryBackend>>,
    snapshot_every: u64,
    writes: u64,
    last_saved: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore")
            .field("meters", &self.meters.keys().collect::<Vec<_>>())
            .field("persistent", &self.backend.is_some())
            .field("snapshot_every", &self.snapshot_every)
            .field("writes", &self.writes)
            .field("last_saved", &self.last_saved)
            .finish()
    }
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl HistoryStore {
    /// Store that never persists
    pub fn in_memory() -> Self {
        Self {
            meters: HistoryMap::new(),
            backend: None,
            snapshot_every: DEFAULT_SNAPSHOT_EVERY,
            writes: 0,
            last_saved: None,
        }
    }

    /// Store backed by `backend`, reloading its last snapshot
    ///
    /// A backend with nothing saved yields an empty store.
    pub fn with_backend(
        backend: Box<dyn HistoryBackend>,
        snapshot_every: u64,
    ) -> Result<Self, HistoryError> {
        let meters = backend.load()?.unwrap_or_default();
        let buckets: usize = meters.values().map(MeterHistory::len).sum();
        tracing::info!(meters = meters.len(), buckets, "Loaded meter history");
        Ok(Self {
            meters,
            backend: Some(backend),
            snapshot_every: snapshot_every.max(1),
            writes: 0,
            last_saved: None,
        })
    }

    /// Store persisted as JSON at `path`; a missing file is an empty history
    pub fn open<P: AsRef<Path>>(path: P, snapshot_every: u64) -> Result<Self, HistoryError> {
        Self::with_backend(Box::new(JsonFileBackend::new(path)), snapshot_every)
    }

    /// Record measurements for the bucket containing `time`
    ///
    /// Overwrites any earlier values for that bucket. Every `snapshot_every`
    /// writes the store is snapshotted; a failed snapshot is returned but the
    /// in-memory write is kept.
    pub fn store(
        &mut self,
        meter: &str,
        time: f64,
        reference: Vec<f32>,
        room: Vec<f32>,
        processed: Option<Vec<f32>>,
    ) -> Result<(), HistoryError> {
        let bucket = Bucket::from_secs(time);
        let entry = self.meters.entry(meter.to_string()).or_default();
        entry.reference.insert(bucket, reference);
        entry.room.insert(bucket, room);
        if let Some(processed) = processed {
            entry.processed.insert(bucket, processed);
        }

        self.writes += 1;
        if self.writes >= self.snapshot_every {
            self.writes = 0;
            self.snapshot()?;
        }
        Ok(())
    }

    /// Write the whole store to the backend now
    pub fn snapshot(&mut self) -> Result<(), HistoryError> {
        let Some(backend) = &self.backend else {
            return Ok(());
        };
        backend.save(&self.meters)?;
        self.last_saved = Some(Utc::now());
        tracing::debug!(meters = self.meters.len(), "Saved meter history");
        Ok(())
    }

    /// Full per-source history of `meter` (empty when unknown)
    pub fn history_for(&self, meter: &str) -> MeterHistory {
        self.meters.get(meter).cloned().unwrap_or_default()
    }

    pub fn last_saved(&self) -> Option<DateTime<Utc>> {
        self.last_saved
    }

    /// Rows for every reference bucket with `start <= bucket <= end`
    ///
    /// Buckets come out ascending, each as a `ref` row, a `room` row (zeros
    /// when missing) and a `processed` row when one was stored.
    pub fn export_range(
        &self,
        meter: &str,
        start: f64,
        end: f64,
    ) -> Result<Vec<ExportRow>, HistoryError> {
        let no_data = || HistoryError::NoDataInRange {
            meter: meter.to_string(),
            start,
            end,
        };
        let history = self.meters.get(meter).ok_or_else(no_data)?;

        let eps = GRID_SNAP / BUCKETS_PER_SEC;
        let mut rows = Vec::new();
        for (bucket, reference) in &history.reference {
            let time = bucket.secs();
            if time < start - eps || time > end + eps {
                continue;
            }
            let room = history
                .room
                .get(bucket)
                .cloned()
                .unwrap_or_else(|| vec![0.0; reference.len()]);
            rows.push(ExportRow {
                time,
                source: Source::Reference,
                bands: reference.clone(),
            });
            rows.push(ExportRow {
                time,
                source: Source::Room,
                bands: room,
            });
            if let Some(processed) = history.processed.get(bucket) {
                rows.push(ExportRow {
                    time,
                    source: Source::Processed,
                    bands: processed.clone(),
                });
            }
        }

        if rows.is_empty() {
            return Err(no_data());
        }
        Ok(rows)
    }

    /// CSV text for [`export_range`](Self::export_range)
    pub fn export_csv(&self, meter: &str, start: f64, end: f64) -> Result<String, HistoryError> {
        let rows = self.export_range(meter, start, end)?;
        let csv = rows_to_csv(&rows);
        tracing::info!(meter, rows = rows.len(), "Exported history");
        Ok(csv)
    }
}

/// Render rows as CSV: `time,source,band_0..band_{N-1}`
///
/// N is the length of the first row. Times use one decimal, bands two.
pub fn rows_to_csv(rows: &[ExportRow]) -> String {
    let num_bands = rows.first().map_or(0, |r| r.bands.len());
    let mut out = String::from("time,source");
    for i in 0..num_bands {
        let _ = write!(out, ",band_{}", i);
    }
    out.push('\n');

    for row in rows {
        let _ = write!(out, "{:.1},{}", row.time, row.source);
        for value in &row.bands {
            let _ = write!(out, ",{:.2}", value);
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn bands(value: f32) -> Vec<f32> {
        vec![value; 4]
    }

    #[test]
    fn test_time_bucket_floors_to_grid() {
        assert_abs_diff_eq!(time_bucket(0.0), 0.0);
        assert_abs_diff_eq!(time_bucket(0.05), 0.0);
        assert_abs_diff_eq!(time_bucket(0.1), 0.1);
        assert_abs_diff_eq!(time_bucket(0.3), 0.3);
        assert_abs_diff_eq!(time_bucket(12.345), 12.3);
        assert_abs_diff_eq!(time_bucket(12.399999), 12.3);
    }

    #[test]
    fn test_time_bucket_idempotent() {
        for i in 0..5000 {
            let t = i as f64 * 0.0137;
            let b = time_bucket(t);
            assert_eq!(Bucket::from_secs(b), Bucket::from_secs(t));
            assert_eq!(time_bucket(b), b);
        }
    }

    #[test]
    fn test_time_bucket_monotonic() {
        let mut previous = Bucket::from_secs(0.0);
        for i in 0..20000 {
            let t = i as f64 / 44100.0 * 37.0;
            let bucket = Bucket::from_secs(t);
            assert!(bucket >= previous);
            previous = bucket;
        }
    }

    #[test]
    fn test_bucket_key_round_trips() {
        let bucket = Bucket::from_secs(7.3);
        let key: String = bucket.into();
        assert_eq!(key, "7.3");
        assert_eq!(Bucket::try_from(key).unwrap(), bucket);
        assert!(Bucket::try_from("abc".to_string()).is_err());
    }

    #[test]
    fn test_store_last_write_wins() {
        let mut store = HistoryStore::in_memory();
        store.store("spectrum", 1.01, bands(1.0), bands(2.0), None).unwrap();
        store.store("spectrum", 1.09, bands(3.0), bands(4.0), Some(bands(5.0))).unwrap();

        let history = store.history_for("spectrum");
        let bucket = Bucket::from_secs(1.0);
        assert_eq!(history.reference.len(), 1);
        assert_eq!(history.reference[&bucket], bands(3.0));
        assert_eq!(history.room[&bucket], bands(4.0));
        assert_eq!(history.processed[&bucket], bands(5.0));
    }

    #[test]
    fn test_history_for_unknown_meter_is_empty() {
        let store = HistoryStore::in_memory();
        assert!(store.history_for("spectrum").is_empty());
    }

    #[test]
    fn test_export_empty_range_is_no_data() {
        let mut store = HistoryStore::in_memory();
        store.store("spectrum", 1.0, bands(1.0), bands(2.0), None).unwrap();
        store.store("spectrum", 25.0, bands(1.0), bands(2.0), None).unwrap();

        let err = store.export_range("spectrum", 10.0, 20.0).unwrap_err();
        assert!(matches!(err, HistoryError::NoDataInRange { .. }));

        let err = store.export_range("loudness", 0.0, 100.0).unwrap_err();
        assert!(matches!(err, HistoryError::NoDataInRange { .. }));
    }

    #[test]
    fn test_export_rows_sorted_and_inclusive() {
        let mut store = HistoryStore::in_memory();
        store.store("spectrum", 2.0, bands(-2.0), bands(-3.0), Some(bands(-4.0))).unwrap();
        store.store("spectrum", 1.0, bands(-1.0), bands(-1.5), None).unwrap();
        store.store("spectrum", 3.05, bands(-9.0), bands(-9.0), None).unwrap();

        let rows = store.export_range("spectrum", 1.0, 2.0).unwrap();
        let summary: Vec<(f64, Source)> = rows.iter().map(|r| (r.time, r.source)).collect();
        assert_eq!(
            summary,
            vec![
                (1.0, Source::Reference),
                (1.0, Source::Room),
                (2.0, Source::Reference),
                (2.0, Source::Room),
                (2.0, Source::Processed),
            ]
        );
    }

    #[test]
    fn test_csv_format() {
        let mut store = HistoryStore::in_memory();
        store.store("spectrum", 0.25, vec![-1.234, -80.0], vec![0.0, -3.5], None).unwrap();

        let csv = store.export_csv("spectrum", 0.0, 1.0).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "time,source,band_0,band_1");
        assert_eq!(lines[1], "0.2,ref,-1.23,-80.00");
        assert_eq!(lines[2], "0.2,room,0.00,-3.50");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_near_grid_keys_snap_onto_bucket() {
        let legacy = Bucket::try_from("12.299999999999999".to_string()).unwrap();
        assert_eq!(legacy, Bucket::from_secs(12.3));
        assert_eq!(String::from(legacy), "12.3");
        assert_abs_diff_eq!(time_bucket(0.1 * 3.0), 0.3);
    }

    #[test]
    fn test_grid_matches_bucket_width() {
        assert_eq!(BUCKETS_PER_SEC, 10.0);
        assert_eq!(Bucket::from_secs(BUCKET_SECS).secs(), BUCKET_SECS);
        assert_eq!(String::from(Bucket::from_secs(7.0 * BUCKET_SECS)), "0.7");
    }

    #[test]
    fn test_missing_file_is_empty_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path().join("meter_history.json"), 10).unwrap();
        assert!(store.history_for("spectrum").is_empty());
        assert!(store.last_saved().is_none());
    }

    #[test]
    fn test_snapshot_every_n_writes_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meter_history.json");

        let mut store = HistoryStore::open(&path, 3).unwrap();
        store.store("spectrum", 0.0, bands(1.0), bands(2.0), None).unwrap();
        store.store("spectrum", 0.1, bands(1.0), bands(2.0), None).unwrap();
        assert!(!path.exists());

        store.store("spectrum", 0.2, bands(1.0), bands(2.0), Some(bands(3.0))).unwrap();
        assert!(path.exists());
        assert!(store.last_saved().is_some());

        let reloaded = HistoryStore::open(&path, 3).unwrap();
        let history = reloaded.history_for("spectrum");
        assert_eq!(history.reference.len(), 3);
        assert_eq!(history.processed.len(), 1);
        assert_eq!(history.room[&Bucket::from_secs(0.1)], bands(2.0));
    }

    #[test]
    fn test_persisted_keys_use_one_decimal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let mut store = HistoryStore::open(&path, 1).unwrap();
        store.store("spectrum", 12.34, vec![0.5], vec![0.25], None).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["spectrum"]["ref"]["12.3"], serde_json::json!([0.5]));
        assert_eq!(json["spectrum"]["room"]["12.3"], serde_json::json!([0.25]));
        assert!(json["spectrum"]["processed"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_file_is_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = HistoryStore::open(&path, 1).unwrap_err();
        assert!(matches!(err, HistoryError::Serialization(_)));
    }
}

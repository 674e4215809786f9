//! Persisted filament records.
//!
//! Each extruder gets one JSON file, `filament_extruder_<id>.json`, holding
//! the most recently parsed record plus provenance. Writes go to a
//! temporary file in the same directory followed by a rename, so readers
//! never observe a partial record.

use crate::opentag::FilamentRecord;
use crate::rfid::TransferSource;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// A record as written to disk.
#[derive(Debug, Serialize)]
struct StoredRecord<'a> {
    extruder_id: u8,
    channel_id: u8,
    source: &'static str,
    received_at: DateTime<Utc>,
    #[serde(flatten)]
    record: &'a FilamentRecord,
}

/// Sink for parsed filament records.
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the path a record for `extruder_id` is stored at.
    pub fn record_path(&self, extruder_id: u8) -> PathBuf {
        self.dir.join(format!("filament_extruder_{extruder_id}.json"))
    }

    /// Persists `record`, replacing any previous record for the extruder.
    pub fn write(
        &self,
        extruder_id: u8,
        channel_id: u8,
        source: TransferSource,
        record: &FilamentRecord,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create record directory: {}", self.dir.display()))?;

        let stored = StoredRecord {
            extruder_id,
            channel_id,
            source: source.as_str(),
            received_at: Utc::now(),
            record,
        };
        let json =
            serde_json::to_string_pretty(&stored).context("Failed to serialize filament record")?;

        let path = self.record_path(extruder_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .with_context(|| format!("Failed to write record file: {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to move record into place: {}", path.display()))?;

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_record(path: &Path) -> serde_json::Value {
        let content = fs::read_to_string(path).expect("record readable");
        serde_json::from_str(&content).expect("record is valid JSON")
    }

    fn sample_record() -> FilamentRecord {
        FilamentRecord {
            manufacturer: Some("Polymaker".to_string()),
            material: Some("PLA".to_string()),
            print_temp_c: Some(210),
            bed_temp_c: Some(60),
            ..FilamentRecord::default()
        }
    }

    #[test]
    fn writes_record_with_provenance() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path());

        let path = store
            .write(0, 2, TransferSource::Rfid, &sample_record())
            .expect("write succeeds");
        assert_eq!(path, dir.path().join("filament_extruder_0.json"));

        let json = read_record(&path);
        assert_eq!(json["extruder_id"], 0);
        assert_eq!(json["channel_id"], 2);
        assert_eq!(json["source"], "rfid");
        assert_eq!(json["material"], "PLA");
        assert_eq!(json["print_temp_c"], 210);
        assert!(json["received_at"].is_string());
    }

    #[test]
    fn rewrite_replaces_the_previous_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path());

        store
            .write(1, 1, TransferSource::Rfid, &sample_record())
            .expect("first write");
        let mut updated = sample_record();
        updated.material = Some("PETG".to_string());
        let path = store
            .write(1, 1, TransferSource::Manual, &updated)
            .expect("second write");

        let json = read_record(&path);
        assert_eq!(json["material"], "PETG");
        assert_eq!(json["source"], "manual");
    }

    #[test]
    fn no_temporary_file_is_left_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path());
        store
            .write(0, 0, TransferSource::Rfid, &sample_record())
            .expect("write succeeds");

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .expect("listable")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn creates_the_directory_on_demand() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path().join("records"));
        store
            .write(0, 0, TransferSource::Rfid, &sample_record())
            .expect("write succeeds");
        assert!(dir.path().join("records/filament_extruder_0.json").exists());
    }

    #[test]
    fn empty_record_serializes_to_provenance_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path());
        let path = store
            .write(0, 0, TransferSource::Rfid, &FilamentRecord::default())
            .expect("write succeeds");
        let json = read_record(&path);
        assert!(json.get("material").is_none());
        assert_eq!(json["extruder_id"], 0);
    }
}

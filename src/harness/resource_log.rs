//! File-per-resource log of in-doubt participants
//!
//! Every participant that voted to commit but never had its completion
//! acknowledged owns exactly one file in the log directory:
//!
//! ```text
//! data/
//! └── xa-log/
//!     ├── 20005-9f1c...-00000000.awaiting
//!     └── ...
//! ```
//!
//! The file holds a JSON envelope:
//! ```json
//! {"version":1,"checksum":"<sha256 hex of record>","record":{...}}
//! ```
//!
//! Writes go to a temporary file in the same directory, are fsynced and then
//! renamed over the final name, so a reader sees either the previous record or
//! the new one. Files that fail to parse or verify are skipped by `scan`.
//! Temporary files orphaned by a crash mid-write are swept when the store is
//! opened.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::Builder;

use crate::error::{HarnessError, Result};
use crate::types::{to_hex, ResourceRecord};

/// Suffix marking a record file as awaiting recovery
pub const AWAITING_SUFFIX: &str = ".awaiting";

/// Prefix of in-flight temporary files in the log directory
const TEMP_PREFIX: &str = ".tmp";

const RECORD_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct RecordEnvelope {
    version: u32,
    checksum: String,
    record: ResourceRecord,
}

/// A record file `scan` could not use
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRecord {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of enumerating the log directory
#[derive(Debug, Default)]
pub struct ScanReport {
    pub records: Vec<ResourceRecord>,
    pub skipped: Vec<SkippedRecord>,
}

/// Durable store of in-doubt resource records
#[derive(Debug)]
pub struct ResourceLogStore {
    dir: PathBuf,
}

impl ResourceLogStore {
    /// Open the store rooted at `dir`, creating the directory if needed and
    /// removing temporary files left by an interrupted `persist`
    pub fn open(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).map_err(|e| HarnessError::storage(&dir, e))?;
        let store = Self { dir };
        store.sweep_temp_files()?;
        Ok(store)
    }

    fn sweep_temp_files(&self) -> Result<usize> {
        let entries = fs::read_dir(&self.dir).map_err(|e| HarnessError::storage(&self.dir, e))?;
        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| HarnessError::storage(&self.dir, e))?;
            let path = entry.path();
            let is_temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(TEMP_PREFIX) && !n.ends_with(AWAITING_SUFFIX))
                .unwrap_or(false);
            if !is_temp || !path.is_file() {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    log::warn!("Removed stale temporary file {}", path.display());
                    removed += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(HarnessError::storage(&path, e)),
            }
        }
        Ok(removed)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file holding record `id`
    pub fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", id, AWAITING_SUFFIX))
    }

    /// Validate a record id before it becomes part of a path
    fn validate_id(&self, id: &str) -> Result<()> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(HarnessError::storage(
                &self.dir,
                format!("invalid record id '{}'", id),
            ));
        }
        Ok(())
    }

    /// Durably write `record`, replacing any record with the same id
    pub fn persist(&self, record: &ResourceRecord) -> Result<PathBuf> {
        self.validate_id(&record.id)?;
        let path = self.record_path(&record.id);
        let envelope = RecordEnvelope {
            version: RECORD_FORMAT_VERSION,
            checksum: checksum(record)?,
            record: record.clone(),
        };
        let bytes = serde_json::to_vec(&envelope)?;

        let mut temp = Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.dir)
            .map_err(|e| HarnessError::storage(&self.dir, e))?;
        temp.write_all(&bytes)
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| HarnessError::storage(temp.path(), e))?;
        temp.persist(&path)
            .map_err(|e| HarnessError::storage(&path, e.error))?;
        sync_dir(&self.dir)?;

        log::debug!("Resource record {} persisted ({:?})", record.id, record.status);
        Ok(path)
    }

    /// Enumerate every record file. Unreadable records are skipped and
    /// reported; failing to read the directory itself is an error.
    pub fn scan(&self) -> Result<ScanReport> {
        let entries = fs::read_dir(&self.dir).map_err(|e| HarnessError::storage(&self.dir, e))?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| HarnessError::storage(&self.dir, e))?;
            let path = entry.path();
            let is_record = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(AWAITING_SUFFIX))
                .unwrap_or(false);
            if is_record {
                paths.push(path);
            }
        }
        paths.sort();

        let mut report = ScanReport::default();
        for path in paths {
            match read_record(&path) {
                Ok(record) => report.records.push(record),
                Err(reason) => {
                    log::warn!("Skipping resource record {}: {}", path.display(), reason);
                    report.skipped.push(SkippedRecord { path, reason });
                }
            }
        }
        Ok(report)
    }

    /// Delete record `id`. Returns false if it was already gone.
    pub fn remove(&self, id: &str) -> Result<bool> {
        self.validate_id(id)?;
        let path = self.record_path(id);
        match fs::remove_file(&path) {
            Ok(()) => {
                sync_dir(&self.dir)?;
                log::debug!("Resource record {} removed", id);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::debug!("Resource record {} already removed", id);
                Ok(false)
            }
            Err(e) => Err(HarnessError::storage(&path, e)),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.validate_id(id).is_ok() && self.record_path(id).exists()
    }

    /// Number of record files, readable or not
    pub fn len(&self) -> Result<usize> {
        let report = self.scan()?;
        Ok(report.records.len() + report.skipped.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// SHA-256 hex digest of the serialised record
fn checksum(record: &ResourceRecord) -> Result<String> {
    let bytes = serde_json::to_vec(record)?;
    Ok(to_hex(&Sha256::digest(&bytes)))
}

/// Read and verify one record file; the error is the reason it was rejected
fn read_record(path: &Path) -> std::result::Result<ResourceRecord, String> {
    let bytes = fs::read(path).map_err(|e| format!("unreadable: {}", e))?;
    let envelope: RecordEnvelope =
        serde_json::from_slice(&bytes).map_err(|e| format!("malformed JSON: {}", e))?;
    if envelope.version != RECORD_FORMAT_VERSION {
        return Err(format!("unknown format version {}", envelope.version));
    }
    let expected = checksum(&envelope.record).map_err(|e| e.to_string())?;
    if envelope.checksum != expected {
        return Err("checksum mismatch".to_string());
    }

    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let stem = file_name.strip_suffix(AWAITING_SUFFIX).unwrap_or(file_name);
    if stem != envelope.record.id {
        return Err(format!(
            "record id '{}' does not match its file name",
            envelope.record.id
        ));
    }
    Ok(envelope.record)
}

/// Make a rename or unlink in `dir` durable
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| HarnessError::storage(dir, e))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Mutation, RecordStatus, Xid, DEFAULT_FORMAT_ID};
    use tempfile::tempdir;

    fn record(gtrid: &[u8], value: &str) -> ResourceRecord {
        ResourceRecord::new(
            Xid::branch(DEFAULT_FORMAT_ID, gtrid, 0),
            Mutation::insert(value),
            RecordStatus::Prepared,
        )
    }

    #[test]
    fn test_persist_then_scan() {
        let dir = tempdir().unwrap();
        let store = ResourceLogStore::open(dir.path().join("xa-log")).unwrap();
        let rec = record(b"g1", "X");

        let path = store.persist(&rec).unwrap();
        assert!(path.to_string_lossy().ends_with(AWAITING_SUFFIX));
        assert!(store.contains(&rec.id));

        let report = store.scan().unwrap();
        assert_eq!(report.records, vec![rec]);
        assert!(report.skipped.is_empty());
    }

    #[test]
    fn test_open_sweeps_interrupted_writes() {
        let dir = tempdir().unwrap();
        let log_dir = dir.path().join("xa-log");
        let rec = record(b"g1", "X");
        {
            let store = ResourceLogStore::open(log_dir.clone()).unwrap();
            store.persist(&rec).unwrap();
        }
        // what a kill between create and rename leaves behind
        let stale = log_dir.join(".tmpAbC123");
        fs::write(&stale, b"{\"version\":1").unwrap();

        let store = ResourceLogStore::open(log_dir.clone()).unwrap();
        assert!(!stale.exists());
        assert_eq!(fs::read_dir(&log_dir).unwrap().count(), 1);
        assert_eq!(store.scan().unwrap().records, vec![rec]);
    }

    #[test]
    fn test_persist_replaces_same_id() {
        let dir = tempdir().unwrap();
        let store = ResourceLogStore::open(dir.path().to_path_buf()).unwrap();
        let rec = record(b"g1", "X");
        store.persist(&rec).unwrap();
        store.persist(&rec.with_status(RecordStatus::InDoubt)).unwrap();

        let report = store.scan().unwrap();
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].status, RecordStatus::InDoubt);
        // no temp files left behind
        assert_eq!(fs::read_dir(store.dir()).unwrap().count(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = ResourceLogStore::open(dir.path().to_path_buf()).unwrap();
        let rec = record(b"g1", "X");
        store.persist(&rec).unwrap();

        assert!(store.remove(&rec.id).unwrap());
        assert!(!store.remove(&rec.id).unwrap());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_scan_skips_corrupt_files() {
        let dir = tempdir().unwrap();
        let store = ResourceLogStore::open(dir.path().to_path_buf()).unwrap();
        let good = record(b"g1", "X");
        store.persist(&good).unwrap();

        fs::write(store.dir().join("garbage.awaiting"), b"{not json").unwrap();
        // unrelated files are not records at all
        fs::write(store.dir().join("notes.txt"), b"hello").unwrap();

        let report = store.scan().unwrap();
        assert_eq!(report.records, vec![good]);
        assert_eq!(report.skipped.len(), 1);
        assert!(report.skipped[0].reason.contains("malformed JSON"));
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn test_scan_rejects_tampered_record() {
        let dir = tempdir().unwrap();
        let store = ResourceLogStore::open(dir.path().to_path_buf()).unwrap();
        let rec = record(b"g1", "X");
        let path = store.persist(&rec).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        fs::write(&path, text.replace("\"X\"", "\"Y\"")).unwrap();

        let report = store.scan().unwrap();
        assert!(report.records.is_empty());
        assert_eq!(report.skipped[0].reason, "checksum mismatch");
    }

    #[test]
    fn test_scan_rejects_renamed_record() {
        let dir = tempdir().unwrap();
        let store = ResourceLogStore::open(dir.path().to_path_buf()).unwrap();
        let rec = record(b"g1", "X");
        let path = store.persist(&rec).unwrap();
        fs::rename(&path, store.record_path("other")).unwrap();

        let report = store.scan().unwrap();
        assert!(report.records.is_empty());
        assert!(report.skipped[0].reason.contains("does not match"));
    }

    #[test]
    fn test_scan_missing_directory_is_an_error() {
        let dir = tempdir().unwrap();
        let store = ResourceLogStore::open(dir.path().join("xa-log")).unwrap();
        fs::remove_dir(store.dir()).unwrap();
        assert!(matches!(store.scan(), Err(HarnessError::Storage { .. })));
    }

    #[test]
    fn test_invalid_ids_are_rejected() {
        let dir = tempdir().unwrap();
        let store = ResourceLogStore::open(dir.path().to_path_buf()).unwrap();
        assert!(store.remove("../escape").is_err());
        assert!(!store.contains("../escape"));
    }
}

//! Probe table storage
//!
//! ## Storage Format
//!
//! The probe table is the single string-valued table the harness drives
//! transactions against. It lives in one file:
//!
//! ### Directory Structure
//! ```text
//! data/
//! └── probe/
//!     └── strings.dat   # Row data, one JSON object per line
//! ```
//!
//! ### Row Format (JSONL)
//! ```json
//! {"id":1,"value":"hello"}
//! {"id":2,"value":"X","origin":"20005-9f1c...-00000000"}
//! ```
//!
//! `origin` is only present on rows written by recovery and names the resource
//! record the row came from, so applying the same recovered record twice
//! inserts one row.
//!
//! Every change rewrites the whole file to a temporary sibling, fsyncs it and
//! renames it into place, so a crash leaves either the old or the new table.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::{HarnessError, Result};
use crate::types::ProbeRow;

/// File name of the probe table inside its directory
pub const PROBE_FILE_NAME: &str = "strings.dat";

/// Longest value the probe column accepts
pub const MAX_VALUE_LEN: usize = 255;

#[derive(Debug, Default)]
struct TableData {
    rows: BTreeMap<u64, ProbeRow>,
    next_id: u64,
}

/// The probe table: `strings(id, value)`
#[derive(Debug)]
pub struct ProbeTable {
    dir: PathBuf,
    data: RwLock<TableData>,
}

impl ProbeTable {
    /// Open (or create) the table stored in `dir`
    pub fn open(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).map_err(|e| HarnessError::storage(&dir, e))?;
        let table = Self {
            dir,
            data: RwLock::new(TableData::default()),
        };
        table.load()?;
        Ok(table)
    }

    /// Path of the table file
    pub fn path(&self) -> PathBuf {
        self.dir.join(PROBE_FILE_NAME)
    }

    fn load(&self) -> Result<()> {
        let path = self.path();
        let rows = read_rows(&path)?;
        let mut data = self.data.write().expect("probe table lock poisoned");
        data.next_id = rows.keys().max().copied().unwrap_or(0) + 1;
        data.rows = rows;
        log::debug!("Probe table {} loaded ({} rows)", path.display(), data.rows.len());
        Ok(())
    }

    /// Rewrite the table file with `rows`
    fn save(&self, rows: &BTreeMap<u64, ProbeRow>) -> Result<()> {
        let path = self.path();
        let temp_path = path.with_extension("dat.tmp");

        let write = || -> std::io::Result<()> {
            let file = File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            for row in rows.values() {
                let json = serde_json::to_string(row)?;
                writeln!(writer, "{}", json)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
            // Atomic rename for crash safety
            fs::rename(&temp_path, &path)
        };
        write().map_err(|e| HarnessError::storage(&path, e))
    }

    /// Every value, in insertion order
    pub fn get_all(&self) -> Vec<String> {
        let data = self.data.read().expect("probe table lock poisoned");
        data.rows.values().map(|r| r.value.clone()).collect()
    }

    /// Every row, in insertion order
    pub fn rows(&self) -> Vec<ProbeRow> {
        let data = self.data.read().expect("probe table lock poisoned");
        data.rows.values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.data.read().expect("probe table lock poisoned").rows.len()
    }

    /// Check a value fits the probe column
    pub fn check_value(&self, value: &str) -> Result<()> {
        if value.chars().count() > MAX_VALUE_LEN {
            return Err(HarnessError::storage(
                self.path(),
                format!(
                    "value of {} characters exceeds the column limit of {}",
                    value.chars().count(),
                    MAX_VALUE_LEN
                ),
            ));
        }
        Ok(())
    }

    /// Insert every value or none of them
    pub fn insert_all(&self, values: &[String]) -> Result<Vec<u64>> {
        for value in values {
            self.check_value(value)?;
        }
        if values.is_empty() {
            return Ok(Vec::new());
        }

        let mut data = self.data.write().expect("probe table lock poisoned");
        let mut rows = data.rows.clone();
        let mut ids = Vec::with_capacity(values.len());
        let mut next_id = data.next_id;
        for value in values {
            rows.insert(
                next_id,
                ProbeRow {
                    id: next_id,
                    value: value.clone(),
                    origin: None,
                },
            );
            ids.push(next_id);
            next_id += 1;
        }

        self.save(&rows)?;
        data.rows = rows;
        data.next_id = next_id;
        Ok(ids)
    }

    /// Insert `value` tagged with `origin` unless a row with that origin
    /// already exists. Returns whether a row was inserted.
    pub fn insert_once(&self, origin: &str, value: &str) -> Result<bool> {
        self.check_value(value)?;
        let mut data = self.data.write().expect("probe table lock poisoned");
        if data
            .rows
            .values()
            .any(|r| r.origin.as_deref() == Some(origin))
        {
            log::debug!("Row for {} already applied", origin);
            return Ok(false);
        }

        let id = data.next_id;
        let mut rows = data.rows.clone();
        rows.insert(
            id,
            ProbeRow {
                id,
                value: value.to_string(),
                origin: Some(origin.to_string()),
            },
        );
        self.save(&rows)?;
        data.rows = rows;
        data.next_id = id + 1;
        Ok(true)
    }

    /// Remove every row; returns how many were removed
    pub fn delete_all(&self) -> Result<usize> {
        let mut data = self.data.write().expect("probe table lock poisoned");
        let removed = data.rows.len();
        let empty = BTreeMap::new();
        self.save(&empty)?;
        data.rows = empty;
        Ok(removed)
    }

    /// Check that the table's directory is still usable
    pub fn validate(&self) -> Result<()> {
        let meta = fs::metadata(&self.dir).map_err(|e| HarnessError::storage(&self.dir, e))?;
        if !meta.is_dir() {
            return Err(HarnessError::storage(&self.dir, "not a directory"));
        }
        Ok(())
    }
}

/// Read every row from the table file at `path`
fn read_rows(path: &Path) -> Result<BTreeMap<u64, ProbeRow>> {
    let mut rows = BTreeMap::new();
    if !path.exists() {
        return Ok(rows);
    }

    let file = File::open(path).map_err(|e| HarnessError::storage(path, e))?;
    let reader = BufReader::new(file);
    for (idx, line_res) in reader.lines().enumerate() {
        let line = line_res.map_err(|e| HarnessError::storage(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let row: ProbeRow = serde_json::from_str(&line).map_err(|e| {
            HarnessError::Json(format!(
                "Failed to parse JSON row in '{}', line {}: {}. Content: {}",
                path.display(),
                idx + 1,
                e,
                &line
            ))
        })?;
        rows.insert(row.id, row);
    }
    Ok(rows)
}

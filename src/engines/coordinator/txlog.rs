//! Coordinator log file I/O
//!
//! The coordinator log is the transaction manager's own durable memory. A
//! record is only ever appended at a decision point, and `append_durable`
//! returns only after the frame has been fsynced.
//!
//! ## Format
//! Each record is binary-encoded (bincode):
//! - 4-byte little-endian length prefix
//! - Serialized `LogRecord`
//!
//! A torn frame at the tail (crash mid-append) ends the replay and is cut off
//! when the log is reopened for appending; a frame that decodes to garbage is
//! skipped with a warning.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use bytes::{BufMut, Bytes, BytesMut};
use tempfile::NamedTempFile;

use super::log::{LogOperation, LogRecord};
use super::types::Seq;
use crate::error::{HarnessError, Result};
use crate::types::now_millis;

/// Frames larger than this are treated as a torn or corrupt tail
const MAX_FRAME_LEN: usize = 16 << 20;

/// Append-only coordinator log
pub struct TxLog {
    path: PathBuf,
    file: File,
    next_seq: Seq,
}

impl TxLog {
    /// Open (or create) the log and return the records already in it
    pub fn open(path: PathBuf) -> Result<(Self, Vec<LogRecord>)> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| HarnessError::storage(parent, e))?;
        }
        let (records, valid_len) = read_frames(&path)?;
        truncate_torn_tail(&path, valid_len)?;
        let file = open_append(&path)?;
        let next_seq = records.iter().map(|r| r.seq).max().unwrap_or(0) + 1;
        Ok((
            Self {
                path,
                file,
                next_seq,
            },
            records,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and fsync before returning
    pub fn append_durable(&mut self, gtrid: &[u8], op: LogOperation) -> Result<Seq> {
        let seq = self.next_seq;
        let record = LogRecord {
            seq,
            gtrid: gtrid.to_vec(),
            op,
            timestamp: now_millis(),
        };
        let frame = encode_frame(&record)?;
        self.file
            .write_all(&frame)
            .and_then(|_| self.file.sync_data())
            .map_err(|e| HarnessError::storage(&self.path, e))?;
        self.next_seq += 1;
        Ok(seq)
    }

    /// Re-read everything currently on disk
    pub fn read_records(&self) -> Result<Vec<LogRecord>> {
        read_log(&self.path)
    }

    /// Replace the log with just `keep`, atomically
    pub fn compact(&mut self, keep: &[LogRecord]) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = NamedTempFile::new_in(dir).map_err(|e| HarnessError::storage(dir, e))?;
        for record in keep {
            let frame = encode_frame(record)?;
            temp.write_all(&frame)
                .map_err(|e| HarnessError::storage(temp.path(), e))?;
        }
        temp.as_file()
            .sync_all()
            .map_err(|e| HarnessError::storage(temp.path(), e))?;
        temp.persist(&self.path)
            .map_err(|e| HarnessError::storage(&self.path, e.error))?;

        // Reopen so later appends land in the new file
        self.file = open_append(&self.path)?;
        log::debug!(
            "Coordinator log compacted to {} records at {}",
            keep.len(),
            self.path.display()
        );
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| HarnessError::storage(path, e))
}

/// Encode a record as a length-prefixed frame
pub(super) fn encode_frame(record: &LogRecord) -> Result<Bytes> {
    let encoded = bincode::serialize(record)?;
    let mut frame = BytesMut::with_capacity(4 + encoded.len());
    frame.put_u32_le(encoded.len() as u32);
    frame.put_slice(&encoded);
    Ok(frame.freeze())
}

/// Cut the log back to its last complete frame so new appends follow it
fn truncate_torn_tail(path: &Path, valid_len: u64) -> Result<()> {
    let file = match OpenOptions::new().write(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(HarnessError::storage(path, e)),
    };
    let len = file
        .metadata()
        .map_err(|e| HarnessError::storage(path, e))?
        .len();
    if len > valid_len {
        log::warn!(
            "Truncating coordinator log {} from {} to {} bytes",
            path.display(),
            len,
            valid_len
        );
        file.set_len(valid_len)
            .and_then(|_| file.sync_all())
            .map_err(|e| HarnessError::storage(path, e))?;
    }
    Ok(())
}

/// Read every decodable record from the log at `path`
pub fn read_log(path: &Path) -> Result<Vec<LogRecord>> {
    read_frames(path).map(|(records, _)| records)
}

/// Read the log, also returning the byte offset just past the last complete
/// frame
fn read_frames(path: &Path) -> Result<(Vec<LogRecord>, u64)> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(HarnessError::storage(path, e)),
    };

    let mut records = Vec::new();
    let mut valid_len = 0u64;
    loop {
        // Read 4-byte length prefix
        let mut len_buf = [0u8; 4];
        match file.read_exact(&mut len_buf) {
            Ok(_) => {}
            Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(HarnessError::storage(path, e)),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            log::warn!(
                "Coordinator log {} has an implausible frame length {}, ignoring the tail",
                path.display(),
                len
            );
            break;
        }

        let mut record_buf = vec![0u8; len];
        match file.read_exact(&mut record_buf) {
            Ok(_) => {}
            Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => {
                log::warn!("Coordinator log {} ends with a torn frame", path.display());
                break;
            }
            Err(e) => return Err(HarnessError::storage(path, e)),
        }

        valid_len += 4 + len as u64;

        match bincode::deserialize::<LogRecord>(&record_buf) {
            Ok(record) => records.push(record),
            Err(e) => log::warn!("Skipping malformed coordinator log record: {}", e),
        }
    }
    Ok((records, valid_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Xid, DEFAULT_FORMAT_ID};
    use tempfile::tempdir;

    fn committing(gtrid: &[u8]) -> LogOperation {
        LogOperation::Committing {
            branches: vec![Xid::branch(DEFAULT_FORMAT_ID, gtrid, 0)],
        }
    }

    #[test]
    fn test_open_creates_empty_log() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("tx-log").join("coordinator.log");
        let (log, records) = TxLog::open(path.clone()).unwrap();
        assert!(records.is_empty());
        assert!(path.exists());
        assert_eq!(log.path(), path.as_path());
    }

    #[test]
    fn test_append_then_reopen() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("coordinator.log");
        {
            let (mut log, _) = TxLog::open(path.clone()).unwrap();
            assert_eq!(log.append_durable(b"g1", committing(b"g1")).unwrap(), 1);
            assert_eq!(log.append_durable(b"g1", LogOperation::Completed).unwrap(), 2);
        }

        let (mut log, records) = TxLog::open(path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].op, committing(b"g1"));
        assert_eq!(records[1].op, LogOperation::Completed);
        // Sequence numbers continue after a restart
        assert_eq!(log.append_durable(b"g2", committing(b"g2")).unwrap(), 3);
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("coordinator.log");
        {
            let (mut log, _) = TxLog::open(path.clone()).unwrap();
            log.append_durable(b"g1", committing(b"g1")).unwrap();
        }
        // Half-written frame: length prefix promising more bytes than exist
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&100u32.to_le_bytes()).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();

        let records = read_log(&path).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_append_after_torn_tail_is_replayed() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("coordinator.log");
        {
            let (mut log, _) = TxLog::open(path.clone()).unwrap();
            log.append_durable(b"g1", committing(b"g1")).unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&100u32.to_le_bytes()).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();
        drop(file);

        let (mut log, records) = TxLog::open(path.clone()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);

        log.append_durable(b"g2", committing(b"g2")).unwrap();
        let records = log.read_records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].gtrid, b"g2".to_vec());
        assert_eq!(records[1].op, committing(b"g2"));
    }

    #[test]
    fn test_malformed_frame_is_skipped() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("coordinator.log");
        let mut file = File::create(&path).unwrap();
        file.write_all(&3u32.to_le_bytes()).unwrap();
        file.write_all(&[0xff, 0xff, 0xff]).unwrap();
        let good = encode_frame(&LogRecord {
            seq: 1,
            gtrid: b"g1".to_vec(),
            op: LogOperation::Completed,
            timestamp: 0,
        })
        .unwrap();
        file.write_all(&good).unwrap();
        drop(file);

        let records = read_log(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].seq, 1);
    }

    #[test]
    fn test_compact_rewrites_log() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("coordinator.log");
        let (mut log, _) = TxLog::open(path.clone()).unwrap();
        log.append_durable(b"g1", committing(b"g1")).unwrap();
        log.append_durable(b"g1", LogOperation::Completed).unwrap();

        log.compact(&[]).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        log.append_durable(b"g2", committing(b"g2")).unwrap();
        let records = log.read_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].gtrid, b"g2".to_vec());
    }
}

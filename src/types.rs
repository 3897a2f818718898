//! Core data types shared by the coordinator, the resource log and the probe table

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Format identifier stamped on every xid this harness creates
pub const DEFAULT_FORMAT_ID: i32 = 131077;

/// Distributed transaction branch identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Xid {
    pub format_id: i32,
    /// Global transaction id, shared by every branch of one transaction
    pub gtrid: Vec<u8>,
    /// Branch qualifier
    pub bqual: Vec<u8>,
}

impl Xid {
    pub fn new(format_id: i32, gtrid: Vec<u8>, bqual: Vec<u8>) -> Self {
        Self {
            format_id,
            gtrid,
            bqual,
        }
    }

    /// Branch qualifier for the n-th enlisted resource
    pub fn branch(format_id: i32, gtrid: &[u8], index: u32) -> Self {
        Self::new(format_id, gtrid.to_vec(), index.to_be_bytes().to_vec())
    }

    /// Stable identifier usable as a file name
    pub fn record_id(&self) -> String {
        format!(
            "{:x}-{}-{}",
            self.format_id,
            to_hex(&self.gtrid),
            to_hex(&self.bqual)
        )
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.record_id())
    }
}

/// Lower-case hex rendering of a byte slice
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// The effect a prepared branch applies when it is finally committed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    /// Insert one string into the probe table
    Insert { value: String },
}

impl Mutation {
    pub fn insert(value: impl Into<String>) -> Self {
        Mutation::Insert {
            value: value.into(),
        }
    }
}

/// Where an in-doubt branch stood when its record was last written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    /// Voted to commit, outcome not yet delivered
    Prepared,
    /// Commit outcome delivered but never applied or acknowledged
    InDoubt,
}

/// Durable description of one in-doubt participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: String,
    pub xid: Xid,
    pub mutation: Mutation,
    pub status: RecordStatus,
    /// Unix epoch millis
    pub created_at_ms: u64,
}

impl ResourceRecord {
    pub fn new(xid: Xid, mutation: Mutation, status: RecordStatus) -> Self {
        Self {
            id: xid.record_id(),
            xid,
            mutation,
            status,
            created_at_ms: now_millis(),
        }
    }

    pub fn with_status(&self, status: RecordStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

/// One row of the probe table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeRow {
    pub id: u64,
    pub value: String,
    /// Resource record id when the row was written by recovery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// Current timestamp in milliseconds
pub fn now_millis() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(dur) => dur.as_millis() as u64,
        Err(_) => 0,
    }
}

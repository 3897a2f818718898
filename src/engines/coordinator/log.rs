//! Coordinator log record structures and replay

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::types::Seq;
use crate::types::Xid;

/// A coordinator log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Sequence number
    pub seq: Seq,
    /// Global transaction the record belongs to
    pub gtrid: Vec<u8>,
    /// The operation
    pub op: LogOperation,
    /// Timestamp (Unix epoch millis)
    pub timestamp: u64,
}

/// Operations that can be logged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOperation {
    /// Commit decision reached for these prepared branches
    Committing { branches: Vec<Xid> },
    /// One branch acknowledged its commit
    BranchCompleted { xid: Xid },
    /// Every branch acknowledged; the decision can be dropped
    Completed,
}

/// A commit decision some of whose branches never acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outstanding {
    pub gtrid: Vec<u8>,
    pub branches: Vec<Xid>,
    pub completed: BTreeSet<Xid>,
}

impl Outstanding {
    pub fn is_pending(&self, xid: &Xid) -> bool {
        self.branches.contains(xid) && !self.completed.contains(xid)
    }

    pub fn is_finished(&self) -> bool {
        self.branches.iter().all(|b| self.completed.contains(b))
    }
}

/// Fold log records into the decisions that still have pending branches
/// (or have not been marked `Completed`), keyed by gtrid.
pub fn replay(records: &[LogRecord]) -> BTreeMap<Vec<u8>, Outstanding> {
    let mut decisions: BTreeMap<Vec<u8>, Outstanding> = BTreeMap::new();
    for record in records {
        match &record.op {
            LogOperation::Committing { branches } => {
                decisions.insert(
                    record.gtrid.clone(),
                    Outstanding {
                        gtrid: record.gtrid.clone(),
                        branches: branches.clone(),
                        completed: BTreeSet::new(),
                    },
                );
            }
            LogOperation::BranchCompleted { xid } => {
                if let Some(decision) = decisions.get_mut(&record.gtrid) {
                    decision.completed.insert(xid.clone());
                }
            }
            LogOperation::Completed => {
                decisions.remove(&record.gtrid);
            }
        }
    }
    decisions
}

//! Core transaction types and state management

use std::sync::Arc;

use crate::engines::XaResource;
use crate::types::Xid;

/// Sequence number of a coordinator log record
pub type Seq = u64;

/// Process-local transaction handle
pub type TxnId = u64;

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Preparing,
    Committing,
    Committed,
    RolledBack,
}

/// One enlisted participant
#[derive(Clone)]
pub struct Branch {
    pub xid: Xid,
    pub resource: Arc<dyn XaResource>,
}

/// In-memory transaction context
#[derive(Clone)]
pub struct Transaction {
    pub id: TxnId,
    pub gtrid: Vec<u8>,
    pub state: TxnState,
    /// Participants in enlistment order
    pub branches: Vec<Branch>,
}

impl Transaction {
    pub fn new(id: TxnId, gtrid: Vec<u8>) -> Self {
        Self {
            id,
            gtrid,
            state: TxnState::Active,
            branches: Vec::new(),
        }
    }

    pub fn info(&self) -> TransactionInfo {
        TransactionInfo {
            id: self.id,
            gtrid: self.gtrid.clone(),
            state: self.state,
            branch_count: self.branches.len(),
        }
    }
}

/// Snapshot of a live transaction returned by `get_transaction`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInfo {
    pub id: TxnId,
    pub gtrid: Vec<u8>,
    pub state: TxnState,
    pub branch_count: usize,
}

use std::sync::Arc;

use crate::error::Result;
use crate::types::Xid;

/// A participant's answer to `prepare`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    /// Prepared and able to commit
    Commit,
    /// Nothing to commit; the branch drops out of phase two
    ReadOnly,
}

/// Trait defining the standard interface for all 2PC participants.
/// The coordinator drives every enlisted branch, and every handle returned
/// by a recovery helper, through this uniform API, similar to XA.
pub trait XaResource: Send + Sync {
    /// Short name used in log lines
    fn name(&self) -> &str;

    /// Called when the resource is enlisted under `xid`
    fn start(&self, _xid: &Xid) -> Result<()> {
        Ok(())
    }

    /// Phase one. An error counts as a vote to roll back.
    fn prepare(&self, xid: &Xid) -> Result<Vote>;

    /// Phase two, commit outcome
    fn commit(&self, xid: &Xid) -> Result<()>;

    /// Phase two, rollback outcome (also used for presumed abort)
    fn rollback(&self, xid: &Xid) -> Result<()>;

    /// Discard any heuristic knowledge of the branch
    fn forget(&self, _xid: &Xid) -> Result<()> {
        Ok(())
    }

    /// Branches this resource holds in doubt, consulted by recovery
    fn recover(&self) -> Result<Vec<Xid>> {
        Ok(Vec::new())
    }
}

/// Pluggable provider of recovery-time resource handles
pub trait RecoveryHelper: Send + Sync {
    /// Helpers registered under the same name replace each other
    fn name(&self) -> &str;

    /// Called once on registration; returning false rejects the helper
    fn initialise(&self, param: &str) -> Result<bool>;

    /// Handles the recovery module should ask for in-doubt branches
    fn get_resources(&self) -> Result<Vec<Arc<dyn XaResource>>>;
}

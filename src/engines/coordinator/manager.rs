//! Reference coordinator for the harness
//!
//! ## Commit protocol
//!
//! 1. BEGIN: allocate a transaction handle and a random global transaction id
//! 2. ENLIST: give each resource a branch xid (gtrid + enlistment index)
//! 3. PREPARE: ask every branch for its vote, in enlistment order. Any failure
//!    rolls back every branch.
//! 4. DECIDE: append `Committing { branches }` to the coordinator log and
//!    fsync. This is the point of no return.
//! 5. COMMIT: deliver the outcome to each branch, logging `BranchCompleted`
//!    per acknowledgment and `Completed` once all acknowledged.
//!
//! A branch that fails between 4 and 5 is left to the recovery module, which
//! finds it again through a registered recovery helper.
//!
//! ## Simulated crashes
//! When a participant reports `SimulatedCrash`, the coordinator halts on the
//! spot: nothing more is logged, no other branch is called and the recovery
//! worker stops. Every later call fails. Recovery has to happen in a freshly
//! opened coordinator, exactly as after a real process exit.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

pub use super::log::{LogOperation, LogRecord};
use super::log::replay;
use super::recovery::RecoveryModule;
use super::txlog::TxLog;
use super::types::{Branch, Seq, Transaction, TransactionInfo, TxnId, TxnState};
use crate::engines::{Vote, XaResource};
use crate::error::{HarnessError, Result};
use crate::types::{Xid, DEFAULT_FORMAT_ID};

/// File name of the coordinator log inside its directory
pub const LOG_FILE_NAME: &str = "coordinator.log";

/// Configuration for the coordinator and its recovery module
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Passed to recovery helpers on registration
    pub node_name: String,
    /// Format id stamped on every branch xid
    pub format_id: i32,
    /// Whether a recovery module is registered at all
    pub recovery_enabled: bool,
    /// Interval between background recovery cycles
    pub recovery_period: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_name: "harness-1".to_string(),
            format_id: DEFAULT_FORMAT_ID,
            recovery_enabled: true,
            recovery_period: Duration::from_secs(2),
        }
    }
}

impl CoordinatorConfig {
    /// A coordinator with no recovery module registered
    pub fn without_recovery() -> Self {
        Self {
            recovery_enabled: false,
            ..Default::default()
        }
    }

    /// Short recovery period for automated test runs
    pub fn fast_recovery() -> Self {
        Self {
            recovery_period: Duration::from_millis(25),
            ..Default::default()
        }
    }
}

/// State shared between the coordinator and its recovery module
pub(super) struct Shared {
    pub(super) config: CoordinatorConfig,
    log: Mutex<TxLog>,
    active: RwLock<HashMap<TxnId, Transaction>>,
    next_txn_id: AtomicU64,
    halted: AtomicBool,
}

impl Shared {
    pub(super) fn ensure_running(&self) -> Result<()> {
        if self.halted.load(Ordering::SeqCst) {
            return Err(HarnessError::Transaction(
                "transaction manager halted by a simulated crash".into(),
            ));
        }
        Ok(())
    }

    /// Durably append one record
    pub(super) fn append(&self, gtrid: &[u8], op: LogOperation) -> Result<Seq> {
        self.log
            .lock()
            .expect("coordinator log lock poisoned")
            .append_durable(gtrid, op)
    }

    pub(super) fn read_log(&self) -> Result<Vec<LogRecord>> {
        self.log
            .lock()
            .expect("coordinator log lock poisoned")
            .read_records()
    }

    /// Drop records of finished decisions. Runs under the log lock so no
    /// concurrent append can be lost.
    pub(super) fn compact_log(&self) -> Result<()> {
        let mut log = self.log.lock().expect("coordinator log lock poisoned");
        let records = log.read_records()?;
        let outstanding = replay(&records);
        let keep: Vec<LogRecord> = records
            .iter()
            .filter(|r| outstanding.contains_key(&r.gtrid))
            .cloned()
            .collect();
        if keep.len() < records.len() {
            log.compact(&keep)?;
        }
        Ok(())
    }

    /// True when `gtrid` belongs to a transaction still running in-process
    pub(super) fn is_live(&self, gtrid: &[u8]) -> bool {
        self.active
            .read()
            .expect("active_txns lock poisoned")
            .values()
            .any(|t| t.gtrid == gtrid)
    }
}

/// The transaction coordinator
pub struct Coordinator {
    shared: Arc<Shared>,
    recovery: Option<Arc<RecoveryModule>>,
}

impl Coordinator {
    /// Open the coordinator log in `log_dir` and, when enabled, register and
    /// start the recovery module
    pub fn open(log_dir: PathBuf, config: CoordinatorConfig) -> Result<Self> {
        let (txlog, records) = TxLog::open(log_dir.join(LOG_FILE_NAME))?;
        let outstanding = replay(&records);
        if !outstanding.is_empty() {
            log::info!(
                "Coordinator log holds {} commit decisions awaiting recovery",
                outstanding.len()
            );
        }

        let recovery_enabled = config.recovery_enabled;
        let recovery_period = config.recovery_period;
        let shared = Arc::new(Shared {
            config,
            log: Mutex::new(txlog),
            active: RwLock::new(HashMap::new()),
            next_txn_id: AtomicU64::new(1),
            halted: AtomicBool::new(false),
        });

        let recovery = if recovery_enabled {
            let module = RecoveryModule::new(Arc::clone(&shared));
            module.start(recovery_period);
            Some(module)
        } else {
            None
        };

        Ok(Self { shared, recovery })
    }

    /// The registered recovery module, if any
    pub fn recovery_module(&self) -> Option<Arc<RecoveryModule>> {
        self.recovery.clone()
    }

    pub fn is_halted(&self) -> bool {
        self.shared.halted.load(Ordering::SeqCst)
    }

    /// Number of transactions begun and not yet completed
    pub fn active_count(&self) -> usize {
        self.shared.active.read().expect("active_txns lock poisoned").len()
    }

    /// Begin a new transaction
    pub fn begin(&self) -> Result<TxnId> {
        self.shared.ensure_running()?;
        let txn_id = self.shared.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let gtrid = rand::random::<[u8; 16]>().to_vec();
        log::debug!("Transaction {} begun", txn_id);

        self.shared
            .active
            .write()
            .expect("active_txns lock poisoned")
            .insert(txn_id, Transaction::new(txn_id, gtrid));
        Ok(txn_id)
    }

    /// Enlist a resource as a new branch of the transaction
    pub fn enlist_resource(&self, txn_id: TxnId, resource: Arc<dyn XaResource>) -> Result<Xid> {
        self.shared.ensure_running()?;
        let mut txns = self.shared.active.write().expect("active_txns lock poisoned");
        let txn = txns.get_mut(&txn_id).ok_or_else(|| {
            HarnessError::Transaction(format!("Transaction {} not found", txn_id))
        })?;
        if txn.state != TxnState::Active {
            return Err(HarnessError::Transaction(format!(
                "Transaction {} is not active",
                txn_id
            )));
        }

        let xid = Xid::branch(
            self.shared.config.format_id,
            &txn.gtrid,
            txn.branches.len() as u32,
        );
        resource.start(&xid)?;
        log::debug!("Enlisted {} as branch {}", resource.name(), xid);
        txn.branches.push(Branch {
            xid: xid.clone(),
            resource,
        });
        Ok(xid)
    }

    /// Snapshot of a live transaction
    pub fn get_transaction(&self, txn_id: TxnId) -> Option<TransactionInfo> {
        self.shared
            .active
            .read()
            .expect("active_txns lock poisoned")
            .get(&txn_id)
            .map(Transaction::info)
    }

    /// Commit with two-phase commit across every enlisted branch
    pub fn commit(&self, txn_id: TxnId) -> Result<()> {
        self.shared.ensure_running()?;
        let txn = self.claim(txn_id, TxnState::Preparing)?;

        // Phase one
        let mut prepared: Vec<Branch> = Vec::with_capacity(txn.branches.len());
        for branch in &txn.branches {
            match branch.resource.prepare(&branch.xid) {
                Ok(Vote::Commit) => prepared.push(branch.clone()),
                Ok(Vote::ReadOnly) => {
                    log::debug!("Branch {} voted read-only", branch.xid);
                }
                Err(e) if e.is_simulated_crash() => return Err(self.halt(e)),
                Err(e) => {
                    log::warn!(
                        "Branch {} ({}) failed to prepare: {}",
                        branch.xid,
                        branch.resource.name(),
                        e
                    );
                    self.rollback_branches(&txn.branches)?;
                    self.finish(txn_id);
                    return Err(HarnessError::Transaction(format!(
                        "Transaction {} rolled back: {}",
                        txn_id, e
                    )));
                }
            }
        }

        if prepared.is_empty() {
            self.finish(txn_id);
            return Ok(());
        }

        // Decision point
        let decision = LogOperation::Committing {
            branches: prepared.iter().map(|b| b.xid.clone()).collect(),
        };
        if let Err(e) = self.shared.append(&txn.gtrid, decision) {
            log::error!("Commit decision for transaction {} not logged: {}", txn_id, e);
            self.rollback_branches(&prepared)?;
            self.finish(txn_id);
            return Err(HarnessError::Transaction(format!(
                "Transaction {} rolled back: commit decision could not be logged: {}",
                txn_id, e
            )));
        }
        self.set_state(txn_id, TxnState::Committing);

        // Phase two
        let mut pending = 0usize;
        for branch in &prepared {
            match branch.resource.commit(&branch.xid) {
                Ok(()) => {
                    let op = LogOperation::BranchCompleted {
                        xid: branch.xid.clone(),
                    };
                    if let Err(e) = self.shared.append(&txn.gtrid, op) {
                        log::warn!("Completion of branch {} not logged: {}", branch.xid, e);
                        pending += 1;
                    }
                }
                Err(e) if e.is_simulated_crash() => return Err(self.halt(e)),
                Err(e) => {
                    log::warn!(
                        "Branch {} failed to commit, leaving it for recovery: {}",
                        branch.xid,
                        e
                    );
                    pending += 1;
                }
            }
        }

        if pending == 0 {
            if let Err(e) = self.shared.append(&txn.gtrid, LogOperation::Completed) {
                log::warn!("Completion of transaction {} not logged: {}", txn_id, e);
            }
        }
        self.set_state(txn_id, TxnState::Committed);
        self.finish(txn_id);
        log::debug!("Transaction {} committed ({} branches pending)", txn_id, pending);
        Ok(())
    }

    /// Roll back every enlisted branch
    pub fn rollback(&self, txn_id: TxnId) -> Result<()> {
        self.shared.ensure_running()?;
        let txn = self.claim(txn_id, TxnState::RolledBack)?;
        self.rollback_branches(&txn.branches)?;
        self.finish(txn_id);
        log::debug!("Transaction {} rolled back", txn_id);
        Ok(())
    }

    /// Stop the background recovery worker
    pub fn shutdown(&self) {
        if let Some(recovery) = &self.recovery {
            recovery.stop();
        }
    }

    /// Move an active transaction into `next` and hand back a copy of it
    fn claim(&self, txn_id: TxnId, next: TxnState) -> Result<Transaction> {
        let mut txns = self.shared.active.write().expect("active_txns lock poisoned");
        let txn = txns.get_mut(&txn_id).ok_or_else(|| {
            HarnessError::Transaction(format!("Transaction {} not found", txn_id))
        })?;
        if txn.state != TxnState::Active {
            return Err(HarnessError::Transaction(format!(
                "Transaction {} is not active",
                txn_id
            )));
        }
        txn.state = next;
        Ok(txn.clone())
    }

    fn set_state(&self, txn_id: TxnId, state: TxnState) {
        let mut txns = self.shared.active.write().expect("active_txns lock poisoned");
        if let Some(txn) = txns.get_mut(&txn_id) {
            txn.state = state;
        }
    }

    fn finish(&self, txn_id: TxnId) {
        self.shared
            .active
            .write()
            .expect("active_txns lock poisoned")
            .remove(&txn_id);
    }

    /// Roll back branches, warning on failures. Only a simulated crash is
    /// reported back.
    fn rollback_branches(&self, branches: &[Branch]) -> Result<()> {
        for branch in branches {
            match branch.resource.rollback(&branch.xid) {
                Ok(()) => {}
                Err(e) if e.is_simulated_crash() => return Err(self.halt(e)),
                Err(e) => log::warn!("Branch {} failed to roll back: {}", branch.xid, e),
            }
        }
        Ok(())
    }

    /// Stop dead, as if the process had exited
    fn halt(&self, cause: HarnessError) -> HarnessError {
        self.shared.halted.store(true, Ordering::SeqCst);
        log::error!("Transaction manager halted: {}", cause);
        if let Some(recovery) = &self.recovery {
            recovery.stop();
        }
        cause
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

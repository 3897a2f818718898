//! Crash and recovery operations behind the `/executor` endpoints

use std::sync::Arc;

use crate::error::{HarnessError, Result};
use crate::harness::poller::RecoveryPoller;
use crate::harness::resource_log::ResourceLogStore;
use crate::harness::scanner::RecoveryScanner;
use crate::harness::simulated::{FaultHook, SimulatedXAResource};
use crate::naming::NamingContext;
use crate::types::Mutation;

pub struct TransactionDriver {
    naming: Arc<NamingContext>,
    store: Arc<ResourceLogStore>,
    hook: Arc<FaultHook>,
    poller: RecoveryPoller,
}

impl TransactionDriver {
    pub fn new(
        naming: Arc<NamingContext>,
        store: Arc<ResourceLogStore>,
        hook: Arc<FaultHook>,
        poller: RecoveryPoller,
    ) -> Self {
        Self {
            naming,
            store,
            hook,
            poller,
        }
    }

    /// Every value in the probe table
    pub fn get_strings(&self) -> Result<Vec<String>> {
        let ds = self.naming.data_source()?;
        let conn = ds.get_connection()?;
        conn.get_all()
    }

    /// Insert `value` inside a transaction spanning the data source's branch
    pub fn save_string(&self, value: &str) -> Result<()> {
        let tm = self.naming.transaction_manager()?;
        let ds = self.naming.data_source()?;
        let txn = tm.begin()?;

        let staged = (|| -> Result<()> {
            let mut conn = ds.get_connection()?;
            conn.enlist(&tm, txn)?;
            conn.insert(value)
        })();
        if let Err(e) = staged {
            if let Err(rollback_err) = tm.rollback(txn) {
                log::warn!("Rollback of transaction {} failed: {}", txn, rollback_err);
            }
            return Err(e);
        }
        tm.commit(txn)
    }

    /// Delete every row; returns how many were removed
    pub fn remove_all(&self) -> Result<usize> {
        let ds = self.naming.data_source()?;
        let conn = ds.get_connection()?;
        conn.delete_all()
    }

    /// Commit a transaction whose only participant crashes after voting.
    /// In exit mode the process is gone before this returns.
    pub fn crash(&self, value: &str) -> Result<()> {
        let tm = self.naming.transaction_manager()?;
        self.naming.data_source()?.check_value(value)?;

        log::info!("Crashing a transaction that inserts '{}'", value);
        let txn = tm.begin()?;
        let resource = Arc::new(SimulatedXAResource::new(
            Arc::clone(&self.store),
            Arc::clone(&self.hook),
            Mutation::insert(value),
        ));
        tm.enlist_resource(txn, resource)?;
        tm.commit(txn)?;

        Err(HarnessError::Internal(
            "transaction committed without the resource crashing".to_string(),
        ))
    }

    /// Register the resource-log scanner and wait for recovery to insert at
    /// least one row. Returns the values present afterwards.
    pub fn recovery(&self) -> Result<Vec<String>> {
        let before = self.get_strings()?;
        log::info!("Strings before recovery: {:?}", before);

        let tm = self.naming.transaction_manager()?;
        let ds = self.naming.data_source()?;
        let count = || -> Result<usize> {
            let conn = ds.get_connection()?;
            conn.count()
        };
        let register = || -> Result<()> {
            let module = tm.recovery_module().ok_or_else(|| {
                HarnessError::Configuration(
                    "No recovery module is registered with the transaction manager".to_string(),
                )
            })?;
            module.add_resource_recovery_helper(Arc::new(RecoveryScanner::new(
                Arc::clone(&self.store),
                Arc::clone(&ds),
            )))
        };

        let report = self.poller.verify(count, register)?;
        log::info!(
            "Recovery completed after {} polls ({} -> {} rows)",
            report.attempts,
            report.before,
            report.after
        );

        let after = self.get_strings()?;
        log::info!("Strings after recovery: {:?}", after);
        Ok(after)
    }

    /// Resolve the four transaction bindings
    pub fn verify_jndi(&self) -> Result<()> {
        self.naming.verify_transaction_bindings()
    }
}

//! Recovery module: periodic resolution of in-doubt branches
//!
//! Each cycle replays the coordinator log, asks every registered helper for
//! resource handles and resolves every xid those handles report:
//! - a pending branch of a logged commit decision is committed
//! - a branch whose decision is already resolved is forgotten
//! - a branch of a transaction still running in-process is left alone
//! - anything else is rolled back (presumed abort)

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::log::{replay, LogOperation};
use super::manager::Shared;
use crate::engines::RecoveryHelper;
use crate::error::{HarnessError, Result};

/// What one recovery cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Xids reported by helper handles
    pub examined: usize,
    pub committed: usize,
    pub rolled_back: usize,
    pub forgotten: usize,
    /// Belonging to live transactions
    pub skipped: usize,
    /// Resolution attempted and failed; retried next cycle
    pub failed: usize,
    /// Decisions closed with `Completed`
    pub completed_transactions: usize,
}

impl CycleReport {
    pub fn is_empty(&self) -> bool {
        self.examined == 0 && self.completed_transactions == 0
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "examined={} committed={} rolled_back={} forgotten={} skipped={} failed={} completed={}",
            self.examined,
            self.committed,
            self.rolled_back,
            self.forgotten,
            self.skipped,
            self.failed,
            self.completed_transactions
        )
    }
}

/// Shutdown flag the worker sleeps on
struct WorkerSignal {
    shutdown: Mutex<bool>,
    wake: Condvar,
}

impl WorkerSignal {
    /// Sleep for `period`; true if shutdown was requested
    fn wait(&self, period: Duration) -> bool {
        let guard = self.shutdown.lock().expect("recovery signal lock poisoned");
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, period, |stop| !*stop)
            .expect("recovery signal lock poisoned");
        *guard
    }
}

/// The coordinator's recovery module
pub struct RecoveryModule {
    shared: Arc<Shared>,
    helpers: RwLock<Vec<Arc<dyn RecoveryHelper>>>,
    /// Serialises cycles run by the worker and by callers
    cycle_lock: Mutex<()>,
    signal: Arc<WorkerSignal>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cycles: AtomicU64,
}

impl RecoveryModule {
    pub(super) fn new(shared: Arc<Shared>) -> Arc<Self> {
        Arc::new(Self {
            shared,
            helpers: RwLock::new(Vec::new()),
            cycle_lock: Mutex::new(()),
            signal: Arc::new(WorkerSignal {
                shutdown: Mutex::new(false),
                wake: Condvar::new(),
            }),
            worker: Mutex::new(None),
            cycles: AtomicU64::new(0),
        })
    }

    /// Spawn the background worker
    pub(super) fn start(self: &Arc<Self>, period: Duration) {
        let module = Arc::downgrade(self);
        let signal = Arc::clone(&self.signal);
        let handle = thread::Builder::new()
            .name("recovery-worker".into())
            .spawn(move || worker_loop(module, signal, period));
        match handle {
            Ok(h) => *self.worker.lock().expect("recovery worker lock poisoned") = Some(h),
            Err(e) => log::error!("Failed to spawn recovery worker: {}", e),
        }
    }

    /// Register a helper; one with the same name is replaced
    pub fn add_resource_recovery_helper(&self, helper: Arc<dyn RecoveryHelper>) -> Result<()> {
        if !helper.initialise(&self.shared.config.node_name)? {
            return Err(HarnessError::Configuration(format!(
                "recovery helper '{}' refused to initialise",
                helper.name()
            )));
        }
        let mut helpers = self.helpers.write().expect("helpers lock poisoned");
        helpers.retain(|h| h.name() != helper.name());
        log::info!("Recovery helper '{}' registered", helper.name());
        helpers.push(helper);
        Ok(())
    }

    pub fn helper_count(&self) -> usize {
        self.helpers.read().expect("helpers lock poisoned").len()
    }

    /// Number of cycles that ran to completion
    pub fn cycles_completed(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    /// Run one recovery cycle now. A helper that cannot list its resources
    /// fails the whole cycle.
    pub fn run_cycle(&self) -> Result<CycleReport> {
        let _cycle = self.cycle_lock.lock().expect("cycle lock poisoned");
        self.shared.ensure_running()?;

        let mut outstanding = replay(&self.shared.read_log()?);
        let helpers: Vec<Arc<dyn RecoveryHelper>> =
            self.helpers.read().expect("helpers lock poisoned").clone();

        let mut report = CycleReport::default();
        for helper in helpers {
            let resources = helper.get_resources()?;
            for resource in resources {
                for xid in resource.recover()? {
                    report.examined += 1;
                    if self.shared.is_live(&xid.gtrid) {
                        report.skipped += 1;
                        continue;
                    }
                    match outstanding.get_mut(&xid.gtrid) {
                        Some(decision) if decision.is_pending(&xid) => {
                            match resource.commit(&xid) {
                                Ok(()) => {
                                    log::info!("Recovered branch {} committed", xid);
                                    decision.completed.insert(xid.clone());
                                    self.shared.append(
                                        &xid.gtrid,
                                        LogOperation::BranchCompleted { xid: xid.clone() },
                                    )?;
                                    report.committed += 1;
                                }
                                Err(e) => {
                                    log::warn!("Recovery commit of {} failed: {}", xid, e);
                                    report.failed += 1;
                                }
                            }
                        }
                        Some(_) => match resource.forget(&xid) {
                            Ok(()) => report.forgotten += 1,
                            Err(e) => {
                                log::warn!("Forgetting resolved branch {} failed: {}", xid, e);
                                report.failed += 1;
                            }
                        },
                        None => match resource.rollback(&xid) {
                            Ok(()) => {
                                log::info!("Branch {} has no commit decision, rolled back", xid);
                                report.rolled_back += 1;
                            }
                            Err(e) => {
                                log::warn!("Presumed-abort rollback of {} failed: {}", xid, e);
                                report.failed += 1;
                            }
                        },
                    }
                }
            }
        }

        for decision in outstanding.values().filter(|d| d.is_finished()) {
            self.shared.append(&decision.gtrid, LogOperation::Completed)?;
            report.completed_transactions += 1;
        }
        if report.completed_transactions > 0 {
            self.shared.compact_log()?;
        }

        self.cycles.fetch_add(1, Ordering::SeqCst);
        Ok(report)
    }

    /// Stop the background worker and wait for it to exit
    pub fn stop(&self) {
        {
            let mut stop = self.signal.shutdown.lock().expect("recovery signal lock poisoned");
            *stop = true;
        }
        self.signal.wake.notify_all();

        let handle = self.worker.lock().expect("recovery worker lock poisoned").take();
        if let Some(handle) = handle {
            // a cycle can halt the coordinator from the worker itself
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/// Background worker loop
fn worker_loop(module: Weak<RecoveryModule>, signal: Arc<WorkerSignal>, period: Duration) {
    log::info!("Recovery worker started (period: {:?})", period);

    loop {
        if signal.wait(period) {
            break;
        }
        let Some(module) = module.upgrade() else {
            break;
        };
        match module.run_cycle() {
            Ok(report) if report.is_empty() => {}
            Ok(report) => log::info!("Recovery cycle: {}", report),
            Err(e) => log::error!("Recovery cycle failed: {}", e),
        }
    }

    log::info!("Recovery worker shutting down");
}

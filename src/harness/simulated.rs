//! A participant that dies instead of committing
//!
//! `SimulatedXAResource` votes to commit, persists its pending mutation, and
//! when the commit outcome arrives it re-persists itself as in-doubt and
//! fires the fault hook. The commit is never acknowledged, which leaves the
//! coordinator holding a logged decision and the resource log holding the
//! record recovery has to find.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::engines::{Vote, XaResource};
use crate::error::{HarnessError, Result};
use crate::harness::resource_log::ResourceLogStore;
use crate::types::{Mutation, RecordStatus, ResourceRecord, Xid};

/// Exit status of a process killed by the fault hook
pub const CRASH_EXIT_CODE: i32 = 86;

/// What the fault hook does when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultMode {
    /// Terminate the process immediately
    #[default]
    Exit,
    /// Report `SimulatedCrash` and let the coordinator halt itself
    Simulate,
}

impl FromStr for FaultMode {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exit" => Ok(FaultMode::Exit),
            "simulate" => Ok(FaultMode::Simulate),
            other => Err(HarnessError::Configuration(format!(
                "Unknown fault mode, expected exit or simulate but was: {}",
                other
            ))),
        }
    }
}

/// The injected crash
#[derive(Debug)]
pub struct FaultHook {
    mode: FaultMode,
    fired: AtomicBool,
}

impl FaultHook {
    pub fn new(mode: FaultMode) -> Self {
        Self {
            mode,
            fired: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> FaultMode {
        self.mode
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Fire the hook. In `Exit` mode this never returns.
    pub fn trigger(&self, what: &str) -> HarnessError {
        self.fired.store(true, Ordering::SeqCst);
        match self.mode {
            FaultMode::Exit => {
                log::error!("Crashing the process: {}", what);
                log::logger().flush();
                std::process::exit(CRASH_EXIT_CODE)
            }
            FaultMode::Simulate => {
                log::warn!("Simulated crash: {}", what);
                HarnessError::SimulatedCrash(what.to_string())
            }
        }
    }
}

/// Lifecycle of the simulated participant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Active,
    Prepared,
    Crashed,
    RolledBack,
}

/// 2PC participant carrying one mutation that crashes on commit
pub struct SimulatedXAResource {
    store: Arc<ResourceLogStore>,
    hook: Arc<FaultHook>,
    mutation: Mutation,
    state: Mutex<ResourceState>,
    record: Mutex<Option<ResourceRecord>>,
}

impl SimulatedXAResource {
    pub fn new(store: Arc<ResourceLogStore>, hook: Arc<FaultHook>, mutation: Mutation) -> Self {
        Self {
            store,
            hook,
            mutation,
            state: Mutex::new(ResourceState::Active),
            record: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ResourceState {
        *self.state.lock().expect("resource state lock poisoned")
    }

    fn set_state(&self, state: ResourceState) {
        *self.state.lock().expect("resource state lock poisoned") = state;
    }

    fn forget_record(&self, xid: &Xid) -> Result<()> {
        self.store.remove(&xid.record_id())?;
        *self.record.lock().expect("resource record lock poisoned") = None;
        self.set_state(ResourceState::RolledBack);
        Ok(())
    }
}

impl XaResource for SimulatedXAResource {
    fn name(&self) -> &str {
        "simulated-xa-resource"
    }

    fn prepare(&self, xid: &Xid) -> Result<Vote> {
        if self.state() != ResourceState::Active {
            return Err(HarnessError::Transaction(format!(
                "branch {} prepared twice",
                xid
            )));
        }
        let record = ResourceRecord::new(xid.clone(), self.mutation.clone(), RecordStatus::Prepared);
        self.store.persist(&record)?;
        *self.record.lock().expect("resource record lock poisoned") = Some(record);
        self.set_state(ResourceState::Prepared);
        log::info!("Branch {} voted to commit", xid);
        Ok(Vote::Commit)
    }

    fn commit(&self, xid: &Xid) -> Result<()> {
        if self.state() != ResourceState::Prepared {
            return Err(HarnessError::Transaction(format!(
                "branch {} committed without being prepared",
                xid
            )));
        }
        let record = self
            .record
            .lock()
            .expect("resource record lock poisoned")
            .clone()
            .unwrap_or_else(|| {
                ResourceRecord::new(xid.clone(), self.mutation.clone(), RecordStatus::Prepared)
            });
        self.store.persist(&record.with_status(RecordStatus::InDoubt))?;
        self.set_state(ResourceState::Crashed);
        Err(self
            .hook
            .trigger(&format!("commit of branch {} never acknowledged", xid)))
    }

    fn rollback(&self, xid: &Xid) -> Result<()> {
        self.forget_record(xid)
    }

    fn forget(&self, xid: &Xid) -> Result<()> {
        self.forget_record(xid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DEFAULT_FORMAT_ID;
    use tempfile::tempdir;

    fn resource(dir: &std::path::Path) -> (SimulatedXAResource, Arc<ResourceLogStore>, Arc<FaultHook>) {
        let store = Arc::new(ResourceLogStore::open(dir.to_path_buf()).unwrap());
        let hook = Arc::new(FaultHook::new(FaultMode::Simulate));
        let res = SimulatedXAResource::new(store.clone(), hook.clone(), Mutation::insert("X"));
        (res, store, hook)
    }

    #[test]
    fn test_fault_mode_parsing() {
        assert_eq!("exit".parse::<FaultMode>().unwrap(), FaultMode::Exit);
        assert_eq!("Simulate".parse::<FaultMode>().unwrap(), FaultMode::Simulate);
        assert!("panic".parse::<FaultMode>().is_err());
    }

    #[test]
    fn test_prepare_persists_and_votes_commit() {
        let dir = tempdir().unwrap();
        let (res, store, _) = resource(dir.path());
        let xid = Xid::branch(DEFAULT_FORMAT_ID, b"g1", 0);

        assert_eq!(res.prepare(&xid).unwrap(), Vote::Commit);
        assert_eq!(res.state(), ResourceState::Prepared);

        let report = store.scan().unwrap();
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].status, RecordStatus::Prepared);
        assert_eq!(report.records[0].mutation, Mutation::insert("X"));
    }

    #[test]
    fn test_commit_crashes_and_leaves_in_doubt_record() {
        let dir = tempdir().unwrap();
        let (res, store, hook) = resource(dir.path());
        let xid = Xid::branch(DEFAULT_FORMAT_ID, b"g1", 0);
        res.prepare(&xid).unwrap();

        let err = res.commit(&xid).unwrap_err();
        assert!(err.is_simulated_crash());
        assert!(hook.has_fired());
        assert_eq!(res.state(), ResourceState::Crashed);

        let report = store.scan().unwrap();
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].status, RecordStatus::InDoubt);
    }

    #[test]
    fn test_commit_before_prepare_is_refused() {
        let dir = tempdir().unwrap();
        let (res, store, hook) = resource(dir.path());
        let xid = Xid::branch(DEFAULT_FORMAT_ID, b"g1", 0);

        assert!(matches!(res.commit(&xid), Err(HarnessError::Transaction(_))));
        assert!(!hook.has_fired());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_rollback_removes_record() {
        let dir = tempdir().unwrap();
        let (res, store, _) = resource(dir.path());
        let xid = Xid::branch(DEFAULT_FORMAT_ID, b"g1", 0);
        res.prepare(&xid).unwrap();

        res.rollback(&xid).unwrap();
        assert_eq!(res.state(), ResourceState::RolledBack);
        assert!(store.is_empty().unwrap());
    }
}

//! Crash/recovery harness
//!
//! ## Layout under the data directory
//! ```text
//! data/
//! ├── probe/strings.dat         # probe table (embedded database)
//! ├── tx-log/coordinator.log    # coordinator decision log
//! └── xa-log/<id>.awaiting      # in-doubt resource records
//! ```
//!
//! A crash run and the recovery run that follows it are two harness
//! instances over the same data directory; nothing else is shared.

pub mod driver;
pub mod poller;
pub mod resource_log;
pub mod scanner;
pub mod simulated;

use std::fs;
use std::sync::Arc;

pub use driver::TransactionDriver;
pub use poller::{PollerConfig, RecoveryPoller, RecoveryReport};
pub use resource_log::{ResourceLogStore, ScanReport, SkippedRecord, AWAITING_SUFFIX};
pub use scanner::{RecoveredResource, RecoveryScanner, SCANNER_NAME};
pub use simulated::{FaultHook, FaultMode, ResourceState, SimulatedXAResource, CRASH_EXIT_CODE};

use crate::datasource::{Allocator, DataSource, DbDescriptor};
use crate::engines::Coordinator;
use crate::error::{HarnessError, Result};
use crate::naming::NamingContext;
use crate::Config;

/// Directory of the coordinator log under the data directory
pub const TX_LOG_DIR: &str = "tx-log";
/// Directory of the resource log under the data directory
pub const XA_LOG_DIR: &str = "xa-log";

/// Everything one harness run needs, wired together
pub struct Harness {
    allocator: Allocator,
    descriptor: DbDescriptor,
    coordinator: Arc<Coordinator>,
    datasource: Arc<DataSource>,
    store: Arc<ResourceLogStore>,
    hook: Arc<FaultHook>,
    naming: Arc<NamingContext>,
    driver: TransactionDriver,
}

impl Harness {
    /// Provision the database, open the coordinator and resource log, and
    /// bind everything into a fresh naming context
    pub fn start(config: &Config) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)
            .map_err(|e| HarnessError::storage(&config.data_dir, e))?;

        let allocator = Allocator::from_config(&config.allocator, &config.data_dir)?;
        let descriptor = allocator.allocate_db(config.allocator.expiry_minutes)?;
        let datasource = Arc::new(DataSource::open(descriptor.clone(), config.pool.clone())?);

        let coordinator = Arc::new(Coordinator::open(
            config.data_dir.join(TX_LOG_DIR),
            config.coordinator.clone(),
        )?);

        let store = Arc::new(ResourceLogStore::open(config.data_dir.join(XA_LOG_DIR))?);
        let pending = store.len()?;
        if pending > 0 {
            log::info!(
                "{} resource records in {} are awaiting recovery",
                pending,
                store.dir().display()
            );
        }

        let hook = Arc::new(FaultHook::new(config.fault_mode));
        let naming = Arc::new(NamingContext::new());
        naming.bind_coordinator(Arc::clone(&coordinator));
        naming.bind_data_source(Arc::clone(&datasource));

        let driver = TransactionDriver::new(
            Arc::clone(&naming),
            Arc::clone(&store),
            Arc::clone(&hook),
            RecoveryPoller::new(config.poller.clone()),
        );

        log::info!(
            "Harness started in {:?} (fault mode {:?})",
            config.data_dir,
            config.fault_mode
        );
        Ok(Self {
            allocator,
            descriptor,
            coordinator,
            datasource,
            store,
            hook,
            naming,
            driver,
        })
    }

    pub fn driver(&self) -> &TransactionDriver {
        &self.driver
    }

    pub fn naming(&self) -> &Arc<NamingContext> {
        &self.naming
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn datasource(&self) -> &Arc<DataSource> {
        &self.datasource
    }

    pub fn resource_log(&self) -> &Arc<ResourceLogStore> {
        &self.store
    }

    pub fn fault_hook(&self) -> &Arc<FaultHook> {
        &self.hook
    }

    /// Stop background recovery and release the database
    pub fn shutdown(&self) -> Result<()> {
        self.coordinator.shutdown();
        if !self.allocator.deallocate_db(&self.descriptor)? {
            log::warn!("Allocator refused to release {}", self.descriptor.url);
        }
        log::info!("Harness stopped");
        Ok(())
    }
}

//! Transactional data source over the probe database
//!
//! `DataSource` ties an allocated database to a connection pool. Only
//! embedded `file:` databases can actually be opened; server descriptors
//! produced by the container and remote-pool allocators are rejected here.

pub mod allocator;
pub mod pool;

use std::sync::Arc;

pub use allocator::{file_ok, wait_for_tcp, Allocator, AllocatorConfig, AllocatorMode, DbDescriptor};
pub use pool::{Connection, ConnectionPool, PoolConfig, PooledConnection};

use crate::error::{HarnessError, Result};
use crate::storage::ProbeTable;

/// A pooled, XA-capable data source
pub struct DataSource {
    descriptor: DbDescriptor,
    table: Arc<ProbeTable>,
    pool: ConnectionPool,
}

impl DataSource {
    /// Open the database named by `descriptor`
    pub fn open(descriptor: DbDescriptor, config: PoolConfig) -> Result<Self> {
        let dir = descriptor.file_path().ok_or_else(|| {
            HarnessError::Configuration(format!(
                "cannot open data source for '{}': only file: databases are supported",
                descriptor.url
            ))
        })?;
        let table = Arc::new(ProbeTable::open(dir)?);
        let pool = ConnectionPool::new(Arc::clone(&table), config)?;
        log::info!(
            "Data source opened on {} ({} rows, pool max {})",
            descriptor.url,
            table.count(),
            pool.config().max_active
        );
        Ok(Self {
            descriptor,
            table,
            pool,
        })
    }

    pub fn descriptor(&self) -> &DbDescriptor {
        &self.descriptor
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Borrow a pooled connection
    pub fn get_connection(&self) -> Result<PooledConnection> {
        self.pool.get_connection()
    }

    /// Reject a value the probe column cannot hold
    pub fn check_value(&self, value: &str) -> Result<()> {
        self.table.check_value(value)
    }
}

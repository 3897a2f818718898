//! Bounded connection pool over the probe table
//!
//! Connections are handed out as `PooledConnection` guards that go back to the
//! pool when dropped, whatever path the caller leaves by. Idle connections are
//! re-validated once they have sat longer than the validation interval, and
//! idle connections above `min_idle` are evicted once they have sat longer
//! than `min_evictable_idle`.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::engines::coordinator::TxnId;
use crate::engines::{Coordinator, Vote, XaResource};
use crate::error::{HarnessError, Result};
use crate::storage::ProbeTable;
use crate::types::{Mutation, Xid};

/// Pool sizing and housekeeping settings
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_active: usize,
    pub min_idle: usize,
    pub initial_size: usize,
    /// How long `get_connection` waits on an exhausted pool
    pub max_wait: Duration,
    pub validation_interval: Duration,
    pub min_evictable_idle: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active: 100,
            min_idle: 10,
            initial_size: 10,
            max_wait: Duration::from_secs(10),
            validation_interval: Duration::from_secs(10),
            min_evictable_idle: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// A small pool that gives up quickly, for tests
    pub fn small(max_active: usize) -> Self {
        Self {
            max_active,
            min_idle: 0,
            initial_size: 0,
            max_wait: Duration::from_millis(200),
            ..Default::default()
        }
    }

    fn check(&self) -> Result<()> {
        if self.max_active == 0 {
            return Err(HarnessError::Configuration(
                "pool max_active must be at least 1".into(),
            ));
        }
        if self.initial_size > self.max_active || self.min_idle > self.max_active {
            return Err(HarnessError::Configuration(format!(
                "pool initial_size ({}) and min_idle ({}) must not exceed max_active ({})",
                self.initial_size, self.min_idle, self.max_active
            )));
        }
        Ok(())
    }
}

/// XA branch of a connection: inserts are staged and applied on commit
struct ProbeBranch {
    table: Arc<ProbeTable>,
    staged: Mutex<Vec<String>>,
}

impl XaResource for ProbeBranch {
    fn name(&self) -> &str {
        "probe-table"
    }

    fn prepare(&self, _xid: &Xid) -> Result<Vote> {
        let staged = self.staged.lock().expect("staged inserts lock poisoned");
        if staged.is_empty() {
            return Ok(Vote::ReadOnly);
        }
        self.table.validate()?;
        for value in staged.iter() {
            self.table.check_value(value)?;
        }
        Ok(Vote::Commit)
    }

    fn commit(&self, xid: &Xid) -> Result<()> {
        let values: Vec<String> =
            std::mem::take(&mut *self.staged.lock().expect("staged inserts lock poisoned"));
        self.table.insert_all(&values)?;
        log::debug!("Branch {} applied {} inserts", xid, values.len());
        Ok(())
    }

    fn rollback(&self, _xid: &Xid) -> Result<()> {
        self.staged.lock().expect("staged inserts lock poisoned").clear();
        Ok(())
    }
}

/// A connection to the probe database
pub struct Connection {
    id: u64,
    table: Arc<ProbeTable>,
    last_validated: Instant,
    last_used: Instant,
    branch: Option<Arc<ProbeBranch>>,
}

impl Connection {
    fn new(id: u64, table: Arc<ProbeTable>) -> Self {
        let now = Instant::now();
        Self {
            id,
            table,
            last_validated: now,
            last_used: now,
            branch: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn get_all(&self) -> Result<Vec<String>> {
        Ok(self.table.get_all())
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.table.count())
    }

    pub fn delete_all(&self) -> Result<usize> {
        self.table.delete_all()
    }

    /// Enlist this connection's XA branch in transaction `txn`. Later inserts
    /// are applied only when the transaction commits.
    pub fn enlist(&mut self, coordinator: &Coordinator, txn: TxnId) -> Result<Xid> {
        if self.branch.is_some() {
            return Err(HarnessError::Transaction(format!(
                "connection {} is already enlisted",
                self.id
            )));
        }
        let branch = Arc::new(ProbeBranch {
            table: Arc::clone(&self.table),
            staged: Mutex::new(Vec::new()),
        });
        let xid = coordinator.enlist_resource(txn, branch.clone())?;
        self.branch = Some(branch);
        Ok(xid)
    }

    pub fn is_enlisted(&self) -> bool {
        self.branch.is_some()
    }

    /// Insert one value: staged when enlisted, applied at once otherwise
    pub fn insert(&self, value: &str) -> Result<()> {
        self.table.check_value(value)?;
        match &self.branch {
            Some(branch) => {
                branch
                    .staged
                    .lock()
                    .expect("staged inserts lock poisoned")
                    .push(value.to_string());
                Ok(())
            }
            None => self.table.insert_all(&[value.to_string()]).map(|_| ()),
        }
    }

    /// Apply the mutation of a recovered record. Applying the same record
    /// twice has no further effect; returns whether a row was written.
    pub fn apply_recovered(&self, origin: &str, mutation: &Mutation) -> Result<bool> {
        match mutation {
            Mutation::Insert { value } => self.table.insert_once(origin, value),
        }
    }

    fn validate(&mut self) -> Result<()> {
        self.table.validate()?;
        self.last_validated = Instant::now();
        Ok(())
    }
}

struct PoolState {
    idle: VecDeque<Connection>,
    active: usize,
    next_id: u64,
}

struct PoolInner {
    config: PoolConfig,
    table: Arc<ProbeTable>,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl PoolInner {
    fn release(&self, mut conn: Connection) {
        conn.branch = None;
        conn.last_used = Instant::now();

        let mut state = self.state.lock().expect("pool lock poisoned");
        state.active -= 1;
        state.idle.push_back(conn);
        self.evict(&mut state);
        drop(state);
        self.available.notify_one();
    }

    /// Drop idle connections beyond `min_idle` that have sat too long
    fn evict(&self, state: &mut PoolState) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        while state.idle.len() > self.config.min_idle {
            let stale = state
                .idle
                .front()
                .map(|c| now.duration_since(c.last_used) >= self.config.min_evictable_idle)
                .unwrap_or(false);
            if !stale {
                break;
            }
            if let Some(conn) = state.idle.pop_front() {
                log::debug!("Evicting idle connection {}", conn.id);
                evicted += 1;
            }
        }
        evicted
    }
}

/// Bounded pool of probe-table connections
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(table: Arc<ProbeTable>, config: PoolConfig) -> Result<Self> {
        config.check()?;
        let mut idle = VecDeque::with_capacity(config.initial_size);
        for id in 0..config.initial_size as u64 {
            idle.push_back(Connection::new(id + 1, Arc::clone(&table)));
        }
        let next_id = config.initial_size as u64 + 1;

        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                table,
                state: Mutex::new(PoolState {
                    idle,
                    active: 0,
                    next_id,
                }),
                available: Condvar::new(),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Borrow a connection, waiting up to `max_wait` for one to be returned
    pub fn get_connection(&self) -> Result<PooledConnection> {
        let config = &self.inner.config;
        let deadline = Instant::now() + config.max_wait;
        let mut state = self.inner.state.lock().expect("pool lock poisoned");

        loop {
            // Most recently returned first
            while let Some(mut conn) = state.idle.pop_back() {
                if conn.last_validated.elapsed() >= config.validation_interval {
                    if let Err(e) = conn.validate() {
                        log::warn!("Discarding connection {} that failed validation: {}", conn.id, e);
                        continue;
                    }
                }
                state.active += 1;
                return Ok(PooledConnection::new(Arc::clone(&self.inner), conn));
            }

            if state.active < config.max_active {
                let id = state.next_id;
                state.next_id += 1;
                let mut conn = Connection::new(id, Arc::clone(&self.inner.table));
                conn.validate()?;
                state.active += 1;
                return Ok(PooledConnection::new(Arc::clone(&self.inner), conn));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(HarnessError::storage(
                    self.inner.table.path(),
                    format!(
                        "connection pool exhausted: {} connections in use, none returned within {:?}",
                        state.active, config.max_wait
                    ),
                ));
            }
            state = self
                .inner
                .available
                .wait_timeout(state, deadline - now)
                .expect("pool lock poisoned")
                .0;
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().expect("pool lock poisoned").active
    }

    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().expect("pool lock poisoned").idle.len()
    }

    /// Run eviction now; returns how many idle connections were dropped
    pub fn evict_idle(&self) -> usize {
        let mut state = self.inner.state.lock().expect("pool lock poisoned");
        self.inner.evict(&mut state)
    }
}

/// A borrowed connection, returned to its pool on drop
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Connection) -> Self {
        Self {
            pool,
            conn: Some(conn),
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection already returned")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection already returned")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

//! Database provisioning
//!
//! The harness can run against an embedded file database or describe a server
//! database that something outside the harness manages: a container started
//! by the test environment, or a lease from a remote allocation service. The
//! harness never starts, stops or empties a server database itself; for those
//! variants allocation only waits for the server to accept connections and
//! the release calls are bookkeeping. The strategy is picked once at startup
//! from a mode string.

use std::fs;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{HarnessError, Result};
use crate::storage::PROBE_FILE_NAME;

/// Directory of the embedded database under the data directory
pub const EMBEDDED_DB_DIR: &str = "probe";

/// Everything needed to open a data source on an allocated database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbDescriptor {
    pub url: String,
    pub username: String,
    pub password: String,
    pub database_name: String,
    pub driver_class: String,
    pub factory: String,
    pub login_timeout: Duration,
    /// Whether the server side supports container-managed pooling
    pub pooled: bool,
}

impl DbDescriptor {
    /// Local directory of a `file:` URL
    pub fn file_path(&self) -> Option<PathBuf> {
        self.url.strip_prefix("file:").map(PathBuf::from)
    }
}

/// Allocation strategy named by the mode string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorMode {
    Embedded,
    Container,
    RemotePool,
}

impl FromStr for AllocatorMode {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" => Err(HarnessError::Configuration(
                "allocator mode must not be empty".into(),
            )),
            "embedded" | "h2" => Ok(AllocatorMode::Embedded),
            "container" => Ok(AllocatorMode::Container),
            "remote-pool" | "dballocator" => Ok(AllocatorMode::RemotePool),
            other => Err(HarnessError::Configuration(format!(
                "Unknown operation mode, expected embedded, container or remote-pool but was: {}",
                other
            ))),
        }
    }
}

/// Allocator settings
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    pub mode: String,
    /// Server address for container and remote-pool modes
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    /// Lease length requested from a remote pool
    pub expiry_minutes: Option<u32>,
    /// Per-attempt TCP connect timeout while waiting for the server
    pub connect_timeout: Duration,
    /// Overall time to wait for the server to accept connections
    pub ready_timeout: Duration,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            mode: "embedded".to_string(),
            host: "localhost".to_string(),
            port: 5432,
            database: "crashrec".to_string(),
            username: "crashrec".to_string(),
            password: "crashrec".to_string(),
            expiry_minutes: None,
            connect_timeout: Duration::from_millis(500),
            ready_timeout: Duration::from_secs(30),
        }
    }
}

/// Database allocator
#[derive(Debug, Clone)]
pub enum Allocator {
    /// File database under the data directory
    Embedded { root: PathBuf },
    /// Server database in a container the test environment starts and
    /// stops; allocation waits for it to listen
    Containerized { config: AllocatorConfig },
    /// Server database leased from a remote allocation service that owns the
    /// lease lifecycle; allocation waits for it to listen
    RemotePool { config: AllocatorConfig },
}

impl Allocator {
    /// Pick the allocator for `config.mode`
    pub fn from_config(config: &AllocatorConfig, data_dir: &Path) -> Result<Self> {
        let allocator = match config.mode.parse::<AllocatorMode>()? {
            AllocatorMode::Embedded => Allocator::Embedded {
                root: data_dir.join(EMBEDDED_DB_DIR),
            },
            AllocatorMode::Container => Allocator::Containerized {
                config: config.clone(),
            },
            AllocatorMode::RemotePool => Allocator::RemotePool {
                config: config.clone(),
            },
        };
        log::info!("Database allocator: {}", allocator.mode_name());
        Ok(allocator)
    }

    pub fn mode_name(&self) -> &'static str {
        match self {
            Allocator::Embedded { .. } => "embedded",
            Allocator::Containerized { .. } => "container",
            Allocator::RemotePool { .. } => "remote-pool",
        }
    }

    /// Provision a database. `expiry_minutes` is only meaningful to a remote
    /// pool lease.
    pub fn allocate_db(&self, expiry_minutes: Option<u32>) -> Result<DbDescriptor> {
        match self {
            Allocator::Embedded { root } => {
                fs::create_dir_all(root).map_err(|e| HarnessError::storage(root, e))?;
                Ok(DbDescriptor {
                    url: format!("file:{}", root.display()),
                    username: "sa".to_string(),
                    password: "sa".to_string(),
                    database_name: "testdb".to_string(),
                    driver_class: "embedded-jsonl".to_string(),
                    factory: "probe-table".to_string(),
                    login_timeout: Duration::ZERO,
                    pooled: false,
                })
            }
            Allocator::Containerized { config } => {
                wait_until_ready(config)?;
                Ok(server_descriptor(config, "container-postgres"))
            }
            Allocator::RemotePool { config } => {
                wait_until_ready(config)?;
                if let Some(minutes) = expiry_minutes.or(config.expiry_minutes) {
                    log::info!(
                        "Leased database {} for {} minutes",
                        config.database,
                        minutes
                    );
                }
                Ok(server_descriptor(config, "remote-pool"))
            }
        }
    }

    /// Release a database; true when the allocator accepted the release.
    /// Server databases are owned elsewhere, so this only logs the release.
    pub fn deallocate_db(&self, db: &DbDescriptor) -> Result<bool> {
        log::debug!("Deallocating database {}", db.url);
        Ok(true)
    }

    /// Extend or renew a lease. Only logged: the remote service renews
    /// leases on its own schedule and the other variants have none.
    pub fn reallocate_db(&self, expiry_minutes: Option<u32>, db: &DbDescriptor) -> Result<bool> {
        match self {
            Allocator::RemotePool { config } => {
                let minutes = expiry_minutes.or(config.expiry_minutes).unwrap_or(0);
                log::info!("Renewing lease on {} for {} minutes", db.url, minutes);
                Ok(true)
            }
            _ => Ok(true),
        }
    }

    /// Empty the database. For the embedded database only call this while no
    /// data source is open on it. Server databases are left untouched.
    pub fn clean_db(&self, db: &DbDescriptor) -> Result<bool> {
        match db.file_path() {
            Some(dir) => {
                let table = dir.join(PROBE_FILE_NAME);
                match fs::remove_file(&table) {
                    Ok(()) => Ok(true),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
                    Err(e) => Err(HarnessError::storage(&table, e)),
                }
            }
            None => Ok(true),
        }
    }
}

fn wait_until_ready(config: &AllocatorConfig) -> Result<()> {
    if !wait_for_tcp(
        &config.host,
        config.port,
        config.connect_timeout,
        config.ready_timeout,
    ) {
        return Err(HarnessError::Configuration(format!(
            "database at {}:{} did not accept connections within {:?}",
            config.host, config.port, config.ready_timeout
        )));
    }
    Ok(())
}

fn server_descriptor(config: &AllocatorConfig, driver: &str) -> DbDescriptor {
    DbDescriptor {
        url: format!(
            "postgresql://{}:{}/{}",
            config.host, config.port, config.database
        ),
        username: config.username.clone(),
        password: config.password.clone(),
        database_name: config.database.clone(),
        driver_class: driver.to_string(),
        factory: "xa-datasource".to_string(),
        login_timeout: config.connect_timeout,
        pooled: true,
    }
}

/// Poll `host:port` once a second until a TCP connection succeeds or
/// `overall` elapses
pub fn wait_for_tcp(host: &str, port: u16, conn_timeout: Duration, overall: Duration) -> bool {
    let started = Instant::now();
    while started.elapsed() < overall {
        let addrs = match (host, port).to_socket_addrs() {
            Ok(addrs) => addrs.collect::<Vec<_>>(),
            Err(e) => {
                log::debug!("wait_for_tcp: cannot resolve {}:{}: {}", host, port, e);
                Vec::new()
            }
        };
        for addr in &addrs {
            if TcpStream::connect_timeout(addr, conn_timeout).is_ok() {
                return true;
            }
        }
        log::debug!("wait_for_tcp: {}:{} not ready", host, port);

        let remaining = overall.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            break;
        }
        thread::sleep(remaining.min(Duration::from_secs(1)));
    }
    false
}

/// True when `path` exists and holds at least `min_size` bytes
pub fn file_ok(min_size: u64, path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.len() >= min_size)
        .unwrap_or(false)
}

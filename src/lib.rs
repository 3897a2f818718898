use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use log::info;

pub mod datasource;
pub mod engines;
pub mod error;
pub mod harness;
pub mod http;
pub mod naming;
pub mod storage;
pub mod types;

use crate::datasource::{AllocatorConfig, PoolConfig};
use crate::engines::CoordinatorConfig;
use crate::error::{HarnessError, Result};
use crate::harness::{FaultMode, Harness, PollerConfig};

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the HTTP server to
    pub bind_addr: SocketAddr,
    /// Root of the probe database, coordinator log and resource log
    pub data_dir: PathBuf,
    /// Database provisioning
    pub allocator: AllocatorConfig,
    /// What the simulated participant does when it crashes
    pub fault_mode: FaultMode,
    /// Recovery polling
    pub poller: PollerConfig,
    /// Reference coordinator and its recovery module
    pub coordinator: CoordinatorConfig,
    /// Data source connection pool
    pub pool: PoolConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".parse().expect("invalid default bind address"),
            data_dir: PathBuf::from("./data"),
            allocator: AllocatorConfig::default(),
            fault_mode: FaultMode::default(),
            poller: PollerConfig::default(),
            coordinator: CoordinatorConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

/// The harness HTTP server
pub struct Server {
    config: Config,
    harness: Arc<Harness>,
}

impl Server {
    /// Create a new server with the given configuration
    pub async fn new(config: Config) -> Result<Self> {
        // Allocation may wait for a database server to come up
        let harness_config = config.clone();
        let harness = tokio::task::spawn_blocking(move || Harness::start(&harness_config))
            .await
            .map_err(|e| HarnessError::Internal(format!("harness startup failed: {}", e)))??;

        Ok(Self {
            config,
            harness: Arc::new(harness),
        })
    }

    pub fn harness(&self) -> &Arc<Harness> {
        &self.harness
    }

    /// The `/executor` router
    pub fn router(&self) -> axum::Router {
        http::router(Arc::clone(&self.harness))
    }

    /// Run the server until Ctrl-C
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serve on an already-bound listener until `shutdown` resolves
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Harness listening on {}", listener.local_addr()?);
        info!("Data directory: {:?}", self.config.data_dir);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        self.harness.shutdown()
    }
}

//! xa-recovery-harness - crash/recovery test harness for two-phase commit
//!
//! Drives a transaction whose participant dies after voting to commit, then
//! checks that a later recovery pass finds the abandoned participant and
//! completes it.
//!
//! Architecture Overview:
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    HTTP /executor                           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Transaction Driver                         │
//! │     (save / crash / recovery polling / naming checks)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                    ┌─────────┴─────────┐
//!                    ▼                   ▼
//! ┌──────────────────────────┐ ┌────────────────────────────────┐
//! │      Coordinator         │ │   Data Source + Pool           │
//! │ (2PC, decision log,      │ │   (probe table)                │
//! │  recovery module)        │ │                                │
//! └──────────────────────────┘ └────────────────────────────────┘
//!                    │                   │
//!                    ▼                   │
//! ┌──────────────────────────┐           │
//! │   Resource log +         │◀──────────┘
//! │   recovery scanner       │
//! └──────────────────────────┘

use std::path::PathBuf;
use std::time::Duration;

use log::info;

use xa_recovery_harness::harness::FaultMode;
use xa_recovery_harness::{Config, Server};

fn print_help() {
    println!("xa-recovery-harness - crash/recovery test harness for two-phase commit");
    println!();
    println!("Usage: xa-recovery-harness [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -p, --port PORT              Port to listen on (default: 8080)");
    println!("  -d, --data-dir DIR           Data directory (default: ./data)");
    println!("  -a, --allocator MODE         embedded | container | remote-pool (default: embedded)");
    println!("      --db-host HOST           Database host for container/remote-pool modes");
    println!("      --db-port PORT           Database port for container/remote-pool modes");
    println!("      --fault MODE             exit | simulate (default: exit)");
    println!("      --poll-attempts N        Recovery poll attempts (default: 3)");
    println!("      --poll-interval-ms MS    Delay between recovery polls (default: 5000)");
    println!("      --recovery-period-ms MS  Recovery cycle period (default: 2000)");
    println!("      --no-recovery            Do not register a recovery module");
    println!("  -h, --help                   Show this help");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        let value = args.get(i + 1).map(String::as_str);
        let mut takes_value = true;
        match (flag, value) {
            ("--port" | "-p", Some(v)) => {
                let port: u16 = v.parse()?;
                config.bind_addr = format!("127.0.0.1:{}", port).parse()?;
            }
            ("--data-dir" | "-d", Some(v)) => config.data_dir = PathBuf::from(v),
            ("--allocator" | "-a", Some(v)) => config.allocator.mode = v.to_string(),
            ("--db-host", Some(v)) => config.allocator.host = v.to_string(),
            ("--db-port", Some(v)) => config.allocator.port = v.parse()?,
            ("--fault", Some(v)) => config.fault_mode = v.parse::<FaultMode>()?,
            ("--poll-attempts", Some(v)) => config.poller.attempts = v.parse()?,
            ("--poll-interval-ms", Some(v)) => {
                config.poller.interval = Duration::from_millis(v.parse()?)
            }
            ("--recovery-period-ms", Some(v)) => {
                config.coordinator.recovery_period = Duration::from_millis(v.parse()?)
            }
            ("--no-recovery", _) => {
                config.coordinator.recovery_enabled = false;
                takes_value = false;
            }
            ("--help" | "-h", _) => {
                print_help();
                return Ok(());
            }
            (other, _) => {
                eprintln!("Unknown or incomplete option: {}", other);
                print_help();
                std::process::exit(2);
            }
        }
        i += if takes_value { 2 } else { 1 };
    }

    info!("Starting xa-recovery-harness...");

    let server = Server::new(config).await?;
    server.run().await?;

    Ok(())
}

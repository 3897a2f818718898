//! Reference coordinator - 2PC with a durable decision log
//!
//! Stands in for the transaction manager under test. It offers the
//! transaction boundary API and a recovery module that accepts pluggable
//! recovery helpers and drives the branches they report to completion.

pub mod log;
pub mod manager;
pub mod recovery;
pub mod txlog;
pub mod types;

// Public API
pub use manager::{Coordinator, CoordinatorConfig};
pub use recovery::{CycleReport, RecoveryModule};
pub use types::*;

//! Transaction engine for the harness
//!
//! The harness exercises a transaction manager through two seams only: the
//! transaction boundary API (begin / enlist / commit / rollback) and the
//! recovery module's helper registration. The `coordinator` module is the
//! in-repo reference implementation of both.

pub mod coordinator;
pub mod handler;

pub use handler::{RecoveryHelper, Vote, XaResource};

// Re-exports for convenience
pub use coordinator::{Coordinator, CoordinatorConfig, RecoveryModule};

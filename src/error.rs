//! Error types for the harness
//!
//! Defines a unified error type that can represent errors from all components.
//! Messages are written to be returned verbatim as HTTP response bodies.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Unified error type for harness operations
#[derive(Debug)]
pub enum HarnessError {
    /// I/O error without a more specific storage context
    Io(io::Error),
    /// Resource log, coordinator log or probe table failure
    Storage {
        path: PathBuf,
        message: String,
    },
    /// Missing recovery module, naming binding or unsupported setting.
    /// Always fatal, never retried.
    Configuration(String),
    /// Polling exhausted without observing recovery progress
    RecoveryTimeout {
        attempts: u32,
        elapsed: Duration,
    },
    /// Commit/rollback failure on the ordinary (non-crash) path
    Transaction(String),
    /// The fault hook fired in simulate mode
    SimulatedCrash(String),
    /// JSON encoding/decoding error
    Json(String),
    /// Binary log frame encoding/decoding error
    Codec(String),
    /// Generic internal error
    Internal(String),
}

impl HarnessError {
    /// Build a storage error carrying the path it happened on
    pub fn storage(path: impl AsRef<Path>, message: impl fmt::Display) -> Self {
        HarnessError::Storage {
            path: path.as_ref().to_path_buf(),
            message: message.to_string(),
        }
    }

    /// True when this error is the simulated process death
    pub fn is_simulated_crash(&self) -> bool {
        matches!(self, HarnessError::SimulatedCrash(_))
    }

    /// HTTP status used when this error escapes an endpoint
    pub fn http_status(&self) -> u16 {
        match self {
            // the "process" is gone; nothing sensible can be returned
            HarnessError::SimulatedCrash(_) => 503,
            _ => 500,
        }
    }
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HarnessError::Io(e) => write!(f, "{}", e),
            HarnessError::Storage { path, message } => {
                write!(f, "storage error at '{}': {}", path.display(), message)
            }
            HarnessError::Configuration(msg) => write!(f, "{}", msg),
            HarnessError::RecoveryTimeout { attempts, elapsed } => write!(
                f,
                "Something wrong happened and recovery didn't complete ({} attempts, {:.1}s)",
                attempts,
                elapsed.as_secs_f64()
            ),
            HarnessError::Transaction(msg) => write!(f, "{}", msg),
            HarnessError::SimulatedCrash(msg) => write!(f, "simulated crash: {}", msg),
            HarnessError::Json(msg) => write!(f, "{}", msg),
            HarnessError::Codec(msg) => write!(f, "{}", msg),
            HarnessError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for HarnessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HarnessError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for HarnessError {
    fn from(e: io::Error) -> Self {
        HarnessError::Io(e)
    }
}

impl From<serde_json::Error> for HarnessError {
    fn from(e: serde_json::Error) -> Self {
        HarnessError::Json(e.to_string())
    }
}

impl From<bincode::Error> for HarnessError {
    fn from(e: bincode::Error) -> Self {
        HarnessError::Codec(e.to_string())
    }
}

/// Result type alias for harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;

//! Bounded polling for recovery progress

use std::thread;
use std::time::{Duration, Instant};

use crate::error::{HarnessError, Result};

/// How long the poller waits for recovery
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub attempts: u32,
    /// Sleep before each sample
    pub interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            interval: Duration::from_secs(5),
        }
    }
}

impl PollerConfig {
    /// Short interval for automated test runs
    pub fn quick() -> Self {
        Self {
            interval: Duration::from_millis(200),
            ..Default::default()
        }
    }
}

/// Outcome of a successful recovery check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub before: usize,
    pub after: usize,
    /// Samples taken until progress was seen
    pub attempts: u32,
}

pub struct RecoveryPoller {
    config: PollerConfig,
}

impl RecoveryPoller {
    pub fn new(config: PollerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Sample `probe_count`, run `register`, then re-sample up to the
    /// configured number of attempts until the count has grown. A `register`
    /// failure is returned at once.
    pub fn verify<C, R>(&self, mut probe_count: C, register: R) -> Result<RecoveryReport>
    where
        C: FnMut() -> Result<usize>,
        R: FnOnce() -> Result<()>,
    {
        let started = Instant::now();
        let before = probe_count()?;
        register()?;

        for attempt in 1..=self.config.attempts {
            thread::sleep(self.config.interval);
            let after = probe_count()?;
            log::debug!(
                "Recovery poll {}/{}: {} rows (was {})",
                attempt,
                self.config.attempts,
                after,
                before
            );
            if after > before {
                return Ok(RecoveryReport {
                    before,
                    after,
                    attempts: attempt,
                });
            }
        }

        Err(HarnessError::RecoveryTimeout {
            attempts: self.config.attempts,
            elapsed: started.elapsed(),
        })
    }
}

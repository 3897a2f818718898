//! Naming context for the transaction-related bindings
//!
//! Components are looked up by their well-known names rather than reached
//! through globals, so a binding can be removed at runtime and the diagnostic
//! endpoint can report exactly which one is missing.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::datasource::DataSource;
use crate::engines::Coordinator;
use crate::error::{HarnessError, Result};

pub const USER_TRANSACTION: &str = "java:comp/UserTransaction";
pub const TRANSACTION_MANAGER: &str = "java:comp/env/TransactionManager";
pub const TRANSACTION_SYNCHRONIZATION_REGISTRY: &str =
    "java:comp/env/TransactionSynchronizationRegistry";
pub const TRANSACTIONAL_DATA_SOURCE: &str = "java:comp/env/transactionalDataSource";

/// Something bound under a name
#[derive(Clone)]
pub enum Binding {
    Coordinator(Arc<Coordinator>),
    DataSource(Arc<DataSource>),
}

#[derive(Default)]
pub struct NamingContext {
    bindings: RwLock<HashMap<String, Binding>>,
}

impl NamingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `binding` under `name`, returning what was bound there before
    pub fn bind(&self, name: &str, binding: Binding) -> Option<Binding> {
        self.bindings
            .write()
            .expect("naming lock poisoned")
            .insert(name.to_string(), binding)
    }

    pub fn unbind(&self, name: &str) -> Option<Binding> {
        self.bindings
            .write()
            .expect("naming lock poisoned")
            .remove(name)
    }

    pub fn lookup(&self, name: &str) -> Option<Binding> {
        self.bindings
            .read()
            .expect("naming lock poisoned")
            .get(name)
            .cloned()
    }

    /// Bound names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .bindings
            .read()
            .expect("naming lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Bind the coordinator under the three transaction names
    pub fn bind_coordinator(&self, coordinator: Arc<Coordinator>) {
        for name in [
            USER_TRANSACTION,
            TRANSACTION_MANAGER,
            TRANSACTION_SYNCHRONIZATION_REGISTRY,
        ] {
            self.bind(name, Binding::Coordinator(Arc::clone(&coordinator)));
        }
    }

    pub fn bind_data_source(&self, data_source: Arc<DataSource>) {
        self.bind(TRANSACTIONAL_DATA_SOURCE, Binding::DataSource(data_source));
    }

    fn coordinator_at(&self, name: &str, missing: &str) -> Result<Arc<Coordinator>> {
        match self.lookup(name) {
            Some(Binding::Coordinator(c)) => Ok(c),
            _ => Err(HarnessError::Configuration(missing.to_string())),
        }
    }

    pub fn transaction_manager(&self) -> Result<Arc<Coordinator>> {
        self.coordinator_at(TRANSACTION_MANAGER, "TransactionManager not found in JNDI")
    }

    pub fn data_source(&self) -> Result<Arc<DataSource>> {
        match self.lookup(TRANSACTIONAL_DATA_SOURCE) {
            Some(Binding::DataSource(ds)) => Ok(ds),
            _ => Err(HarnessError::Configuration(
                "DataSource not found in JNDI".to_string(),
            )),
        }
    }

    /// Check all four bindings, failing on the first one missing
    pub fn verify_transaction_bindings(&self) -> Result<()> {
        self.coordinator_at(USER_TRANSACTION, "UserTransaction not found in JNDI")?;
        self.transaction_manager()?;
        self.coordinator_at(
            TRANSACTION_SYNCHRONIZATION_REGISTRY,
            "TransactionSynchronizationRegistry not found in JNDI",
        )?;
        self.data_source()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::{Allocator, AllocatorConfig, PoolConfig};
    use crate::engines::CoordinatorConfig;
    use tempfile::tempdir;

    fn bound_context(dir: &std::path::Path) -> NamingContext {
        let coordinator = Arc::new(
            Coordinator::open(dir.join("tx-log"), CoordinatorConfig::without_recovery()).unwrap(),
        );
        let db = Allocator::from_config(&AllocatorConfig::default(), dir)
            .unwrap()
            .allocate_db(None)
            .unwrap();
        let ds = Arc::new(DataSource::open(db, PoolConfig::small(1)).unwrap());

        let naming = NamingContext::new();
        naming.bind_coordinator(coordinator);
        naming.bind_data_source(ds);
        naming
    }

    #[test]
    fn test_all_bindings_verify() {
        let dir = tempdir().unwrap();
        let naming = bound_context(dir.path());
        naming.verify_transaction_bindings().unwrap();
        assert_eq!(naming.names().len(), 4);
        assert!(naming.transaction_manager().is_ok());
        assert!(naming.data_source().is_ok());
    }

    #[test]
    fn test_missing_binding_is_named() {
        let dir = tempdir().unwrap();
        for (name, message) in [
            (USER_TRANSACTION, "UserTransaction not found in JNDI"),
            (TRANSACTION_MANAGER, "TransactionManager not found in JNDI"),
            (
                TRANSACTION_SYNCHRONIZATION_REGISTRY,
                "TransactionSynchronizationRegistry not found in JNDI",
            ),
            (TRANSACTIONAL_DATA_SOURCE, "DataSource not found in JNDI"),
        ] {
            let naming = bound_context(dir.path());
            assert!(naming.unbind(name).is_some());
            let err = naming.verify_transaction_bindings().unwrap_err();
            assert_eq!(err.to_string(), message);
        }
    }

    #[test]
    fn test_wrong_kind_counts_as_missing() {
        let dir = tempdir().unwrap();
        let naming = bound_context(dir.path());
        let ds = naming.lookup(TRANSACTIONAL_DATA_SOURCE).unwrap();
        naming.bind(TRANSACTION_MANAGER, ds);
        assert!(naming.transaction_manager().is_err());
    }
}

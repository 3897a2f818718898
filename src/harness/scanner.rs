//! Recovery helper backed by the resource log
//!
//! On every recovery cycle the scanner enumerates the resource log and hands
//! the recovery module one `RecoveredResource` per record. Committing such a
//! handle applies the recorded mutation through a pooled connection and then
//! deletes the record; rolling it back or forgetting it only deletes the
//! record.

use std::sync::Arc;

use crate::datasource::DataSource;
use crate::engines::{RecoveryHelper, Vote, XaResource};
use crate::error::{HarnessError, Result};
use crate::harness::resource_log::ResourceLogStore;
use crate::types::{ResourceRecord, Xid};

/// Name the scanner registers under
pub const SCANNER_NAME: &str = "resource-log-scanner";

pub struct RecoveryScanner {
    store: Arc<ResourceLogStore>,
    datasource: Arc<DataSource>,
}

impl RecoveryScanner {
    pub fn new(store: Arc<ResourceLogStore>, datasource: Arc<DataSource>) -> Self {
        Self { store, datasource }
    }

    /// Handles for every readable record currently in the log
    pub fn recovered_resources(&self) -> Result<Vec<RecoveredResource>> {
        let report = self.store.scan()?;
        if !report.skipped.is_empty() {
            log::warn!(
                "{} resource records could not be read and were skipped",
                report.skipped.len()
            );
        }
        Ok(report
            .records
            .into_iter()
            .map(|record| RecoveredResource {
                record,
                store: Arc::clone(&self.store),
                datasource: Arc::clone(&self.datasource),
            })
            .collect())
    }
}

impl RecoveryHelper for RecoveryScanner {
    fn name(&self) -> &str {
        SCANNER_NAME
    }

    fn initialise(&self, param: &str) -> Result<bool> {
        log::info!(
            "Resource log scanner initialised for node '{}' on {}",
            param,
            self.store.dir().display()
        );
        Ok(true)
    }

    fn get_resources(&self) -> Result<Vec<Arc<dyn XaResource>>> {
        let resources = self.recovered_resources()?;
        if !resources.is_empty() {
            log::info!("Resource log holds {} in-doubt records", resources.len());
        }
        Ok(resources
            .into_iter()
            .map(|r| Arc::new(r) as Arc<dyn XaResource>)
            .collect())
    }
}

/// A participant rebuilt from its resource record
pub struct RecoveredResource {
    record: ResourceRecord,
    store: Arc<ResourceLogStore>,
    datasource: Arc<DataSource>,
}

impl RecoveredResource {
    pub fn record(&self) -> &ResourceRecord {
        &self.record
    }

    fn check_xid(&self, xid: &Xid) -> Result<()> {
        if *xid != self.record.xid {
            return Err(HarnessError::Transaction(format!(
                "recovered resource {} asked to resolve foreign branch {}",
                self.record.id, xid
            )));
        }
        Ok(())
    }
}

impl XaResource for RecoveredResource {
    fn name(&self) -> &str {
        "recovered-resource"
    }

    fn prepare(&self, xid: &Xid) -> Result<Vote> {
        self.check_xid(xid)?;
        Ok(Vote::Commit)
    }

    fn commit(&self, xid: &Xid) -> Result<()> {
        self.check_xid(xid)?;
        {
            let conn = self.datasource.get_connection()?;
            let applied = conn.apply_recovered(&self.record.id, &self.record.mutation)?;
            if !applied {
                log::info!("Record {} was already applied", self.record.id);
            }
        }
        self.store.remove(&self.record.id)?;
        log::info!("Recovered record {} committed", self.record.id);
        Ok(())
    }

    fn rollback(&self, xid: &Xid) -> Result<()> {
        self.check_xid(xid)?;
        self.store.remove(&self.record.id)?;
        log::info!("Recovered record {} rolled back", self.record.id);
        Ok(())
    }

    fn forget(&self, xid: &Xid) -> Result<()> {
        self.check_xid(xid)?;
        self.store.remove(&self.record.id)?;
        Ok(())
    }

    fn recover(&self) -> Result<Vec<Xid>> {
        Ok(vec![self.record.xid.clone()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::{Allocator, AllocatorConfig, PoolConfig};
    use crate::types::{Mutation, RecordStatus, DEFAULT_FORMAT_ID};
    use tempfile::tempdir;

    fn scanner(dir: &std::path::Path) -> (RecoveryScanner, Arc<ResourceLogStore>, Arc<DataSource>) {
        let store = Arc::new(ResourceLogStore::open(dir.join("xa-log")).unwrap());
        let db = Allocator::from_config(&AllocatorConfig::default(), dir)
            .unwrap()
            .allocate_db(None)
            .unwrap();
        let ds = Arc::new(DataSource::open(db, PoolConfig::small(2)).unwrap());
        (RecoveryScanner::new(store.clone(), ds.clone()), store, ds)
    }

    fn in_doubt(store: &ResourceLogStore, gtrid: &[u8], value: &str) -> ResourceRecord {
        let record = ResourceRecord::new(
            Xid::branch(DEFAULT_FORMAT_ID, gtrid, 0),
            Mutation::insert(value),
            RecordStatus::InDoubt,
        );
        store.persist(&record).unwrap();
        record
    }

    #[test]
    fn test_initialise_accepts() {
        let dir = tempdir().unwrap();
        let (scanner, _, _) = scanner(dir.path());
        assert!(scanner.initialise("node-1").unwrap());
        assert_eq!(scanner.name(), SCANNER_NAME);
    }

    #[test]
    fn test_handles_report_their_xid() {
        let dir = tempdir().unwrap();
        let (scanner, store, _) = scanner(dir.path());
        let record = in_doubt(&store, b"g1", "X");

        let resources = scanner.get_resources().unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].recover().unwrap(), vec![record.xid]);
    }

    #[test]
    fn test_commit_applies_then_removes() {
        let dir = tempdir().unwrap();
        let (scanner, store, ds) = scanner(dir.path());
        let record = in_doubt(&store, b"g1", "X");

        let handle = scanner.recovered_resources().unwrap().remove(0);
        handle.commit(&record.xid).unwrap();

        assert!(!store.contains(&record.id));
        assert_eq!(ds.get_connection().unwrap().get_all().unwrap(), vec!["X"]);
        assert_eq!(ds.pool().active_count(), 0);

        // a second delivery changes nothing
        handle.commit(&record.xid).unwrap();
        assert_eq!(ds.get_connection().unwrap().count().unwrap(), 1);
    }

    #[test]
    fn test_rollback_only_removes() {
        let dir = tempdir().unwrap();
        let (scanner, store, ds) = scanner(dir.path());
        let record = in_doubt(&store, b"g1", "X");

        let handle = scanner.recovered_resources().unwrap().remove(0);
        handle.rollback(&record.xid).unwrap();
        assert!(store.is_empty().unwrap());
        assert_eq!(ds.get_connection().unwrap().count().unwrap(), 0);
    }

    #[test]
    fn test_foreign_xid_is_refused() {
        let dir = tempdir().unwrap();
        let (scanner, store, _) = scanner(dir.path());
        let record = in_doubt(&store, b"g1", "X");

        let handle = scanner.recovered_resources().unwrap().remove(0);
        let other = Xid::branch(DEFAULT_FORMAT_ID, b"g2", 0);
        assert!(handle.commit(&other).is_err());
        assert!(store.contains(&record.id));
    }

    #[test]
    fn test_scan_failure_propagates() {
        let dir = tempdir().unwrap();
        let (scanner, store, _) = scanner(dir.path());
        std::fs::remove_dir(store.dir()).unwrap();
        assert!(scanner.get_resources().is_err());
    }
}

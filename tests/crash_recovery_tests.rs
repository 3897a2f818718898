use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use xa_recovery_harness::engines::coordinator::manager::LOG_FILE_NAME;
use xa_recovery_harness::engines::CoordinatorConfig;
use xa_recovery_harness::error::HarnessError;
use xa_recovery_harness::harness::{
    FaultMode, Harness, PollerConfig, RecoveryPoller, RecoveryScanner, TX_LOG_DIR,
};
use xa_recovery_harness::types::{Mutation, RecordStatus, ResourceRecord, Xid, DEFAULT_FORMAT_ID};
use xa_recovery_harness::Config;

fn config(dir: &Path) -> Config {
    Config {
        data_dir: dir.to_path_buf(),
        fault_mode: FaultMode::Simulate,
        coordinator: CoordinatorConfig::fast_recovery(),
        poller: PollerConfig {
            attempts: 3,
            interval: Duration::from_millis(200),
        },
        ..Default::default()
    }
}

/// Poll `cond` until it holds or a few seconds pass
fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    cond()
}

/// Crash a transaction inserting `value` in a harness that is then dropped.
/// The crash adds no row and leaves exactly one record behind.
fn crash_once(dir: &Path, value: &str) {
    let harness = Harness::start(&config(dir)).unwrap();
    let before = harness.driver().get_strings().unwrap();
    let err = harness.driver().crash(value).unwrap_err();
    assert!(err.is_simulated_crash(), "unexpected error: {}", err);
    assert_eq!(harness.driver().get_strings().unwrap(), before);
    assert_eq!(harness.resource_log().len().unwrap(), 1);
}

#[test]
fn test_crash_then_recover() {
    let tmp = TempDir::new().unwrap();
    crash_once(tmp.path(), "X");

    let harness = Harness::start(&config(tmp.path())).unwrap();
    // nothing recovers before the scanner is registered
    assert!(harness.driver().get_strings().unwrap().is_empty());

    let after = harness.driver().recovery().unwrap();
    assert_eq!(after, vec!["X"]);
    // the row lands before the cycle that wrote it finishes
    assert!(wait_until(|| harness.resource_log().is_empty().unwrap()));

    // the decision was closed and compacted away
    let log_path = tmp.path().join(TX_LOG_DIR).join(LOG_FILE_NAME);
    assert!(wait_until(|| fs::metadata(&log_path).unwrap().len() == 0));
    harness.shutdown().unwrap();

    // a restart finds nothing left to do and the row is still there
    let harness = Harness::start(&config(tmp.path())).unwrap();
    assert_eq!(harness.driver().get_strings().unwrap(), vec!["X"]);
    assert!(harness.resource_log().is_empty().unwrap());
}

#[test]
fn test_recovery_times_out_without_scanner() {
    let tmp = TempDir::new().unwrap();
    crash_once(tmp.path(), "X");

    let harness = Harness::start(&config(tmp.path())).unwrap();
    let ds = harness.datasource().clone();
    let mut samples = 0u32;
    let poller = RecoveryPoller::new(config(tmp.path()).poller);
    let err = poller
        .verify(
            || {
                samples += 1;
                ds.get_connection()?.count()
            },
            // the scanner is never registered
            || Ok(()),
        )
        .unwrap_err();

    assert!(err
        .to_string()
        .starts_with("Something wrong happened and recovery didn't complete"));
    match err {
        HarnessError::RecoveryTimeout { attempts, elapsed } => {
            assert_eq!(attempts, 3);
            assert!(elapsed >= Duration::from_millis(600));
        }
        other => panic!("expected a recovery timeout, got {}", other),
    }
    assert_eq!(samples, 4);
    assert!(harness.driver().get_strings().unwrap().is_empty());
    assert_eq!(harness.resource_log().len().unwrap(), 1);
}

#[test]
fn test_corrupt_record_is_skipped_during_recovery() {
    let tmp = TempDir::new().unwrap();
    crash_once(tmp.path(), "X");

    let harness = Harness::start(&config(tmp.path())).unwrap();
    let garbage = harness.resource_log().dir().join("deadbeef.awaiting");
    fs::write(&garbage, b"\x00\x01 not a record").unwrap();

    let report = harness.resource_log().scan().unwrap();
    assert_eq!(report.records.len(), 1);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].path, garbage);

    assert_eq!(harness.driver().recovery().unwrap(), vec!["X"]);
    // the corrupt file is left for an operator
    assert!(wait_until(|| harness.resource_log().len().unwrap() == 1));
    assert!(garbage.exists());
}

#[test]
fn test_record_without_decision_is_rolled_back() {
    let tmp = TempDir::new().unwrap();
    let harness = Harness::start(&Config {
        coordinator: CoordinatorConfig {
            recovery_period: Duration::from_secs(3600),
            ..Default::default()
        },
        ..config(tmp.path())
    })
    .unwrap();

    // a participant that voted but whose coordinator never decided
    let record = ResourceRecord::new(
        Xid::branch(DEFAULT_FORMAT_ID, b"undecided", 0),
        Mutation::insert("Y"),
        RecordStatus::Prepared,
    );
    harness.resource_log().persist(&record).unwrap();

    let module = harness.coordinator().recovery_module().unwrap();
    module
        .add_resource_recovery_helper(Arc::new(RecoveryScanner::new(
            harness.resource_log().clone(),
            harness.datasource().clone(),
        )))
        .unwrap();
    let report = module.run_cycle().unwrap();

    assert_eq!(report.rolled_back, 1);
    assert!(harness.resource_log().is_empty().unwrap());
    assert!(harness.driver().get_strings().unwrap().is_empty());
}

#[test]
fn test_recovery_is_repeatable_across_crashes() {
    let tmp = TempDir::new().unwrap();
    crash_once(tmp.path(), "first");
    {
        let harness = Harness::start(&config(tmp.path())).unwrap();
        assert_eq!(harness.driver().recovery().unwrap(), vec!["first"]);
        assert!(wait_until(|| harness.resource_log().is_empty().unwrap()));
    }

    crash_once(tmp.path(), "second");
    let harness = Harness::start(&config(tmp.path())).unwrap();
    assert_eq!(harness.driver().get_strings().unwrap(), vec!["first"]);
    assert_eq!(harness.driver().recovery().unwrap(), vec!["first", "second"]);
    assert!(wait_until(|| harness.resource_log().is_empty().unwrap()));
}

#[test]
fn test_save_string_survives_restart() {
    let tmp = TempDir::new().unwrap();
    {
        let harness = Harness::start(&config(tmp.path())).unwrap();
        harness.driver().save_string("kept").unwrap();
    }
    let harness = Harness::start(&config(tmp.path())).unwrap();
    assert_eq!(harness.driver().get_strings().unwrap(), vec!["kept"]);
}

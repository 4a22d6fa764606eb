//! The shipped configuration file loads and validates

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::path::{Path, PathBuf};
use std::time::Duration;

use common::sqlite::VacuumMode;
use hvsrv::config::{HvsrvConfig, ENV_PREFIX};
use hvsrv::stabilization::Algorithm;

fn shipped_config() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("config/hvsrv.yaml")
}

#[test]
fn test_shipped_config_is_valid() {
    let config: HvsrvConfig =
        common::config_loader::load_config(Some(&shipped_config()), ENV_PREFIX).unwrap();
    config.validate().unwrap();

    assert_eq!(config.serial.baud, 9600);
    assert_eq!(config.driver.to_settings().probe_budget, Duration::from_millis(1200));
    assert_eq!(config.recorder.to_settings().commit_every_rows, 200);
    assert_eq!(config.csv.path.as_deref(), Some(Path::new("data/hv_data")));
    assert_eq!(config.stabilization.algorithm, Algorithm::Pid);
    assert_eq!(config.stabilization.target_current, 1000.0);

    let policy = config.retention.to_policy();
    assert_eq!(policy.keep_days, 30);
    assert_eq!(policy.keep_runs, 200);
    assert_eq!(policy.vacuum_mode, VacuumMode::Incremental);
}

#[test]
fn test_shipped_config_matches_defaults() {
    let shipped: HvsrvConfig =
        common::config_loader::load_config(Some(&shipped_config()), ENV_PREFIX).unwrap();
    let defaults = HvsrvConfig::default();

    assert_eq!(shipped.serial.port, defaults.serial.port);
    assert_eq!(shipped.driver.failure_threshold, defaults.driver.failure_threshold);
    assert_eq!(shipped.retention.interval_secs, defaults.retention.interval_secs);
    assert_eq!(shipped.stabilization, defaults.stabilization);
    assert!(shipped.meters.is_empty());
    assert_eq!(shipped.session.stabilize_on_start, defaults.session.stabilize_on_start);
}

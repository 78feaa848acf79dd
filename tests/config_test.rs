//! Integration tests for configuration loading and validation.

use serial_test::serial;
use solar_monitor::config::{CacheBackend, MonitorConfig};
use solar_monitor::error::MonitorError;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

const MINIMAL: &str = r#"
app_connectors:
  mock:
    sim: {}
data_structures:
  points:
    V: { input_type: int, output_type: float, floatpoint: 0.001 }
app_blocks:
  - name: simulation
    app: demo
    inputs:
      mock:
        - { name: sim_bat, source: sim }
    outputs:
      log:
        - { name: sim_log, cache_interval: 10 }
"#;

/// Write `contents` to a temporary `.yaml` file.
fn write_config(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .expect("Failed to create temp config");
    file.write_all(contents.as_bytes())
        .expect("Failed to write temp config");
    file
}

#[test]
#[serial]
fn test_load_from_file() {
    let file = write_config(MINIMAL);
    let config = MonitorConfig::load_from(file.path()).unwrap();
    config.validate().unwrap();

    assert_eq!(config.app_blocks.len(), 1);
    assert_eq!(config.cache.backend, CacheBackend::Memory);
    let item = &config.app_blocks[0].inputs["mock"][0];
    assert_eq!(item.time_interval, 1.0);
    assert_eq!(config.app_connectors.mock["sim"].port, "mock");
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let file = write_config(MINIMAL);
    std::env::set_var("SOLAR_MONITOR_CACHE__MAX_ROWS", "42");
    std::env::set_var("SOLAR_MONITOR_SCHEDULER__ALIGN_SECONDS", "0");
    let loaded = MonitorConfig::load_from(file.path());
    std::env::remove_var("SOLAR_MONITOR_CACHE__MAX_ROWS");
    std::env::remove_var("SOLAR_MONITOR_SCHEDULER__ALIGN_SECONDS");

    let config = loaded.unwrap();
    assert_eq!(config.cache.max_rows, 42);
    assert_eq!(config.scheduler.align_seconds, 0);
}

#[test]
#[serial]
fn test_malformed_yaml_is_reported() {
    let file = write_config("app_blocks: [ { name: x, inputs: 7 } ]");
    let err = MonitorConfig::load_from(file.path()).unwrap_err();
    assert!(matches!(err, MonitorError::Config(_)));
    assert!(!err.is_recoverable());
}

#[test]
#[serial]
fn test_redis_cache_requires_connector() {
    let file = write_config(&format!("{MINIMAL}\ncache:\n  backend: redis\n"));
    let config = MonitorConfig::load_from(file.path()).unwrap();
    let err = config.validate().unwrap_err();
    assert!(matches!(err, MonitorError::ConfigInvalid(_)));
}

#[test]
#[serial]
fn test_shipped_config_is_valid() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/solar_monitor.yaml");
    let config = MonitorConfig::load_from(&path).unwrap();
    config.validate().unwrap();

    assert_eq!(config.select_blocks(None, Some("monitor")).len(), 2);
    assert_eq!(config.select_blocks(Some("simulation"), None).len(), 1);
    assert_eq!(config.schema().unwrap().len(), 12);
}

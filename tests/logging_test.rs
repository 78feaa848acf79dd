//! Global subscriber installation. Kept in its own test binary because the
//! subscriber is process-wide.

use serial_test::serial;
use solar_monitor::logging::{self, OutputFormat, TracingConfig};
use tracing::Level;

#[test]
#[serial]
fn test_init_is_idempotent() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config = TracingConfig::new(Level::INFO)
        .with_format(OutputFormat::Json)
        .with_log_dir(dir.path().join("logs"));

    let first = logging::init(config.clone()).expect("first init");
    let _second = logging::init(config).expect("second init is a no-op");
    tracing::info!(node = "bat", "logging ready");
    drop(first);

    assert!(dir.path().join("logs").is_dir());
}

#[test]
#[serial]
fn test_init_rejects_unusable_log_dir() {
    let file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
    let config = TracingConfig::new(Level::INFO).with_log_dir(file.path().join("logs"));
    assert!(logging::init(config).is_err());
}

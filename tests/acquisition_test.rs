//! Integration tests for shared sessions, input workers and the scheduler,
//! driven by scripted mock devices.

use solar_monitor::acquisition::{
    MockDevice, MockStep, PacketReader, SerialSession, SessionConfig, SessionRegistry,
};
use solar_monitor::cache::{InputsCache, MemoryInputsCache};
use solar_monitor::checker::{build_schema, PointConfig, Schema};
use solar_monitor::error::MonitorError;
use solar_monitor::input::{InputSpec, InputWorker};
use solar_monitor::sample::{RawPacket, Value};
use solar_monitor::scheduler::{Scheduler, SchedulerConfig};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_millis(50);

fn frame(pairs: &[(&str, &str)]) -> RawPacket {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn point(input: &str, output: &str, floatpoint: Option<f64>) -> PointConfig {
    PointConfig {
        input_type: Some(input.into()),
        output_type: Some(output.into()),
        floatpoint,
    }
}

fn battery_schema() -> Arc<Schema> {
    let mut points = BTreeMap::new();
    points.insert("V".to_string(), point("int", "float", Some(0.001)));
    points.insert("I".to_string(), point("int", "float", Some(0.001)));
    points.insert("SOC".to_string(), point("int", "float", Some(0.1)));
    Arc::new(build_schema(&points).unwrap())
}

fn session(device: &MockDevice, config: SessionConfig) -> Arc<SerialSession> {
    Arc::new(SerialSession::new("bmv", Box::new(device.clone()), config))
}

#[test]
fn test_lock_conflict() {
    let device = MockDevice::new("/dev/ttyMOCK0");
    let session = session(&device, SessionConfig::default());

    assert!(session.lock("A"));
    assert!(!session.lock("B"));
    session.unlock();
    assert!(session.lock("B"));
    assert_eq!(session.lock_holder().as_deref(), Some("B"));
}

#[test]
fn test_batch_merges_short_frames() {
    let device = MockDevice::new("/dev/ttyMOCK0");
    device.push([
        MockStep::Packet(frame(&[("V", "12800"), ("I", "-350")])),
        MockStep::ReadError,
        MockStep::Packet(frame(&[("SOC", "876"), ("V", "12810")])),
    ]);
    let config = SessionConfig {
        packets_per_batch: 2,
        ..SessionConfig::default()
    };
    let session = session(&device, config);

    let reading = session.read("bat", TIMEOUT).unwrap();
    assert_eq!(reading.packet["V"], "12810");
    assert_eq!(reading.packet["I"], "-350");
    assert_eq!(reading.packet["SOC"], "876");
    assert_eq!(device.reads(), 3);
}

#[test]
fn test_port_loss_reconnects_on_next_read() {
    let device = MockDevice::new("/dev/ttyMOCK0");
    device.push([MockStep::PortLost]);
    device.set_fallback(frame(&[("V", "12800")]));
    let session = session(&device, SessionConfig::default());

    let err = session.read("bat", TIMEOUT).unwrap_err();
    assert!(matches!(err, MonitorError::ConnectionLost { .. }));
    assert!(err.is_recoverable());

    let reading = session.read("bat", TIMEOUT).unwrap();
    assert_eq!(reading.packet["V"], "12800");
    assert_eq!(device.connects(), 2);
}

#[test]
fn test_unreachable_device_keeps_recovery_owner() {
    let device = MockDevice::new("/dev/ttyMOCK0");
    device.refuse_connect(true);
    let session = session(&device, SessionConfig::default());

    assert!(session.read("bat", TIMEOUT).is_err());
    assert!(session.is_locked_by("bat"));
    assert!(matches!(
        session.read("mppt", TIMEOUT),
        Err(MonitorError::SessionBusy { .. })
    ));

    device.refuse_connect(false);
    device.set_fallback(frame(&[("V", "1")]));
    assert!(session.read("bat", TIMEOUT).is_ok());
    assert!(session.lock_holder().is_none());
}

#[test]
fn test_registry_shares_one_session_per_connector() {
    let registry = SessionRegistry::new();
    let device = MockDevice::new("/dev/ttyMOCK0");

    let first = registry
        .get_or_open("bmv", || {
            Ok(SerialSession::new("bmv", Box::new(device.clone()), SessionConfig::default()))
        })
        .unwrap();
    let second = registry
        .get_or_open("bmv", || panic!("session must be reused"))
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(registry.len(), 1);
    registry.close_all();
}

#[test]
fn test_mock_battery_monitor_emits_frames() {
    let mut device = MockDevice::battery_monitor("sim");
    device.connect().unwrap();
    let packet = device.read_single(TIMEOUT).unwrap();
    assert!(packet.contains_key("V"));
    assert!(packet.contains_key("SOC"));
}

#[tokio::test]
async fn test_scheduled_inputs_fill_the_cache() {
    let device = MockDevice::battery_monitor("sim");
    let session = session(&device, SessionConfig::default());
    let cache: Arc<dyn InputsCache> = Arc::new(MemoryInputsCache::default());
    let scheduler = Scheduler::new(SchedulerConfig {
        max_workers: 4,
        align_seconds: 0,
    });

    for (node, interval_ms) in [("bat", 100), ("bat_soc", 250)] {
        let mut spec = InputSpec::new(node, Duration::from_millis(interval_ms));
        spec.timeout = TIMEOUT;
        if node == "bat_soc" {
            spec.columns = vec!["SOC".into()];
        }
        let worker = InputWorker::new(
            spec,
            Arc::clone(&session),
            battery_schema(),
            Schema::new(),
            Arc::clone(&cache),
        );
        scheduler
            .add(node, Duration::from_millis(interval_ms), Arc::new(worker))
            .unwrap();
    }

    scheduler.start_all().await;
    tokio::time::sleep(Duration::from_millis(600)).await;
    scheduler.cancel_all().await;
    assert_eq!(scheduler.count_active(), 0);

    let window = cache.read_window(0, 0, None).await.unwrap();
    assert!(!window.is_empty());
    let bat = window
        .data
        .values()
        .rev()
        .find_map(|bucket| bucket.get("bat"))
        .expect("bat samples");
    assert_eq!(bat["V"], Value::Float(12.8));
    assert_eq!(bat["SOC"], Value::Float(87.6));
    assert_eq!(bat["I"], Value::Float(-1.5));
    for soc in window.data.values().filter_map(|bucket| bucket.get("bat_soc")) {
        assert_eq!(soc.keys().collect::<Vec<_>>(), vec!["SOC", "time", "time_ref"]);
    }
    assert!(scheduler.tick_count("bat").unwrap() >= 3);
}

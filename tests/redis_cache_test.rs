//! Redis backend tests.
//!
//! These need a reachable Redis server and are ignored by default:
//!
//! ```bash
//! SOLAR_MONITOR_TEST_REDIS=redis://127.0.0.1:6379/15 \
//!     cargo test --test redis_cache_test -- --ignored --test-threads=1
//! ```
//!
//! Every test works in its own set name and prefix and resets it first.

use serial_test::serial;
use solar_monitor::cache::{InputsCache, MemoryInputsCache, RedisInputsCache};
use solar_monitor::output::sinks::RedisTimeSeriesSink;
use solar_monitor::output::Sink;
use solar_monitor::sample::{Fields, Structure, Value};

const DEFAULT_URL: &str = "redis://127.0.0.1:6379/15";

fn redis_url() -> String {
    std::env::var("SOLAR_MONITOR_TEST_REDIS").unwrap_or_else(|_| DEFAULT_URL.to_string())
}

async fn fresh_cache(name: &str, max_rows: usize) -> RedisInputsCache {
    let cache = RedisInputsCache::connect(&redis_url(), name, format!("{name}_"), max_rows)
        .await
        .expect("Redis server must be reachable");
    cache.reset().await.unwrap();
    cache
}

fn fields(pairs: &[(&str, f64)]) -> Fields {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Value::Float(*v)))
        .collect()
}

#[tokio::test]
#[serial]
#[ignore] // Needs a Redis server
async fn merge_keeps_newest_field_values() {
    let cache = fresh_cache("test_merge", 10).await;
    assert!(cache.register_node("bat").await.unwrap());
    assert!(!cache.has_data().await.unwrap());

    cache.add(100, "bat", &fields(&[("V", 12.8), ("I", -1.5)])).await.unwrap();
    cache.add(100, "bat", &fields(&[("V", 12.9)])).await.unwrap();
    assert!(!cache.add(101, "bat", &Fields::new()).await.unwrap());

    let window = cache.read_window(0, 0, None).await.unwrap();
    assert_eq!(window.data.keys().copied().collect::<Vec<_>>(), vec![100]);
    // node names come back without the storage prefix
    let bat = &window.data[&100]["bat"];
    assert_eq!(bat["V"], Value::Float(12.9));
    assert_eq!(bat["I"], Value::Float(-1.5));

    assert!(cache.has_data().await.unwrap());
    assert_eq!(cache.reset().await.unwrap(), 1);
    assert!(!cache.has_data().await.unwrap());
}

#[tokio::test]
#[serial]
#[ignore] // Needs a Redis server
async fn oldest_rows_are_trimmed_first() {
    let cache = fresh_cache("test_trim", 3).await;
    for k in [5, 1, 4, 2, 3] {
        cache.add(k, "mppt", &fields(&[("PPV", k as f64)])).await.unwrap();
    }
    assert_eq!(cache.keys_by_node("mppt").await.unwrap(), vec![3, 4, 5]);
    cache.reset().await.unwrap();
}

#[tokio::test]
#[serial]
#[ignore] // Needs a Redis server
async fn windows_match_the_memory_backend() {
    let redis = fresh_cache("test_window", 100).await;
    let memory = MemoryInputsCache::new(100);
    for cache in [&redis as &dyn InputsCache, &memory] {
        cache.set_interval_min(1);
        for k in 1_722_013_460..1_722_013_472 {
            cache.add(k, "fast", &fields(&[("V", k as f64)])).await.unwrap();
            if k % 5 == 0 {
                cache.add(k, "slow", &fields(&[("SOC", 87.6), ("TTG", 240.0)])).await.unwrap();
            }
        }
    }

    let mut structure = Structure::new();
    structure.insert("slow".into(), vec!["SOC".into()]);
    structure.insert("fast".into(), Vec::new());
    for (from, items, structure) in [
        (0, 0, None),
        (1_722_013_464, 2, Some(&structure)),
        (1_722_013_461, 4, None),
    ] {
        let from_redis = redis.read_window(from, items, structure).await.unwrap();
        let from_memory = memory.read_window(from, items, structure).await.unwrap();
        assert_eq!(from_redis, from_memory, "from={from} items={items}");
    }
    redis.reset().await.unwrap();
}

#[tokio::test]
#[serial]
#[ignore] // Needs a Redis server
async fn time_series_sink_writes_prefixed_nodes() {
    let reader = RedisInputsCache::connect(&redis_url(), "test_series", "n_", 100)
        .await
        .expect("Redis server must be reachable");
    reader.reset().await.unwrap();

    let mut window = solar_monitor::cache::WindowData::new();
    for k in [10, 11] {
        window
            .entry(k)
            .or_default()
            .insert("voltage".to_string(), fields(&[("bat_V", 12.0 + k as f64 / 10.0)]));
    }
    let mut schema = Structure::new();
    schema.insert("voltage".into(), vec!["bat_V".into()]);

    let mut sink = RedisTimeSeriesSink::new("series", redis_url(), "test_series", 100);
    sink.connect().await.unwrap();
    assert!(sink.send(&window, &schema).await.unwrap());
    sink.close().await;

    let stored = reader.read_window(0, 0, None).await.unwrap();
    assert_eq!(stored.data, window);
    reader.reset().await.unwrap();
}

//! Sink implementations.
//!
//! - [`RedisTimeSeriesSink`]: writes windows into Redis hashes (`n_<node>`)
//! - [`HttpSink`]: POSTs each window as JSON
//! - [`LogSink`]: logs each window through `tracing`
//! - [`MemorySink`]: keeps windows in memory, for tests and dry runs

pub mod http;
pub mod redis;

pub use self::http::HttpSink;
pub use self::redis::RedisTimeSeriesSink;

use super::Sink;
use crate::cache::WindowData;
use crate::error::AppResult;
use crate::sample::Structure;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

/// Sink that emits each window as a structured log event.
#[derive(Debug, Clone)]
pub struct LogSink {
    name: String,
}

impl LogSink {
    /// Log sink labelled `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Sink for LogSink {
    fn kind(&self) -> &'static str {
        "log"
    }

    async fn connect(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn send(&mut self, data: &WindowData, schema: &Structure) -> AppResult<bool> {
        let payload = serde_json::to_string(data)?;
        tracing::info!(
            sink = %self.name,
            nodes = ?schema.keys().collect::<Vec<_>>(),
            entries = data.len(),
            %payload,
            "Window"
        );
        Ok(true)
    }

    async fn close(&mut self) {}
}

#[derive(Debug, Default)]
struct MemoryState {
    sent: Vec<(WindowData, Structure)>,
    fail_next: u32,
    connected: bool,
}

/// Sink recording every delivered window. Clones share storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Windows delivered so far, oldest first.
    pub fn sent(&self) -> Vec<(WindowData, Structure)> {
        self.state.lock().sent.clone()
    }

    /// Reject the next `count` sends.
    pub fn fail_next(&self, count: u32) {
        self.state.lock().fail_next = count;
    }

    /// Whether `connect` ran and `close` did not.
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn connect(&mut self) -> AppResult<()> {
        self.state.lock().connected = true;
        Ok(())
    }

    async fn send(&mut self, data: &WindowData, schema: &Structure) -> AppResult<bool> {
        let mut state = self.state.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Ok(false);
        }
        state.sent.push((data.clone(), schema.clone()));
        Ok(true)
    }

    async fn close(&mut self) {
        self.state.lock().connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{Fields, Value};
    use std::collections::BTreeMap;
    use tracing_test::traced_test;

    fn window() -> (WindowData, Structure) {
        let mut fields = Fields::new();
        fields.insert("voltage".into(), Value::Float(12.3));
        let mut bucket = BTreeMap::new();
        bucket.insert("bat".to_string(), fields);
        let mut data = WindowData::new();
        data.insert(1000, bucket);
        let mut schema = Structure::new();
        schema.insert("bat".into(), vec!["voltage".into()]);
        (data, schema)
    }

    #[tokio::test]
    #[traced_test]
    async fn log_sink_emits_window() {
        let (data, schema) = window();
        let mut sink = LogSink::new("dry_run");
        sink.connect().await.unwrap();
        assert!(sink.send(&data, &schema).await.unwrap());
        assert!(logs_contain("dry_run"));
        assert!(logs_contain("voltage"));
    }

    #[tokio::test]
    async fn memory_sink_records_and_fails_on_demand() {
        let (data, schema) = window();
        let handle = MemorySink::new();
        let mut sink = handle.clone();
        sink.connect().await.unwrap();
        assert!(handle.is_connected());

        handle.fail_next(1);
        assert!(!sink.send(&data, &schema).await.unwrap());
        assert!(sink.send(&data, &schema).await.unwrap());
        assert_eq!(handle.sent(), vec![(data, schema)]);

        sink.close().await;
        assert!(!handle.is_connected());
    }
}

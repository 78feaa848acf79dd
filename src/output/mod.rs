//! Output side: sinks, output workers and the dispatcher loop.
//!
//! An [`OutputWorker`] describes one delivery target: which cache columns it
//! wants, how they are renamed for the sink, and how it is paced. The
//! [`OutputDispatcher`](dispatcher::OutputDispatcher) drives every worker from a
//! single loop.

pub mod dispatcher;
pub mod sinks;

pub use dispatcher::OutputDispatcher;

use crate::cache::WindowData;
use crate::error::AppResult;
use crate::sample::{Structure, TimeKey};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Delivery target of an output worker.
#[async_trait]
pub trait Sink: Send {
    /// Sink kind label (`redis`, `http`, `log`, ...).
    fn kind(&self) -> &'static str;

    /// Establish the connector. Called once at startup; failure is fatal.
    async fn connect(&mut self) -> AppResult<()>;

    /// Deliver one renamed window. `schema` lists the fields per node.
    async fn send(&mut self, data: &WindowData, schema: &Structure) -> AppResult<bool>;

    /// Release the connector. Best-effort.
    async fn close(&mut self);
}

/// Per-node field renames applied before delivery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenameMap(BTreeMap<String, Vec<(String, String)>>);

impl RenameMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `node -> {src: dst}` tables.
    pub fn from_tables(tables: &BTreeMap<String, BTreeMap<String, String>>) -> Self {
        Self(
            tables
                .iter()
                .map(|(node, pairs)| {
                    let pairs = pairs
                        .iter()
                        .map(|(src, dst)| (src.clone(), dst.clone()))
                        .collect();
                    (node.clone(), pairs)
                })
                .collect(),
        )
    }

    /// Add a rename for `node`.
    pub fn insert(&mut self, node: impl Into<String>, src: impl Into<String>, dst: impl Into<String>) {
        self.0
            .entry(node.into())
            .or_default()
            .push((src.into(), dst.into()));
    }

    /// Whether no rename is configured.
    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    /// Map reversing every rename.
    pub fn inverse(&self) -> Self {
        Self(
            self.0
                .iter()
                .map(|(node, pairs)| {
                    let pairs = pairs.iter().map(|(s, d)| (d.clone(), s.clone())).collect();
                    (node.clone(), pairs)
                })
                .collect(),
        )
    }

    /// Rename fields on every entry of `data` in place.
    ///
    /// All renames of a node are applied together, so swaps (`a->b`, `b->a`)
    /// behave as expected.
    pub fn apply(&self, data: &mut WindowData) {
        for bucket in data.values_mut() {
            for (node, fields) in bucket.iter_mut() {
                let Some(pairs) = self.0.get(node) else {
                    continue;
                };
                let moved: Vec<_> = pairs
                    .iter()
                    .filter_map(|(src, dst)| fields.remove(src).map(|v| (dst.clone(), v)))
                    .collect();
                fields.extend(moved);
            }
        }
    }

    /// Rename the field lists of a structure.
    pub fn apply_schema(&self, schema: &Structure) -> Structure {
        schema
            .iter()
            .map(|(node, columns)| {
                let renamed = match self.0.get(node) {
                    Some(pairs) => columns
                        .iter()
                        .map(|c| {
                            pairs
                                .iter()
                                .find(|(src, _)| src == c)
                                .map_or_else(|| c.clone(), |(_, dst)| dst.clone())
                        })
                        .collect(),
                    None => columns.clone(),
                };
                (node.clone(), renamed)
            })
            .collect()
    }
}

/// Configuration of one output worker.
#[derive(Debug, Clone)]
pub struct OutputSpec {
    /// Worker name
    pub name: String,
    /// Sink kind
    pub sink_kind: String,
    /// Connector name
    pub source_name: String,
    /// Consecutive time keys per delivery
    pub cache_interval: usize,
    /// Minimum seconds between two deliveries, per time key
    pub time_interval: Duration,
    /// Requested columns per node; `None` takes everything
    pub columns: Option<Structure>,
    /// Renames applied before delivery
    pub column_rename: RenameMap,
}

/// Output worker: a spec, its sink and its delivery bookmark.
pub struct OutputWorker {
    spec: OutputSpec,
    sink: Box<dyn Sink>,
    last_delivered_time_key: TimeKey,
    last_delivered_wall: Option<Instant>,
    failures: u32,
}

impl std::fmt::Debug for OutputWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputWorker")
            .field("spec", &self.spec)
            .field("sink", &self.sink.kind())
            .field("last_delivered_time_key", &self.last_delivered_time_key)
            .field("failures", &self.failures)
            .finish()
    }
}

impl OutputWorker {
    /// Bind a spec to its sink.
    pub fn new(spec: OutputSpec, sink: Box<dyn Sink>) -> Self {
        Self {
            spec,
            sink,
            last_delivered_time_key: 0,
            last_delivered_wall: None,
            failures: 0,
        }
    }

    /// Worker name.
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Worker configuration.
    pub fn spec(&self) -> &OutputSpec {
        &self.spec
    }

    /// Next `from_time` for this worker.
    pub fn bookmark(&self) -> TimeKey {
        self.last_delivered_time_key
    }

    /// Consecutive failed deliveries.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Establish the sink connector.
    pub async fn connect(&mut self) -> AppResult<()> {
        self.sink.connect().await
    }

    /// Release the sink connector.
    pub async fn close(&mut self) {
        self.sink.close().await;
    }

    /// Minimum wall time between deliveries.
    pub fn pacing(&self) -> Duration {
        self.spec
            .time_interval
            .saturating_mul(u32::try_from(self.spec.cache_interval.max(1)).unwrap_or(u32::MAX))
    }

    fn is_due(&self, now: Instant) -> bool {
        self.last_delivered_wall
            .map_or(true, |last| now.saturating_duration_since(last) >= self.pacing())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{Fields, Value};

    fn data() -> WindowData {
        let mut fields = Fields::new();
        fields.insert("V".into(), Value::Float(12.3));
        fields.insert("I".into(), Value::Float(4.5));
        let mut bucket = BTreeMap::new();
        bucket.insert("bat".to_string(), fields);
        let mut data = WindowData::new();
        data.insert(1000, bucket);
        data
    }

    #[test]
    fn rename_round_trip() {
        let mut rename = RenameMap::new();
        rename.insert("bat", "V", "voltage");
        rename.insert("bat", "I", "current");

        let original = data();
        let mut renamed = original.clone();
        rename.apply(&mut renamed);
        assert!(renamed[&1000]["bat"].contains_key("voltage"));
        assert!(!renamed[&1000]["bat"].contains_key("V"));

        rename.inverse().apply(&mut renamed);
        assert_eq!(renamed, original);
    }

    #[test]
    fn rename_swap_is_simultaneous() {
        let mut rename = RenameMap::new();
        rename.insert("bat", "V", "I");
        rename.insert("bat", "I", "V");
        let mut swapped = data();
        rename.apply(&mut swapped);
        assert_eq!(swapped[&1000]["bat"]["V"], Value::Float(4.5));
        assert_eq!(swapped[&1000]["bat"]["I"], Value::Float(12.3));
    }

    #[test]
    fn rename_schema_columns() {
        let mut rename = RenameMap::new();
        rename.insert("bat", "V", "voltage");
        let mut schema = Structure::new();
        schema.insert("bat".into(), vec!["V".into(), "SOC".into()]);
        schema.insert("mppt".into(), vec!["V".into()]);

        let renamed = rename.apply_schema(&schema);
        assert_eq!(renamed["bat"], vec!["voltage", "SOC"]);
        assert_eq!(renamed["mppt"], vec!["V"]);
    }

    #[test]
    fn pacing_saturates_on_huge_windows() {
        let spec = OutputSpec {
            name: "out".into(),
            sink_kind: "log".into(),
            source_name: String::new(),
            cache_interval: usize::MAX,
            time_interval: Duration::from_secs(1),
            columns: None,
            column_rename: RenameMap::new(),
        };
        let worker = OutputWorker::new(spec, Box::new(crate::output::sinks::LogSink::new("out")));
        assert_eq!(worker.pacing(), Duration::from_secs(u64::from(u32::MAX)));
    }
}

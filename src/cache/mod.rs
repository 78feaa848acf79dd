//! Time-keyed multi-node inputs cache.
//!
//! Input workers write samples under `(node, time_key)`; output workers read
//! windows of consecutive time keys. Two interchangeable backends implement
//! [`InputsCache`]:
//!
//! - [`MemoryInputsCache`]: process-local map behind a single mutex
//! - [`RedisInputsCache`]: one Redis hash per node, node keys listed in a set
//!
//! Both share the windowing algorithm in [`select_window`], so they answer
//! `read_window` identically for identical content.
//!
//! # Windowing
//!
//! Keys of all requested nodes are merged and walked forward from `from_time`;
//! successive unique keys whose projected bucket is non-empty are admitted until
//! `nb_items` are taken. Every node's
//! entry on an admitted key is returned. The walk advances by whichever key comes
//! next, so producers with different cadences compose. `last_time` is one past
//! the newest admitted key and is the caller's next `from_time`.
//!
//! When `interval_min` is set, a bucket is only admitted once the newest key in
//! the cache is at least `interval_min` seconds past it: a slower producer may
//! still merge fields into the newest second.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryInputsCache;
pub use self::redis::RedisInputsCache;

use crate::error::AppResult;
use crate::sample::{Fields, Structure, TimeKey, TIME_FIELDS};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};

/// Default per-node row bound.
pub const DEFAULT_MAX_ROWS: usize = 3600;

/// Time key to node to fields.
pub type WindowData = BTreeMap<TimeKey, BTreeMap<String, Fields>>;

/// Node to time key to fields.
pub type NodeEntries = BTreeMap<String, BTreeMap<TimeKey, Fields>>;

/// Result of a window query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Window {
    /// Entries ordered by time key
    pub data: WindowData,
    /// Next `from_time` for the caller; 0 when nothing was returned
    pub last_time: TimeKey,
    /// Newest returned time key; 0 when nothing was returned
    pub max_time: TimeKey,
}

impl Window {
    /// Number of time keys in the window.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the window holds no entries.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Contract shared by the cache backends.
#[async_trait]
pub trait InputsCache: Send + Sync {
    /// Backend label for logs.
    fn backend(&self) -> &'static str;

    /// Record that `node` will write entries. Idempotent.
    async fn register_node(&self, node: &str) -> AppResult<bool>;

    /// Merge `fields` into `(node, time_key)` and enforce the per-node bound.
    ///
    /// Returns false, without creating an entry, when `fields` is empty.
    async fn add(&self, time_key: TimeKey, node: &str, fields: &Fields) -> AppResult<bool>;

    /// Read up to `nb_items` time keys starting at `from_time`.
    ///
    /// `from_time = 0` reads from the earliest key, `nb_items = 0` reads all.
    async fn read_window(
        &self,
        from_time: TimeKey,
        nb_items: usize,
        structure: Option<&Structure>,
    ) -> AppResult<Window>;

    /// Sorted time keys stored for `node`.
    async fn keys_by_node(&self, node: &str) -> AppResult<Vec<TimeKey>>;

    /// Whether any node holds an entry.
    async fn has_data(&self) -> AppResult<bool>;

    /// Delete every entry. Returns the number of entries removed.
    async fn reset(&self) -> AppResult<usize>;

    /// Record the smallest producer interval in seconds.
    fn set_interval_min(&self, seconds: u64);

    /// Smallest producer interval in seconds; 0 when unset.
    fn interval_min(&self) -> u64;

    /// Per-node row bound.
    fn max_rows(&self) -> usize;
}

/// Apply the windowing rules to a snapshot of node entries.
pub fn select_window(
    nodes: &NodeEntries,
    from_time: TimeKey,
    nb_items: usize,
    structure: Option<&Structure>,
    interval_min: u64,
) -> Window {
    let selected: Vec<(&String, &BTreeMap<TimeKey, Fields>)> = nodes
        .iter()
        .filter(|(node, _)| structure.map_or(true, |s| s.contains_key(*node)))
        .collect();

    let mut keys: BTreeSet<TimeKey> = selected
        .iter()
        .flat_map(|(_, entries)| entries.range(from_time..).map(|(k, _)| *k))
        .collect();

    if nb_items > 0 && interval_min > 0 {
        let newest = selected
            .iter()
            .filter_map(|(_, entries)| entries.keys().next_back().copied())
            .max();
        if let Some(newest) = newest {
            let interval = interval_min as TimeKey;
            keys.retain(|k| k.saturating_add(interval) <= newest);
        }
    }

    let take = if nb_items == 0 { usize::MAX } else { nb_items };
    let mut data = WindowData::new();
    for key in keys {
        if data.len() >= take {
            break;
        }
        let mut bucket = BTreeMap::new();
        for (node, entries) in &selected {
            let Some(fields) = entries.get(&key) else {
                continue;
            };
            let projected = project(fields, structure.and_then(|s| s.get(*node)));
            if !projected.is_empty() {
                bucket.insert((*node).clone(), projected);
            }
        }
        if !bucket.is_empty() {
            data.insert(key, bucket);
        }
    }

    match data.keys().next_back().copied() {
        Some(max_time) => Window {
            data,
            last_time: max_time + 1,
            max_time,
        },
        None => Window::default(),
    }
}

/// Keep only `columns` of `fields`; an absent or empty column list keeps all.
///
/// The acquisition time fields follow the projected columns but never make a
/// bucket non-empty on their own.
fn project(fields: &Fields, columns: Option<&Vec<String>>) -> Fields {
    match columns {
        Some(columns) if !columns.is_empty() => {
            let mut projected: Fields = columns
                .iter()
                .filter_map(|c| fields.get(c).map(|v| (c.clone(), v.clone())))
                .collect();
            if !projected.is_empty() {
                for key in TIME_FIELDS {
                    if let Some(v) = fields.get(key) {
                        projected.insert(key.to_string(), v.clone());
                    }
                }
            }
            projected
        }
        _ => fields.clone(),
    }
}

/// Merge `fields` into an entry map and trim the oldest keys beyond `max_rows`.
///
/// Returns the evicted keys.
pub(crate) fn merge_and_trim(
    entries: &mut BTreeMap<TimeKey, Fields>,
    time_key: TimeKey,
    fields: &Fields,
    max_rows: usize,
) -> Vec<TimeKey> {
    entries
        .entry(time_key)
        .or_default()
        .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));

    let mut evicted = Vec::new();
    while entries.len() > max_rows.max(1) {
        match entries.pop_first() {
            Some((key, _)) => evicted.push(key),
            None => break,
        }
    }
    evicted
}

//! Process-local inputs cache.

use super::{merge_and_trim, select_window, InputsCache, NodeEntries, Window, DEFAULT_MAX_ROWS};
use crate::error::AppResult;
use crate::sample::{Fields, Structure, TimeKey};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-memory cache; every operation takes one short lock.
#[derive(Debug)]
pub struct MemoryInputsCache {
    nodes: Mutex<NodeEntries>,
    max_rows: usize,
    interval_min: AtomicU64,
}

impl Default for MemoryInputsCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ROWS)
    }
}

impl MemoryInputsCache {
    /// Cache keeping at most `max_rows` entries per node.
    pub fn new(max_rows: usize) -> Self {
        Self {
            nodes: Mutex::new(NodeEntries::new()),
            max_rows: max_rows.max(1),
            interval_min: AtomicU64::new(0),
        }
    }

    /// Registered node names.
    pub fn nodes(&self) -> Vec<String> {
        self.nodes.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl InputsCache for MemoryInputsCache {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn register_node(&self, node: &str) -> AppResult<bool> {
        self.nodes.lock().entry(node.to_string()).or_default();
        Ok(true)
    }

    async fn add(&self, time_key: TimeKey, node: &str, fields: &Fields) -> AppResult<bool> {
        if fields.is_empty() {
            return Ok(false);
        }
        let mut nodes = self.nodes.lock();
        let entries = nodes.entry(node.to_string()).or_default();
        let evicted = merge_and_trim(entries, time_key, fields, self.max_rows);
        if !evicted.is_empty() {
            tracing::trace!(node, count = evicted.len(), "evicted oldest cache rows");
        }
        Ok(true)
    }

    async fn read_window(
        &self,
        from_time: TimeKey,
        nb_items: usize,
        structure: Option<&Structure>,
    ) -> AppResult<Window> {
        let nodes = self.nodes.lock();
        Ok(select_window(
            &nodes,
            from_time,
            nb_items,
            structure,
            self.interval_min(),
        ))
    }

    async fn keys_by_node(&self, node: &str) -> AppResult<Vec<TimeKey>> {
        Ok(self
            .nodes
            .lock()
            .get(node)
            .map(|entries| entries.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn has_data(&self) -> AppResult<bool> {
        Ok(self.nodes.lock().values().any(|e| !e.is_empty()))
    }

    async fn reset(&self) -> AppResult<usize> {
        let mut nodes = self.nodes.lock();
        let count = nodes.values().map(|e| e.len()).sum();
        nodes.clear();
        Ok(count)
    }

    fn set_interval_min(&self, seconds: u64) {
        self.interval_min.store(seconds, Ordering::Relaxed);
    }

    fn interval_min(&self) -> u64 {
        self.interval_min.load(Ordering::Relaxed)
    }

    fn max_rows(&self) -> usize {
        self.max_rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::Value;

    fn v(x: f64) -> Fields {
        let mut f = Fields::new();
        f.insert("V".into(), Value::Float(x));
        f
    }

    #[tokio::test]
    async fn fifo_trims_strictly_oldest() {
        let cache = MemoryInputsCache::new(10);
        for k in 1..=12 {
            assert!(cache.add(k, "X", &v(k as f64)).await.unwrap());
        }
        assert_eq!(
            cache.keys_by_node("X").await.unwrap(),
            (3..=12).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn empty_fields_do_not_create_entry() {
        let cache = MemoryInputsCache::default();
        assert!(!cache.add(1, "X", &Fields::new()).await.unwrap());
        assert!(!cache.has_data().await.unwrap());
        assert!(cache.keys_by_node("X").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn same_key_merges_newest_wins() {
        let cache = MemoryInputsCache::default();
        let mut first = v(12.0);
        first.insert("I".into(), Value::Float(1.0));
        cache.add(7, "X", &first).await.unwrap();
        cache.add(7, "X", &v(13.0)).await.unwrap();

        let w = cache.read_window(0, 0, None).await.unwrap();
        let entry = &w.data[&7]["X"];
        assert_eq!(entry["V"], Value::Float(13.0));
        assert_eq!(entry["I"], Value::Float(1.0));
    }

    #[tokio::test]
    async fn reset_reports_deleted_count() {
        let cache = MemoryInputsCache::default();
        cache.register_node("X").await.unwrap();
        cache.register_node("X").await.unwrap();
        assert_eq!(cache.nodes(), vec!["X".to_string()]);
        cache.add(1, "X", &v(1.0)).await.unwrap();
        cache.add(2, "Y", &v(1.0)).await.unwrap();
        assert_eq!(cache.reset().await.unwrap(), 2);
        assert!(!cache.has_data().await.unwrap());
    }
}

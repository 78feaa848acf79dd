//! Redis-backed inputs cache.
//!
//! Layout:
//! - a set named after the cache (default `inputs_cache`) lists the node keys
//! - each node lives in a hash `<prefix><node>` (default prefix `ric_`) whose
//!   fields are time keys in decimal and whose values are JSON field maps
//!
//! Commands are not wrapped in transactions. `HSET`, `HDEL` and `SADD` are atomic
//! server-side; trimming runs after the write and is advisory, so concurrent
//! writers can briefly exceed `max_rows` by their own count.

use super::{select_window, InputsCache, NodeEntries, Window};
use crate::error::{AppResult, MonitorError};
use crate::sample::{Fields, Structure, TimeKey};
use ::redis::aio::MultiplexedConnection;
use ::redis::AsyncCommands;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// Default set name listing node keys.
pub const DEFAULT_CACHE_NAME: &str = "inputs_cache";
/// Default node key prefix.
pub const DEFAULT_PREFIX: &str = "ric_";

/// Inputs cache stored in Redis hashes.
#[derive(Clone)]
pub struct RedisInputsCache {
    conn: MultiplexedConnection,
    name: String,
    prefix: String,
    max_rows: usize,
    interval_min: std::sync::Arc<AtomicU64>,
}

impl std::fmt::Debug for RedisInputsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisInputsCache")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .field("max_rows", &self.max_rows)
            .finish()
    }
}

impl RedisInputsCache {
    /// Connect to `url` and check the server answers.
    pub async fn connect(
        url: &str,
        name: impl Into<String>,
        prefix: impl Into<String>,
        max_rows: usize,
    ) -> AppResult<Self> {
        let client = ::redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;

        let name = name.into();
        tracing::info!(cache = %name, "Connected Redis inputs cache");
        Ok(Self {
            conn,
            name,
            prefix: prefix.into(),
            max_rows: max_rows.max(1),
            interval_min: Default::default(),
        })
    }

    /// Storage key of `node`.
    pub fn node_key(&self, node: &str) -> String {
        format!("{}{}", self.prefix, node)
    }

    /// External node name of a storage key, if it carries this cache's prefix.
    pub fn node_name<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str())
    }

    async fn node_keys(&self) -> AppResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut members: Vec<String> = conn.smembers(&self.name).await?;
        members.sort();
        Ok(members)
    }

    async fn load_node(&self, key: &str) -> AppResult<BTreeMap<TimeKey, Fields>> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = conn.hgetall(key).await?;
        let mut entries = BTreeMap::new();
        for (field, json) in raw {
            let Ok(time_key) = field.parse::<TimeKey>() else {
                tracing::debug!(key, field = %field, "skipping non-numeric cache key");
                continue;
            };
            match serde_json::from_str::<Fields>(&json) {
                Ok(fields) => {
                    entries.insert(time_key, fields);
                }
                Err(e) => tracing::debug!(key, time_key, error = %e, "skipping undecodable cache entry"),
            }
        }
        Ok(entries)
    }

    async fn trim(&self, key: &str) -> AppResult<usize> {
        let mut conn = self.conn.clone();
        let fields: Vec<String> = conn.hkeys(key).await?;
        let evict = keys_to_evict(&fields, self.max_rows);
        if evict.is_empty() {
            return Ok(0);
        }
        let removed: usize = conn.hdel(key, &evict).await?;
        tracing::trace!(key, removed, "trimmed Redis cache rows");
        Ok(removed)
    }
}

/// Hash fields to delete so at most `max_rows` numeric keys remain.
///
/// Non-numeric keys always go first; then the numerically oldest.
pub fn keys_to_evict(fields: &[String], max_rows: usize) -> Vec<String> {
    let mut numeric: Vec<(TimeKey, &String)> = Vec::new();
    let mut evict: Vec<String> = Vec::new();
    for field in fields {
        match field.parse::<TimeKey>() {
            Ok(k) => numeric.push((k, field)),
            Err(_) => evict.push(field.clone()),
        }
    }

    if numeric.len() > max_rows {
        numeric.sort_by_key(|(k, _)| *k);
        let excess = numeric.len() - max_rows;
        evict.extend(numeric.into_iter().take(excess).map(|(_, f)| f.clone()));
    }
    evict
}

#[async_trait]
impl InputsCache for RedisInputsCache {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn register_node(&self, node: &str) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.sadd(&self.name, self.node_key(node)).await?;
        Ok(true)
    }

    async fn add(&self, time_key: TimeKey, node: &str, fields: &Fields) -> AppResult<bool> {
        if fields.is_empty() {
            return Ok(false);
        }
        let key = self.node_key(node);
        let field = time_key.to_string();
        let mut conn = self.conn.clone();

        let existing: Option<String> = conn.hget(&key, &field).await?;
        let mut merged = match existing {
            Some(json) => serde_json::from_str::<Fields>(&json).unwrap_or_else(|e| {
                tracing::debug!(key = %key, time_key, error = %e, "replacing undecodable entry");
                Fields::new()
            }),
            None => Fields::new(),
        };
        merged.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));

        let json = serde_json::to_string(&merged)?;
        let _: i64 = conn.hset(&key, &field, json).await?;
        let _: i64 = conn.sadd(&self.name, &key).await?;
        self.trim(&key).await?;
        Ok(true)
    }

    async fn read_window(
        &self,
        from_time: TimeKey,
        nb_items: usize,
        structure: Option<&Structure>,
    ) -> AppResult<Window> {
        let mut nodes = NodeEntries::new();
        for key in self.node_keys().await? {
            let Some(node) = self.node_name(&key) else {
                continue;
            };
            if structure.is_some_and(|s| !s.contains_key(node)) {
                continue;
            }
            let node = node.to_string();
            nodes.insert(node, self.load_node(&key).await?);
        }
        Ok(select_window(
            &nodes,
            from_time,
            nb_items,
            structure,
            self.interval_min(),
        ))
    }

    async fn keys_by_node(&self, node: &str) -> AppResult<Vec<TimeKey>> {
        let mut conn = self.conn.clone();
        let fields: Vec<String> = conn.hkeys(self.node_key(node)).await?;
        let mut keys: Vec<TimeKey> = fields.iter().filter_map(|f| f.parse().ok()).collect();
        keys.sort_unstable();
        Ok(keys)
    }

    async fn has_data(&self) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        for key in self.node_keys().await? {
            let len: usize = conn.hlen(&key).await?;
            if len > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn reset(&self) -> AppResult<usize> {
        let mut conn = self.conn.clone();
        let mut count = 0usize;
        for key in self.node_keys().await? {
            let len: usize = conn.hlen(&key).await?;
            count += len;
            let _: i64 = conn.del(&key).await?;
        }
        let _: i64 = conn.del(&self.name).await?;
        tracing::info!(cache = %self.name, count, "Reset Redis inputs cache");
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

/// Check a JSON cache value decodes to a field map.
pub fn decode_entry(json: &str) -> AppResult<Fields> {
    serde_json::from_str(json).map_err(MonitorError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn evicts_invalid_keys_first_then_oldest() {
        let fields = strings(&["12", "3", "bogus", "10", "11", "4"]);
        let evict = keys_to_evict(&fields, 3);
        assert_eq!(evict, strings(&["bogus", "3", "4"]));
    }

    #[test]
    fn nothing_to_evict_within_bound() {
        let fields = strings(&["1", "2"]);
        assert!(keys_to_evict(&fields, 2).is_empty());
    }

    #[test]
    fn numeric_sort_not_lexical() {
        let fields = strings(&["9", "10", "100"]);
        assert_eq!(keys_to_evict(&fields, 2), strings(&["9"]));
    }

    #[test]
    fn decodes_stored_entry() {
        let fields = decode_entry(r#"{"V": 12.3, "CS": 3}"#).unwrap();
        assert_eq!(fields.len(), 2);
        assert!(decode_entry("not json").is_err());
    }
}

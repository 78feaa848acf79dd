//! Redis time-series sink.
//!
//! Stores delivered windows with the inputs cache layout under its own
//! namespace: node hashes prefixed `n_`, listed in a set named by the caller.
//! Retention is bounded by `max_rows` per node, like the cache.

use crate::cache::{InputsCache, RedisInputsCache, WindowData};
use crate::error::{AppResult, MonitorError};
use crate::output::Sink;
use crate::sample::Structure;
use async_trait::async_trait;

/// Node key prefix of the time-series namespace.
pub const SERIES_PREFIX: &str = "n_";

/// Sink writing windows into a Redis time-series namespace.
#[derive(Debug)]
pub struct RedisTimeSeriesSink {
    name: String,
    url: String,
    set_name: String,
    max_rows: usize,
    store: Option<RedisInputsCache>,
}

impl RedisTimeSeriesSink {
    /// Sink writing into set `set_name` on the server at `url`.
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        set_name: impl Into<String>,
        max_rows: usize,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            set_name: set_name.into(),
            max_rows,
            store: None,
        }
    }
}

#[async_trait]
impl Sink for RedisTimeSeriesSink {
    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn connect(&mut self) -> AppResult<()> {
        let store =
            RedisInputsCache::connect(&self.url, &self.set_name, SERIES_PREFIX, self.max_rows).await?;
        self.store = Some(store);
        Ok(())
    }

    async fn send(&mut self, data: &WindowData, schema: &Structure) -> AppResult<bool> {
        let Some(store) = &self.store else {
            return Err(MonitorError::Sink {
                sink: self.name.clone(),
                message: "not connected".into(),
            });
        };
        for node in schema.keys() {
            store.register_node(node).await?;
        }
        let mut written = 0usize;
        for (time_key, bucket) in data {
            for (node, fields) in bucket {
                if store.add(*time_key, node, fields).await? {
                    written += 1;
                }
            }
        }
        tracing::trace!(sink = %self.name, written, "Wrote time-series rows");
        Ok(true)
    }

    async fn close(&mut self) {
        self.store = None;
    }
}

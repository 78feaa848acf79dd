//! Input workers: one per node, ticked by the scheduler.
//!
//! A tick turns one device reading into one cache entry:
//!
//! 1. reuse the session's last reading when it is fresher than `cache_window`,
//!    otherwise read the device on a blocking thread
//! 2. validate and rescale with [`check_all`](crate::checker::check_all)
//! 3. keep the requested columns and write under `floor(time)`
//!
//! Per-sample failures are logged and the sample is dropped; the next tick
//! starts fresh. A lost Redis cache is reported on the fatal channel instead.

use crate::acquisition::{RawReading, SerialSession};
use crate::cache::InputsCache;
use crate::checker::{check_all, Schema};
use crate::error::{AppResult, FatalSender, MonitorError};
use crate::sample::{now_secs, Fields, Sample, TimeKey, Value};
use crate::scheduler::TickHandler;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Static configuration of one input worker.
#[derive(Debug, Clone)]
pub struct InputSpec {
    /// Node name; also the session lock owner id
    pub node: String,
    /// Tick period
    pub interval: Duration,
    /// Max age of a shared reading that may be reused, in seconds
    pub cache_window: f64,
    /// Per-read device timeout
    pub timeout: Duration,
    /// Fields to keep; empty keeps every checked field. `time` and
    /// `time_ref` are always kept.
    pub columns: Vec<String>,
}

impl InputSpec {
    /// Spec with the default reuse window (half the interval).
    pub fn new(node: impl Into<String>, interval: Duration) -> Self {
        Self {
            node: node.into(),
            interval,
            cache_window: interval.as_secs_f64() / 2.0,
            timeout: Duration::from_secs(2),
            columns: Vec::new(),
        }
    }
}

/// Acquisition worker for one node.
pub struct InputWorker {
    spec: InputSpec,
    session: Arc<SerialSession>,
    schema: Arc<Schema>,
    overrides: Schema,
    cache: Arc<dyn InputsCache>,
    fatal: Option<FatalSender>,
}

impl InputWorker {
    /// Worker for `spec`, reading through `session` and writing to `cache`.
    pub fn new(
        spec: InputSpec,
        session: Arc<SerialSession>,
        schema: Arc<Schema>,
        overrides: Schema,
        cache: Arc<dyn InputsCache>,
    ) -> Self {
        Self {
            spec,
            session,
            schema,
            overrides,
            cache,
            fatal: None,
        }
    }

    /// Report errors that must stop the monitor on `fatal`.
    pub fn with_fatal(mut self, fatal: FatalSender) -> Self {
        self.fatal = Some(fatal);
        self
    }

    /// Node name.
    pub fn node(&self) -> &str {
        &self.spec.node
    }

    /// Static configuration.
    pub fn spec(&self) -> &InputSpec {
        &self.spec
    }

    /// Shared session this worker reads from.
    pub fn session(&self) -> &Arc<SerialSession> {
        &self.session
    }

    /// Acquire, check and store one sample. Returns the stored time key, or
    /// `None` when nothing was written.
    pub async fn acquire(&self) -> AppResult<Option<TimeKey>> {
        let reading = self.reading().await?;
        let sample = self.normalize(&reading)?;
        if sample.fields.is_empty() {
            tracing::debug!(node = %self.spec.node, "No usable field in reading");
            return Ok(None);
        }

        let time_key = sample.time_key();
        let entry = sample.into_entry();
        let stored = self.cache.add(time_key, &self.spec.node, &entry).await?;
        Ok(stored.then_some(time_key))
    }

    async fn reading(&self) -> AppResult<RawReading> {
        if self.session.is_cache_fresh(now_secs(), self.spec.cache_window) {
            if let Some(reading) = self.session.last_reading() {
                tracing::trace!(node = %self.spec.node, "Reusing shared reading");
                return Ok(reading);
            }
        }

        let session = Arc::clone(&self.session);
        let node = self.spec.node.clone();
        let timeout = self.spec.timeout;
        tokio::task::spawn_blocking(move || read_locked(&session, &node, timeout))
            .await
            .map_err(|e| MonitorError::Device(format!("read task failed: {e}")))?
    }

    fn normalize(&self, reading: &RawReading) -> AppResult<Sample> {
        let raw: Fields = reading
            .packet
            .iter()
            .map(|(k, v)| (k.clone(), Value::Str(v.clone())))
            .collect();
        let mut fields = check_all(&raw, &self.schema, &self.overrides)?;
        if !self.spec.columns.is_empty() {
            fields.retain(|name, _| self.spec.columns.contains(name));
        }
        Ok(Sample::new(reading.time, fields))
    }
}

/// Read under the session's cooperative lock.
///
/// The lock is released unless the read left the session disconnected: in that
/// case this node owns the reconnect and later callers see the session busy.
fn read_locked(session: &SerialSession, node: &str, timeout: Duration) -> AppResult<RawReading> {
    if !session.lock(node) {
        return Err(MonitorError::SessionBusy {
            port: session.name().to_string(),
            holder: session.lock_holder().unwrap_or_default(),
        });
    }
    let result = session.read(node, timeout);
    if session.is_connected() {
        session.unlock();
    }
    result
}

#[async_trait]
impl TickHandler for InputWorker {
    async fn tick(&self) {
        match self.acquire().await {
            Ok(Some(time_key)) => {
                tracing::trace!(node = %self.spec.node, time_key, "Stored sample");
            }
            Ok(None) => {}
            Err(e) if e.is_recoverable() => {
                tracing::debug!(node = %self.spec.node, error = %e, "Sample dropped");
            }
            Err(e) if e.is_fatal() => {
                tracing::error!(node = %self.spec.node, error = %e, "Inputs cache lost");
                if let Some(fatal) = &self.fatal {
                    let _ = fatal.send(e);
                }
            }
            Err(e) => {
                tracing::warn!(node = %self.spec.node, error = %e, "Input tick failed");
            }
        }
    }
}

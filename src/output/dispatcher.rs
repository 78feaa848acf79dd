//! Output dispatcher loop.
//!
//! A sink that refuses or errors only fails its own visit; the same window is
//! retried on the next one. A cache that can no longer be read is reported on
//! the fatal channel.

use super::{OutputWorker, RenameMap};
use crate::cache::{InputsCache, Window, WindowData};
use crate::error::{FatalSender, MonitorError};
use crate::sample::Structure;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Default pause between dispatcher iterations.
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(100);

/// Outcome of one worker visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Pacing interval not elapsed
    NotDue,
    /// Fewer than `cache_interval` complete entries available
    Partial,
    /// Window delivered, bookmark advanced
    Sent,
    /// Sink refused or errored; bookmark unchanged
    Failed,
}

/// Drives every output worker from a single loop.
pub struct OutputDispatcher {
    cache: Arc<dyn InputsCache>,
    workers: Vec<OutputWorker>,
    period: Duration,
    fatal: Option<FatalSender>,
}

/// Failure of one visit, by the stage it happened in.
enum VisitError {
    Cache(MonitorError),
    Sink(MonitorError),
}

impl OutputDispatcher {
    /// Dispatcher over `cache` pausing `period` between iterations.
    pub fn new(cache: Arc<dyn InputsCache>, period: Duration) -> Self {
        Self {
            cache,
            workers: Vec::new(),
            period,
            fatal: None,
        }
    }

    /// Report cache read failures on `fatal`.
    pub fn with_fatal(mut self, fatal: FatalSender) -> Self {
        self.fatal = Some(fatal);
        self
    }

    /// Register an output worker.
    pub fn push(&mut self, worker: OutputWorker) {
        self.workers.push(worker);
    }

    /// Registered workers.
    pub fn workers(&self) -> &[OutputWorker] {
        &self.workers
    }

    /// Mutable access for connect/close sweeps.
    pub fn workers_mut(&mut self) -> &mut [OutputWorker] {
        &mut self.workers
    }

    /// Visit every worker once at the current instant.
    pub async fn run_once(&mut self) -> Vec<Delivery> {
        self.run_once_at(Instant::now()).await
    }

    /// Visit every worker once as if the clock read `now`.
    pub async fn run_once_at(&mut self, now: Instant) -> Vec<Delivery> {
        let mut outcomes = Vec::with_capacity(self.workers.len());
        for worker in &mut self.workers {
            let outcome = match visit(self.cache.as_ref(), worker, now).await {
                Ok(outcome) => outcome,
                Err(VisitError::Cache(e)) => {
                    tracing::error!(output = %worker.spec.name, error = %e, "Inputs cache unreadable");
                    if let Some(fatal) = &self.fatal {
                        let _ = fatal.send(e);
                    }
                    Delivery::Failed
                }
                Err(VisitError::Sink(e)) => {
                    worker.failures += 1;
                    tracing::warn!(
                        output = %worker.spec.name,
                        failures = worker.failures,
                        error = %e,
                        "Output delivery failed"
                    );
                    Delivery::Failed
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Loop until `shutdown` flips to true.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(outputs = self.workers.len(), "Output dispatcher started");
        while !*shutdown.borrow() {
            self.run_once().await;
            tokio::select! {
                _ = tokio::time::sleep(self.period) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Output dispatcher stopped");
    }

    /// Close every sink. Best-effort.
    pub async fn close_all(&mut self) {
        for worker in &mut self.workers {
            worker.close().await;
            tracing::debug!(output = %worker.spec.name, "Closed output");
        }
    }
}

async fn visit(
    cache: &dyn InputsCache,
    worker: &mut OutputWorker,
    now: Instant,
) -> Result<Delivery, VisitError> {
    if !worker.is_due(now) {
        return Ok(Delivery::NotDue);
    }

    let spec = &worker.spec;
    let window: Window = cache
        .read_window(
            worker.last_delivered_time_key,
            spec.cache_interval,
            spec.columns.as_ref(),
        )
        .await
        .map_err(VisitError::Cache)?;
    if window.len() != spec.cache_interval {
        return Ok(Delivery::Partial);
    }

    let mut data = window.data;
    spec.column_rename.apply(&mut data);
    let schema = match &spec.columns {
        Some(columns) => requested_schema(columns, &spec.column_rename, &data),
        None => schema_of(&data),
    };

    if !worker.sink.send(&data, &schema).await.map_err(VisitError::Sink)? {
        worker.failures += 1;
        tracing::warn!(
            output = %spec.name,
            sink = worker.sink.kind(),
            failures = worker.failures,
            "Sink rejected window"
        );
        return Ok(Delivery::Failed);
    }

    worker.last_delivered_time_key = worker.last_delivered_time_key.max(window.last_time);
    worker.last_delivered_wall = Some(now);
    worker.failures = 0;
    tracing::debug!(
        output = %spec.name,
        from = data.keys().next().copied().unwrap_or_default(),
        to = window.max_time,
        "Delivered window"
    );
    Ok(Delivery::Sent)
}

/// Field lists actually present, per node, after renaming.
fn schema_of(data: &WindowData) -> Structure {
    let mut schema = Structure::new();
    for bucket in data.values() {
        for (node, fields) in bucket {
            let columns = schema.entry(node.clone()).or_default();
            for name in fields.keys() {
                if !columns.contains(name) {
                    columns.push(name.clone());
                }
            }
        }
    }
    schema
}

/// Renamed requested columns; nodes requesting every field report what `data` holds.
fn requested_schema(columns: &Structure, rename: &RenameMap, data: &WindowData) -> Structure {
    let found = schema_of(data);
    let mut schema = rename.apply_schema(columns);
    for (node, cols) in schema.iter_mut() {
        if cols.is_empty() {
            *cols = found.get(node).cloned().unwrap_or_default();
        }
    }
    schema
}

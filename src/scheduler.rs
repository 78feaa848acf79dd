//! Fixed-interval workers driving input acquisition.
//!
//! Each worker runs in its own tokio task:
//!
//! 1. record `start`
//! 2. run the tick body under the scheduler's shared serialization lock
//! 3. sleep `max(0, interval - elapsed)`
//!
//! The shared lock serializes every tick body in the process (device reads,
//! reconnects and cache writes never interleave). It is never held across the
//! sleep. `start_all` first waits for the next wall-clock multiple of
//! `align_seconds` so every worker shares one phase.
//!
//! Cancellation is cooperative: `cancel_all` raises a stop signal that wakes
//! sleeping workers and is checked between ticks. A tick body already running
//! completes before its worker exits.
//!
//! # Example
//!
//! ```no_run
//! use solar_monitor::scheduler::{Scheduler, SchedulerConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn demo() -> solar_monitor::error::AppResult<()> {
//! let scheduler = Scheduler::new(SchedulerConfig::default());
//! scheduler.add("bat", Duration::from_secs(1), Arc::new(|| async {
//!     tracing::info!("tick");
//! }))?;
//! scheduler.start_all().await;
//! scheduler.cancel_all().await;
//! # Ok(())
//! # }
//! ```

use crate::error::{AppResult, MonitorError};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Default ceiling on registered workers.
pub const DEFAULT_MAX_WORKERS: usize = 10;
/// Default start-up phase alignment.
pub const DEFAULT_ALIGN_SECONDS: u64 = 10;

/// Body of one scheduled tick.
#[async_trait]
pub trait TickHandler: Send + Sync {
    /// Run one tick.
    async fn tick(&self);
}

#[async_trait]
impl<F, Fut> TickHandler for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn tick(&self) {
        (self)().await
    }
}

/// Scheduler limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of workers
    pub max_workers: usize,
    /// Start-up phase alignment in seconds; 0 disables it
    pub align_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            align_seconds: DEFAULT_ALIGN_SECONDS,
        }
    }
}

/// Registered periodic worker.
#[derive(Clone)]
struct ScheduledWorker {
    interval: Duration,
    handler: Arc<dyn TickHandler>,
    last_execution: Arc<Mutex<Option<Instant>>>,
    ticks: Arc<AtomicU64>,
}

/// Periodic worker pool with one shared serialization lock.
pub struct Scheduler {
    config: SchedulerConfig,
    workers: Mutex<BTreeMap<String, ScheduledWorker>>,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
    serial_lock: Arc<tokio::sync::Mutex<()>>,
    stop: watch::Sender<bool>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("workers", &self.workers.lock().keys().collect::<Vec<_>>())
            .field("active", &self.count_active())
            .finish()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl Scheduler {
    /// Create an idle scheduler.
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            workers: Mutex::new(BTreeMap::new()),
            handles: Mutex::new(Vec::new()),
            serial_lock: Arc::new(tokio::sync::Mutex::new(())),
            stop: watch::channel(false).0,
        }
    }

    /// Register a worker under `key`.
    ///
    /// Fails when the key exists, the interval is zero, or the worker ceiling
    /// would be exceeded.
    pub fn add(
        &self,
        key: impl Into<String>,
        interval: Duration,
        handler: Arc<dyn TickHandler>,
    ) -> AppResult<()> {
        let key = key.into();
        if interval.is_zero() {
            return Err(MonitorError::Scheduler(format!(
                "worker '{key}' needs a strictly positive interval"
            )));
        }

        let mut workers = self.workers.lock();
        if workers.contains_key(&key) {
            return Err(MonitorError::Scheduler(format!("worker '{key}' already exists")));
        }
        if workers.len() + 1 > self.config.max_workers {
            return Err(MonitorError::Scheduler(format!(
                "worker limit reached ({}), cannot add '{key}'",
                self.config.max_workers
            )));
        }

        tracing::debug!(worker = %key, interval_ms = interval.as_millis() as u64, "Scheduled worker");
        workers.insert(
            key,
            ScheduledWorker {
                interval,
                handler,
                last_execution: Arc::new(Mutex::new(None)),
                ticks: Arc::new(AtomicU64::new(0)),
            },
        );
        Ok(())
    }

    /// Registered worker names.
    pub fn keys(&self) -> Vec<String> {
        self.workers.lock().keys().cloned().collect()
    }

    /// Align to the configured phase, then start every registered worker not
    /// already running.
    pub async fn start_all(&self) {
        self.stop.send_replace(false);
        if self.config.align_seconds > 0 {
            let wait = phase_delay(crate::sample::now_secs(), self.config.align_seconds);
            tracing::info!(wait_ms = wait.as_millis() as u64, "Aligning workers to phase");
            tokio::time::sleep(wait).await;
        }
        if *self.stop.borrow() {
            return;
        }

        let workers = self.workers.lock().clone();
        let mut handles = self.handles.lock();
        handles.retain(|(_, h)| !h.is_finished());
        for (name, worker) in workers {
            if handles.iter().any(|(running, _)| running == &name) {
                continue;
            }
            let handle = tokio::spawn(run_worker(
                name.clone(),
                worker,
                self.serial_lock.clone(),
                self.stop.subscribe(),
            ));
            handles.push((name, handle));
        }
        tracing::info!(count = handles.len(), "Started scheduled workers");
    }

    /// Stop every worker and wait for them to exit.
    ///
    /// Pending sleeps are cut short; a tick body in flight runs to completion.
    /// No tick body runs after this returns.
    pub async fn cancel_all(&self) {
        self.stop.send_replace(true);
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        let count = handles.len();
        let results = join_all(
            handles
                .into_iter()
                .map(|(name, handle)| async move { (name, handle.await) }),
        )
        .await;
        for (name, result) in results {
            if let Err(e) = result {
                tracing::warn!(worker = %name, error = %e, "Worker ended abnormally");
            }
        }
        tracing::info!(count, "Cancelled scheduled workers");
    }

    /// Number of running worker tasks.
    pub fn count_active(&self) -> usize {
        self.handles
            .lock()
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .count()
    }

    /// Number of completed ticks of `key`.
    pub fn tick_count(&self, key: &str) -> Option<u64> {
        self.workers
            .lock()
            .get(key)
            .map(|w| w.ticks.load(Ordering::Relaxed))
    }

    /// Monotonic start time of the last tick of `key`.
    pub fn last_execution(&self, key: &str) -> Option<Instant> {
        self.workers
            .lock()
            .get(key)
            .and_then(|w| *w.last_execution.lock())
    }
}

async fn run_worker(
    name: String,
    worker: ScheduledWorker,
    serial_lock: Arc<tokio::sync::Mutex<()>>,
    mut stop: watch::Receiver<bool>,
) {
    tracing::debug!(worker = %name, "Worker started");
    loop {
        let start = Instant::now();
        {
            let _guard = tokio::select! {
                biased;
                _ = stopped(&mut stop) => break,
                guard = serial_lock.lock() => guard,
            };
            if *stop.borrow() {
                break;
            }
            *worker.last_execution.lock() = Some(start);
            worker.handler.tick().await;
            worker.ticks.fetch_add(1, Ordering::Relaxed);
        }
        let elapsed = start.elapsed();
        if elapsed > worker.interval {
            tracing::debug!(worker = %name, elapsed_ms = elapsed.as_millis() as u64, "Tick overran its interval");
        }
        tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            _ = tokio::time::sleep(worker.interval.saturating_sub(elapsed)) => {}
        }
    }
    tracing::debug!(worker = %name, "Worker stopped");
}

/// Resolve once the stop signal is raised or the scheduler is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        let raised = *stop.borrow_and_update();
        if raised || stop.changed().await.is_err() {
            return;
        }
    }
}

/// Time until the next multiple of `align` seconds after `now`.
pub fn phase_delay(now: f64, align: u64) -> Duration {
    if align == 0 {
        return Duration::ZERO;
    }
    let align = align as f64;
    let rem = now.rem_euclid(align);
    if rem == 0.0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(align - rem)
    }
}

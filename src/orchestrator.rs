//! Wiring from configuration to running workers.
//!
//! [`Orchestrator::build`] turns a validated [`MonitorConfig`] into a cache,
//! one shared session per connector, scheduled input workers and output workers.
//! [`Orchestrator::run`] connects every output (fail-fast), starts the scheduler,
//! drives the dispatcher until the shutdown future resolves or a worker reports
//! a fatal error, then closes everything best-effort.

use crate::acquisition::{MockDevice, SerialSession, SessionConfig, SessionRegistry, VeDirectSerial};
use crate::cache::{InputsCache, MemoryInputsCache, RedisInputsCache};
use crate::checker::build_schema;
use crate::config::{AppBlock, CacheBackend, Connectors, MonitorConfig, OutputItem};
use crate::error::{AppResult, FatalSender, MonitorError};
use crate::input::{InputSpec, InputWorker};
use crate::output::sinks::{HttpSink, LogSink, RedisTimeSeriesSink};
use crate::output::{OutputDispatcher, OutputSpec, OutputWorker, RenameMap, Sink};
use crate::scheduler::Scheduler;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Lifecycle state of a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    /// Built, or connected for outputs
    Ready,
    /// Connector failed with the given cause
    Failed(String),
    /// Stopped by shutdown
    Closed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Ready => f.write_str("ready"),
            WorkerState::Failed(cause) => write!(f, "failed: {cause}"),
            WorkerState::Closed => f.write_str("closed"),
        }
    }
}

/// Status entry of one input or output worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    /// Device or sink kind
    pub kind: String,
    /// Connector name
    pub connector: String,
    /// Lifecycle state
    pub state: WorkerState,
}

/// Worker name to status.
pub type StatusMap = BTreeMap<String, WorkerStatus>;

/// Owns the cache, the sessions, the scheduler and the dispatcher.
pub struct Orchestrator {
    cache: Arc<dyn InputsCache>,
    sessions: SessionRegistry,
    scheduler: Arc<Scheduler>,
    dispatcher: OutputDispatcher,
    status: StatusMap,
    fatal_tx: FatalSender,
    fatal_rx: mpsc::UnboundedReceiver<MonitorError>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("cache", &self.cache.backend())
            .field("sessions", &self.sessions.len())
            .field("scheduler", &self.scheduler)
            .field("status", &self.status)
            .finish()
    }
}

impl Orchestrator {
    /// Validate `config` and build every worker of the selected blocks.
    pub async fn build(config: &MonitorConfig, block: Option<&str>, app: Option<&str>) -> AppResult<Self> {
        config.validate()?;
        let blocks = config.select_blocks(block, app);
        if blocks.is_empty() {
            return Err(MonitorError::ConfigInvalid(format!(
                "no app block matches block={} app={}",
                block.unwrap_or("*"),
                app.unwrap_or("*")
            )));
        }

        let cache = build_cache(config).await;
        let schema = Arc::new(config.schema()?);
        let scheduler = Arc::new(Scheduler::new(config.scheduler.clone()));
        let sessions = SessionRegistry::new();
        let mut status = StatusMap::new();
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        for block in &blocks {
            for (kind, items) in &block.inputs {
                for item in items {
                    let session = sessions.get_or_open(&item.source, || {
                        open_session(kind, &item.source, &config.app_connectors)
                    })?;
                    cache.register_node(&item.name).await?;

                    let interval = seconds(item.time_interval, Duration::from_secs(1));
                    let mut spec = InputSpec::new(&item.name, interval);
                    if let Some(window) = item.cache_window {
                        spec.cache_window = window;
                    }
                    spec.timeout = session.config().read_timeout;
                    spec.columns = item.columns.clone();

                    let worker = InputWorker::new(
                        spec,
                        Arc::clone(&session),
                        Arc::clone(&schema),
                        build_schema(&item.points)?,
                        Arc::clone(&cache),
                    )
                    .with_fatal(fatal_tx.clone());
                    scheduler.add(&item.name, interval, Arc::new(worker))?;
                    status.insert(
                        item.name.clone(),
                        WorkerStatus {
                            kind: kind.clone(),
                            connector: item.source.clone(),
                            state: WorkerState::Ready,
                        },
                    );
                }
            }
        }
        cache.set_interval_min(MonitorConfig::interval_min(&blocks));

        let period = Duration::from_millis(config.dispatcher.period_ms.max(1));
        let mut dispatcher =
            OutputDispatcher::new(Arc::clone(&cache), period).with_fatal(fatal_tx.clone());
        for block in &blocks {
            for (kind, items) in &block.outputs {
                for item in items {
                    let sink = build_sink(kind, item, &config.app_connectors)?;
                    dispatcher.push(OutputWorker::new(output_spec(kind, item), sink));
                    status.insert(
                        item.name.clone(),
                        WorkerStatus {
                            kind: kind.clone(),
                            connector: item.source.clone().unwrap_or_default(),
                            state: WorkerState::Ready,
                        },
                    );
                }
            }
        }

        tracing::info!(
            cache = cache.backend(),
            inputs = scheduler.keys().len(),
            outputs = dispatcher.workers().len(),
            sessions = sessions.len(),
            "Monitor built"
        );
        Ok(Self {
            cache,
            sessions,
            scheduler,
            dispatcher,
            status,
            fatal_tx,
            fatal_rx,
        })
    }

    /// Shared inputs cache.
    pub fn cache(&self) -> Arc<dyn InputsCache> {
        Arc::clone(&self.cache)
    }

    /// Input scheduler.
    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.scheduler)
    }

    /// Current worker status map.
    pub fn status(&self) -> &StatusMap {
        &self.status
    }

    /// Establish every output connector.
    ///
    /// Any failure cancels the scheduler, logs the full status map and returns
    /// [`MonitorError::Worker`] for the first failed output.
    pub async fn connect_outputs(&mut self) -> AppResult<()> {
        let mut first_failure = None;
        for worker in self.dispatcher.workers_mut() {
            if let Err(e) = worker.connect().await {
                let name = worker.name().to_string();
                if let Some(entry) = self.status.get_mut(&name) {
                    entry.state = WorkerState::Failed(e.to_string());
                }
                first_failure.get_or_insert((name, worker.spec().source_name.clone(), e.to_string()));
            }
        }

        let Some((worker, connector, cause)) = first_failure else {
            return Ok(());
        };
        self.scheduler.cancel_all().await;
        for (name, entry) in &self.status {
            tracing::error!(
                worker = %name,
                kind = %entry.kind,
                connector = %entry.connector,
                state = %entry.state,
                "Worker status"
            );
        }
        Err(MonitorError::Worker {
            worker,
            connector,
            cause,
        })
    }

    /// Sender on which workers report errors that stop the monitor.
    pub fn fatal_sender(&self) -> FatalSender {
        self.fatal_tx.clone()
    }

    /// Run until `shutdown` resolves, then stop and close every worker.
    ///
    /// A fatal error reported by a worker stops the monitor the same way and is
    /// returned.
    pub async fn run<F>(mut self, shutdown: F) -> AppResult<StatusMap>
    where
        F: Future<Output = ()>,
    {
        self.connect_outputs().await?;

        let scheduler = Arc::clone(&self.scheduler);
        let starter = tokio::spawn(async move { scheduler.start_all().await });

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut failure = None;
        {
            let dispatch = self.dispatcher.run(stop_rx);
            tokio::pin!(dispatch);
            tokio::pin!(shutdown);
            tokio::select! {
                _ = &mut dispatch => {}
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    // the receiver lives in `dispatch`, so the send cannot fail
                    let _ = stop_tx.send(true);
                    dispatch.await;
                }
                Some(e) = self.fatal_rx.recv() => {
                    tracing::error!(error = %e, "Stopping on fatal error");
                    let _ = stop_tx.send(true);
                    dispatch.await;
                    failure = Some(e);
                }
            }
        }

        starter.abort();
        let _ = starter.await;
        self.shutdown().await;
        match failure {
            Some(e) => Err(e),
            None => Ok(self.status),
        }
    }

    async fn shutdown(&mut self) {
        self.scheduler.cancel_all().await;
        self.dispatcher.close_all().await;
        self.sessions.close_all();
        for entry in self.status.values_mut() {
            entry.state = WorkerState::Closed;
        }
        tracing::info!(workers = self.status.len(), "Monitor stopped");
    }
}

/// Build the configured cache; a Redis cache that cannot connect falls back to
/// memory.
async fn build_cache(config: &MonitorConfig) -> Arc<dyn InputsCache> {
    let settings = &config.cache;
    if settings.backend == CacheBackend::Redis {
        let connector = settings
            .connector
            .as_ref()
            .and_then(|name| config.app_connectors.redis.get(name));
        if let Some(connector) = connector {
            match RedisInputsCache::connect(
                &connector.url(),
                &settings.name,
                &settings.prefix,
                settings.max_rows,
            )
            .await
            {
                Ok(cache) => return Arc::new(cache),
                Err(e) => tracing::warn!(
                    error = %e,
                    "Redis cache unavailable, falling back to memory"
                ),
            }
        }
    }
    Arc::new(MemoryInputsCache::new(settings.max_rows))
}

fn open_session(kind: &str, source: &str, connectors: &Connectors) -> AppResult<SerialSession> {
    let unknown = || MonitorError::ConfigInvalid(format!("unknown {kind} connector '{source}'"));
    match kind {
        "vedirect" => {
            let conf = connectors.vedirect.get(source).ok_or_else(unknown)?;
            let device = VeDirectSerial::new(&conf.serial_port, conf.baud);
            let session_config = SessionConfig {
                packets_per_batch: conf.packets_per_batch.max(1),
                max_read_errors: conf.max_read_errors.max(1),
                read_timeout: seconds(conf.timeout, SessionConfig::default().read_timeout),
            };
            Ok(SerialSession::new(source, Box::new(device), session_config))
        }
        "mock" => {
            let conf = connectors.mock.get(source).ok_or_else(unknown)?;
            let session_config = SessionConfig {
                packets_per_batch: conf.packets_per_batch.max(1),
                ..SessionConfig::default()
            };
            let device = MockDevice::battery_monitor(&conf.port);
            Ok(SerialSession::new(source, Box::new(device), session_config))
        }
        other => Err(MonitorError::ConfigInvalid(format!("unknown input kind '{other}'"))),
    }
}

fn build_sink(kind: &str, item: &OutputItem, connectors: &Connectors) -> AppResult<Box<dyn Sink>> {
    let source = item.source.as_deref().unwrap_or_default();
    let unknown = || MonitorError::ConfigInvalid(format!("unknown {kind} connector '{source}'"));
    match kind {
        "redis" => {
            let conf = connectors.redis.get(source).ok_or_else(unknown)?;
            let set_name = item.set_name.clone().unwrap_or_else(|| item.name.clone());
            Ok(Box::new(RedisTimeSeriesSink::new(
                &item.name,
                conf.url(),
                set_name,
                conf.max_rows,
            )))
        }
        "http" => {
            let conf = connectors.http.get(source).ok_or_else(unknown)?;
            let timeout = seconds(conf.timeout, crate::output::sinks::http::DEFAULT_TIMEOUT);
            Ok(Box::new(
                HttpSink::new(&item.name, &conf.url, timeout).with_headers(conf.headers.clone()),
            ))
        }
        "log" => Ok(Box::new(LogSink::new(&item.name))),
        other => Err(MonitorError::ConfigInvalid(format!("unknown output kind '{other}'"))),
    }
}

fn output_spec(kind: &str, item: &OutputItem) -> OutputSpec {
    OutputSpec {
        name: item.name.clone(),
        sink_kind: kind.to_string(),
        source_name: item.source.clone().unwrap_or_default(),
        cache_interval: item.cache_interval.max(1),
        time_interval: seconds(item.time_interval, Duration::ZERO),
        columns: item.columns.clone(),
        column_rename: RenameMap::from_tables(&item.ref_cols),
    }
}

fn seconds(value: f64, fallback: Duration) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(fallback)
}

/// Blocks selected for a run; exposed for status reporting in the binary.
pub fn describe_blocks(blocks: &[&AppBlock]) -> String {
    blocks
        .iter()
        .map(|b| format!("{}:{}", b.app, b.name))
        .collect::<Vec<_>>()
        .join(", ")
}

//! Monitor configuration loaded with Figment.
//!
//! Configuration is layered:
//! 1. a YAML file (`config/solar_monitor.yaml` by default)
//! 2. environment variables prefixed `SOLAR_MONITOR_`, nested keys split on `__`
//!
//! The file declares connectors (`app_connectors`), the typed point table
//! (`data_structures.points`) and app blocks wiring inputs and outputs to
//! connectors by name. [`MonitorConfig::validate`] checks the cross references
//! before anything is started.
//!
//! # Example
//! ```no_run
//! use solar_monitor::config::MonitorConfig;
//!
//! let config = MonitorConfig::load_from("config/solar_monitor.yaml")?;
//! config.validate()?;
//! for block in config.select_blocks(None, Some("battery")) {
//!     println!("block {}", block.name);
//! }
//! # Ok::<(), solar_monitor::error::MonitorError>(())
//! ```

use crate::cache::DEFAULT_MAX_ROWS;
use crate::cache::redis::{DEFAULT_CACHE_NAME, DEFAULT_PREFIX};
use crate::checker::{build_schema, PointConfig, Schema};
use crate::error::{AppResult, MonitorError};
use crate::sample::Structure;
use crate::scheduler::SchedulerConfig;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Default configuration file.
pub const DEFAULT_CONF_PATH: &str = "config/solar_monitor.yaml";
/// Environment override prefix.
pub const ENV_PREFIX: &str = "SOLAR_MONITOR_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Blocks of inputs and outputs
    #[serde(default)]
    pub app_blocks: Vec<AppBlock>,
    /// Connectors by kind then by name
    #[serde(default)]
    pub app_connectors: Connectors,
    /// Shared point table
    #[serde(default)]
    pub data_structures: DataStructures,
    /// Inputs cache settings
    #[serde(default)]
    pub cache: CacheConfig,
    /// Input scheduler limits
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Output dispatcher settings
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

/// A named group of inputs and outputs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppBlock {
    /// Block name, selectable with `--block`
    pub name: String,
    /// Application label, selectable with `--app`
    #[serde(default)]
    pub app: String,
    /// Inputs by device kind (`vedirect`, `mock`)
    #[serde(default)]
    pub inputs: BTreeMap<String, Vec<InputItem>>,
    /// Outputs by sink kind (`redis`, `http`, `log`)
    #[serde(default)]
    pub outputs: BTreeMap<String, Vec<OutputItem>>,
    /// Free-form block arguments
    #[serde(default)]
    pub args: BTreeMap<String, serde_json::Value>,
}

/// One input declaration. `name` is the cache node name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputItem {
    /// Cache node name
    pub name: String,
    /// Connector name
    pub source: String,
    /// Fields kept after checking; empty keeps all
    #[serde(default)]
    pub columns: Vec<String>,
    /// Tick period in seconds
    #[serde(default = "default_time_interval")]
    pub time_interval: f64,
    /// Reuse window of a shared reading in seconds; half the interval when unset
    #[serde(default)]
    pub cache_window: Option<f64>,
    /// Per-input descriptor overrides
    #[serde(default)]
    pub points: BTreeMap<String, PointConfig>,
}

/// One output declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputItem {
    /// Output name
    pub name: String,
    /// Connector name; `log` outputs need none
    #[serde(default)]
    pub source: Option<String>,
    /// Requested fields per node; absent takes every node
    #[serde(default)]
    pub columns: Option<Structure>,
    /// Field renames per node, `src: dst`
    #[serde(default)]
    pub ref_cols: BTreeMap<String, BTreeMap<String, String>>,
    /// Minimum seconds between two deliveries, per time key
    #[serde(default = "default_time_interval")]
    pub time_interval: f64,
    /// Consecutive time keys per delivery
    #[serde(default = "default_cache_interval")]
    pub cache_interval: usize,
    /// Redis time-series set name; the output name when unset
    #[serde(default)]
    pub set_name: Option<String>,
}

/// Connector tables by kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Connectors {
    /// VE.Direct serial ports
    #[serde(default)]
    pub vedirect: BTreeMap<String, SerialConnector>,
    /// Simulated devices
    #[serde(default)]
    pub mock: BTreeMap<String, MockConnector>,
    /// Redis servers
    #[serde(default)]
    pub redis: BTreeMap<String, RedisConnector>,
    /// HTTP endpoints
    #[serde(default)]
    pub http: BTreeMap<String, HttpConnector>,
}

impl Connectors {
    /// Whether a connector `name` exists for `kind`.
    pub fn contains(&self, kind: &str, name: &str) -> bool {
        match kind {
            "vedirect" => self.vedirect.contains_key(name),
            "mock" => self.mock.contains_key(name),
            "redis" => self.redis.contains_key(name),
            "http" => self.http.contains_key(name),
            _ => false,
        }
    }
}

/// VE.Direct serial port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConnector {
    /// Configured port; other ports are scanned when it fails
    pub serial_port: String,
    /// Baud rate
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Read timeout in seconds
    #[serde(default = "default_read_timeout")]
    pub timeout: f64,
    /// Frames merged into one reading
    #[serde(default = "default_packets_per_batch")]
    pub packets_per_batch: usize,
    /// Frame errors tolerated per reading
    #[serde(default = "default_max_read_errors")]
    pub max_read_errors: u32,
}

/// Simulated battery monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockConnector {
    /// Reported port name
    #[serde(default = "default_mock_port")]
    pub port: String,
    /// Frames merged into one reading
    #[serde(default = "default_packets_per_batch")]
    pub packets_per_batch: usize,
}

/// Redis server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConnector {
    /// Server host
    #[serde(default = "default_redis_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_redis_port")]
    pub port: u16,
    /// Database index
    #[serde(default)]
    pub db: u32,
    /// Optional password
    #[serde(default)]
    pub password: Option<String>,
    /// Rows kept per node by time-series outputs
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
}

impl RedisConnector {
    /// `redis://` URL for this connector.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}:{}/{}", password, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConnector {
    /// Endpoint receiving windows
    pub url: String,
    /// Extra request headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Request timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub timeout: f64,
}

/// Shared data structures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataStructures {
    /// Field descriptors by field name
    #[serde(default)]
    pub points: BTreeMap<String, PointConfig>,
}

/// Cache backend choice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// Process-local map
    #[default]
    Memory,
    /// Redis hashes
    Redis,
}

/// Inputs cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Backend
    #[serde(default)]
    pub backend: CacheBackend,
    /// Redis connector name, for the redis backend
    #[serde(default)]
    pub connector: Option<String>,
    /// Redis set listing node keys
    #[serde(default = "default_cache_name")]
    pub name: String,
    /// Redis node key prefix
    #[serde(default = "default_cache_prefix")]
    pub prefix: String,
    /// Rows kept per node
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            connector: None,
            name: default_cache_name(),
            prefix: default_cache_prefix(),
            max_rows: default_max_rows(),
        }
    }
}

/// Output dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Pause between iterations in milliseconds
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            period_ms: default_period_ms(),
        }
    }
}

// Default value functions
fn default_time_interval() -> f64 {
    1.0
}

fn default_cache_interval() -> usize {
    1
}

fn default_baud() -> u32 {
    crate::acquisition::vedirect::DEFAULT_BAUD
}

fn default_read_timeout() -> f64 {
    2.0
}

fn default_packets_per_batch() -> usize {
    1
}

fn default_max_read_errors() -> u32 {
    3
}

fn default_mock_port() -> String {
    "mock".to_string()
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_http_timeout() -> f64 {
    10.0
}

fn default_cache_name() -> String {
    DEFAULT_CACHE_NAME.to_string()
}

fn default_cache_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_max_rows() -> usize {
    DEFAULT_MAX_ROWS
}

fn default_period_ms() -> u64 {
    100
}

const INPUT_KINDS: [&str; 2] = ["vedirect", "mock"];
const OUTPUT_KINDS: [&str; 3] = ["redis", "http", "log"];

fn invalid(message: impl Into<String>) -> MonitorError {
    MonitorError::ConfigInvalid(message.into())
}

impl MonitorConfig {
    /// Load from `path` merged with `SOLAR_MONITOR_*` environment variables.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(invalid(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        let config = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Check cross references and value ranges.
    pub fn validate(&self) -> AppResult<()> {
        let mut blocks = HashSet::new();
        let mut nodes = HashSet::new();
        let mut outputs = HashSet::new();

        build_schema(&self.data_structures.points)?;

        for block in &self.app_blocks {
            if !blocks.insert(block.name.as_str()) {
                return Err(invalid(format!("duplicate app block '{}'", block.name)));
            }

            for (kind, items) in &block.inputs {
                if !INPUT_KINDS.contains(&kind.as_str()) {
                    return Err(invalid(format!(
                        "unknown input kind '{kind}' in block '{}'",
                        block.name
                    )));
                }
                for item in items {
                    if !nodes.insert(item.name.as_str()) {
                        return Err(invalid(format!("duplicate input name '{}'", item.name)));
                    }
                    if !self.app_connectors.contains(kind, &item.source) {
                        return Err(invalid(format!(
                            "input '{}' names unknown {kind} connector '{}'",
                            item.name, item.source
                        )));
                    }
                    if !(item.time_interval.is_finite() && item.time_interval > 0.0) {
                        return Err(invalid(format!(
                            "input '{}' needs a positive time_interval",
                            item.name
                        )));
                    }
                    if item.cache_window.is_some_and(|w| !(w.is_finite() && w >= 0.0)) {
                        return Err(invalid(format!(
                            "input '{}' has a negative cache_window",
                            item.name
                        )));
                    }
                    build_schema(&item.points)?;
                }
            }
        }

        for block in &self.app_blocks {
            for (kind, items) in &block.outputs {
                if !OUTPUT_KINDS.contains(&kind.as_str()) {
                    return Err(invalid(format!(
                        "unknown output kind '{kind}' in block '{}'",
                        block.name
                    )));
                }
                for item in items {
                    self.validate_output(kind, item, &nodes)?;
                    if !outputs.insert(item.name.as_str()) {
                        return Err(invalid(format!("duplicate output name '{}'", item.name)));
                    }
                }
            }
        }

        if self.cache.backend == CacheBackend::Redis {
            match &self.cache.connector {
                Some(name) if self.app_connectors.redis.contains_key(name) => {}
                Some(name) => {
                    return Err(invalid(format!("cache names unknown redis connector '{name}'")))
                }
                None => return Err(invalid("redis cache needs a connector")),
            }
        }
        if self.cache.max_rows == 0 {
            return Err(invalid("cache.max_rows must be at least 1"));
        }
        if self.scheduler.max_workers == 0 {
            return Err(invalid("scheduler.max_workers must be at least 1"));
        }
        if nodes.len() > self.scheduler.max_workers {
            return Err(invalid(format!(
                "{} inputs exceed scheduler.max_workers = {}",
                nodes.len(),
                self.scheduler.max_workers
            )));
        }

        Ok(())
    }

    fn validate_output(&self, kind: &str, item: &OutputItem, nodes: &HashSet<&str>) -> AppResult<()> {
        match (&item.source, kind) {
            (_, "log") => {}
            (Some(source), _) if self.app_connectors.contains(kind, source) => {}
            (Some(source), _) => {
                return Err(invalid(format!(
                    "output '{}' names unknown {kind} connector '{source}'",
                    item.name
                )))
            }
            (None, _) => return Err(invalid(format!("output '{}' needs a source", item.name))),
        }
        if item.cache_interval < 1 {
            return Err(invalid(format!(
                "output '{}' needs cache_interval >= 1",
                item.name
            )));
        }
        if !(item.time_interval.is_finite() && item.time_interval >= 0.0) {
            return Err(invalid(format!(
                "output '{}' has a negative time_interval",
                item.name
            )));
        }
        if let Some(columns) = &item.columns {
            if let Some(unknown) = columns.keys().find(|n| !nodes.contains(n.as_str())) {
                return Err(invalid(format!(
                    "output '{}' requests unknown node '{unknown}'",
                    item.name
                )));
            }
        }
        Ok(())
    }

    /// Blocks matching `block` and `app`; `None` matches everything.
    pub fn select_blocks<'a>(&'a self, block: Option<&'a str>, app: Option<&'a str>) -> Vec<&'a AppBlock> {
        self.app_blocks
            .iter()
            .filter(|b| block.map_or(true, |name| b.name == name))
            .filter(|b| app.map_or(true, |app| b.app == app))
            .collect()
    }

    /// Typed schema of the shared point table.
    pub fn schema(&self) -> AppResult<Schema> {
        build_schema(&self.data_structures.points)
    }

    /// Smallest input interval across `blocks`, rounded up to whole seconds.
    ///
    /// Sub-second inputs still write into one-second buckets, so they count
    /// as one second.
    pub fn interval_min(blocks: &[&AppBlock]) -> u64 {
        blocks
            .iter()
            .flat_map(|b| b.inputs.values().flatten())
            .map(|item| item.time_interval.ceil() as u64)
            .min()
            .unwrap_or(0)
    }
}

//! Logging setup.
//!
//! Built on `tracing` and `tracing-subscriber`:
//! - structured events with key/value fields
//! - console output as pretty, compact or JSON
//! - `RUST_LOG` overrides the configured level
//! - optional daily rolling JSON files through `tracing-appender`
//!
//! # Example
//! ```no_run
//! use solar_monitor::logging::{self, OutputFormat, TracingConfig};
//! use tracing::Level;
//!
//! # fn main() -> Result<(), String> {
//! let _guard = logging::init(
//!     TracingConfig::new(Level::DEBUG)
//!         .with_format(OutputFormat::Compact)
//!         .with_log_dir("logs"),
//! )?;
//! tracing::info!(node = "bat", "Acquisition started");
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// File name prefix of rolling log files.
pub const LOG_FILE_PREFIX: &str = "solar_monitor.log";

/// Output format of the console layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for development)
    Pretty,
    /// Compact single-line format (for services)
    Compact,
    /// JSON format for log aggregation
    Json,
}

/// Logging options.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Console format
    pub format: OutputFormat,
    /// Whether to emit span open/close events
    pub with_span_events: bool,
    /// Whether to include file and line numbers
    pub with_file_and_line: bool,
    /// Whether to include thread names
    pub with_thread_names: bool,
    /// Whether to enable ANSI colors on the console
    pub with_ansi: bool,
    /// Directory for daily rolling files; none disables file output
    pub log_dir: Option<PathBuf>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
            log_dir: None,
        }
    }
}

impl TracingConfig {
    /// Defaults at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Options from the command line flags.
    pub fn from_cli(debug: bool, log_dir: Option<PathBuf>) -> Self {
        let level = if debug { Level::DEBUG } else { Level::INFO };
        Self {
            log_dir,
            with_file_and_line: debug,
            ..Self::new(level)
        }
    }

    /// Set the console format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Emit span open/close events.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable ANSI colors on the console.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    /// Also write daily rolling JSON files into `dir`.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }
}

/// Keeps the file writer alive. Dropping it flushes pending lines.
#[derive(Debug, Default)]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber.
///
/// Idempotent: when a subscriber is already installed (tests, embedding) this
/// returns Ok and leaves it in place.
pub fn init(config: TracingConfig) -> Result<LogGuard, String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(config.level)));

    let console = console_layer(&config, std::io::stdout);
    let mut layers = vec![console];

    let mut guard = LogGuard::default();
    if let Some(dir) = &config.log_dir {
        std::fs::create_dir_all(dir)
            .map_err(|e| format!("Failed to create log directory {}: {}", dir.display(), e))?;
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        layers.push(
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(config.with_thread_names)
                .boxed(),
        );
        guard._file = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .or_else(|e| {
            // Already installed by a test harness or an earlier call
            if e.to_string().contains("a global default trace dispatcher has already been set") {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {}", e))
            }
        })?;

    Ok(guard)
}

/// Console layer for `config`, writing to `writer`.
fn console_layer<W>(config: &TracingConfig, writer: W) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = fmt::layer()
        .with_writer(writer)
        .with_span_events(span_events)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_thread_names(config.with_thread_names);
    match config.format {
        OutputFormat::Pretty => layer.pretty().with_ansi(config.with_ansi).boxed(),
        OutputFormat::Compact => layer.compact().with_ansi(config.with_ansi).boxed(),
        OutputFormat::Json => layer.json().boxed(),
    }
}

fn level_to_filter_string(level: Level) -> String {
    level.as_str().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_options() {
        let config = TracingConfig::from_cli(true, Some(PathBuf::from("logs")));
        assert_eq!(config.level, Level::DEBUG);
        assert!(config.with_file_and_line);
        assert_eq!(config.log_dir.as_deref(), Some(std::path::Path::new("logs")));

        let quiet = TracingConfig::from_cli(false, None);
        assert_eq!(quiet.level, Level::INFO);
        assert!(quiet.log_dir.is_none());
    }

    #[test]
    fn test_builder() {
        let config = TracingConfig::new(Level::WARN)
            .with_format(OutputFormat::Json)
            .with_span_events(true)
            .with_ansi(false);
        assert_eq!(config.format, OutputFormat::Json);
        assert!(config.with_span_events);
        assert!(!config.with_ansi);
    }

    #[derive(Clone, Default)]
    struct Buffer(std::sync::Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'w> MakeWriter<'w> for Buffer {
        type Writer = Buffer;

        fn make_writer(&'w self) -> Self::Writer {
            self.clone()
        }
    }

    fn compact_output(with_ansi: bool) -> String {
        let buffer = Buffer::default();
        let config = TracingConfig::new(Level::INFO).with_ansi(with_ansi);
        let subscriber = tracing_subscriber::registry().with(console_layer(&config, buffer.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(node = "bat", "Sample dropped");
        });
        let bytes = buffer.0.lock().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_compact_console_follows_ansi_option() {
        let plain = compact_output(false);
        assert!(plain.contains("Sample dropped"));
        assert!(!plain.contains('\u{1b}'));

        let colored = compact_output(true);
        assert!(colored.contains("Sample dropped"));
        assert!(colored.contains('\u{1b}'));
    }
}

//! Custom error types for the monitor.
//!
//! This module defines the primary error type, `MonitorError`, used across the
//! acquisition, cache and output layers. Using the `thiserror` crate, it provides a
//! centralized way to describe everything that can go wrong between a serial
//! device and a sink.
//!
//! ## Error Hierarchy
//!
//! Errors fall into three broad categories:
//!
//! 1. **Configuration Errors** - `ConfigInvalid`, `Config`, `DeviceDataConf`
//!    - Raised at startup while the configuration is loaded and validated
//!    - Permanent: the process exits with status 1
//!
//! 2. **Per-sample / per-batch Errors** - `InputValue`, `OutputValue`, `InputRead`,
//!    `ConnectionLost`, `SessionBusy`, `Device`
//!    - Raised inside one scheduler tick
//!    - Recovery: the sample or batch is dropped, the next tick retries
//!
//! 3. **Connector Errors** - `RedisConnection`, `Worker`, `Sink`
//!    - Fatal while starting up (fail-fast)
//!    - At runtime a sink failure is retried on the next visit, while a lost
//!      Redis cache stops the monitor (see [`MonitorError::is_fatal`])
//!
//! By using `#[from]`, `MonitorError` can be created from the underlying library
//! errors, so `?` works throughout the crate.

use thiserror::Error;

/// Convenience alias for results using the monitor error type.
pub type AppResult<T> = std::result::Result<T, MonitorError>;

/// Channel on which running workers report errors that must stop the monitor.
pub type FatalSender = tokio::sync::mpsc::UnboundedSender<MonitorError>;

/// Primary error type for the monitor.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Semantic configuration error (unknown connector, duplicate name, bad interval).
    #[error("Configuration validation error: {0}")]
    ConfigInvalid(String),

    /// Configuration file could not be parsed or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// A point descriptor is malformed.
    #[error("Device data configuration error on '{field}': {reason}")]
    DeviceDataConf {
        /// Field whose descriptor is invalid
        field: String,
        /// What is wrong with it
        reason: String,
    },

    /// A raw value could not be coerced to the descriptor's input type.
    #[error("Input value error on '{field}': cannot read '{value}' as {expected}")]
    InputValue {
        /// Field name
        field: String,
        /// Offending raw value
        value: String,
        /// Expected input type
        expected: String,
    },

    /// A converted value was rejected by the descriptor's output type.
    #[error("Output value error on '{field}': cannot convert '{value}' to {expected}")]
    OutputValue {
        /// Field name
        field: String,
        /// Offending value
        value: String,
        /// Expected output type
        expected: String,
    },

    /// Too many recoverable frame errors during one batch.
    #[error("Read error ceiling reached on port {port} after {errors} errors")]
    InputRead {
        /// Device port
        port: String,
        /// Number of errors seen in the batch
        errors: u32,
    },

    /// The device port disappeared mid-read; a reconnect was attempted.
    #[error("Connection lost on port {port}")]
    ConnectionLost {
        /// Device port
        port: String,
    },

    /// The session is locked by another caller.
    #[error("Serial session {port} is locked by '{holder}'")]
    SessionBusy {
        /// Device port
        port: String,
        /// Node currently holding the lock
        holder: String,
    },

    /// Any other device failure.
    #[error("Device error: {0}")]
    Device(String),

    /// Redis could not be reached or returned an error.
    #[error("Redis connection error: {0}")]
    RedisConnection(#[from] redis::RedisError),

    /// An output worker could not initialize its connector.
    #[error("Worker '{worker}' failed on connector '{connector}': {cause}")]
    Worker {
        /// Worker name
        worker: String,
        /// Connector name
        connector: String,
        /// Underlying cause
        cause: String,
    },

    /// Invalid scheduler operation.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// A sink refused or failed a delivery.
    #[error("Sink '{sink}' error: {message}")]
    Sink {
        /// Sink name
        sink: String,
        /// Failure description
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<figment::Error> for MonitorError {
    fn from(value: figment::Error) -> Self {
        MonitorError::Config(Box::new(value))
    }
}

impl MonitorError {
    /// Whether the error must stop a running monitor.
    ///
    /// Only the inputs cache losing its Redis server qualifies: there is no
    /// safe place left to write samples or read windows from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MonitorError::RedisConnection(_))
    }

    /// Whether the error only affects the current sample or batch.
    ///
    /// Recoverable errors are logged at debug level and retried on the next tick.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MonitorError::InputValue { .. }
                | MonitorError::OutputValue { .. }
                | MonitorError::InputRead { .. }
                | MonitorError::ConnectionLost { .. }
                | MonitorError::SessionBusy { .. }
                | MonitorError::Device(_)
                | MonitorError::Sink { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_sample_errors_as_recoverable() {
        let err = MonitorError::InputValue {
            field: "V".into(),
            value: "12.5".into(),
            expected: "int".into(),
        };
        assert!(err.is_recoverable());

        let err = MonitorError::ConnectionLost {
            port: "/dev/ttyUSB0".into(),
        };
        assert!(err.is_recoverable());
    }

    #[test]
    fn classifies_startup_errors_as_fatal() {
        let err = MonitorError::DeviceDataConf {
            field: "V".into(),
            reason: "missing input_type".into(),
        };
        assert!(!err.is_recoverable());

        let err = MonitorError::Worker {
            worker: "influx".into(),
            connector: "local".into(),
            cause: "refused".into(),
        };
        assert!(!err.is_recoverable());
        assert_eq!(
            err.to_string(),
            "Worker 'influx' failed on connector 'local': refused"
        );
    }

    #[test]
    fn only_lost_cache_stops_the_monitor() {
        let err = MonitorError::from(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "connection refused",
        )));
        assert!(err.is_fatal());
        assert!(!err.is_recoverable());

        let err = MonitorError::Sink {
            sink: "web".into(),
            message: "503".into(),
        };
        assert!(!err.is_fatal());
    }
}

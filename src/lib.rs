//! # Solar Monitor Core Library
//!
//! Runtime engine of the `solar-monitor` service: it reads VE.Direct charge
//! controllers and battery monitors over serial ports, normalizes every field,
//! keeps a bounded time-keyed cache of samples, and delivers windows of that
//! cache to sinks.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: device trait, VE.Direct reader, mock device, packet
//!   composition and the shared [`SerialSession`](acquisition::SerialSession)
//!   with its cooperative lock.
//! - **`cache`**: the [`InputsCache`](cache::InputsCache) contract with its
//!   in-memory and Redis backends and the windowing rules.
//! - **`checker`**: typed field descriptors, validation and rescaling.
//! - **`config`**: Figment-based YAML + environment configuration and its
//!   semantic validation.
//! - **`error`**: the `MonitorError` enum used across the crate.
//! - **`input`**: input workers turning device readings into cache entries.
//! - **`logging`**: `tracing-subscriber` setup with optional rolling files.
//! - **`orchestrator`**: wires configuration to workers and runs them.
//! - **`output`**: sinks, output workers and the dispatcher loop.
//! - **`sample`**: values, field maps and time keys.
//! - **`scheduler`**: fixed-interval workers with phase alignment.

pub mod acquisition;
pub mod cache;
pub mod checker;
pub mod config;
pub mod error;
pub mod input;
pub mod logging;
pub mod orchestrator;
pub mod output;
pub mod sample;
pub mod scheduler;

//! Device seam: the blocking "read one packet" contract the session drives.
//!
//! Two implementations live in this crate: [`VeDirectSerial`](super::vedirect::VeDirectSerial)
//! for real hardware and [`MockDevice`] for tests and hardware-less runs.

use crate::sample::RawPacket;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a device.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// Recoverable frame error (bad checksum, truncated block, no block in time).
    #[error("frame read error: {0}")]
    Read(String),

    /// The port went away.
    #[error("port lost: {0}")]
    PortLost(String),

    /// No port is open.
    #[error("device not connected")]
    NotConnected,

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

/// Blocking packet source for one physical port.
pub trait PacketReader: Send {
    /// Port currently targeted.
    fn port(&self) -> &str;

    /// Open the configured port.
    fn connect(&mut self) -> Result<(), DeviceError>;

    /// Check that `port` carries a readable device stream.
    fn test_port(&mut self, port: &str) -> Result<bool, DeviceError>;

    /// Scan the OS for a port carrying the device; retargets the reader on success.
    fn search_port(&mut self) -> Result<Option<String>, DeviceError>;

    /// Prepare for a new batch (discard partial frames).
    fn init_read(&mut self);

    /// Block until one complete packet arrives or `timeout` expires.
    fn read_single(&mut self, timeout: Duration) -> Result<RawPacket, DeviceError>;

    /// Release the port.
    fn close(&mut self) {}
}

/// One scripted device response.
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Deliver this packet
    Packet(RawPacket),
    /// Fail with a recoverable frame error
    ReadError,
    /// Lose the port
    PortLost,
}

#[derive(Debug, Default)]
struct MockState {
    script: VecDeque<MockStep>,
    fallback: Option<RawPacket>,
    connected: bool,
    refuse_connect: bool,
    connects: u32,
    reads: u32,
}

/// Scripted device. Clones share their script, so a test can keep a handle after
/// boxing one copy into a session.
#[derive(Debug, Clone)]
pub struct MockDevice {
    port: String,
    state: Arc<Mutex<MockState>>,
}

impl MockDevice {
    /// Create a mock bound to `port`.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Mock that emits a plausible battery monitor frame forever.
    pub fn battery_monitor(port: impl Into<String>) -> Self {
        let mock = Self::new(port);
        let frame: RawPacket = [
            ("V", "12800"),
            ("I", "-1500"),
            ("P", "-19"),
            ("CE", "-12500"),
            ("SOC", "876"),
            ("TTG", "1440"),
            ("PID", "0x203"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        mock.set_fallback(frame);
        mock
    }

    /// Queue steps after the current script.
    pub fn push(&self, steps: impl IntoIterator<Item = MockStep>) {
        self.state.lock().script.extend(steps);
    }

    /// Packet returned once the script is exhausted.
    pub fn set_fallback(&self, packet: RawPacket) {
        self.state.lock().fallback = Some(packet);
    }

    /// Make `connect` fail until set back to false.
    pub fn refuse_connect(&self, refuse: bool) {
        self.state.lock().refuse_connect = refuse;
    }

    /// Number of successful connects.
    pub fn connects(&self) -> u32 {
        self.state.lock().connects
    }

    /// Number of `read_single` calls.
    pub fn reads(&self) -> u32 {
        self.state.lock().reads
    }
}

impl PacketReader for MockDevice {
    fn port(&self) -> &str {
        &self.port
    }

    fn connect(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.refuse_connect {
            return Err(DeviceError::PortLost(self.port.clone()));
        }
        state.connected = true;
        state.connects += 1;
        Ok(())
    }

    fn test_port(&mut self, port: &str) -> Result<bool, DeviceError> {
        let state = self.state.lock();
        Ok(port == self.port && !state.refuse_connect)
    }

    fn search_port(&mut self) -> Result<Option<String>, DeviceError> {
        let state = self.state.lock();
        Ok((!state.refuse_connect).then(|| self.port.clone()))
    }

    fn init_read(&mut self) {}

    fn read_single(&mut self, _timeout: Duration) -> Result<RawPacket, DeviceError> {
        let mut state = self.state.lock();
        state.reads += 1;
        if !state.connected {
            return Err(DeviceError::NotConnected);
        }
        match state.script.pop_front() {
            Some(MockStep::Packet(packet)) => Ok(packet),
            Some(MockStep::ReadError) => Err(DeviceError::Read("bad checksum".into())),
            Some(MockStep::PortLost) => {
                state.connected = false;
                Err(DeviceError::PortLost(self.port.clone()))
            }
            None => state
                .fallback
                .clone()
                .ok_or_else(|| DeviceError::Read("no data".into())),
        }
    }

    fn close(&mut self) {
        self.state.lock().connected = false;
    }
}

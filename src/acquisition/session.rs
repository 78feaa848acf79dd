//! Shared acquisition session for one physical device port.
//!
//! Several input workers may name the same port as their source. They share one
//! [`SerialSession`] through a cooperative lock:
//!
//! ```text
//! unlocked ──lock(a)──> locked(a) ──unlock()──> unlocked
//!                          │
//!                  lock(b) fails fast (false)
//! ```
//!
//! The lock only serializes connect/test against reads; it is never waited on.
//! A caller that finds the session locked by someone else gets
//! [`MonitorError::SessionBusy`] and retries on its next tick.
//!
//! All methods block on device I/O. Async callers run them through
//! `tokio::task::spawn_blocking`.

use super::device::{DeviceError, PacketReader};
use super::packet_cache::PacketCache;
use crate::error::{AppResult, MonitorError};
use crate::sample::RawPacket;
use parking_lot::Mutex;
use std::time::Duration;

/// Tuning of one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Frames merged into one sample
    pub packets_per_batch: usize,
    /// Recoverable frame errors tolerated per batch
    pub max_read_errors: u32,
    /// Default per-frame read timeout for callers
    pub read_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            packets_per_batch: 1,
            max_read_errors: 3,
            read_timeout: Duration::from_secs(2),
        }
    }
}

/// Merged device packet and its acquisition time.
#[derive(Debug, Clone, PartialEq)]
pub struct RawReading {
    /// Wall-clock time of the first frame of the batch
    pub time: f64,
    /// Merged frame fields
    pub packet: RawPacket,
}

#[derive(Debug, Default)]
struct SessionState {
    locked_by: Option<String>,
    connected: bool,
    last_reading: Option<RawReading>,
}

/// One device port multiplexed among input workers.
pub struct SerialSession {
    name: String,
    config: SessionConfig,
    state: Mutex<SessionState>,
    device: Mutex<Box<dyn PacketReader>>,
    packet_cache: Mutex<PacketCache>,
}

impl std::fmt::Debug for SerialSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialSession")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl SerialSession {
    /// Wrap a device. The port is not opened until [`SerialSession::try_connect`].
    pub fn new(name: impl Into<String>, device: Box<dyn PacketReader>, config: SessionConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(SessionState::default()),
            device: Mutex::new(device),
            packet_cache: Mutex::new(PacketCache::new()),
        }
    }

    /// Connector name of this session.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Session tuning.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Port currently targeted by the device.
    pub fn port(&self) -> String {
        self.device.lock().port().to_string()
    }

    /// Whether the last connect succeeded and no port loss was seen since.
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Acquire the cooperative lock. Fails fast when another caller holds it.
    pub fn lock(&self, caller: &str) -> bool {
        let mut state = self.state.lock();
        match &state.locked_by {
            Some(holder) if holder != caller => false,
            _ => {
                state.locked_by = Some(caller.to_string());
                true
            }
        }
    }

    /// Release the cooperative lock.
    pub fn unlock(&self) {
        self.state.lock().locked_by = None;
    }

    /// Whether `caller` holds the lock.
    pub fn is_locked_by(&self, caller: &str) -> bool {
        self.state.lock().locked_by.as_deref() == Some(caller)
    }

    /// Current lock holder.
    pub fn lock_holder(&self) -> Option<String> {
        self.state.lock().locked_by.clone()
    }

    /// Open and self-test the configured port, scanning the OS for another
    /// candidate when it fails.
    ///
    /// The lock is taken for `caller` and released only on success, so the
    /// caller that saw the failure keeps ownership of the recovery.
    pub fn try_connect(&self, caller: &str) -> bool {
        if !self.lock(caller) {
            tracing::debug!(session = %self.name, caller, "connect skipped, session locked");
            return false;
        }

        let connected = {
            let mut device = self.device.lock();
            connect_device(device.as_mut(), &self.name)
        };

        self.state.lock().connected = connected;
        if connected {
            self.unlock();
        }
        connected
    }

    /// Read one batch of frames and return the merged reading.
    ///
    /// The caller must hold the lock or the session must be unlocked. Port loss
    /// triggers a reconnect attempt and reports [`MonitorError::ConnectionLost`]
    /// for this batch; the next tick reads again.
    pub fn read(&self, caller: &str, timeout: Duration) -> AppResult<RawReading> {
        {
            let state = self.state.lock();
            if let Some(holder) = state.locked_by.as_deref() {
                if holder != caller {
                    return Err(MonitorError::SessionBusy {
                        port: self.name.clone(),
                        holder: holder.to_string(),
                    });
                }
            }
        }

        if !self.is_connected() && !self.try_connect(caller) {
            return Err(MonitorError::ConnectionLost {
                port: self.port(),
            });
        }

        match self.read_batch(timeout) {
            Err(MonitorError::ConnectionLost { port }) => {
                self.state.lock().connected = false;
                tracing::warn!(session = %self.name, %port, "Port lost during read, reconnecting");
                if self.try_connect(caller) {
                    tracing::info!(session = %self.name, "Reconnected");
                }
                Err(MonitorError::ConnectionLost { port })
            }
            other => other,
        }
    }

    fn read_batch(&self, timeout: Duration) -> AppResult<RawReading> {
        let mut device = self.device.lock();
        let mut cache = self.packet_cache.lock();
        cache.reset();
        device.init_read();

        let wanted = self.config.packets_per_batch.max(1);
        let budget = wanted + self.config.max_read_errors as usize;
        let mut errors = 0u32;

        for _ in 0..budget {
            match device.read_single(timeout) {
                Ok(frame) => {
                    cache.add(frame);
                    if cache.frames() >= wanted {
                        break;
                    }
                }
                Err(DeviceError::Read(reason)) => {
                    errors += 1;
                    tracing::debug!(session = %self.name, errors, %reason, "Recoverable frame error");
                    if errors >= self.config.max_read_errors {
                        return Err(MonitorError::InputRead {
                            port: device.port().to_string(),
                            errors,
                        });
                    }
                }
                Err(DeviceError::PortLost(_)) | Err(DeviceError::NotConnected) => {
                    return Err(MonitorError::ConnectionLost {
                        port: device.port().to_string(),
                    });
                }
                Err(DeviceError::Other(reason)) => return Err(MonitorError::Device(reason)),
            }
        }

        let (time, packet) = cache.snapshot().ok_or_else(|| MonitorError::InputRead {
            port: device.port().to_string(),
            errors,
        })?;
        let reading = RawReading { time, packet };
        self.state.lock().last_reading = Some(reading.clone());
        Ok(reading)
    }

    /// Whether the last reading is at most `window` seconds old at `now`.
    pub fn is_cache_fresh(&self, now: f64, window: f64) -> bool {
        self.state
            .lock()
            .last_reading
            .as_ref()
            .is_some_and(|r| now - r.time <= window && now >= r.time)
    }

    /// Last successful reading.
    pub fn last_reading(&self) -> Option<RawReading> {
        self.state.lock().last_reading.clone()
    }

    /// Release the device.
    pub fn close(&self) {
        self.device.lock().close();
        let mut state = self.state.lock();
        state.connected = false;
        state.locked_by = None;
    }
}

fn connect_device(device: &mut dyn PacketReader, session: &str) -> bool {
    let port = device.port().to_string();
    match device.test_port(&port) {
        Ok(true) => match device.connect() {
            Ok(()) => return true,
            Err(e) => tracing::warn!(session, %port, error = %e, "Connect failed after port test"),
        },
        Ok(false) => tracing::debug!(session, %port, "Port test failed"),
        Err(e) => tracing::debug!(session, %port, error = %e, "Port test error"),
    }

    match device.search_port() {
        Ok(Some(found)) => match device.connect() {
            Ok(()) => {
                tracing::info!(session, port = %found, "Connected on scanned port");
                true
            }
            Err(e) => {
                tracing::warn!(session, port = %found, error = %e, "Connect failed on scanned port");
                false
            }
        },
        Ok(None) => {
            tracing::warn!(session, %port, "No device port found");
            false
        }
        Err(e) => {
            tracing::warn!(session, %port, error = %e, "Port scan failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::device::{MockDevice, MockStep};

    const TIMEOUT: Duration = Duration::from_millis(10);

    fn frame(pairs: &[(&str, &str)]) -> RawPacket {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn session(mock: &MockDevice, packets_per_batch: usize) -> SerialSession {
        SerialSession::new(
            "bmv",
            Box::new(mock.clone()),
            SessionConfig {
                packets_per_batch,
                max_read_errors: 2,
                read_timeout: Duration::from_millis(10),
            },
        )
    }

    #[test]
    fn lock_conflict_fails_fast() {
        let mock = MockDevice::new("/dev/ttyUSB0");
        let s = session(&mock, 1);

        assert!(s.lock("a"));
        assert!(!s.lock("b"));
        assert!(s.is_locked_by("a"));
        s.unlock();
        assert!(s.lock("b"));
        assert!(s.is_locked_by("b"));
    }

    #[test]
    fn read_merges_batch_frames() {
        let mock = MockDevice::new("/dev/ttyUSB0");
        mock.push([
            MockStep::Packet(frame(&[("V", "12800")])),
            MockStep::Packet(frame(&[("I", "150")])),
        ]);
        let s = session(&mock, 2);
        assert!(s.try_connect("bat"));
        assert!(s.lock_holder().is_none());

        let reading = s.read("bat", TIMEOUT).unwrap();
        assert_eq!(reading.packet.len(), 2);
        assert!(s.is_cache_fresh(reading.time + 0.5, 1.0));
        assert!(!s.is_cache_fresh(reading.time + 2.0, 1.0));
    }

    #[test]
    fn read_error_ceiling_fails_batch() {
        let mock = MockDevice::new("/dev/ttyUSB0");
        mock.push([MockStep::ReadError, MockStep::ReadError]);
        let s = session(&mock, 1);
        assert!(s.try_connect("bat"));

        let err = s.read("bat", TIMEOUT).unwrap_err();
        assert!(matches!(err, MonitorError::InputRead { errors: 2, .. }));
    }

    #[test]
    fn busy_session_rejects_other_callers() {
        let mock = MockDevice::new("/dev/ttyUSB0");
        let s = session(&mock, 1);
        assert!(s.lock("a"));
        assert!(matches!(
            s.read("b", TIMEOUT),
            Err(MonitorError::SessionBusy { .. })
        ));
    }

    #[test]
    fn port_loss_reconnects_and_fails_batch() {
        let mock = MockDevice::new("/dev/ttyUSB0");
        mock.push([MockStep::PortLost]);
        mock.set_fallback(frame(&[("V", "1")]));
        let s = session(&mock, 1);
        assert!(s.try_connect("bat"));

        assert!(matches!(
            s.read("bat", TIMEOUT),
            Err(MonitorError::ConnectionLost { .. })
        ));
        assert_eq!(mock.connects(), 2);
        assert!(s.read("bat", TIMEOUT).is_ok());
    }

    #[test]
    fn failed_connect_keeps_lock_for_caller() {
        let mock = MockDevice::new("/dev/ttyUSB0");
        mock.refuse_connect(true);
        let s = session(&mock, 1);

        assert!(!s.try_connect("a"));
        assert!(s.is_locked_by("a"));
        assert!(matches!(
            s.read("b", TIMEOUT),
            Err(MonitorError::SessionBusy { .. })
        ));

        mock.refuse_connect(false);
        assert!(s.try_connect("a"));
        assert!(s.lock_holder().is_none());
    }
}

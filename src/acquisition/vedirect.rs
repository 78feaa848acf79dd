//! VE.Direct text protocol over a serial port.
//!
//! Victron devices emit blocks of `\r\n<label>\t<value>` fields terminated by a
//! `Checksum` field whose single value byte makes the byte sum of the whole block
//! 0 mod 256. Lines starting with `:` are HEX-protocol messages and are skipped.

use super::device::{DeviceError, PacketReader};
use crate::sample::RawPacket;
use serialport::{SerialPort, SerialPortType};
use std::collections::VecDeque;
use std::io::{ErrorKind, Read};
use std::time::{Duration, Instant};

/// Default VE.Direct line speed.
pub const DEFAULT_BAUD: u32 = 19_200;

const CHECKSUM_LABEL: &[u8] = b"Checksum";
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitHeader,
    InKey,
    InValue,
    InChecksum,
    Hex,
}

/// Byte-level VE.Direct block decoder.
#[derive(Debug)]
pub struct FrameParser {
    state: State,
    sum: u8,
    key: Vec<u8>,
    value: Vec<u8>,
    block: RawPacket,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    /// Parser waiting for the start of a block.
    pub fn new() -> Self {
        Self {
            state: State::WaitHeader,
            sum: 0,
            key: Vec::new(),
            value: Vec::new(),
            block: RawPacket::new(),
        }
    }

    /// Forget any partial block.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Feed one byte. Returns a finished block or a checksum error at block end.
    pub fn feed(&mut self, byte: u8) -> Option<Result<RawPacket, DeviceError>> {
        if byte == b':' && self.state != State::InChecksum {
            self.state = State::Hex;
        }
        if self.state != State::Hex {
            self.sum = self.sum.wrapping_add(byte);
        }

        match self.state {
            State::WaitHeader => {
                if byte == b'\n' {
                    self.state = State::InKey;
                }
                None
            }
            State::InKey => {
                if byte == b'\t' {
                    self.state = if self.key == CHECKSUM_LABEL {
                        State::InChecksum
                    } else {
                        State::InValue
                    };
                } else {
                    self.key.push(byte);
                }
                None
            }
            State::InValue => {
                if byte == b'\r' {
                    let key = String::from_utf8_lossy(&self.key).into_owned();
                    let value = String::from_utf8_lossy(&self.value).into_owned();
                    self.block.insert(key, value);
                    self.key.clear();
                    self.value.clear();
                    self.state = State::WaitHeader;
                } else {
                    self.value.push(byte);
                }
                None
            }
            State::InChecksum => {
                self.key.clear();
                self.value.clear();
                self.state = State::WaitHeader;
                let sum = std::mem::take(&mut self.sum);
                let block = std::mem::take(&mut self.block);
                if sum == 0 {
                    Some(Ok(block))
                } else {
                    Some(Err(DeviceError::Read(format!(
                        "checksum mismatch ({} fields, residue {sum})",
                        block.len()
                    ))))
                }
            }
            State::Hex => {
                self.sum = 0;
                if byte == b'\n' {
                    self.state = State::WaitHeader;
                }
                None
            }
        }
    }
}

/// VE.Direct device on a serial port.
pub struct VeDirectSerial {
    port_name: String,
    baud: u32,
    serial: Option<Box<dyn SerialPort>>,
    parser: FrameParser,
    pending: VecDeque<u8>,
}

impl std::fmt::Debug for VeDirectSerial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VeDirectSerial")
            .field("port_name", &self.port_name)
            .field("baud", &self.baud)
            .field("connected", &self.serial.is_some())
            .finish()
    }
}

impl VeDirectSerial {
    /// Reader for `port_name` at `baud`. Nothing is opened until `connect`.
    pub fn new(port_name: impl Into<String>, baud: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud,
            serial: None,
            parser: FrameParser::new(),
            pending: VecDeque::new(),
        }
    }

    fn open(&self, port: &str) -> Result<Box<dyn SerialPort>, DeviceError> {
        serialport::new(port, self.baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(POLL_TIMEOUT)
            .open()
            .map_err(|e| DeviceError::PortLost(format!("{port}: {e}")))
    }

    fn read_block<R: Read + ?Sized>(
        serial: &mut R,
        parser: &mut FrameParser,
        pending: &mut VecDeque<u8>,
        timeout: Duration,
    ) -> Result<RawPacket, DeviceError> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 256];
        loop {
            while let Some(byte) = pending.pop_front() {
                if let Some(result) = parser.feed(byte) {
                    return result;
                }
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::Read(format!(
                    "no complete block within {timeout:?}"
                )));
            }
            match serial.read(&mut buf) {
                Ok(0) => return Err(DeviceError::PortLost("end of stream".into())),
                Ok(n) => pending.extend(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                    continue
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(DeviceError::PortLost(e.to_string())),
            }
        }
    }
}

impl PacketReader for VeDirectSerial {
    fn port(&self) -> &str {
        &self.port_name
    }

    fn connect(&mut self) -> Result<(), DeviceError> {
        let serial = self.open(&self.port_name)?;
        tracing::info!(port = %self.port_name, baud = self.baud, "Opened VE.Direct serial port");
        self.serial = Some(serial);
        self.init_read();
        Ok(())
    }

    fn test_port(&mut self, port: &str) -> Result<bool, DeviceError> {
        let mut serial = match self.open(port) {
            Ok(serial) => serial,
            Err(e) => {
                tracing::debug!(port, error = %e, "Port test: cannot open");
                return Ok(false);
            }
        };
        let mut parser = FrameParser::new();
        let mut pending = VecDeque::new();
        // Two blocks: the first one is usually truncated.
        for _ in 0..2 {
            match Self::read_block(serial.as_mut(), &mut parser, &mut pending, Duration::from_secs(2)) {
                Ok(block) if !block.is_empty() => return Ok(true),
                Ok(_) | Err(DeviceError::Read(_)) => continue,
                Err(e) => {
                    tracing::debug!(port, error = %e, "Port test failed");
                    return Ok(false);
                }
            }
        }
        Ok(false)
    }

    fn search_port(&mut self) -> Result<Option<String>, DeviceError> {
        let mut ports = serialport::available_ports()
            .map_err(|e| DeviceError::Other(format!("port enumeration failed: {e}")))?;
        ports.sort_by_key(|p| !matches!(p.port_type, SerialPortType::UsbPort(_)));

        for info in ports {
            if self.test_port(&info.port_name)? {
                tracing::info!(old = %self.port_name, new = %info.port_name, "Found VE.Direct device");
                self.port_name = info.port_name;
                return Ok(Some(self.port_name.clone()));
            }
        }
        Ok(None)
    }

    fn init_read(&mut self) {
        self.parser.reset();
        self.pending.clear();
        if let Some(serial) = self.serial.as_mut() {
            if let Err(e) = serial.clear(serialport::ClearBuffer::Input) {
                tracing::debug!(port = %self.port_name, error = %e, "Could not clear input buffer");
            }
        }
    }

    fn read_single(&mut self, timeout: Duration) -> Result<RawPacket, DeviceError> {
        let serial = self.serial.as_mut().ok_or(DeviceError::NotConnected)?;
        let result = Self::read_block(serial.as_mut(), &mut self.parser, &mut self.pending, timeout);
        if let Err(DeviceError::PortLost(_)) = &result {
            self.serial = None;
        }
        result
    }

    fn close(&mut self) {
        if self.serial.take().is_some() {
            tracing::info!(port = %self.port_name, "Closed VE.Direct serial port");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Build a valid block from fields, appending the checksum byte.
    fn block(fields: &[(&str, &str)]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for (k, v) in fields {
            bytes.extend_from_slice(format!("\r\n{k}\t{v}").as_bytes());
        }
        bytes.extend_from_slice(b"\r\nChecksum\t");
        let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        bytes.push(0u8.wrapping_sub(sum));
        bytes
    }

    fn feed_all(parser: &mut FrameParser, bytes: &[u8]) -> Vec<Result<RawPacket, DeviceError>> {
        bytes.iter().filter_map(|b| parser.feed(*b)).collect()
    }

    #[test]
    fn decodes_valid_block() {
        let mut parser = FrameParser::new();
        let out = feed_all(&mut parser, &block(&[("V", "12800"), ("I", "-1500")]));
        assert_eq!(out.len(), 1);
        let packet = out[0].clone().unwrap();
        assert_eq!(packet.get("V").map(String::as_str), Some("12800"));
        assert_eq!(packet.get("I").map(String::as_str), Some("-1500"));
    }

    #[test]
    fn detects_corrupted_block() {
        let mut bytes = block(&[("V", "12800")]);
        bytes[5] = b'9';
        let mut parser = FrameParser::new();
        let out = feed_all(&mut parser, &bytes);
        assert!(matches!(out[0], Err(DeviceError::Read(_))));

        // The parser resynchronizes on the next block
        let out = feed_all(&mut parser, &block(&[("SOC", "998")]));
        assert!(out[0].is_ok());
    }

    #[test]
    fn skips_hex_messages_between_blocks() {
        let mut bytes = block(&[("V", "1")]);
        bytes.extend_from_slice(b":A0102000543\n");
        bytes.extend(block(&[("V", "2")]));
        let mut parser = FrameParser::new();
        let out = feed_all(&mut parser, &bytes);
        assert_eq!(out.len(), 2);
        assert_eq!(
            out[1].as_ref().unwrap().get("V").map(String::as_str),
            Some("2")
        );
    }

    #[test]
    fn read_block_keeps_trailing_bytes() {
        let mut bytes = block(&[("V", "1")]);
        bytes.extend(block(&[("V", "2")]));
        let mut cursor = Cursor::new(bytes);
        let mut parser = FrameParser::new();
        let mut pending = VecDeque::new();

        let first =
            VeDirectSerial::read_block(&mut cursor, &mut parser, &mut pending, Duration::from_secs(1))
                .unwrap();
        let second =
            VeDirectSerial::read_block(&mut cursor, &mut parser, &mut pending, Duration::from_secs(1))
                .unwrap();
        assert_eq!(first.get("V").map(String::as_str), Some("1"));
        assert_eq!(second.get("V").map(String::as_str), Some("2"));

        // Exhausted stream reads as a lost port
        let end =
            VeDirectSerial::read_block(&mut cursor, &mut parser, &mut pending, Duration::from_secs(1));
        assert!(matches!(end, Err(DeviceError::PortLost(_))));
    }
}

//! Composition of several short device frames into one sample.
//!
//! VE.Direct devices spread their register set over consecutive frames. A read
//! batch starts with [`PacketCache::reset`], feeds each frame to
//! [`PacketCache::add`], and takes the merged result with
//! [`PacketCache::snapshot`].

use crate::sample::{now_secs, RawPacket};

/// Short-lived cache of the packet being composed.
#[derive(Debug, Default, Clone)]
pub struct PacketCache {
    time: Option<f64>,
    packet: RawPacket,
    frames: usize,
}

impl PacketCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the current packet.
    pub fn reset(&mut self) {
        self.time = None;
        self.packet.clear();
        self.frames = 0;
    }

    /// Merge a frame into the current packet, stamped with the wall clock.
    pub fn add(&mut self, frame: RawPacket) -> bool {
        self.add_at(frame, now_secs())
    }

    /// Merge a frame, stamping the packet with `now` if it is the first field.
    ///
    /// Returns false for an empty frame, which leaves the cache untouched.
    pub fn add_at(&mut self, frame: RawPacket, now: f64) -> bool {
        if frame.is_empty() {
            return false;
        }
        if self.time.is_none() {
            self.time = Some(now);
        }
        self.packet.extend(frame);
        self.frames += 1;
        true
    }

    /// Whether a packet is being composed.
    pub fn has(&self) -> bool {
        self.time.is_some() && !self.packet.is_empty()
    }

    /// Number of frames merged since the last reset.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Seconds since the packet was started, if any.
    pub fn age(&self, now: f64) -> Option<f64> {
        self.time.map(|t| (now - t).max(0.0))
    }

    /// Acquisition time and merged fields.
    pub fn snapshot(&self) -> Option<(f64, RawPacket)> {
        self.time
            .filter(|_| !self.packet.is_empty())
            .map(|t| (t, self.packet.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(pairs: &[(&str, &str)]) -> RawPacket {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn merges_frames_under_first_timestamp() {
        let mut cache = PacketCache::new();
        assert!(!cache.has());

        assert!(cache.add_at(frame(&[("V", "12800"), ("I", "150")]), 100.25));
        assert!(cache.add_at(frame(&[("I", "160"), ("SOC", "998")]), 101.0));

        let (time, packet) = cache.snapshot().unwrap();
        assert_eq!(time, 100.25);
        assert_eq!(packet.get("I").map(String::as_str), Some("160"));
        assert_eq!(packet.len(), 3);
        assert_eq!(cache.frames(), 2);
        assert_eq!(cache.age(101.25), Some(1.0));
    }

    #[test]
    fn empty_frame_is_ignored() {
        let mut cache = PacketCache::new();
        assert!(!cache.add_at(RawPacket::new(), 1.0));
        assert!(!cache.has());
        assert!(cache.snapshot().is_none());
    }

    #[test]
    fn reset_starts_a_new_packet() {
        let mut cache = PacketCache::new();
        cache.add_at(frame(&[("V", "1")]), 1.0);
        cache.reset();
        assert!(!cache.has());
        assert_eq!(cache.age(5.0), None);
        cache.add_at(frame(&[("V", "2")]), 3.0);
        assert_eq!(cache.snapshot().unwrap().0, 3.0);
    }
}

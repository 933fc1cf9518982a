//! Per-channel counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters for one stream of a session
#[derive(Debug, Default)]
pub struct ChannelStats {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    dropped_units: AtomicU64,
    skipped_frames: AtomicU64,
    wait_timeouts: AtomicU64,
}

impl ChannelStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_send(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_receive(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// A producer-side unit was discarded (oversized or overflowing)
    pub fn record_dropped(&self) {
        self.dropped_units.fetch_add(1, Ordering::Relaxed);
    }

    /// A consumer-side frame failed validation and was skipped
    pub fn record_skipped(&self) {
        self.skipped_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.wait_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            dropped_units: self.dropped_units.load(Ordering::Relaxed),
            skipped_frames: self.skipped_frames.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ChannelStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub dropped_units: u64,
    pub skipped_frames: u64,
    pub wait_timeouts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = ChannelStats::new();
        stats.record_send(128);
        stats.record_send(64);
        stats.record_receive(128);
        stats.record_dropped();
        stats.record_skipped();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.frames_sent, 2);
        assert_eq!(snapshot.bytes_sent, 192);
        assert_eq!(snapshot.frames_received, 1);
        assert_eq!(snapshot.dropped_units, 1);
        assert_eq!(snapshot.skipped_frames, 1);
        assert_eq!(snapshot.wait_timeouts, 0);

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"bytes_sent\":192"));
    }
}

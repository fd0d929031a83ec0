//! Engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters maintained by the poll loop.
///
/// Kept behind an `Arc` so an observer thread (the CLI's status line, a
/// metrics exporter) can snapshot them while the engine runs.
#[derive(Debug, Default)]
pub struct EngineStats {
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    tx_completions: AtomicU64,
    frames_recycled: AtomicU64,
    fill_backpressure: AtomicU64,
    tx_backpressure: AtomicU64,
    iterations: AtomicU64,
    idle_waits: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Packets delivered to the transport layer.
    pub rx_packets: u64,
    /// Payload bytes delivered.
    pub rx_bytes: u64,
    /// Frames committed to the transmit ring.
    pub tx_packets: u64,
    /// Payload bytes committed for transmit.
    pub tx_bytes: u64,
    /// Transmit completions reclaimed.
    pub tx_completions: u64,
    /// Frames recycled into the fill ring after delivery.
    pub frames_recycled: u64,
    /// Iterations where the fill ring granted fewer slots than requested.
    pub fill_backpressure: u64,
    /// Frames parked because the transmit ring was full.
    pub tx_backpressure: u64,
    /// Poll loop iterations executed.
    pub iterations: u64,
    /// Idle iterations that blocked waiting for receive readiness.
    pub idle_waits: u64,
}

impl EngineStats {
    pub(crate) fn add_rx(&self, packets: u64, bytes: u64) {
        self.rx_packets.fetch_add(packets, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_tx(&self, packets: u64, bytes: u64) {
        self.tx_packets.fetch_add(packets, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_completions(&self, n: u64) {
        self.tx_completions.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_recycled(&self, n: u64) {
        self.frames_recycled.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn note_fill_backpressure(&self) {
        self.fill_backpressure.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_tx_backpressure(&self, n: u64) {
        self.tx_backpressure.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn note_iteration(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_idle_wait(&self) {
        self.idle_waits.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies all counters at once.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_completions: self.tx_completions.load(Ordering::Relaxed),
            frames_recycled: self.frames_recycled.load(Ordering::Relaxed),
            fill_backpressure: self.fill_backpressure.load(Ordering::Relaxed),
            tx_backpressure: self.tx_backpressure.load(Ordering::Relaxed),
            iterations: self.iterations.load(Ordering::Relaxed),
            idle_waits: self.idle_waits.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counter_updates() {
        let stats = EngineStats::default();
        stats.add_rx(3, 4096);
        stats.add_tx(2, 128);
        stats.add_completions(2);
        stats.add_recycled(3);
        stats.note_fill_backpressure();
        stats.note_iteration();

        let snap = stats.snapshot();
        assert_eq!(snap.rx_packets, 3);
        assert_eq!(snap.rx_bytes, 4096);
        assert_eq!(snap.tx_packets, 2);
        assert_eq!(snap.tx_completions, 2);
        assert_eq!(snap.frames_recycled, 3);
        assert_eq!(snap.fill_backpressure, 1);
        assert_eq!(snap.iterations, 1);
        assert_eq!(snap.idle_waits, 0);
    }
}

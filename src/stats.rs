//! Statistics tracking for the packet proxy.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters of what happened to packets read from the tunnel.
pub struct Stats {
    pub requests: AtomicU64,
    pub forwarded: AtomicU64,
    pub blocked: AtomicU64,
    pub dropped: AtomicU64,
    pub responses: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            responses: AtomicU64::new(0),
        }
    }

    pub fn record_forwarded(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blocked(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// An upstream reply was turned into a packet for the tunnel.
    pub fn record_response(&self) {
        self.responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.swap(0, Ordering::Relaxed),
            forwarded: self.forwarded.swap(0, Ordering::Relaxed),
            blocked: self.blocked.swap(0, Ordering::Relaxed),
            dropped: self.dropped.swap(0, Ordering::Relaxed),
            responses: self.responses.swap(0, Ordering::Relaxed),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub forwarded: u64,
    pub blocked: u64,
    pub dropped: u64,
    pub responses: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_resets_counters() {
        let stats = Stats::new();
        stats.record_forwarded();
        stats.record_blocked();
        stats.record_blocked();
        stats.record_dropped();
        stats.record_response();

        let first = stats.snapshot_and_reset();
        assert_eq!(first.requests, 4);
        assert_eq!(first.forwarded, 1);
        assert_eq!(first.blocked, 2);
        assert_eq!(first.dropped, 1);
        assert_eq!(first.responses, 1);

        let second = stats.snapshot_and_reset();
        assert_eq!(second.requests, 0);
        assert_eq!(second.blocked, 0);
    }
}

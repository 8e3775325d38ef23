//! Bounded FIFO of queries waiting on an upstream reply.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::debug;

/// Most queries in flight at once.
pub const MAX_WAITING: usize = 1024;

/// Age after which an unanswered query is abandoned.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Queries in insertion order, so the front is always the oldest.
///
/// Limits are enforced on every insertion. Evicted entries are dropped,
/// which closes any socket they own.
pub struct WaitList<T> {
    entries: VecDeque<(Instant, T)>,
    capacity: usize,
    timeout: Duration,
}

impl<T> WaitList<T> {
    pub fn new() -> Self {
        Self::with_limits(MAX_WAITING, WAIT_TIMEOUT)
    }

    pub fn with_limits(capacity: usize, timeout: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            timeout,
        }
    }

    pub fn add(&mut self, item: T) {
        self.add_at(item, Instant::now());
    }

    /// Insert `item` created at `now`, evicting expired and excess entries first.
    pub fn add_at(&mut self, item: T, now: Instant) {
        while let Some((created, _)) = self.entries.front() {
            if now.saturating_duration_since(*created) <= self.timeout {
                break;
            }
            debug!("dropping query socket after timeout");
            self.entries.pop_front();
        }

        while self.entries.len() >= self.capacity {
            debug!("dropping query socket due to space constraints");
            self.entries.pop_front();
        }

        self.entries.push_back((now, item));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|(_, item)| item)
    }

    /// Remove and return every entry for which `pred(position, entry)` holds.
    ///
    /// Positions are those seen by [`iter`](Self::iter) before removal.
    /// Remaining entries keep their order.
    pub fn take_where<F>(&mut self, mut pred: F) -> Vec<T>
    where
        F: FnMut(usize, &T) -> bool,
    {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());

        for (position, (created, item)) in self.entries.drain(..).enumerate() {
            if pred(position, &item) {
                taken.push(item);
            } else {
                kept.push_back((created, item));
            }
        }

        self.entries = kept;
        taken
    }
}

impl<T> Default for WaitList<T> {
    fn default() -> Self {
        Self::new()
    }
}

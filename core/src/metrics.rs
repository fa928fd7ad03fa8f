//! Throughput counters.
//!
//! One counter per direction: `read` (records admitted from the intake
//! socket) and `sent` (records written upstream). Counters accumulate a
//! record count and a byte total; each report drains them and restarts the
//! elapsed timer, so every report line covers exactly one interval.
//!
//! Updates use relaxed atomics so the counters can be read from a status
//! snapshot without coordinating with the event loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A monotonic {count, bytes} pair with an elapsed-since-reset timer.
#[derive(Debug)]
pub struct StreamCounter {
    name: &'static str,
    count: AtomicU64,
    bytes: AtomicU64,
    since: Instant,
}

impl StreamCounter {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            count: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            since: Instant::now(),
        }
    }

    /// Record one message of `len` payload bytes.
    pub fn record(&self, len: usize) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Drain the counter, returning the interval totals and resetting the
    /// elapsed timer.
    pub fn take_report(&mut self) -> StreamReport {
        let report = StreamReport {
            name: self.name,
            count: self.count.swap(0, Ordering::Relaxed),
            bytes: self.bytes.swap(0, Ordering::Relaxed),
            elapsed_secs: self.since.elapsed().as_secs_f64(),
        };
        self.since = Instant::now();
        report
    }
}

/// One interval's totals for a single direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamReport {
    pub name: &'static str,
    pub count: u64,
    pub bytes: u64,
    pub elapsed_secs: f64,
}

impl StreamReport {
    pub fn per_second(&self) -> f64 {
        if self.elapsed_secs > 0.0 {
            self.count as f64 / self.elapsed_secs
        } else {
            0.0
        }
    }
}

/// The broker's per-direction counters.
#[derive(Debug)]
pub struct Metrics {
    pub read: StreamCounter,
    pub sent: StreamCounter,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            read: StreamCounter::new("read"),
            sent: StreamCounter::new("sent"),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

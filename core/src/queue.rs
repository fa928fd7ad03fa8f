//! The in-memory record queue.
//!
//! An ordered sequence of ready-to-send payloads with two insertion points:
//! the tail for normal intake and the head for self-log records and for
//! restoring a record after a failed send. Only the event loop touches it.

use bytes::Bytes;
use std::collections::VecDeque;
use tracing::warn;

/// FIFO of records awaiting delivery.
///
/// The queue itself enforces no bound unless `limit` is set; when it is,
/// intake drops the oldest queued record and counts the drop. Head
/// insertion (self-log, send-failure restore) is never subject to the
/// limit: a record already admitted must not be lost to it.
#[derive(Debug, Default)]
pub struct MessageQueue {
    records: VecDeque<Bytes>,
    limit: Option<usize>,
    dropped: u64,
}

impl MessageQueue {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            records: VecDeque::new(),
            limit,
            dropped: 0,
        }
    }

    /// Append a record at the tail. With a configured limit, the oldest
    /// queued record is dropped to make room.
    pub fn push_back(&mut self, record: Bytes) {
        if let Some(limit) = self.limit {
            while self.records.len() >= limit.max(1) {
                self.records.pop_front();
                self.dropped += 1;
                if self.dropped % 1000 == 1 {
                    warn!(
                        dropped = self.dropped,
                        limit, "queue limit reached, dropping oldest records"
                    );
                }
            }
        }
        self.records.push_back(record);
    }

    /// Insert a record at the head, ahead of buffered traffic.
    pub fn push_front(&mut self, record: Bytes) {
        self.records.push_front(record);
    }

    pub fn pop_front(&mut self) -> Option<Bytes> {
        self.records.pop_front()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total records dropped to the queue limit since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Replace the bound on config reload. Already-queued records are
    /// kept; a tighter limit takes effect on the next intake.
    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.records.iter()
    }
}

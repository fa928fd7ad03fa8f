//! Self-logging: the broker's own operational events as GELF records.
//!
//! Events are built with the same client-library contract producers use,
//! stamped `facility = "gelf-broker"` with the broker's pid, and inserted
//! at the head of the queue so they overtake buffered producer traffic
//! once the upstream recovers.

use crate::queue::MessageQueue;
use bytes::Bytes;
use gelf_client::RecordBuilder;
use tracing::warn;

/// Facility stamped on every self-log record.
pub const FACILITY: &str = "gelf-broker";

/// Build a self-log record and head-insert it. A record that fails to
/// build is dropped with a warning; self-logging never disturbs the loop.
pub fn emit(queue: &mut MessageQueue, level: u8, message: impl Into<String>) {
    match build(level, message.into()) {
        Ok(record) => queue.push_front(record),
        Err(e) => warn!(error = %e, "failed to build self-log record"),
    }
}

fn build(level: u8, message: String) -> gelf_client::Result<Bytes> {
    let record = RecordBuilder::new()
        .message(message)
        .level(level)?
        .facility(FACILITY)
        .field("pid", std::process::id())
        .build()?;
    Ok(Bytes::from(record.to_bytes()?))
}

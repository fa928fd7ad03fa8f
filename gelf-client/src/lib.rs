//! Producer-side client library for the gelf-broker log shipper.
//!
//! Producers build a GELF 1.1 document with [`RecordBuilder`], then hand it
//! to a [`Publisher`] bound to the broker's Unix datagram socket. One record
//! travels per datagram, wrapped in a 16-bit big-endian length envelope.
//!
//! ```rust,no_run
//! use gelf_client::{Publisher, RecordBuilder};
//!
//! fn main() -> gelf_client::Result<()> {
//!     let publisher = Publisher::connect("/run/gelf-broker.sock")?;
//!     let record = RecordBuilder::new()
//!         .message("backup finished")
//!         .level_name("info")?
//!         .field("job", "nightly-backup")
//!         .build()?;
//!     publisher.send_record(&record)
//! }
//! ```

pub mod publisher;
pub mod record;

pub use publisher::Publisher;
pub use record::{parse_level, Record, RecordBuilder, Timestamp};

/// Wire protocol revision shared with the broker. The broker refuses to
/// start against a client library speaking a different revision.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest record payload that fits the 16-bit length envelope.
pub const MAX_RECORD_LEN: usize = u16::MAX as usize;

/// Errors raised by the client library
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Socket I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// GELF document serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A record needs `message` or `short_message` before it can be built
    #[error("record has neither message nor short_message")]
    MessageMissing,

    /// Record payload does not fit the 16-bit length envelope
    #[error("record of {size} bytes exceeds the {max} byte datagram limit", max = MAX_RECORD_LEN)]
    RecordTooLarge { size: usize },

    /// Unrecognized severity level name
    #[error("unknown level name: {0:?}")]
    UnknownLevel(String),

    /// Numeric level outside the 1..=9 range
    #[error("level {0} outside the valid range 1..=9")]
    LevelOutOfRange(i64),
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

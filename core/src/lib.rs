//! # gelf-broker
//!
//! A local log-shipping broker for GELF records. Producers on the host
//! write length-prefixed datagrams to a Unix socket; the broker forwards
//! them to a remote Graylog endpoint over a persistent TCP (optionally
//! TLS) connection, absorbing bursts, surviving remote outages, and
//! preserving queued records across its own restarts.
//!
//! ## Architecture
//!
//! A single event loop owns every moving part:
//!
//! - [`listener`] - the Unix datagram intake socket and its integrity
//!   self-check (device+inode signature, liveness probe)
//! - [`codec`] - the intake length-prefix envelope and the upstream
//!   NUL-terminated frame
//! - [`queue`] - the in-memory FIFO with head re-insertion on send failure
//! - [`upstream`] - endpoint classification, the connection state
//!   machine, keep-alives, and graceful half-close
//! - [`spool`] - the crash-resilience snapshot file
//! - [`broker`] - the control loop, timers, signal matrix, and lifecycle
//! - [`status`] / [`pidfile`] - the operational surface for probes
//! - [`selflog`] - the broker's own events as head-inserted GELF records
//! - [`metrics`] - per-direction throughput counters
//!
//! Delivery is at-least-once: a transient upstream outage buffers records
//! in memory (and on disk via the spool), and a crash-window restore may
//! duplicate. Ordering within a producer is preserved.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use gelf_broker::{Broker, Config};
//! use std::path::PathBuf;
//!
//! #[tokio::main]
//! async fn main() -> gelf_broker::Result<()> {
//!     let config = Config::from_flags(
//!         PathBuf::from("/run/gelf-broker.sock"),
//!         "logs.example.com:12201".to_string(),
//!     );
//!     let (broker, _handle) = Broker::new(config, None, false)?;
//!     broker.run().await
//! }
//! ```

pub mod broker;
pub mod codec;
pub mod config;
pub mod listener;
pub mod metrics;
pub mod pidfile;
pub mod queue;
pub mod selflog;
pub mod spool;
pub mod status;
pub mod tls;
pub mod upstream;

pub use broker::{Broker, BrokerHandle, ControlEvent};
pub use config::Config;
pub use listener::{Listener, SocketSignature};
pub use metrics::{Metrics, StreamCounter};
pub use queue::MessageQueue;
pub use status::StatusSnapshot;
pub use upstream::{HostPort, Upstream, UpstreamState};

use thiserror::Error;

/// Client-library protocol revision this broker was built against.
pub const REQUIRED_CLIENT_PROTOCOL: u32 = 1;

/// Broker error taxonomy.
///
/// Hot-path errors (intake framing, upstream transport, spool I/O) are
/// handled locally in the loop and never surface here; this enum carries
/// the conditions that terminate or refuse startup, plus the per-module
/// sources wrapped for context.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Malformed config, missing required keys, unparseable endpoint
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Intake socket errors; the conflict variant is fatal
    #[error("listener error: {0}")]
    Listener(#[from] listener::ListenerError),

    /// Endpoint parsing and transport errors
    #[error("upstream error: {0}")]
    Upstream(#[from] upstream::UpstreamError),

    /// TLS material loading and handshake errors
    #[error("TLS error: {0}")]
    Tls(#[from] tls::TlsError),

    /// Spool open/lock/read/write failures
    #[error("spool error: {0}")]
    Spool(#[from] spool::SpoolError),

    /// Status file write failures
    #[error("status file error: {0}")]
    Status(#[from] status::StatusError),

    /// Pidfile contention and lock failures
    #[error("pidfile error: {0}")]
    PidFile(#[from] pidfile::PidFileError),

    /// Startup and shutdown sequencing errors
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    /// Everything else
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias used throughout the broker.
pub type Result<T> = std::result::Result<T, BrokerError>;

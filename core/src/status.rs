//! Status file writer.
//!
//! A YAML snapshot of the broker's state, written at startup, on every
//! `SIGUSR2`, and on config reload. The write is guarded by a `<path>~`
//! lockfile: created with exclusive-create plus an advisory lock, removed
//! once the payload is in place. Consumers use the same `<path>~` as a
//! rendezvous to request a fresh snapshot, so a pre-existing lockfile is
//! not an error; only a concurrently *locked* one is. Readers may observe
//! a half-written snapshot; the contract is best-effort.

use nix::fcntl::{Flock, FlockArg};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("status file I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("status serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("another status write is in progress")]
    WriterActive,
}

/// Intake-side state as reported to consumers.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ListenerStatus {
    pub socket: PathBuf,
    /// Hex-encoded device+inode signature, or null before the first bind.
    pub signature: Option<String>,
}

/// Upstream-side state as reported to consumers.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UpstreamStatus {
    /// Numeric connection state (0 unknown .. 4 shutdown).
    pub state: u8,
    pub hostport: String,
}

/// The status document.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusSnapshot {
    pub pid: u32,
    pub queue_len: usize,
    /// Wall-clock start time, RFC 3339.
    pub started: String,
    /// Monotonic seconds since startup.
    pub uptime_secs: u64,
    pub listener: ListenerStatus,
    pub socket: PathBuf,
    pub upstream: UpstreamStatus,
}

/// Write the snapshot under the `<path>~` rendezvous.
pub fn write(path: &Path, snapshot: &StatusSnapshot) -> Result<(), StatusError> {
    let lock_path = lockfile_path(path);

    let lock_file = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock_path)
    {
        Ok(file) => file,
        // A reader may have created the rendezvous to request this very
        // write; reuse it if nobody holds the lock.
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            OpenOptions::new().write(true).open(&lock_path)?
        }
        Err(e) => return Err(e.into()),
    };
    let _lock = Flock::lock(lock_file, FlockArg::LockExclusiveNonblock)
        .map_err(|_| StatusError::WriterActive)?;

    let payload = serde_yaml::to_string(snapshot)?;
    let mut out = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    out.write_all(payload.as_bytes())?;
    out.flush()?;

    std::fs::remove_file(&lock_path)?;
    debug!(path = %path.display(), "status file written");
    Ok(())
}

fn lockfile_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push("~");
    PathBuf::from(name)
}

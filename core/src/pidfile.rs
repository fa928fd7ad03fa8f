//! Pidfile management.
//!
//! A second broker instance must not start while the first is alive. The
//! pidfile carries the owner's decimal PID; staleness is probed through
//! `/proc` when available, falling back to a 0-signal `kill`. The live
//! file is created with exclusive-create semantics and held under an
//! exclusive advisory lock for the life of the process.

use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("pidfile I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("pidfile {path} is owned by live process {pid}")]
    ProcessAlive { path: PathBuf, pid: i32 },

    #[error("pidfile {path} already exists")]
    Contention { path: PathBuf },

    #[error("pidfile lock unavailable: {0}")]
    Locked(nix::errno::Errno),
}

/// An acquired pidfile. Dropping it unlinks the file.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    _lock: Flock<File>,
}

impl PidFile {
    /// Acquire the pidfile at `path`, clearing a stale one if its owner is
    /// gone. A live owner or a lost creation race is fatal.
    pub fn acquire(path: &Path) -> Result<Self, PidFileError> {
        if let Ok(contents) = std::fs::read_to_string(path) {
            match contents.trim().parse::<i32>() {
                Ok(pid) if process_alive(pid) => {
                    return Err(PidFileError::ProcessAlive {
                        path: path.to_path_buf(),
                        pid,
                    });
                }
                Ok(pid) => {
                    warn!(pid, path = %path.display(), "removing stale pidfile");
                    std::fs::remove_file(path)?;
                }
                Err(_) => {
                    warn!(path = %path.display(), "removing malformed pidfile");
                    std::fs::remove_file(path)?;
                }
            }
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    PidFileError::Contention {
                        path: path.to_path_buf(),
                    }
                } else {
                    PidFileError::Io(e)
                }
            })?;
        let lock = Flock::lock(file, FlockArg::LockExclusiveNonblock)
            .map_err(|(_, errno)| PidFileError::Locked(errno))?;

        let mut out: &File = &lock;
        out.write_all(std::process::id().to_string().as_bytes())?;
        out.flush()?;

        Ok(Self {
            path: path.to_path_buf(),
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to unlink pidfile");
        }
    }
}

fn process_alive(pid: i32) -> bool {
    if Path::new("/proc").is_dir() {
        Path::new(&format!("/proc/{}", pid)).exists()
    } else {
        kill(Pid::from_raw(pid), None).is_ok()
    }
}

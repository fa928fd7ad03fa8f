//! The Unix datagram intake socket.
//!
//! The listener owns the filesystem-resident socket: creation, permission
//! bits, and an integrity self-check. The socket file lives outside the
//! broker's control (an operator or a packaging script may remove or
//! replace it), so each check verifies existence, file type, the
//! device+inode signature captured at bind time, and that a probe datagram
//! still lands. Any failure triggers a rebind on the next tick; a probe
//! answered by a *different* live broker at bind time is fatal.

use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::UnixDatagram as StdUnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UnixDatagram;
use tracing::{debug, info, warn};

/// Largest intake datagram: 2-byte envelope plus a 16-bit payload.
pub const MAX_DATAGRAM: usize = u16::MAX as usize + 2;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("another live broker answers on {}", path.display())]
    Conflict { path: PathBuf },

    #[error("listener I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Filesystem identity of the bound socket file: device and inode
/// numbers, packed big-endian. A third party unlinking and recreating the
/// path produces a different signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketSignature([u8; 16]);

impl SocketSignature {
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let md = fs::symlink_metadata(path)?;
        let mut packed = [0u8; 16];
        packed[..8].copy_from_slice(&md.dev().to_be_bytes());
        packed[8..].copy_from_slice(&md.ino().to_be_bytes());
        Ok(Self(packed))
    }

    pub fn hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// The bound intake socket.
#[derive(Debug)]
pub struct Listener {
    socket: Arc<UnixDatagram>,
    path: PathBuf,
    signature: SocketSignature,
}

impl Listener {
    /// Bind the intake socket at `path`.
    ///
    /// An existing socket that answers a probe belongs to a live broker:
    /// binding over it is refused. Anything else at the path is unlinked
    /// first. `perms`, when given, is applied masked to the lower 9 bits.
    pub fn bind(path: &Path, perms: Option<u32>) -> Result<Self, ListenerError> {
        match fs::symlink_metadata(path) {
            Ok(md) => {
                if md.file_type().is_socket() && probe(path) {
                    return Err(ListenerError::Conflict {
                        path: path.to_path_buf(),
                    });
                }
                debug!(path = %path.display(), "unlinking stale socket path");
                fs::remove_file(path)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let std_socket = StdUnixDatagram::bind(path)?;
        if let Some(mode) = perms {
            fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o777))?;
        }
        std_socket.set_nonblocking(true)?;
        let socket = UnixDatagram::from_std(std_socket)?;
        let signature = SocketSignature::from_path(path)?;

        info!(path = %path.display(), signature = %signature.hex(), "intake socket bound");
        Ok(Self {
            socket: Arc::new(socket),
            path: path.to_path_buf(),
            signature,
        })
    }

    /// A clone of the socket handle for the receive loop.
    pub fn socket(&self) -> Arc<UnixDatagram> {
        Arc::clone(&self.socket)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn signature(&self) -> SocketSignature {
        self.signature
    }

    /// Integrity self-check: the path still exists, is a socket, carries
    /// the signature captured at bind, and answers a probe datagram.
    pub fn check(&self) -> bool {
        let md = match fs::symlink_metadata(&self.path) {
            Ok(md) => md,
            Err(_) => {
                warn!(path = %self.path.display(), "intake socket path is gone");
                return false;
            }
        };
        if !md.file_type().is_socket() {
            warn!(path = %self.path.display(), "intake socket path is not a socket");
            return false;
        }
        match SocketSignature::from_path(&self.path) {
            Ok(sig) if sig == self.signature => {}
            _ => {
                warn!(path = %self.path.display(), "intake socket signature drifted");
                return false;
            }
        }
        if !probe(&self.path) {
            warn!(path = %self.path.display(), "intake socket does not answer probes");
            return false;
        }
        true
    }

    /// Remove the socket file. Called only at shutdown or when the
    /// listening path moves on reload.
    pub fn unlink(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to unlink intake socket");
            }
        }
    }
}

/// Send a 1-byte liveness probe to `path`. The receiving broker drops it
/// without enqueuing.
fn probe(path: &Path) -> bool {
    StdUnixDatagram::unbound()
        .and_then(|s| s.send_to(&[0u8], path))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn bind_creates_socket_and_signature() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("intake.sock");

        let listener = Listener::bind(&path, None).unwrap();
        let md = fs::symlink_metadata(&path).unwrap();
        assert!(md.file_type().is_socket());
        assert_eq!(listener.signature().hex().len(), 32);
        assert!(listener.check());
    }

    #[tokio::test]
    async fn perms_are_masked_and_applied() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("intake.sock");

        let _listener = Listener::bind(&path, Some(0o7660)).unwrap();
        let mode = fs::symlink_metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o660);
    }

    #[tokio::test]
    async fn second_bind_on_live_socket_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("intake.sock");

        let _first = Listener::bind(&path, None).unwrap();
        assert!(matches!(
            Listener::bind(&path, None),
            Err(ListenerError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn stale_socket_file_is_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("intake.sock");

        // bind and drop: the socket file remains but nobody answers
        {
            let listener = Listener::bind(&path, None).unwrap();
            drop(listener);
        }
        assert!(path.exists());
        assert!(Listener::bind(&path, None).is_ok());
    }

    #[tokio::test]
    async fn signature_drift_fails_the_check() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("intake.sock");

        let listener = Listener::bind(&path, None).unwrap();
        assert!(listener.check());

        // a third party replaces the socket file out from under us
        fs::remove_file(&path).unwrap();
        let _other = StdUnixDatagram::bind(&path).unwrap();
        assert!(!listener.check());
    }

    #[tokio::test]
    async fn missing_path_fails_the_check() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("intake.sock");

        let listener = Listener::bind(&path, None).unwrap();
        fs::remove_file(&path).unwrap();
        assert!(!listener.check());
    }

    #[test]
    fn probe_reaches_a_bound_listener() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("intake.sock");
        let _receiver = StdUnixDatagram::bind(&path).unwrap();
        assert!(probe(&path));
    }
}

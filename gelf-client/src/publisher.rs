//! Datagram publisher for the broker's Unix intake socket.
//!
//! One record travels per datagram: a 16-bit big-endian length followed by
//! the GELF JSON payload. A single NUL byte is a liveness probe the broker
//! accepts without enqueuing; [`Publisher::probe`] sends one.

use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};

use crate::{ClientError, Record, Result, MAX_RECORD_LEN};

/// Sends framed records to a broker's intake socket.
#[derive(Debug)]
pub struct Publisher {
    socket: UnixDatagram,
    path: PathBuf,
}

impl Publisher {
    /// Connect an unbound datagram socket to the broker's intake path.
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<Self> {
        let socket = UnixDatagram::unbound()?;
        socket.connect(path.as_ref())?;
        Ok(Self {
            socket,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// The intake socket path this publisher is connected to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Frame and send a finished record.
    pub fn send_record(&self, record: &Record) -> Result<()> {
        self.send_raw(&record.to_bytes()?)
    }

    /// Frame and send an already-serialized GELF payload.
    pub fn send_raw(&self, payload: &[u8]) -> Result<()> {
        let datagram = frame(payload)?;
        self.socket.send(&datagram)?;
        Ok(())
    }

    /// Send a 1-byte liveness probe. The broker drops it without counting.
    pub fn probe(&self) -> Result<()> {
        self.socket.send(&[0u8])?;
        Ok(())
    }
}

/// Wrap a payload in the 16-bit big-endian length envelope.
pub fn frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_RECORD_LEN {
        return Err(ClientError::RecordTooLarge {
            size: payload.len(),
        });
    }
    let mut datagram = Vec::with_capacity(payload.len() + 2);
    datagram.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    datagram.extend_from_slice(payload);
    Ok(datagram)
}

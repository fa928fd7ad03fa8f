//! The crash-resilience spool file.
//!
//! A one-shot snapshot of the in-memory queue, written at lifecycle
//! boundaries and once per main tick: a 32-bit big-endian record count
//! followed by one {16-bit big-endian length, payload} entry per record.
//! Both directions take an exclusive non-blocking advisory lock; a held
//! lock means another process is mid-snapshot and this round is skipped.
//!
//! The spool is a hint, not a WAL: no fsync, no rename-swap. A torn write
//! costs at most one snapshot interval of records, and a crash-window
//! restore may duplicate delivery. Both are accepted.

use bytes::Bytes;
use nix::fcntl::{Flock, FlockArg};
use std::fs::OpenOptions;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("spool I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("spool lock unavailable: {0}")]
    Locked(nix::errno::Errno),
}

/// Read the spooled records back, oldest first.
///
/// A missing spool file is an empty spool. A short read mid-file abandons
/// the remaining entries with a warning and returns what was recovered.
pub fn load(path: &Path) -> Result<Vec<Bytes>, SpoolError> {
    let file = match OpenOptions::new().read(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let lock =
        Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| SpoolError::Locked(errno))?;

    let mut reader = BufReader::new(&*lock);

    let mut count_buf = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut count_buf) {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            warn!(path = %path.display(), "spool file truncated before count header");
            return Ok(Vec::new());
        }
        return Err(e.into());
    }
    let count = u32::from_be_bytes(count_buf) as usize;

    let mut records = Vec::with_capacity(count.min(4096));
    let mut len_buf = [0u8; 2];
    for slot in 0..count {
        match read_entry(&mut reader, &mut len_buf) {
            Ok(record) => records.push(record),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!(
                    path = %path.display(),
                    recovered = records.len(),
                    expected = count,
                    abandoned = count - slot,
                    "short read in spool, abandoning remaining records"
                );
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    debug!(path = %path.display(), records = records.len(), "spool restored");
    Ok(records)
}

fn read_entry(reader: &mut impl Read, len_buf: &mut [u8; 2]) -> io::Result<Bytes> {
    reader.read_exact(len_buf)?;
    let len = u16::from_be_bytes(*len_buf) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Bytes::from(payload))
}

/// Snapshot the queue to disk, truncating any previous snapshot.
///
/// Records too large for the 16-bit length field are skipped with a
/// warning before the count header is written, so the header always
/// matches the entries that follow.
pub fn save<'a, I>(path: &Path, records: I) -> Result<(), SpoolError>
where
    I: IntoIterator<Item = &'a Bytes>,
{
    let keep: Vec<&Bytes> = records
        .into_iter()
        .filter(|r| {
            if r.len() > u16::MAX as usize {
                warn!(len = r.len(), "record too large for spool entry, skipping");
                return false;
            }
            true
        })
        .collect();

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    let lock =
        Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| SpoolError::Locked(errno))?;

    let mut writer = BufWriter::new(&*lock);
    writer.write_all(&(keep.len() as u32).to_be_bytes())?;
    for record in &keep {
        writer.write_all(&(record.len() as u16).to_be_bytes())?;
        writer.write_all(record)?;
    }
    writer.flush()?;

    debug!(path = %path.display(), records = keep.len(), "spool saved");
    Ok(())
}

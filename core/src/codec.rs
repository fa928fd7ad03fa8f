//! Wire framing for both sides of the broker.
//!
//! Intake (Unix datagram): exactly one record per datagram, prefixed by a
//! 16-bit big-endian length. A datagram whose declared length plus the
//! 2-byte prefix does not equal its received size is malformed.
//!
//! Upstream (TCP): the raw record bytes terminated by a single NUL byte.
//! GELF documents are JSON and never contain embedded NULs, so the NUL is
//! the sole delimiter. Keep-alives are the minimal well-formed document
//! `{}` plus NUL.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Keep-alive frame written on idle ticks while connected.
pub const KEEPALIVE_FRAME: &[u8] = b"{}\x00";

#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("datagram of {got} bytes does not match declared length {declared} + 2")]
    LengthMismatch { declared: usize, got: usize },
}

/// Decode one intake datagram.
///
/// Returns `Ok(None)` for liveness probes (datagrams of at most one byte)
/// and for decoded records too short to be useful; these are dropped
/// without counting as messages.
pub fn decode_datagram(buf: &[u8]) -> Result<Option<Bytes>, CodecError> {
    if buf.len() <= 1 {
        return Ok(None);
    }
    let declared = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if declared + 2 != buf.len() {
        return Err(CodecError::LengthMismatch {
            declared,
            got: buf.len(),
        });
    }
    if declared <= 1 {
        return Ok(None);
    }
    Ok(Some(Bytes::copy_from_slice(&buf[2..])))
}

/// Encode a record into the NUL-terminated upstream frame.
pub fn encode_frame(record: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(record.len() + 1);
    frame.put_slice(record);
    frame.put_u8(0);
    frame.freeze()
}

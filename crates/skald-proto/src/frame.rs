//! Length-prefixed framing.
//!
//! Each frame is a u32 big-endian byte count followed by that many
//! bytes of JSON. The reader enforces an upper bound on the announced
//! length so a corrupt prefix cannot trigger an unbounded allocation.

use crate::error::ProtoError;
use std::io::{Read, Write};

/// Writes one frame: length prefix plus body.
///
/// # Errors
///
/// Returns any underlying I/O error; the stream should be considered
/// broken after a partial write.
pub fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(body.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame body exceeds u32")
    })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(body)?;
    writer.flush()
}

/// Reads one frame body.
///
/// Returns `Ok(None)` on clean end-of-stream (EOF at a frame
/// boundary). EOF in the middle of a frame is an error.
///
/// # Errors
///
/// [`ProtoError::FrameTooLarge`] when the announced length exceeds
/// `max_len`; [`ProtoError::Io`] on stream failure.
pub fn read_frame<R: Read>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>, ProtoError> {
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(ProtoError::Io(e)),
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_len {
        return Err(ProtoError::FrameTooLarge { len, max: max_len });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(body))
}

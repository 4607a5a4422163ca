//! Length framing shared by every record in every archive file.
//!
//! A framed record is `len | body | len`, both length words big-endian and
//! counting the whole frame. The trailing copy lets a reader detect a torn
//! write or a misaligned scan.

use crate::record::codec::DecodeError;
use std::io::{self, Read, Write};

/// Bytes of framing around every record body.
pub const FRAME_OVERHEAD: usize = 8;

/// Reads one framed record body.
///
/// Returns `Ok(None)` on a clean end of stream before the first length word.
/// Anything else that is short or inconsistent is a [`FrameError::Corrupt`].
pub fn read_record<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, FrameError> {
    let mut head = [0u8; 4];
    let got = read_full(reader, &mut head)?;
    if got == 0 {
        return Ok(None);
    }
    if got < head.len() {
        return Err(FrameError::corrupt(format!(
            "truncated length word ({got} of 4 bytes)"
        )));
    }

    let len = u32::from_be_bytes(head) as usize;
    if len < FRAME_OVERHEAD {
        return Err(FrameError::corrupt(format!(
            "record length {len} smaller than framing"
        )));
    }

    let body_len = len - FRAME_OVERHEAD;
    let mut body = Vec::with_capacity(body_len.min(64 * 1024));
    reader.take(body_len as u64).read_to_end(&mut body)?;
    if body.len() < body_len {
        return Err(FrameError::corrupt(format!(
            "truncated body: expected {body_len} bytes, found {}",
            body.len()
        )));
    }

    let mut tail = [0u8; 4];
    if read_full(reader, &mut tail)? < tail.len() {
        return Err(FrameError::corrupt("missing trailing length word"));
    }
    let trailer = u32::from_be_bytes(tail) as usize;
    if trailer != len {
        return Err(FrameError::corrupt(format!(
            "length mismatch: header {len}, trailer {trailer}"
        )));
    }

    Ok(Some(body))
}

/// Writes one framed record and returns the number of bytes written.
pub fn write_record<W: Write>(writer: &mut W, body: &[u8]) -> io::Result<u64> {
    let len = u32::try_from(body.len() + FRAME_OVERHEAD).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("record body of {} bytes is too large to frame", body.len()),
        )
    })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(body)?;
    writer.write_all(&len.to_be_bytes())?;
    Ok(u64::from(len))
}

/// Errors from reading a framed record.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame itself is damaged.
    #[error(transparent)]
    Corrupt(#[from] DecodeError),
    /// The underlying read failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FrameError {
    fn corrupt(reason: impl Into<String>) -> Self {
        Self::Corrupt(DecodeError::new(reason))
    }
}

/// Fills `buf` as far as the stream allows, returning the byte count.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

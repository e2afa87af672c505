//! Length-prefixed UTF-8 text frames: a little-endian `u32` length, then the bytes.

use thiserror::Error;

const HEADER: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {needed} bytes does not fit a {capacity} byte buffer")]
    TooLarge { needed: usize, capacity: usize },
    #[error("truncated frame")]
    Truncated,
    #[error("frame is not valid UTF-8")]
    NotUtf8,
}

/// Writes `text` into `buf` and returns the number of bytes used.
pub fn encode(buf: &mut [u8], text: &str) -> Result<usize, FrameError> {
    let needed = HEADER + text.len();
    let len = u32::try_from(text.len()).map_err(|_| FrameError::TooLarge {
        needed,
        capacity: buf.len(),
    })?;
    if needed > buf.len() {
        return Err(FrameError::TooLarge {
            needed,
            capacity: buf.len(),
        });
    }
    buf[..HEADER].copy_from_slice(&len.to_le_bytes());
    buf[HEADER..needed].copy_from_slice(text.as_bytes());
    Ok(needed)
}

pub fn decode(buf: &[u8]) -> Result<&str, FrameError> {
    let header: [u8; HEADER] = buf
        .get(..HEADER)
        .and_then(|raw| raw.try_into().ok())
        .ok_or(FrameError::Truncated)?;
    let len = usize::try_from(u32::from_le_bytes(header)).map_err(|_| FrameError::Truncated)?;
    let body = HEADER
        .checked_add(len)
        .and_then(|end| buf.get(HEADER..end))
        .ok_or(FrameError::Truncated)?;
    std::str::from_utf8(body).map_err(|_| FrameError::NotUtf8)
}

//! Priority frame codec.
//!
//! A frame is the smallest self-delimited unit on a channel:
//!
//! ```text
//! Byte 0:
//! ---------------------------
//! | 7  6  5  4 | 3  2  1  0 |
//! ---------------------------
//! |    (M)     |    (Pr)    |
//! ---------------------------
//! (M)  - Magic number (0101).
//! (Pr) - Priority (0 - max, 15 - min).
//!
//! Bytes 1..2: payload byte count, big endian.
//! ```
//!
//! The reader can demultiplex priority streams without holding parser state
//! across frames, and the magic nibble catches stream corruption early.

use crate::support::{ErrorType, NetworkError, NetworkResult};
use byteorder::{BigEndian, ByteOrder};

pub const HEADER_SIZE: usize = 3;
pub const MAX_PAYLOAD: usize = u16::max_value() as usize;

const MAGIC: u8 = 0b0101;

/// Header of one complete frame sitting at the start of a raw buffer.
#[derive(Debug, Eq, PartialEq)]
pub struct Frame {
    pub priority: usize,
    pub payload_size: usize,
}

impl Frame {
    /// Total frame size including the header.
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload_size
    }
}

/// Appends a frame carrying `payload` at `priority` to `out`.
/// The payload must fit a single frame; the writer queue slices its chunks
/// accordingly before packing.
pub fn pack(priority: usize, payload: &[u8], out: &mut Vec<u8>) {
    debug_assert!(priority < 16);
    debug_assert!(payload.len() <= MAX_PAYLOAD);

    let mut size = [0u8; 2];
    BigEndian::write_u16(&mut size, payload.len() as u16);

    out.reserve(HEADER_SIZE + payload.len());
    out.push((MAGIC << 4) | (priority as u8 & 0x0F));
    out.extend_from_slice(&size);
    out.extend_from_slice(payload);
}

/// Parses the frame at the start of `data`.
///
/// Returns `Ok(None)` while the buffer holds less than one complete frame,
/// `Ok(Some(frame))` once header and payload are fully present, and a fatal
/// error when the magic nibble does not match.
pub fn parse(data: &[u8]) -> NetworkResult<Option<Frame>> {
    if !data.is_empty() {
        let magic = (data[0] >> 4) & 0x0F;

        if magic != MAGIC {
            return Err(NetworkError::Fatal(ErrorType::Corrupt));
        }
    }

    if data.len() < HEADER_SIZE {
        return Ok(None);
    }

    let priority = (data[0] & 0x0F) as usize;
    let payload_size = BigEndian::read_u16(&data[1..3]) as usize;

    if data.len() < HEADER_SIZE + payload_size {
        return Ok(None);
    }

    Ok(Some(Frame {
        priority,
        payload_size,
    }))
}

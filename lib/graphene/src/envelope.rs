//! Guarded byte envelope shared by the ancillary stream patterns:
//! `0xBE <u32 size BE> <payload> 0xED`.
//!
//! The guard bytes let a receiver resynchronize after stream corruption
//! instead of trusting the length field alone.

use crate::support::{ErrorType, NetworkError, NetworkResult};
use byteorder::{BigEndian, ByteOrder};

pub const BEGIN: u8 = 0xBE;
pub const END: u8 = 0xED;

const OVERHEAD: usize = 6;

/// Maximum payload one envelope may carry.
pub const MAX_PAYLOAD: usize = 1 << 26;

/// Wraps a payload in envelope guards.
pub fn seal(payload: &[u8], out: &mut Vec<u8>) {
    debug_assert!(payload.len() <= MAX_PAYLOAD);

    let mut size = [0u8; 4];
    BigEndian::write_u32(&mut size, payload.len() as u32);

    out.reserve(OVERHEAD + payload.len());
    out.push(BEGIN);
    out.extend_from_slice(&size);
    out.extend_from_slice(payload);
    out.push(END);
}

/// Parsed envelope at the head of a raw buffer.
#[derive(Debug, Eq, PartialEq)]
pub struct Envelope {
    pub payload_size: usize,
}

impl Envelope {
    #[inline]
    pub fn size(&self) -> usize {
        OVERHEAD + self.payload_size
    }

    /// The payload slice within the raw bytes this envelope was parsed from.
    #[inline]
    pub fn payload<'a>(&self, raw: &'a [u8]) -> &'a [u8] {
        &raw[5..5 + self.payload_size]
    }
}

/// Parses the envelope at the start of `data`. `Ok(None)` while incomplete;
/// bad guard bytes are fatal.
pub fn open(data: &[u8]) -> NetworkResult<Option<Envelope>> {
    if data.is_empty() {
        return Ok(None);
    }

    if data[0] != BEGIN {
        return Err(NetworkError::Fatal(ErrorType::Corrupt));
    }

    if data.len() < 5 {
        return Ok(None);
    }

    let payload_size = BigEndian::read_u32(&data[1..5]) as usize;

    if payload_size > MAX_PAYLOAD {
        return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
    }

    if data.len() < OVERHEAD + payload_size {
        return Ok(None);
    }

    if data[5 + payload_size] != END {
        return Err(NetworkError::Fatal(ErrorType::Corrupt));
    }

    Ok(Some(Envelope { payload_size }))
}

//! Receiver-side reassembly of one segmented message.

use crate::identity::{MessageId, SerialNumber};
use crate::support::{ErrorType, NetworkError, NetworkResult};

/// Collects the parts of one inbound message into a preallocated payload.
/// Duplicate parts are ignored; completion hands the payload out exactly
/// once via `take_payload`.
pub struct MultipartAssembler {
    msgid: MessageId,
    total_size: u64,
    part_size: u32,
    first_sn: SerialNumber,
    last_sn: SerialNumber,
    received: Vec<bool>,
    received_bytes: u64,
    payload: Vec<u8>,
}

impl MultipartAssembler {
    pub fn new(
        msgid: MessageId,
        total_size: u64,
        part_size: u32,
        first_sn: SerialNumber,
        last_sn: SerialNumber,
    ) -> NetworkResult<MultipartAssembler> {
        if part_size == 0 || first_sn == 0 || last_sn < first_sn {
            return Err(NetworkError::Fatal(ErrorType::Corrupt));
        }

        let nparts = (last_sn - first_sn + 1) as usize;
        let covers = (nparts as u64) * part_size as u64;

        // The advertised geometry must cover the payload and not overshoot
        // by more than one part. An empty message is exactly one part.
        if covers < total_size
            || (total_size > 0 && total_size + part_size as u64 <= covers)
            || (total_size == 0 && nparts != 1)
        {
            return Err(NetworkError::Fatal(ErrorType::Corrupt));
        }

        Ok(MultipartAssembler {
            msgid,
            total_size,
            part_size,
            first_sn,
            last_sn,
            received: vec![false; nparts],
            received_bytes: 0,
            payload: vec![0; total_size as usize],
        })
    }

    #[inline]
    pub fn msgid(&self) -> MessageId {
        self.msgid
    }

    #[inline]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    #[inline]
    pub fn received_size(&self) -> u64 {
        self.received_bytes
    }

    #[inline]
    pub fn first_sn(&self) -> SerialNumber {
        self.first_sn
    }

    /// True when the packet geometry matches this assembler.
    pub fn geometry_matches(
        &self,
        first_sn: SerialNumber,
        last_sn: SerialNumber,
        part_size: u32,
    ) -> bool {
        self.first_sn == first_sn && self.last_sn == last_sn && self.part_size == part_size
    }

    /// Stores one part. Returns true when the part was new.
    pub fn emplace(&mut self, sn: SerialNumber, chunk: &[u8]) -> NetworkResult<bool> {
        if sn < self.first_sn || sn > self.last_sn {
            return Err(NetworkError::Fatal(ErrorType::Corrupt));
        }

        let index = (sn - self.first_sn) as usize;

        if self.received[index] {
            return Ok(false);
        }

        let offset = index * self.part_size as usize;

        if offset + chunk.len() > self.payload.len() {
            return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
        }

        // Every part but the last must fill its slot exactly.
        let expected = if sn == self.last_sn {
            self.payload.len() - offset
        } else {
            self.part_size as usize
        };

        if chunk.len() != expected {
            return Err(NetworkError::Fatal(ErrorType::Corrupt));
        }

        self.payload[offset..offset + chunk.len()].copy_from_slice(chunk);
        self.received[index] = true;
        self.received_bytes += chunk.len() as u64;

        Ok(true)
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.received.iter().all(|&received| received)
    }

    pub fn take_payload(self) -> Vec<u8> {
        debug_assert!(self.is_complete());
        self.payload
    }
}

//! Byte-oriented wire codec.
//!
//! `WireWriter` appends big-endian primitives to a growable buffer.
//! `WireReader` peeks the same primitives with transactional semantics: a
//! sequence of reads between `start_transaction` and `commit_transaction`
//! either advances the cursor as a whole or, when any read ran short, is
//! rolled back so a later call can retry once more bytes arrived.

use crate::support::{ErrorType, NetworkError, NetworkResult};
use byteorder::{BigEndian, ByteOrder};

pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    #[inline]
    pub fn new() -> WireWriter {
        WireWriter { buf: Vec::new() }
    }

    #[inline]
    pub fn with_capacity(capacity: usize) -> WireWriter {
        WireWriter {
            buf: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Consumes the writer and yields the serialized bytes.
    #[inline]
    pub fn take(self) -> Vec<u8> {
        self.buf
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    #[inline]
    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    #[inline]
    pub fn put_u16(&mut self, value: u16) {
        let mut raw = [0u8; 2];
        BigEndian::write_u16(&mut raw, value);
        self.buf.extend_from_slice(&raw);
    }

    #[inline]
    pub fn put_u32(&mut self, value: u32) {
        let mut raw = [0u8; 4];
        BigEndian::write_u32(&mut raw, value);
        self.buf.extend_from_slice(&raw);
    }

    #[inline]
    pub fn put_u64(&mut self, value: u64) {
        let mut raw = [0u8; 8];
        BigEndian::write_u64(&mut raw, value);
        self.buf.extend_from_slice(&raw);
    }

    /// 128-bit identifier, high half first.
    #[inline]
    pub fn put_u128(&mut self, value: u128) {
        self.put_u64((value >> 64) as u64);
        self.put_u64(value as u64);
    }

    /// Fixed-length blob, no length prefix.
    #[inline]
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Blob with a u8 length prefix. Longer input is a caller error.
    #[inline]
    pub fn put_blob8(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= u8::max_value() as usize);
        self.put_u8(bytes.len() as u8);
        self.put_bytes(bytes);
    }

    /// Blob with a u32 length prefix.
    #[inline]
    pub fn put_blob32(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.put_bytes(bytes);
    }
}

pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
    mark: usize,
}

impl<'a> WireReader<'a> {
    #[inline]
    pub fn new(buf: &'a [u8]) -> WireReader<'a> {
        WireReader { buf, pos: 0, mark: 0 }
    }

    /// Bytes not yet consumed by a committed transaction.
    #[inline]
    pub fn available(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Position of the last committed transaction boundary.
    #[inline]
    pub fn committed(&self) -> usize {
        self.mark
    }

    /// Marks the current cursor as the rollback point.
    #[inline]
    pub fn start_transaction(&mut self) {
        self.mark = self.pos;
    }

    /// Keeps everything read since `start_transaction`.
    #[inline]
    pub fn commit_transaction(&mut self) {
        self.mark = self.pos;
    }

    /// Rewinds to the rollback point.
    #[inline]
    pub fn rollback(&mut self) {
        self.pos = self.mark;
    }

    #[inline]
    fn need(&self, count: usize) -> NetworkResult<()> {
        if self.buf.len() - self.pos < count {
            Err(NetworkError::Wait)
        } else {
            Ok(())
        }
    }

    #[inline]
    pub fn get_u8(&mut self) -> NetworkResult<u8> {
        self.need(1)?;
        let value = self.buf[self.pos];
        self.pos += 1;
        Ok(value)
    }

    #[inline]
    pub fn get_u16(&mut self) -> NetworkResult<u16> {
        self.need(2)?;
        let value = BigEndian::read_u16(&self.buf[self.pos..]);
        self.pos += 2;
        Ok(value)
    }

    #[inline]
    pub fn get_u32(&mut self) -> NetworkResult<u32> {
        self.need(4)?;
        let value = BigEndian::read_u32(&self.buf[self.pos..]);
        self.pos += 4;
        Ok(value)
    }

    #[inline]
    pub fn get_u64(&mut self) -> NetworkResult<u64> {
        self.need(8)?;
        let value = BigEndian::read_u64(&self.buf[self.pos..]);
        self.pos += 8;
        Ok(value)
    }

    #[inline]
    pub fn get_u128(&mut self) -> NetworkResult<u128> {
        let high = self.get_u64()?;
        let low = self.get_u64()?;
        Ok(((high as u128) << 64) | low as u128)
    }

    /// Fixed-length blob.
    #[inline]
    pub fn get_bytes(&mut self, count: usize) -> NetworkResult<Vec<u8>> {
        self.need(count)?;
        let bytes = self.buf[self.pos..self.pos + count].to_vec();
        self.pos += count;
        Ok(bytes)
    }

    /// Blob with a u8 length prefix.
    #[inline]
    pub fn get_blob8(&mut self) -> NetworkResult<Vec<u8>> {
        let count = self.get_u8()? as usize;
        self.get_bytes(count)
    }

    /// Blob with a u32 length prefix, bounded to keep a corrupt length from
    /// looking like a short read forever.
    #[inline]
    pub fn get_blob32(&mut self, max: usize) -> NetworkResult<Vec<u8>> {
        let count = self.get_u32()? as usize;

        if count > max {
            return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
        }

        self.get_bytes(count)
    }
}

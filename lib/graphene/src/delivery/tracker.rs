//! Sender-side state for one in-flight segmented message.

use crate::delivery::packet::{MessagePacket, PartPacket};
use crate::identity::{MessageId, SerialNumber};
use std::time::{Duration, Instant};

/// Tracks which parts of one outbound message have been sent and which are
/// acknowledged. The tracker is complete once every part is acknowledged;
/// the send cursor walks the serial range once and, after the retry timeout,
/// returns to the lowest unacknowledged part.
pub struct MultipartTracker {
    msgid: MessageId,
    priority: usize,
    force_checksum: bool,
    part_size: u32,
    first_sn: SerialNumber,
    last_sn: SerialNumber,
    payload: Vec<u8>,
    acked: Vec<bool>,
    cursor: SerialNumber,
    last_send: Instant,
}

impl MultipartTracker {
    pub fn new(
        msgid: MessageId,
        priority: usize,
        force_checksum: bool,
        part_size: u32,
        first_sn: SerialNumber,
        payload: Vec<u8>,
    ) -> MultipartTracker {
        debug_assert!(part_size > 0);
        debug_assert!(first_sn > 0);

        let nparts = Self::part_count_for(payload.len(), part_size);

        MultipartTracker {
            msgid,
            priority,
            force_checksum,
            part_size,
            first_sn,
            last_sn: first_sn + nparts as u64 - 1,
            payload,
            acked: vec![false; nparts],
            cursor: first_sn,
            last_send: Instant::now(),
        }
    }

    /// Number of parts a payload of `len` bytes occupies; an empty message
    /// still takes one part.
    pub fn part_count_for(len: usize, part_size: u32) -> usize {
        let nparts = (len + part_size as usize - 1) / part_size as usize;
        nparts.max(1)
    }

    #[inline]
    pub fn msgid(&self) -> MessageId {
        self.msgid
    }

    #[inline]
    pub fn priority(&self) -> usize {
        self.priority
    }

    #[inline]
    pub fn force_checksum(&self) -> bool {
        self.force_checksum
    }

    #[inline]
    pub fn first_sn(&self) -> SerialNumber {
        self.first_sn
    }

    #[inline]
    pub fn last_sn(&self) -> SerialNumber {
        self.last_sn
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.acked.iter().all(|&acked| acked)
    }

    fn chunk(&self, sn: SerialNumber) -> &[u8] {
        let index = (sn - self.first_sn) as usize;
        let offset = index * self.part_size as usize;
        let end = (offset + self.part_size as usize).min(self.payload.len());

        &self.payload[offset.min(self.payload.len())..end]
    }

    fn lowest_unacked(&self) -> Option<SerialNumber> {
        self.acked
            .iter()
            .position(|&acked| !acked)
            .map(|index| self.first_sn + index as u64)
    }

    /// Picks the next serial number to transmit: unsent parts first, and
    /// once the whole range was walked and `retry_after` elapsed without
    /// completion, the lowest unacknowledged part again.
    pub fn acquire_next(&mut self, now: Instant, retry_after: Duration) -> Option<SerialNumber> {
        if self.cursor > self.last_sn {
            if self.is_complete() || now.duration_since(self.last_send) < retry_after {
                return None;
            }

            self.cursor = self.lowest_unacked().expect("incomplete tracker without gaps");
        }

        // Skip parts acknowledged out of order.
        while self.cursor <= self.last_sn {
            let index = (self.cursor - self.first_sn) as usize;

            if !self.acked[index] {
                let sn = self.cursor;
                self.cursor += 1;
                self.last_send = now;
                return Some(sn);
            }

            self.cursor += 1;
        }

        None
    }

    /// Rewinds the cursor to the lowest unacknowledged part. Used after a
    /// resynchronization.
    pub fn reset_cursor(&mut self) {
        self.cursor = self.lowest_unacked().unwrap_or(self.last_sn + 1);
    }

    /// Marks one part acknowledged. False when the serial number is outside
    /// this tracker or was already acknowledged.
    pub fn acknowledge(&mut self, sn: SerialNumber) -> bool {
        if sn < self.first_sn || sn > self.last_sn {
            return false;
        }

        let index = (sn - self.first_sn) as usize;

        if self.acked[index] {
            return false;
        }

        self.acked[index] = true;
        true
    }

    /// Serializes the packet for `sn`: a MESSAGE for the heading part, a
    /// PART otherwise.
    pub fn serialize_part(&self, sn: SerialNumber) -> Vec<u8> {
        debug_assert!(sn >= self.first_sn && sn <= self.last_sn);

        let chunk = self.chunk(sn).to_vec();

        if sn == self.first_sn {
            MessagePacket {
                sn,
                msgid: self.msgid,
                total_size: self.payload.len() as u64,
                part_size: self.part_size,
                last_sn: self.last_sn,
                chunk,
            }
            .serialize()
        } else {
            PartPacket { sn, chunk }.serialize()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RETRY: Duration = Duration::from_secs(3);

    fn tracker(len: usize, part_size: u32, first_sn: SerialNumber) -> MultipartTracker {
        let payload: Vec<u8> = (0..len).map(|byte| byte as u8).collect();
        MultipartTracker::new(MessageId(1), 0, false, part_size, first_sn, payload)
    }

    #[test]
    fn test_part_count() {
        assert_eq!(MultipartTracker::part_count_for(0, 16), 1);
        assert_eq!(MultipartTracker::part_count_for(16, 16), 1);
        assert_eq!(MultipartTracker::part_count_for(17, 16), 2);
        assert_eq!(MultipartTracker::part_count_for(1024, 16), 64);
    }

    #[test]
    fn test_serial_range() {
        let t = tracker(100, 16, 10);

        assert_eq!(t.first_sn(), 10);
        assert_eq!(t.last_sn(), 16);
    }

    #[test]
    fn test_sequential_acquisition() {
        let mut t = tracker(40, 16, 1);
        let now = Instant::now();

        assert_eq!(t.acquire_next(now, RETRY), Some(1));
        assert_eq!(t.acquire_next(now, RETRY), Some(2));
        assert_eq!(t.acquire_next(now, RETRY), Some(3));
        assert_eq!(t.acquire_next(now, RETRY), None);
    }

    #[test]
    fn test_retry_after_timeout() {
        let mut t = tracker(40, 16, 1);
        let now = Instant::now();

        while t.acquire_next(now, RETRY).is_some() {}

        t.acknowledge(1);
        t.acknowledge(3);

        // Nothing resent before the retry window elapses.
        assert_eq!(t.acquire_next(now + Duration::from_secs(1), RETRY), None);

        // The single unacknowledged part comes back.
        assert_eq!(t.acquire_next(now + Duration::from_secs(4), RETRY), Some(2));
    }

    #[test]
    fn test_completion() {
        let mut t = tracker(40, 16, 5);

        assert!(!t.is_complete());
        assert!(t.acknowledge(5));
        assert!(t.acknowledge(6));
        assert!(!t.is_complete());
        assert!(t.acknowledge(7));
        assert!(t.is_complete());
    }

    #[test]
    fn test_acknowledge_bounds_and_duplicates() {
        let mut t = tracker(40, 16, 5);

        assert!(!t.acknowledge(4));
        assert!(!t.acknowledge(8));
        assert!(t.acknowledge(6));
        assert!(!t.acknowledge(6));
    }

    #[test]
    fn test_reset_cursor_resends_unacked() {
        let mut t = tracker(48, 16, 1);
        let now = Instant::now();

        while t.acquire_next(now, RETRY).is_some() {}
        t.acknowledge(2);
        t.reset_cursor();

        assert_eq!(t.acquire_next(now, RETRY), Some(1));
        // Part 2 is acknowledged and gets skipped.
        assert_eq!(t.acquire_next(now, RETRY), Some(3));
        assert_eq!(t.acquire_next(now, RETRY), None);
    }

    #[test]
    fn test_heading_part_is_message_packet() {
        let t = tracker(40, 16, 1);

        let heading = t.serialize_part(1);
        let tail = t.serialize_part(2);

        // Type nibble: MESSAGE = 2, PART = 4.
        assert_eq!(heading[0] & 0x0F, 2);
        assert_eq!(tail[0] & 0x0F, 4);
    }

    #[test]
    fn test_last_chunk_is_short() {
        let t = tracker(40, 16, 1);

        assert_eq!(t.chunk(1).len(), 16);
        assert_eq!(t.chunk(2).len(), 16);
        assert_eq!(t.chunk(3).len(), 8);
    }

    #[test]
    fn test_empty_message_has_one_part() {
        let mut t = tracker(0, 16, 1);
        let now = Instant::now();

        assert_eq!(t.first_sn(), t.last_sn());
        assert_eq!(t.acquire_next(now, RETRY), Some(1));
        assert!(t.chunk(1).is_empty());
        assert!(t.acknowledge(1));
        assert!(t.is_complete());
    }
}

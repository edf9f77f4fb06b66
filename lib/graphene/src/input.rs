//! Inbound byte demultiplexing.
//!
//! Arriving chunks accumulate in a raw buffer per socket. Complete priority
//! frames are peeled off and their payloads appended to the per-priority
//! buffer the frame names; complete packets are then extracted from each
//! priority buffer. A payload byte lands in exactly one priority buffer and
//! is consumed exactly once.

use crate::frame;
use crate::identity::SocketId;
use crate::packet::{self, Packet};
use crate::support::{ErrorType, NetworkError, NetworkResult};
use crate::wire::WireReader;
use hashbrown::HashMap;

pub struct InputAccount {
    raw: Vec<u8>,
    lanes: Vec<Vec<u8>>,
}

impl InputAccount {
    pub fn new(priority_count: usize) -> InputAccount {
        InputAccount {
            raw: Vec::new(),
            lanes: (0..priority_count).map(|_| Vec::new()).collect(),
        }
    }

    /// Appends freshly received bytes and demultiplexes every complete frame
    /// into its priority lane.
    pub fn append_chunk(&mut self, chunk: &[u8]) -> NetworkResult<()> {
        self.raw.extend_from_slice(chunk);

        loop {
            match frame::parse(&self.raw)? {
                Some(parsed) => {
                    if parsed.priority >= self.lanes.len() {
                        return Err(NetworkError::Fatal(ErrorType::Corrupt));
                    }

                    self.lanes[parsed.priority]
                        .extend_from_slice(&self.raw[frame::HEADER_SIZE..parsed.size()]);
                    self.raw.drain(..parsed.size());
                }
                None => return Ok(()),
            }
        }
    }

    /// Extracts every complete packet out of the priority lanes. Incomplete
    /// tails stay in place for the next chunk.
    pub fn drain_packets(&mut self, out: &mut Vec<(usize, Packet)>) -> NetworkResult<()> {
        for (priority, lane) in self.lanes.iter_mut().enumerate() {
            if lane.is_empty() {
                continue;
            }

            let consumed;
            {
                let mut input = WireReader::new(&lane[..]);

                loop {
                    match packet::read_packet(&mut input)? {
                        Some(parsed) => out.push((priority, parsed)),
                        None => break,
                    }
                }

                consumed = input.committed();
            }

            lane.drain(..consumed);
        }

        Ok(())
    }

    #[cfg(test)]
    fn lane_len(&self, priority: usize) -> usize {
        self.lanes[priority].len()
    }
}

/// Per-socket input accounts of one channel.
pub struct InputRegistry {
    priority_count: usize,
    accounts: HashMap<SocketId, InputAccount>,
}

impl InputRegistry {
    pub fn new(priority_count: usize) -> InputRegistry {
        InputRegistry {
            priority_count,
            accounts: HashMap::new(),
        }
    }

    pub fn add(&mut self, sid: SocketId) {
        self.accounts
            .insert(sid, InputAccount::new(self.priority_count));
    }

    pub fn remove(&mut self, sid: SocketId) {
        self.accounts.remove(&sid);
    }

    /// Feeds a received chunk through the account and collects the packets
    /// that became complete.
    pub fn process(
        &mut self,
        sid: SocketId,
        chunk: &[u8],
        out: &mut Vec<(usize, Packet)>,
    ) -> NetworkResult<()> {
        let account = match self.accounts.get_mut(&sid) {
            Some(account) => account,
            // Late data for a socket already being torn down.
            None => return Ok(()),
        };

        account.append_chunk(chunk)?;
        account.drain_packets(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeId;
    use crate::packet::{AlivePacket, DomesticPacket, HeartbeatPacket};

    fn framed(priority: usize, payload: &[u8]) -> Vec<u8> {
        let mut raw = Vec::new();
        frame::pack(priority, payload, &mut raw);
        raw
    }

    #[test]
    fn test_single_packet_through() {
        let mut account = InputAccount::new(2);
        let packet_bytes = HeartbeatPacket { health: 1 }.serialize();

        account.append_chunk(&framed(0, &packet_bytes)).unwrap();

        let mut out = Vec::new();
        account.drain_packets(&mut out).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, 0);
        match &out[0].1 {
            Packet::Heartbeat(parsed) => assert_eq!(parsed.health, 1),
            other => panic!("Unexpected packet {:?}", other),
        }
        assert_eq!(account.lane_len(0), 0);
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let mut account = InputAccount::new(2);
        let packet_bytes = AlivePacket { id: NodeId::new(0, 9) }.serialize();
        let raw = framed(1, &packet_bytes);

        let mut out = Vec::new();

        account.append_chunk(&raw[..2]).unwrap();
        account.drain_packets(&mut out).unwrap();
        assert!(out.is_empty());

        account.append_chunk(&raw[2..]).unwrap();
        account.drain_packets(&mut out).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, 1);
    }

    #[test]
    fn test_packet_split_across_frames() {
        // One packet carried by two frames of the same priority.
        let mut account = InputAccount::new(2);
        let packet_bytes = DomesticPacket::serialize(&[7u8; 64], false);
        let split = packet_bytes.len() / 2;

        let mut out = Vec::new();

        account.append_chunk(&framed(0, &packet_bytes[..split])).unwrap();
        account.drain_packets(&mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(account.lane_len(0), split);

        account.append_chunk(&framed(0, &packet_bytes[split..])).unwrap();
        account.drain_packets(&mut out).unwrap();

        assert_eq!(out.len(), 1);
        match &out[0].1 {
            Packet::Domestic(parsed) => assert_eq!(parsed.bytes, vec![7u8; 64]),
            other => panic!("Unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_priority_demux() {
        let mut account = InputAccount::new(3);
        let high = HeartbeatPacket { health: 0 }.serialize();
        let low = DomesticPacket::serialize(b"bulk", false);

        let mut raw = framed(0, &high);
        raw.extend(framed(2, &low));

        account.append_chunk(&raw).unwrap();

        let mut out = Vec::new();
        account.drain_packets(&mut out).unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].0, 0);
        assert_eq!(out[1].0, 2);
    }

    #[test]
    fn test_priority_out_of_range_is_fatal() {
        let mut account = InputAccount::new(2);
        let raw = framed(5, b"x");

        assert_eq!(
            account.append_chunk(&raw).err().unwrap(),
            NetworkError::Fatal(ErrorType::Corrupt)
        );
    }

    #[test]
    fn test_corrupt_magic_is_fatal() {
        let mut account = InputAccount::new(2);

        assert_eq!(
            account.append_chunk(&[0xFF, 0, 0]).err().unwrap(),
            NetworkError::Fatal(ErrorType::Corrupt)
        );
    }

    #[test]
    fn test_registry_ignores_unknown_socket() {
        let mut registry = InputRegistry::new(2);
        let mut out = Vec::new();

        registry
            .process(SocketId(42), &[1, 2, 3], &mut out)
            .unwrap();

        assert!(out.is_empty());
    }
}

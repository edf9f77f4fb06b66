//! Channel-level packet codec.
//!
//! Every packet starts with a two-byte header:
//!
//! ```text
//! Byte 0:
//! +-------------------------+
//! | 7  6  5  4 | 3  2  1  0 |
//! +-------------------------+
//! |    (V)     |     (P)    |
//! +------------+------------+
//! (V) - Protocol version (currently 1).
//! (P) - Packet type.
//!
//! Byte 1:
//! +-------------------------------+
//! | 7 | 6 | 5 | 4 | 3 | 2 | 1 | 0 |
//! +-------------------------------+
//! | F6| F5| F4| F3| F2| F1| F0| C |
//! +-------------------------------+
//! (C)  - Checksum bit (1 - a CRC-32 of the data field follows the flags).
//! (F*) - Per-type flags.
//! ```
//!
//! DDATA and GDATA additionally carry a 4-byte data length after the header
//! (and the optional checksum). Every control packet travels at priority 0.

use crate::identity::NodeId;
use crate::support::{ErrorType, NetworkError, NetworkResult};
use crate::wire::{WireReader, WireWriter};

pub const VERSION: u8 = 1;

/// Upper bound for one DDATA/GDATA data field. A corrupt length larger than
/// this is treated as stream corruption instead of an eternal short read.
pub const MAX_DATA_SIZE: usize = 1 << 24;

const FLAG_CHECKSUM: u8 = 0x01;
const FLAG_F0: u8 = 0x02;
const FLAG_F1: u8 = 0x04;
const FLAG_F2: u8 = 0x08;
const FLAG_F3: u8 = 0x10;

mod type_id {
    pub const HANDSHAKE: u8 = 1;
    pub const HEARTBEAT: u8 = 2;
    pub const ALIVE: u8 = 3;
    pub const UNREACH: u8 = 4;
    pub const ROUTE: u8 = 5;
    pub const DDATA: u8 = 14;
    pub const GDATA: u8 = 15;
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HandshakePacket {
    pub id: NodeId,
    pub name: String,
    pub is_response: bool,
    pub is_gateway: bool,
    pub behind_nat: bool,
    pub accepted: bool,
}

impl HandshakePacket {
    pub fn request(id: NodeId, name: &str, is_gateway: bool, behind_nat: bool) -> HandshakePacket {
        HandshakePacket {
            id,
            name: name.to_string(),
            is_response: false,
            is_gateway,
            behind_nat,
            accepted: false,
        }
    }

    pub fn response(id: NodeId, name: &str, is_gateway: bool, accepted: bool) -> HandshakePacket {
        HandshakePacket {
            id,
            name: name.to_string(),
            is_response: true,
            is_gateway,
            behind_nat: false,
            accepted,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut flags = 0u8;

        if self.is_response {
            flags |= FLAG_F0;
        }
        if self.is_gateway {
            flags |= FLAG_F1;
        }
        if self.behind_nat {
            flags |= FLAG_F2;
        }
        if self.accepted {
            flags |= FLAG_F3;
        }

        let mut out = WireWriter::new();
        out.put_u8((VERSION << 4) | type_id::HANDSHAKE);
        out.put_u8(flags);
        out.put_u128(self.id.0);
        out.put_blob8(self.name.as_bytes());
        out.take()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HeartbeatPacket {
    pub health: u8,
}

impl HeartbeatPacket {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = WireWriter::new();
        out.put_u8((VERSION << 4) | type_id::HEARTBEAT);
        out.put_u8(0);
        out.put_u8(self.health);
        out.take()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AlivePacket {
    pub id: NodeId,
}

impl AlivePacket {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = WireWriter::new();
        out.put_u8((VERSION << 4) | type_id::ALIVE);
        out.put_u8(0);
        out.put_u128(self.id.0);
        out.take()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UnreachablePacket {
    /// Gateway reporting the broken path.
    pub gateway: NodeId,
    /// Originator of the data that could not be forwarded.
    pub sender: NodeId,
    /// Destination that turned out to be unreachable.
    pub receiver: NodeId,
}

impl UnreachablePacket {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = WireWriter::new();
        out.put_u8((VERSION << 4) | type_id::UNREACH);
        out.put_u8(0);
        out.put_u128(self.gateway.0);
        out.put_u128(self.sender.0);
        out.put_u128(self.receiver.0);
        out.take()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RoutePacket {
    pub is_response: bool,
    /// Flood deduplication id, allocated by the initiator.
    pub request_id: u64,
    pub initiator: NodeId,
    /// Only meaningful on responses.
    pub responder: NodeId,
    /// Gateways accumulated along the request path, in travel order.
    pub route: Vec<NodeId>,
}

impl RoutePacket {
    pub fn request(request_id: u64, initiator: NodeId, route: Vec<NodeId>) -> RoutePacket {
        RoutePacket {
            is_response: false,
            request_id,
            initiator,
            responder: NodeId::NIL,
            route,
        }
    }

    pub fn response(
        request_id: u64,
        initiator: NodeId,
        responder: NodeId,
        route: Vec<NodeId>,
    ) -> RoutePacket {
        RoutePacket {
            is_response: true,
            request_id,
            initiator,
            responder,
            route,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        debug_assert!(self.route.len() <= u8::max_value() as usize);

        let mut flags = 0u8;

        if self.is_response {
            flags |= FLAG_F0;
        }

        let mut out = WireWriter::new();
        out.put_u8((VERSION << 4) | type_id::ROUTE);
        out.put_u8(flags);
        out.put_u64(self.request_id);
        out.put_u128(self.initiator.0);

        if self.is_response {
            out.put_u128(self.responder.0);
        }

        out.put_u8(self.route.len() as u8);

        for id in &self.route {
            out.put_u128(id.0);
        }

        out.take()
    }
}

/// User data whose receiver is a direct neighbor (one hop).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DomesticPacket {
    pub bytes: Vec<u8>,
}

impl DomesticPacket {
    pub fn serialize(bytes: &[u8], force_checksum: bool) -> Vec<u8> {
        let mut flags = 0u8;

        if force_checksum {
            flags |= FLAG_CHECKSUM;
        }

        let mut out = WireWriter::new();
        out.put_u8((VERSION << 4) | type_id::DDATA);
        out.put_u8(flags);

        if force_checksum {
            out.put_u32(crc32fast::hash(bytes));
        }

        out.put_blob32(bytes);
        out.take()
    }
}

/// User data requiring gateway forwarding; carries end-to-end addressing.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GlobalPacket {
    pub sender: NodeId,
    pub receiver: NodeId,
    pub bytes: Vec<u8>,
}

impl GlobalPacket {
    pub fn serialize(
        sender: NodeId,
        receiver: NodeId,
        bytes: &[u8],
        force_checksum: bool,
    ) -> Vec<u8> {
        let mut flags = 0u8;

        if force_checksum {
            flags |= FLAG_CHECKSUM;
        }

        let mut out = WireWriter::new();
        out.put_u8((VERSION << 4) | type_id::GDATA);
        out.put_u8(flags);

        if force_checksum {
            out.put_u32(crc32fast::hash(bytes));
        }

        out.put_u32(bytes.len() as u32);
        out.put_u128(sender.0);
        out.put_u128(receiver.0);
        out.put_bytes(bytes);
        out.take()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Packet {
    Handshake(HandshakePacket),
    Heartbeat(HeartbeatPacket),
    Alive(AlivePacket),
    Unreachable(UnreachablePacket),
    Route(RoutePacket),
    Domestic(DomesticPacket),
    Global(GlobalPacket),
}

/// Extracts one packet off the reader.
///
/// Returns `Ok(None)` and leaves the cursor untouched while the packet is
/// incomplete; fatal errors mean the stream is corrupt and the socket must
/// be closed.
pub fn read_packet(input: &mut WireReader) -> NetworkResult<Option<Packet>> {
    if input.available() == 0 {
        return Ok(None);
    }

    input.start_transaction();

    match read_packet_body(input) {
        Ok(packet) => {
            input.commit_transaction();
            Ok(Some(packet))
        }
        Err(NetworkError::Wait) => {
            input.rollback();
            Ok(None)
        }
        Err(error) => Err(error),
    }
}

fn read_packet_body(input: &mut WireReader) -> NetworkResult<Packet> {
    let b0 = input.get_u8()?;
    let version = (b0 >> 4) & 0x0F;
    let kind = b0 & 0x0F;

    if version != VERSION {
        return Err(NetworkError::Fatal(ErrorType::VersionMismatch));
    }

    let flags = input.get_u8()?;
    let has_checksum = flags & FLAG_CHECKSUM != 0;

    let checksum = if has_checksum { input.get_u32()? } else { 0 };

    match kind {
        type_id::HANDSHAKE => {
            let id = NodeId(input.get_u128()?);
            let raw_name = input.get_blob8()?;
            let name = String::from_utf8(raw_name)
                .map_err(|_| NetworkError::Fatal(ErrorType::Corrupt))?;

            Ok(Packet::Handshake(HandshakePacket {
                id,
                name,
                is_response: flags & FLAG_F0 != 0,
                is_gateway: flags & FLAG_F1 != 0,
                behind_nat: flags & FLAG_F2 != 0,
                accepted: flags & FLAG_F3 != 0,
            }))
        }

        type_id::HEARTBEAT => {
            let health = input.get_u8()?;
            Ok(Packet::Heartbeat(HeartbeatPacket { health }))
        }

        type_id::ALIVE => {
            let id = NodeId(input.get_u128()?);
            Ok(Packet::Alive(AlivePacket { id }))
        }

        type_id::UNREACH => {
            let gateway = NodeId(input.get_u128()?);
            let sender = NodeId(input.get_u128()?);
            let receiver = NodeId(input.get_u128()?);

            Ok(Packet::Unreachable(UnreachablePacket {
                gateway,
                sender,
                receiver,
            }))
        }

        type_id::ROUTE => {
            let is_response = flags & FLAG_F0 != 0;
            let request_id = input.get_u64()?;
            let initiator = NodeId(input.get_u128()?);

            let responder = if is_response {
                NodeId(input.get_u128()?)
            } else {
                NodeId::NIL
            };

            let count = input.get_u8()? as usize;
            let mut route = Vec::with_capacity(count);

            for _ in 0..count {
                route.push(NodeId(input.get_u128()?));
            }

            Ok(Packet::Route(RoutePacket {
                is_response,
                request_id,
                initiator,
                responder,
                route,
            }))
        }

        type_id::DDATA => {
            let bytes = input.get_blob32(MAX_DATA_SIZE)?;

            if has_checksum && crc32fast::hash(&bytes) != checksum {
                return Err(NetworkError::Fatal(ErrorType::Checksum));
            }

            Ok(Packet::Domestic(DomesticPacket { bytes }))
        }

        type_id::GDATA => {
            let length = input.get_u32()? as usize;

            if length > MAX_DATA_SIZE {
                return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
            }

            let sender = NodeId(input.get_u128()?);
            let receiver = NodeId(input.get_u128()?);
            let bytes = input.get_bytes(length)?;

            if has_checksum && crc32fast::hash(&bytes) != checksum {
                return Err(NetworkError::Fatal(ErrorType::Checksum));
            }

            Ok(Packet::Global(GlobalPacket {
                sender,
                receiver,
                bytes,
            }))
        }

        _ => Err(NetworkError::Fatal(ErrorType::UnknownPacket)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_one(raw: &[u8]) -> Packet {
        let mut input = WireReader::new(raw);
        read_packet(&mut input).unwrap().expect("complete packet")
    }

    #[test]
    fn test_handshake_roundtrip() {
        let pkt = HandshakePacket::request(NodeId::new(1, 2), "alpha", true, false);
        let raw = pkt.serialize();

        match read_one(&raw) {
            Packet::Handshake(parsed) => assert_eq!(parsed, pkt),
            other => panic!("Unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_handshake_response_flags() {
        let pkt = HandshakePacket::response(NodeId::new(3, 4), "beta", false, true);
        let raw = pkt.serialize();

        match read_one(&raw) {
            Packet::Handshake(parsed) => {
                assert!(parsed.is_response);
                assert!(parsed.accepted);
                assert!(!parsed.is_gateway);
                assert!(!parsed.behind_nat);
            }
            other => panic!("Unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat_roundtrip() {
        let raw = HeartbeatPacket { health: 7 }.serialize();

        match read_one(&raw) {
            Packet::Heartbeat(parsed) => assert_eq!(parsed.health, 7),
            other => panic!("Unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_route_request_roundtrip() {
        let pkt = RoutePacket::request(42, NodeId::new(0, 1), vec![NodeId::new(0, 5)]);
        let raw = pkt.serialize();

        match read_one(&raw) {
            Packet::Route(parsed) => {
                assert_eq!(parsed, pkt);
                assert_eq!(parsed.responder, NodeId::NIL);
            }
            other => panic!("Unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_route_response_roundtrip() {
        let route = vec![NodeId::new(0, 5), NodeId::new(0, 6)];
        let pkt = RoutePacket::response(42, NodeId::new(0, 1), NodeId::new(0, 2), route);
        let raw = pkt.serialize();

        match read_one(&raw) {
            Packet::Route(parsed) => assert_eq!(parsed, pkt),
            other => panic!("Unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_unreachable_roundtrip() {
        let pkt = UnreachablePacket {
            gateway: NodeId::new(0, 1),
            sender: NodeId::new(0, 2),
            receiver: NodeId::new(0, 3),
        };
        let raw = pkt.serialize();

        match read_one(&raw) {
            Packet::Unreachable(parsed) => assert_eq!(parsed, pkt),
            other => panic!("Unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_ddata_with_checksum() {
        let raw = DomesticPacket::serialize(b"payload", true);

        match read_one(&raw) {
            Packet::Domestic(parsed) => assert_eq!(parsed.bytes, b"payload"),
            other => panic!("Unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_ddata_checksum_failure() {
        let mut raw = DomesticPacket::serialize(b"payload", true);
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;

        let mut input = WireReader::new(&raw);

        assert_eq!(
            read_packet(&mut input).err().unwrap(),
            NetworkError::Fatal(ErrorType::Checksum)
        );
    }

    #[test]
    fn test_gdata_roundtrip() {
        let raw = GlobalPacket::serialize(NodeId::new(0, 8), NodeId::new(0, 9), b"across", true);

        match read_one(&raw) {
            Packet::Global(parsed) => {
                assert_eq!(parsed.sender, NodeId::new(0, 8));
                assert_eq!(parsed.receiver, NodeId::new(0, 9));
                assert_eq!(parsed.bytes, b"across");
            }
            other => panic!("Unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_version_mismatch_is_fatal() {
        let mut raw = HeartbeatPacket { health: 0 }.serialize();
        raw[0] = (2 << 4) | (raw[0] & 0x0F);

        let mut input = WireReader::new(&raw);

        assert_eq!(
            read_packet(&mut input).err().unwrap(),
            NetworkError::Fatal(ErrorType::VersionMismatch)
        );
    }

    #[test]
    fn test_unknown_type_is_fatal() {
        let raw = [(VERSION << 4) | 9, 0];
        let mut input = WireReader::new(&raw);

        assert_eq!(
            read_packet(&mut input).err().unwrap(),
            NetworkError::Fatal(ErrorType::UnknownPacket)
        );
    }

    #[test]
    fn test_partial_packet_waits() {
        let raw = GlobalPacket::serialize(NodeId::new(0, 8), NodeId::new(0, 9), b"across", false);
        let mut input = WireReader::new(&raw[..raw.len() - 2]);

        assert_eq!(read_packet(&mut input).unwrap(), None);
        assert_eq!(input.available(), raw.len() - 2);
    }

    #[test]
    fn test_two_packets_back_to_back() {
        let mut raw = HeartbeatPacket { health: 1 }.serialize();
        raw.extend(AlivePacket { id: NodeId::new(0, 3) }.serialize());

        let mut input = WireReader::new(&raw);

        match read_packet(&mut input).unwrap().unwrap() {
            Packet::Heartbeat(parsed) => assert_eq!(parsed.health, 1),
            other => panic!("Unexpected packet {:?}", other),
        }

        match read_packet(&mut input).unwrap().unwrap() {
            Packet::Alive(parsed) => assert_eq!(parsed.id, NodeId::new(0, 3)),
            other => panic!("Unexpected packet {:?}", other),
        }

        assert_eq!(read_packet(&mut input).unwrap(), None);
    }
}

//! Delivery sub-protocol codec.
//!
//! Byte 0 packs a version nibble (currently 1) and a type nibble. All types
//! except REPORT carry a 64-bit serial number next. MESSAGE additionally
//! carries the message id and segmentation geometry; ACK names the priority
//! stream its serial number belongs to, since acknowledgements travel at
//! priority 0 while serial numbers are per-stream.

use crate::identity::{MessageId, SerialNumber};
use crate::support::{ErrorType, NetworkError, NetworkResult};
use crate::wire::{WireReader, WireWriter};

pub const VERSION: u8 = 1;

/// Upper bound for one segment or report body.
pub const MAX_CHUNK_SIZE: usize = 1 << 24;

mod type_id {
    pub const SYN: u8 = 1;
    pub const MESSAGE: u8 = 2;
    pub const REPORT: u8 = 3;
    pub const PART: u8 = 4;
    pub const ACK: u8 = 5;
}

#[inline]
fn header(kind: u8) -> u8 {
    (VERSION << 4) | kind
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SynWay {
    Request,
    Response,
}

/// Per-priority synchronization. The request advertises, for every priority
/// stream, the id of the message at the head of the send queue and the first
/// serial number still in flight (0 when the stream is idle). The response
/// is an empty acknowledgement.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SynPacket {
    pub way: SynWay,
    pub lanes: Vec<(MessageId, SerialNumber)>,
}

impl SynPacket {
    pub fn request(lanes: Vec<(MessageId, SerialNumber)>) -> SynPacket {
        SynPacket {
            way: SynWay::Request,
            lanes,
        }
    }

    pub fn response() -> SynPacket {
        SynPacket {
            way: SynWay::Response,
            lanes: Vec::new(),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        debug_assert!(self.lanes.len() <= u8::max_value() as usize);

        let mut out = WireWriter::new();
        out.put_u8(header(type_id::SYN));
        out.put_u64(0);
        out.put_u8(match self.way {
            SynWay::Request => 0,
            SynWay::Response => 1,
        });
        out.put_u8(self.lanes.len() as u8);

        for &(msgid, sn) in &self.lanes {
            out.put_u128(msgid.0);
            out.put_u64(sn);
        }

        out.take()
    }
}

/// First part of a new message, carrying the full geometry.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MessagePacket {
    pub sn: SerialNumber,
    pub msgid: MessageId,
    pub total_size: u64,
    pub part_size: u32,
    pub last_sn: SerialNumber,
    pub chunk: Vec<u8>,
}

impl MessagePacket {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = WireWriter::new();
        out.put_u8(header(type_id::MESSAGE));
        out.put_u64(self.sn);
        out.put_u128(self.msgid.0);
        out.put_u64(self.total_size);
        out.put_u32(self.part_size);
        out.put_u64(self.last_sn);
        out.put_blob32(&self.chunk);
        out.take()
    }
}

/// Subsequent part of the in-flight message on its priority stream.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PartPacket {
    pub sn: SerialNumber,
    pub chunk: Vec<u8>,
}

impl PartPacket {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = WireWriter::new();
        out.put_u8(header(type_id::PART));
        out.put_u64(self.sn);
        out.put_blob32(&self.chunk);
        out.take()
    }
}

/// Positive acknowledgement for one serial number of one priority stream.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AckPacket {
    pub sn: SerialNumber,
    pub priority: u8,
}

impl AckPacket {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = WireWriter::new();
        out.put_u8(header(type_id::ACK));
        out.put_u64(self.sn);
        out.put_u8(self.priority);
        out.take()
    }
}

/// Fire-and-forget payload, no serial number and no acknowledgement.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReportPacket {
    pub bytes: Vec<u8>,
}

impl ReportPacket {
    pub fn serialize(bytes: &[u8]) -> Vec<u8> {
        let mut out = WireWriter::new();
        out.put_u8(header(type_id::REPORT));
        out.put_blob32(bytes);
        out.take()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DeliveryPacket {
    Syn(SynPacket),
    Message(MessagePacket),
    Part(PartPacket),
    Ack(AckPacket),
    Report(ReportPacket),
}

/// Extracts one delivery packet; `Ok(None)` while incomplete.
pub fn read_delivery_packet(input: &mut WireReader) -> NetworkResult<Option<DeliveryPacket>> {
    if input.available() == 0 {
        return Ok(None);
    }

    input.start_transaction();

    match read_body(input) {
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

fn read_body(input: &mut WireReader) -> NetworkResult<DeliveryPacket> {
    let b0 = input.get_u8()?;
    let version = (b0 >> 4) & 0x0F;
    let kind = b0 & 0x0F;

    if version != VERSION {
        return Err(NetworkError::Fatal(ErrorType::VersionMismatch));
    }

    match kind {
        type_id::SYN => {
            let _sn = input.get_u64()?;
            let way = match input.get_u8()? {
                0 => SynWay::Request,
                1 => SynWay::Response,
                _ => return Err(NetworkError::Fatal(ErrorType::Corrupt)),
            };

            let count = input.get_u8()? as usize;
            let mut lanes = Vec::with_capacity(count);

            for _ in 0..count {
                let msgid = MessageId(input.get_u128()?);
                let sn = input.get_u64()?;
                lanes.push((msgid, sn));
            }

            Ok(DeliveryPacket::Syn(SynPacket { way, lanes }))
        }

        type_id::MESSAGE => {
            let sn = input.get_u64()?;
            let msgid = MessageId(input.get_u128()?);
            let total_size = input.get_u64()?;
            let part_size = input.get_u32()?;
            let last_sn = input.get_u64()?;
            let chunk = input.get_blob32(MAX_CHUNK_SIZE)?;

            Ok(DeliveryPacket::Message(MessagePacket {
                sn,
                msgid,
                total_size,
                part_size,
                last_sn,
                chunk,
            }))
        }

        type_id::PART => {
            let sn = input.get_u64()?;
            let chunk = input.get_blob32(MAX_CHUNK_SIZE)?;

            Ok(DeliveryPacket::Part(PartPacket { sn, chunk }))
        }

        type_id::ACK => {
            let sn = input.get_u64()?;
            let priority = input.get_u8()?;

            Ok(DeliveryPacket::Ack(AckPacket { sn, priority }))
        }

        type_id::REPORT => {
            let bytes = input.get_blob32(MAX_CHUNK_SIZE)?;

            Ok(DeliveryPacket::Report(ReportPacket { bytes }))
        }

        _ => Err(NetworkError::Fatal(ErrorType::UnknownPacket)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_one(raw: &[u8]) -> DeliveryPacket {
        let mut input = WireReader::new(raw);
        read_delivery_packet(&mut input)
            .unwrap()
            .expect("complete packet")
    }

    #[test]
    fn test_syn_request_roundtrip() {
        let pkt = SynPacket::request(vec![
            (MessageId(7), 100),
            (MessageId::NIL, 0),
        ]);
        let raw = pkt.serialize();

        assert_eq!(read_one(&raw), DeliveryPacket::Syn(pkt));
    }

    #[test]
    fn test_syn_response_is_empty() {
        let raw = SynPacket::response().serialize();

        match read_one(&raw) {
            DeliveryPacket::Syn(parsed) => {
                assert_eq!(parsed.way, SynWay::Response);
                assert!(parsed.lanes.is_empty());
            }
            other => panic!("Unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_message_roundtrip() {
        let pkt = MessagePacket {
            sn: 11,
            msgid: MessageId(0xFEED),
            total_size: 1_000_000,
            part_size: 16384,
            last_sn: 72,
            chunk: vec![3u8; 64],
        };
        let raw = pkt.serialize();

        assert_eq!(read_one(&raw), DeliveryPacket::Message(pkt));
    }

    #[test]
    fn test_part_roundtrip() {
        let pkt = PartPacket {
            sn: 12,
            chunk: vec![9u8; 32],
        };
        let raw = pkt.serialize();

        assert_eq!(read_one(&raw), DeliveryPacket::Part(pkt));
    }

    #[test]
    fn test_ack_roundtrip() {
        let pkt = AckPacket { sn: 42, priority: 2 };
        let raw = pkt.serialize();

        assert_eq!(read_one(&raw), DeliveryPacket::Ack(pkt));
    }

    #[test]
    fn test_report_roundtrip() {
        let raw = ReportPacket::serialize(b"telemetry blob");

        match read_one(&raw) {
            DeliveryPacket::Report(parsed) => assert_eq!(parsed.bytes, b"telemetry blob"),
            other => panic!("Unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_version_mismatch_is_fatal() {
        let mut raw = AckPacket { sn: 1, priority: 0 }.serialize();
        raw[0] = (3 << 4) | (raw[0] & 0x0F);

        let mut input = WireReader::new(&raw);

        assert_eq!(
            read_delivery_packet(&mut input).err().unwrap(),
            NetworkError::Fatal(ErrorType::VersionMismatch)
        );
    }

    #[test]
    fn test_partial_input_waits() {
        let raw = MessagePacket {
            sn: 1,
            msgid: MessageId(1),
            total_size: 10,
            part_size: 10,
            last_sn: 1,
            chunk: vec![1u8; 10],
        }
        .serialize();

        let mut input = WireReader::new(&raw[..raw.len() - 3]);

        assert_eq!(read_delivery_packet(&mut input).unwrap(), None);
    }
}

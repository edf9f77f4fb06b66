//! Per-peer delivery state: outgoing trackers, incoming assemblers and the
//! synchronization handshake between them.

use crate::delivery::assembler::MultipartAssembler;
use crate::delivery::packet::{
    read_delivery_packet, AckPacket, DeliveryPacket, MessagePacket, PartPacket, SynPacket, SynWay,
};
use crate::delivery::tracker::MultipartTracker;
use crate::identity::{MessageId, NodeId, SerialNumber};
use crate::queue::PriorityTracker;
use crate::support::{ErrorType, NetworkError, NetworkResult};
use crate::wire::WireReader;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const DEFAULT_PART_SIZE: u32 = 16 * 1024;
pub const DEFAULT_EXP_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DeliveryEvent {
    /// The peer acknowledged our SYN; the reliable path is open.
    ReceiverReady { peer: NodeId },
    MessageReceived {
        peer: NodeId,
        msgid: MessageId,
        priority: usize,
        bytes: Vec<u8>,
    },
    MessageDelivered { peer: NodeId, msgid: MessageId },
    MessageLost { peer: NodeId, msgid: MessageId },
    MessageBegin {
        peer: NodeId,
        msgid: MessageId,
        total_size: u64,
    },
    MessageProgress {
        peer: NodeId,
        msgid: MessageId,
        received_size: u64,
        total_size: u64,
    },
    ReportReceived {
        peer: NodeId,
        priority: usize,
        bytes: Vec<u8>,
    },
    Error { message: String },
}

/// One serialized delivery packet bound for the transport.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Outbound {
    pub peer: NodeId,
    pub priority: usize,
    pub force_checksum: bool,
    pub bytes: Vec<u8>,
}

enum SynState {
    Unsynchronised { next_try: Instant },
    Synchronised,
}

struct TrackerLane {
    last_sn: SerialNumber,
    queue: VecDeque<MultipartTracker>,
}

struct AssemblerLane {
    assembler: Option<MultipartAssembler>,
}

pub struct DeliveryController {
    peer: NodeId,
    part_size: u32,
    exp_timeout: Duration,
    syn: SynState,
    paused: bool,
    rotation: PriorityTracker,
    trackers: Vec<TrackerLane>,
    assemblers: Vec<AssemblerLane>,
}

impl DeliveryController {
    pub fn new(
        peer: NodeId,
        weights: &[usize],
        part_size: u32,
        exp_timeout: Duration,
    ) -> DeliveryController {
        DeliveryController {
            peer,
            part_size,
            exp_timeout,
            syn: SynState::Unsynchronised {
                next_try: Instant::now(),
            },
            paused: false,
            rotation: PriorityTracker::new(weights),
            trackers: weights
                .iter()
                .map(|_| TrackerLane {
                    last_sn: 0,
                    queue: VecDeque::new(),
                })
                .collect(),
            assemblers: weights
                .iter()
                .map(|_| AssemblerLane { assembler: None })
                .collect(),
        }
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    #[inline]
    pub fn is_synchronised(&self) -> bool {
        match self.syn {
            SynState::Synchronised => true,
            _ => false,
        }
    }

    /// Stops outbound activity after the peer became unreachable.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resumes after the route came back. The stream re-synchronizes before
    /// anything else is sent.
    pub fn resume(&mut self) {
        self.paused = false;
        self.syn = SynState::Unsynchronised {
            next_try: Instant::now(),
        };
    }

    pub fn has_backlog(&self) -> bool {
        self.trackers.iter().any(|lane| !lane.queue.is_empty())
    }

    /// Segments the payload, allocates its serial range on the priority
    /// stream and queues the tracker. Refused while paused.
    pub fn enqueue_message(
        &mut self,
        msgid: MessageId,
        priority: usize,
        force_checksum: bool,
        payload: Vec<u8>,
    ) -> bool {
        if self.paused || priority >= self.trackers.len() {
            return false;
        }

        let lane = &mut self.trackers[priority];
        let first_sn = lane.last_sn + 1;

        let tracker = MultipartTracker::new(
            msgid,
            priority,
            force_checksum,
            self.part_size,
            first_sn,
            payload,
        );

        lane.last_sn = tracker.last_sn();
        lane.queue.push_back(tracker);
        true
    }

    fn syn_request(&mut self, now: Instant) -> Outbound {
        let lanes = self
            .trackers
            .iter()
            .map(|lane| match lane.queue.front() {
                Some(head) => (head.msgid(), head.first_sn()),
                None => (MessageId::NIL, 0),
            })
            .collect();

        self.syn = SynState::Unsynchronised {
            next_try: now + self.exp_timeout,
        };

        Outbound {
            peer: self.peer,
            priority: 0,
            force_checksum: false,
            bytes: SynPacket::request(lanes).serialize(),
        }
    }

    /// Emits at most one packet: the pending SYN while unsynchronised,
    /// otherwise the next part picked by the weighted priority rotation.
    pub fn step(&mut self, now: Instant, out: &mut Vec<Outbound>) -> usize {
        if self.paused {
            return 0;
        }

        match self.syn {
            SynState::Unsynchronised { next_try } => {
                if now >= next_try {
                    let syn = self.syn_request(now);
                    out.push(syn);
                    return 1;
                }

                return 0;
            }
            SynState::Synchronised => (),
        }

        if !self.has_backlog() {
            return 0;
        }

        let first = self.rotation.next();
        let mut priority = first;

        loop {
            let produced = {
                let lane = &mut self.trackers[priority];

                match lane.queue.front_mut() {
                    Some(head) => head
                        .acquire_next(now, self.exp_timeout)
                        .map(|sn| (head.serialize_part(sn), head.force_checksum())),
                    None => None,
                }
            };

            if let Some((bytes, force_checksum)) = produced {
                out.push(Outbound {
                    peer: self.peer,
                    priority,
                    force_checksum,
                    bytes,
                });
                return 1;
            }

            priority = self.rotation.skip();

            if priority == first {
                return 0;
            }
        }
    }

    /// Feeds one inbound DDATA/GDATA payload through the sub-protocol.
    pub fn process_input(
        &mut self,
        priority: usize,
        bytes: &[u8],
        events: &mut Vec<DeliveryEvent>,
        out: &mut Vec<Outbound>,
    ) -> NetworkResult<()> {
        let mut input = WireReader::new(bytes);

        while let Some(packet) = read_delivery_packet(&mut input)? {
            match packet {
                DeliveryPacket::Syn(pkt) => self.process_syn(pkt, events, out),
                DeliveryPacket::Ack(pkt) => self.process_ack(pkt, events),
                DeliveryPacket::Message(pkt) => self.process_message(priority, pkt, events, out),
                DeliveryPacket::Part(pkt) => self.process_part(priority, pkt, events, out),
                DeliveryPacket::Report(pkt) => events.push(DeliveryEvent::ReportReceived {
                    peer: self.peer,
                    priority,
                    bytes: pkt.bytes,
                }),
            }
        }

        // A payload must hold whole packets.
        if input.available() > 0 {
            return Err(NetworkError::Fatal(ErrorType::Corrupt));
        }

        Ok(())
    }

    fn process_syn(
        &mut self,
        pkt: SynPacket,
        events: &mut Vec<DeliveryEvent>,
        out: &mut Vec<Outbound>,
    ) {
        match pkt.way {
            SynWay::Request => {
                if pkt.lanes.len() != self.assemblers.len() {
                    events.push(DeliveryEvent::Error {
                        message: format!(
                            "SYN request from {} carries {} priority streams, expected {}",
                            self.peer,
                            pkt.lanes.len(),
                            self.assemblers.len()
                        ),
                    });
                    return;
                }

                // Drop assemblers for messages the sender no longer resends.
                for (lane, &(_, first_sn)) in self.assemblers.iter_mut().zip(&pkt.lanes) {
                    if first_sn == 0 {
                        continue;
                    }

                    let abandoned = lane
                        .assembler
                        .as_ref()
                        .map_or(false, |assembler| assembler.first_sn() < first_sn);

                    if abandoned {
                        let msgid = lane.assembler.as_ref().expect("checked above").msgid();
                        lane.assembler = None;
                        events.push(DeliveryEvent::MessageLost {
                            peer: self.peer,
                            msgid,
                        });
                    }
                }

                out.push(Outbound {
                    peer: self.peer,
                    priority: 0,
                    force_checksum: false,
                    bytes: SynPacket::response().serialize(),
                });
            }

            SynWay::Response => {
                if let SynState::Unsynchronised { .. } = self.syn {
                    self.syn = SynState::Synchronised;

                    // Resend everything not yet acknowledged.
                    for lane in self.trackers.iter_mut() {
                        if let Some(head) = lane.queue.front_mut() {
                            head.reset_cursor();
                        }
                    }

                    events.push(DeliveryEvent::ReceiverReady { peer: self.peer });
                }
            }
        }
    }

    fn process_ack(&mut self, pkt: AckPacket, events: &mut Vec<DeliveryEvent>) {
        let priority = pkt.priority as usize;

        let lane = match self.trackers.get_mut(priority) {
            Some(lane) => lane,
            None => return,
        };

        let complete = match lane.queue.front_mut() {
            Some(head) => {
                head.acknowledge(pkt.sn);
                head.is_complete()
            }
            None => false,
        };

        if complete {
            let head = lane.queue.pop_front().expect("completed head vanished");
            events.push(DeliveryEvent::MessageDelivered {
                peer: self.peer,
                msgid: head.msgid(),
            });
        }
    }

    fn process_message(
        &mut self,
        priority: usize,
        pkt: MessagePacket,
        events: &mut Vec<DeliveryEvent>,
        out: &mut Vec<Outbound>,
    ) {
        if priority >= self.assemblers.len() {
            return;
        }

        // Replace an assembler stuck on a different message: its sender has
        // moved on.
        let mut began = false;
        {
            let lane = &mut self.assemblers[priority];

            let replace = match lane.assembler.as_ref() {
                Some(assembler) if assembler.msgid() != pkt.msgid => {
                    events.push(DeliveryEvent::MessageLost {
                        peer: self.peer,
                        msgid: assembler.msgid(),
                    });
                    true
                }
                Some(assembler)
                    if !assembler.geometry_matches(pkt.sn, pkt.last_sn, pkt.part_size) =>
                {
                    events.push(DeliveryEvent::Error {
                        message: format!(
                            "message {} from {} re-announced with different geometry",
                            pkt.msgid, self.peer
                        ),
                    });
                    true
                }
                Some(_) => false,
                None => true,
            };

            if replace {
                match MultipartAssembler::new(
                    pkt.msgid,
                    pkt.total_size,
                    pkt.part_size,
                    pkt.sn,
                    pkt.last_sn,
                ) {
                    Ok(assembler) => {
                        lane.assembler = Some(assembler);
                        began = true;
                    }
                    Err(_) => {
                        lane.assembler = None;
                        events.push(DeliveryEvent::Error {
                            message: format!(
                                "message {} from {} carries invalid geometry",
                                pkt.msgid, self.peer
                            ),
                        });
                        return;
                    }
                }
            }
        }

        if began {
            events.push(DeliveryEvent::MessageBegin {
                peer: self.peer,
                msgid: pkt.msgid,
                total_size: pkt.total_size,
            });
        }

        self.store_part(priority, pkt.sn, &pkt.chunk, events, out);
    }

    fn process_part(
        &mut self,
        priority: usize,
        pkt: PartPacket,
        events: &mut Vec<DeliveryEvent>,
        out: &mut Vec<Outbound>,
    ) {
        if priority >= self.assemblers.len() {
            return;
        }

        // No assembler: the heading MESSAGE is still in flight or was
        // superseded. The part will come around again after the retry.
        if self.assemblers[priority].assembler.is_none() {
            return;
        }

        self.store_part(priority, pkt.sn, &pkt.chunk, events, out);
    }

    fn store_part(
        &mut self,
        priority: usize,
        sn: SerialNumber,
        chunk: &[u8],
        events: &mut Vec<DeliveryEvent>,
        out: &mut Vec<Outbound>,
    ) {
        let peer = self.peer;
        let lane = &mut self.assemblers[priority];

        let (newly, complete) = {
            let assembler = match lane.assembler.as_mut() {
                Some(assembler) => assembler,
                None => return,
            };

            match assembler.emplace(sn, chunk) {
                Ok(newly) => (newly, assembler.is_complete()),
                Err(error) => {
                    events.push(DeliveryEvent::Error {
                        message: format!("bad part {} from {}: {:?}", sn, peer, error),
                    });
                    lane.assembler = None;
                    return;
                }
            }
        };

        // Acknowledge even duplicates; the first ACK may have been lost.
        out.push(Outbound {
            peer,
            priority: 0,
            force_checksum: false,
            bytes: AckPacket {
                sn,
                priority: priority as u8,
            }
            .serialize(),
        });

        if newly {
            let assembler = lane.assembler.as_ref().expect("assembler vanished");
            events.push(DeliveryEvent::MessageProgress {
                peer,
                msgid: assembler.msgid(),
                received_size: assembler.received_size(),
                total_size: assembler.total_size(),
            });
        }

        if complete {
            let assembler = lane.assembler.take().expect("assembler vanished");
            let msgid = assembler.msgid();

            events.push(DeliveryEvent::MessageReceived {
                peer,
                msgid,
                priority,
                bytes: assembler.take_payload(),
            });
        }
    }
}

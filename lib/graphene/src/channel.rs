//! Single-peer-set channel: pools plus handshake, heartbeat and input
//! demultiplexing for every socket of one endpoint.
//!
//! The channel owns the socket lifecycle. Accepted and dialed sockets go
//! through the handshake; survivors land in the reader/writer maps as an
//! established channel to a neighbor node. Everything of interest to the
//! layers above is drained as `ChannelEvent` values at the end of `step()`.

use crate::handshake::{HandshakeAction, HandshakeController, HandshakeRole, LinkMode};
use crate::heartbeat::HeartbeatController;
use crate::identity::{NodeId, SocketId};
use crate::input::InputRegistry;
use crate::packet::{
    DomesticPacket, GlobalPacket, HeartbeatPacket, Packet, RoutePacket, UnreachablePacket,
};
use crate::poll::{
    Backend, ConnStatus, ConnectingEvent, ConnectingPool, ListenerEvent, ListenerPool, ReaderEvent,
    ReaderPool, SocketTable, StreamSocket, WriterEvent, WriterPool,
};
use crate::queue;
use crate::support::{ErrorType, NetworkError, NetworkResult};
use hashbrown::{HashMap, HashSet};
use phonon::logging::{self, Logger};
use phonon::time::Countdown;
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_FRAME_SIZE: u16 = 1500;

/// What to do with the dialed side of a broken link.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReconnectPolicy {
    Never,
    Fixed(Duration),
    /// Doubling delay capped at `ceiling`.
    Backoff { start: Duration, ceiling: Duration },
}

impl ReconnectPolicy {
    /// Redial delay for the given attempt count, `None` when giving up.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        match *self {
            ReconnectPolicy::Never => None,
            ReconnectPolicy::Fixed(delay) => Some(delay),
            ReconnectPolicy::Backoff { start, ceiling } => {
                let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::max_value());
                Some((start * factor).min(ceiling))
            }
        }
    }
}

#[derive(Clone)]
pub struct ChannelConfig {
    pub frame_size: u16,
    pub weights: Vec<usize>,
    pub heartbeat_interval: Duration,
    pub handshake_timeout: Duration,
    pub link_mode: LinkMode,
    pub reconnect: ReconnectPolicy,
}

impl Default for ChannelConfig {
    fn default() -> ChannelConfig {
        ChannelConfig {
            frame_size: DEFAULT_FRAME_SIZE,
            weights: queue::exponential_weights(4),
            heartbeat_interval: crate::heartbeat::DEFAULT_INTERVAL,
            handshake_timeout: crate::handshake::DEFAULT_TIMEOUT,
            link_mode: LinkMode::Single,
            reconnect: ReconnectPolicy::Backoff {
                start: Duration::from_secs(1),
                ceiling: Duration::from_secs(15),
            },
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum ChannelEvent {
    Established {
        peer: NodeId,
        name: String,
        is_gateway: bool,
    },
    Destroyed {
        peer: NodeId,
    },
    DuplicateId {
        peer: NodeId,
        addr: Option<SocketAddr>,
    },
    BytesWritten {
        peer: NodeId,
        count: u64,
    },
    MessageReceived {
        peer: NodeId,
        priority: usize,
        bytes: Vec<u8>,
    },
    GlobalMessageReceived {
        peer: NodeId,
        sender: NodeId,
        receiver: NodeId,
        priority: usize,
        bytes: Vec<u8>,
    },
    RouteReceived {
        peer: NodeId,
        packet: RoutePacket,
    },
    AliveReceived {
        peer: NodeId,
        id: NodeId,
    },
    UnreachableReceived {
        peer: NodeId,
        packet: UnreachablePacket,
    },
    Error {
        message: String,
    },
}

/// Bidirectional socket<->node index for both channel directions.
pub struct ChannelMap {
    reader_by_sid: HashMap<SocketId, NodeId>,
    reader_by_node: HashMap<NodeId, SocketId>,
    writer_by_sid: HashMap<SocketId, NodeId>,
    writer_by_node: HashMap<NodeId, SocketId>,
}

impl ChannelMap {
    pub fn new() -> ChannelMap {
        ChannelMap {
            reader_by_sid: HashMap::new(),
            reader_by_node: HashMap::new(),
            writer_by_sid: HashMap::new(),
            writer_by_node: HashMap::new(),
        }
    }

    pub fn insert_reader(&mut self, peer: NodeId, sid: SocketId) -> bool {
        if self.reader_by_node.contains_key(&peer) || self.reader_by_sid.contains_key(&sid) {
            return false;
        }

        self.reader_by_node.insert(peer, sid);
        self.reader_by_sid.insert(sid, peer);
        true
    }

    pub fn insert_writer(&mut self, peer: NodeId, sid: SocketId) -> bool {
        if self.writer_by_node.contains_key(&peer) || self.writer_by_sid.contains_key(&sid) {
            return false;
        }

        self.writer_by_node.insert(peer, sid);
        self.writer_by_sid.insert(sid, peer);
        true
    }

    /// Atomically claims both slots for a single-link channel.
    pub fn insert_pair(&mut self, peer: NodeId, sid: SocketId) -> bool {
        if self.reader_by_node.contains_key(&peer)
            || self.writer_by_node.contains_key(&peer)
            || self.reader_by_sid.contains_key(&sid)
            || self.writer_by_sid.contains_key(&sid)
        {
            return false;
        }

        self.reader_by_node.insert(peer, sid);
        self.reader_by_sid.insert(sid, peer);
        self.writer_by_node.insert(peer, sid);
        self.writer_by_sid.insert(sid, peer);
        true
    }

    #[inline]
    pub fn reader_of(&self, peer: NodeId) -> Option<SocketId> {
        self.reader_by_node.get(&peer).cloned()
    }

    #[inline]
    pub fn writer_of(&self, peer: NodeId) -> Option<SocketId> {
        self.writer_by_node.get(&peer).cloned()
    }

    #[inline]
    pub fn node_of_reader(&self, sid: SocketId) -> Option<NodeId> {
        self.reader_by_sid.get(&sid).cloned()
    }

    #[inline]
    pub fn node_of_writer(&self, sid: SocketId) -> Option<NodeId> {
        self.writer_by_sid.get(&sid).cloned()
    }

    pub fn writer_peers(&self) -> Vec<NodeId> {
        self.writer_by_node.keys().cloned().collect()
    }

    /// True once both directions exist for the peer.
    pub fn established(&self, peer: NodeId) -> bool {
        self.reader_by_node.contains_key(&peer) && self.writer_by_node.contains_key(&peer)
    }

    /// Detaches the peer owning `sid` (as reader or writer). Returns the
    /// peer and every socket that belonged to its channel.
    pub fn remove_by_socket(&mut self, sid: SocketId) -> Option<(NodeId, Vec<SocketId>)> {
        let peer = self
            .reader_by_sid
            .get(&sid)
            .or_else(|| self.writer_by_sid.get(&sid))
            .cloned()?;

        let mut sids = Vec::new();

        if let Some(rsid) = self.reader_by_node.remove(&peer) {
            self.reader_by_sid.remove(&rsid);
            sids.push(rsid);
        }

        if let Some(wsid) = self.writer_by_node.remove(&peer) {
            self.writer_by_sid.remove(&wsid);

            if !sids.contains(&wsid) {
                sids.push(wsid);
            }
        }

        Some((peer, sids))
    }
}

pub struct Channel<B: Backend> {
    id: NodeId,
    behind_nat: bool,
    config: ChannelConfig,

    connecting: B::Connecting,
    listener: B::Listener,
    reader: B::Reader,
    writer: B::Writer,
    sockets: SocketTable<B::Socket>,

    handshake: HandshakeController,
    heartbeat: HeartbeatController,
    input: InputRegistry,
    map: ChannelMap,

    // Dial bookkeeping for reconnection.
    attempts: HashMap<SocketAddr, u32>,
    dial_nat: HashMap<SocketAddr, bool>,
    no_reconnect: HashSet<SocketAddr>,

    events: Vec<ChannelEvent>,
    log: Logger,
}

impl<B: Backend> Channel<B> {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        id: NodeId,
        name: &str,
        is_gateway: bool,
        behind_nat: bool,
        config: ChannelConfig,
        backend: &B,
        log: L,
    ) -> NetworkResult<Channel<B>> {
        let mut handshake = HandshakeController::new(id, name, is_gateway, config.link_mode);
        handshake.set_timeout(config.handshake_timeout);

        Ok(Channel {
            id,
            behind_nat,
            connecting: backend.connecting_pool()?,
            listener: backend.listener_pool()?,
            reader: backend.reader_pool()?,
            writer: backend.writer_pool(&config.weights)?,
            sockets: SocketTable::new(),
            handshake,
            heartbeat: HeartbeatController::new(config.heartbeat_interval),
            input: InputRegistry::new(config.weights.len()),
            map: ChannelMap::new(),
            attempts: HashMap::new(),
            dial_nat: HashMap::new(),
            no_reconnect: HashSet::new(),
            events: Vec::new(),
            log: logging::child(log),
            config,
        })
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn priority_count(&self) -> usize {
        self.config.weights.len()
    }

    pub fn add_listener(&mut self, addr: SocketAddr) -> NetworkResult<SocketAddr> {
        self.listener.add(addr)
    }

    pub fn listen(&mut self, backlog: u32) -> NetworkResult<()> {
        self.listener.listen(backlog)
    }

    /// Requests an outbound channel towards `addr`. `behind_nat` marks this
    /// side as un-dialable, which exempts it from the handshake id contest.
    pub fn connect_to(&mut self, addr: SocketAddr, behind_nat: bool) -> ConnStatus {
        self.dial_nat.insert(addr, behind_nat || self.behind_nat);
        self.no_reconnect.remove(&addr);
        self.connecting.connect(addr)
    }

    #[inline]
    pub fn has_writer(&self, peer: NodeId) -> bool {
        self.map.writer_of(peer).is_some()
    }

    pub fn writer_peers(&self) -> Vec<NodeId> {
        self.map.writer_peers()
    }

    /// Queues a domestic (one hop) data packet for `peer`.
    pub fn enqueue(
        &mut self,
        peer: NodeId,
        priority: usize,
        force_checksum: bool,
        bytes: &[u8],
    ) -> NetworkResult<()> {
        let packet = DomesticPacket::serialize(bytes, force_checksum);
        self.enqueue_packet(peer, priority, packet)
    }

    /// Queues a global data packet for the neighbor `next_hop`, addressed
    /// end to end from `sender` to `receiver`.
    pub fn enqueue_global(
        &mut self,
        next_hop: NodeId,
        sender: NodeId,
        receiver: NodeId,
        priority: usize,
        force_checksum: bool,
        bytes: &[u8],
    ) -> NetworkResult<()> {
        let packet = GlobalPacket::serialize(sender, receiver, bytes, force_checksum);
        self.enqueue_packet(next_hop, priority, packet)
    }

    /// Queues an already serialized control packet at priority 0.
    pub fn enqueue_control(&mut self, peer: NodeId, packet: Vec<u8>) -> NetworkResult<()> {
        self.enqueue_packet(peer, 0, packet)
    }

    /// Queues an already serialized packet at the given priority.
    pub fn enqueue_packet(
        &mut self,
        peer: NodeId,
        priority: usize,
        packet: Vec<u8>,
    ) -> NetworkResult<()> {
        let sid = match self.map.writer_of(peer) {
            Some(sid) => sid,
            None => return Err(NetworkError::Fatal(ErrorType::PeerNotFound)),
        };

        if !self.writer.enqueue(sid, priority, packet) {
            return Err(NetworkError::Fatal(ErrorType::PeerNotFound));
        }

        Ok(())
    }

    /// Caps outbound frame size for the peer's writer socket.
    pub fn set_frame_size(&mut self, peer: NodeId, frame_size: u16) {
        if let Some(sid) = self.map.writer_of(peer) {
            self.writer.set_frame_size(sid, frame_size);
        }
    }

    /// Drains all events accumulated since the previous call.
    pub fn poll_events(&mut self) -> Vec<ChannelEvent> {
        self.events.split_off(0)
    }

    /// Drives every pool and controller for one pass, then sleeps away the
    /// remainder of a non-zero budget.
    pub fn step(&mut self, budget: Duration) {
        let countdown = Countdown::new(budget);
        let now = Instant::now();

        self.step_listener();
        self.step_connecting();
        self.step_writer();
        self.step_reader(now);

        for sid in self.handshake.step(now) {
            logging::warn!(self.log, "handshake expired";
                           "context" => "handshake", "socket" => %sid);
            self.close_socket(sid);
        }

        let (probes, expired) = self.heartbeat.step(now);

        for sid in probes {
            let packet = HeartbeatPacket { health: 0 }.serialize();
            self.writer.enqueue(sid, 0, packet);
        }

        for sid in expired {
            logging::warn!(self.log, "heartbeat timeout exceeded";
                           "context" => "heartbeat", "socket" => %sid);
            self.schedule_reconnection(sid);
            self.close_socket(sid);
        }

        self.connecting.apply_remove();
        self.reader.apply_remove();
        self.writer.apply_remove();
        // The socket table drops streams last so pools never outlive their
        // registrations.
        self.sockets.apply_remove();

        if budget > Duration::from_millis(0) && !countdown.expired() {
            thread::sleep(countdown.remain());
        }
    }

    fn step_listener(&mut self) {
        let mut events = Vec::new();
        self.listener.step(&mut events);

        for event in events {
            match event {
                ListenerEvent::Accepted(sock) => {
                    let sid = sock.id();
                    logging::debug!(self.log, "socket accepted";
                                    "context" => "listen", "socket" => %sid);
                    self.adopt_socket(sock, true, None);
                }
                ListenerEvent::Failure { error } => {
                    self.events.push(ChannelEvent::Error {
                        message: format!("listener pool failure: {:?}", error),
                    });
                }
            }
        }
    }

    fn step_connecting(&mut self) {
        let mut events = Vec::new();
        self.connecting.step(&mut events);

        for event in events {
            match event {
                ConnectingEvent::Connected(sock) => {
                    let addr = sock.peer_addr();
                    let sid = sock.id();
                    logging::debug!(self.log, "socket connected";
                                    "context" => "connect", "socket" => %sid);
                    self.adopt_socket(sock, false, addr);

                    if let Some(dialed) = addr {
                        self.attempts.remove(&dialed);
                    }

                    let behind_nat = addr
                        .and_then(|dialed| self.dial_nat.get(&dialed).cloned())
                        .unwrap_or(self.behind_nat);
                    let request = self.handshake.start(sid, behind_nat);
                    self.writer.enqueue(sid, 0, request);
                }
                ConnectingEvent::Refused { addr, reason } => {
                    logging::warn!(self.log, "connection refused";
                                   "context" => "connect", "reason" => ?reason);
                    self.schedule_redial(addr);
                }
                ConnectingEvent::Failure { addr, error } => {
                    self.events.push(ChannelEvent::Error {
                        message: format!("connect failure for {}: {:?}", addr, error),
                    });
                    self.schedule_redial(addr);
                }
            }
        }
    }

    fn step_writer(&mut self) {
        let mut events = Vec::new();
        self.writer.step(&mut self.sockets, &mut events);

        for event in events {
            match event {
                WriterEvent::BytesWritten { sid, count } => {
                    if let Some(peer) = self.map.node_of_writer(sid) {
                        self.events.push(ChannelEvent::BytesWritten { peer, count });
                    }
                }
                WriterEvent::Failure { sid, error } => {
                    self.events.push(ChannelEvent::Error {
                        message: format!("write to socket failure: {}: {:?}", sid, error),
                    });
                    self.schedule_reconnection(sid);
                    self.close_socket(sid);
                }
            }
        }
    }

    fn step_reader(&mut self, now: Instant) {
        let mut events = Vec::new();
        self.reader.step(&mut self.sockets, &mut events);

        for event in events {
            match event {
                ReaderEvent::DataReady { sid, bytes } => {
                    self.heartbeat.touch(sid, now);

                    let mut packets = Vec::new();

                    match self.input.process(sid, &bytes, &mut packets) {
                        Ok(()) => {
                            for (priority, packet) in packets {
                                self.process_packet(sid, priority, packet);
                            }
                        }
                        Err(error) => {
                            // Corrupt stream: the socket is done for.
                            self.events.push(ChannelEvent::Error {
                                message: format!("input decode failure: {}: {:?}", sid, error),
                            });
                            self.close_socket(sid);
                        }
                    }
                }
                ReaderEvent::Disconnected { sid } => {
                    logging::debug!(self.log, "socket disconnected";
                                    "context" => "read", "socket" => %sid);
                    self.schedule_reconnection(sid);
                    self.close_socket(sid);
                }
                ReaderEvent::Failure { sid, error } => {
                    self.events.push(ChannelEvent::Error {
                        message: format!("read from socket failure: {}: {:?}", sid, error),
                    });
                    self.schedule_reconnection(sid);
                    self.close_socket(sid);
                }
            }
        }
    }

    fn adopt_socket(&mut self, sock: B::Socket, accepted: bool, dial_addr: Option<SocketAddr>) {
        let sid = sock.id();

        self.input.add(sid);
        self.reader.add(&sock);
        self.writer.ensure(&sock, self.config.frame_size);
        self.sockets.insert(sock, accepted, dial_addr);

        debug_assert!(sid != SocketId::INVALID);
    }

    fn process_packet(&mut self, sid: SocketId, priority: usize, packet: Packet) {
        match packet {
            Packet::Handshake(pkt) => {
                let action = self.handshake.process(sid, &pkt);
                self.apply_handshake(sid, action);
            }

            // Liveness was already refreshed when the bytes arrived.
            Packet::Heartbeat(_) => (),

            Packet::Alive(pkt) => {
                if let Some(peer) = self.map.node_of_reader(sid) {
                    self.events.push(ChannelEvent::AliveReceived { peer, id: pkt.id });
                }
            }

            Packet::Unreachable(pkt) => {
                if let Some(peer) = self.map.node_of_reader(sid) {
                    self.events
                        .push(ChannelEvent::UnreachableReceived { peer, packet: pkt });
                }
            }

            Packet::Route(pkt) => {
                if let Some(peer) = self.map.node_of_reader(sid) {
                    self.events
                        .push(ChannelEvent::RouteReceived { peer, packet: pkt });
                }
            }

            Packet::Domestic(pkt) => {
                if let Some(peer) = self.map.node_of_reader(sid) {
                    self.events.push(ChannelEvent::MessageReceived {
                        peer,
                        priority,
                        bytes: pkt.bytes,
                    });
                }
            }

            Packet::Global(pkt) => {
                if let Some(peer) = self.map.node_of_reader(sid) {
                    self.events.push(ChannelEvent::GlobalMessageReceived {
                        peer,
                        sender: pkt.sender,
                        receiver: pkt.receiver,
                        priority,
                        bytes: pkt.bytes,
                    });
                }
            }
        }
    }

    fn apply_handshake(&mut self, sid: SocketId, action: HandshakeAction) {
        match action {
            HandshakeAction::Accept {
                peer,
                name,
                is_gateway,
                role,
                reply,
            } => {
                if let Some(reply) = reply {
                    self.writer.enqueue(sid, 0, reply);
                }

                let inserted = match role {
                    HandshakeRole::Both => self.map.insert_pair(peer, sid),
                    HandshakeRole::Reader => self.map.insert_reader(peer, sid),
                    HandshakeRole::Writer => self.map.insert_writer(peer, sid),
                };

                if !inserted {
                    // A channel to this peer already exists; the socket has
                    // no slot to fill.
                    logging::debug!(self.log, "socket excluded, channel slot taken";
                                    "context" => "handshake",
                                    "socket" => %sid,
                                    "peer" => %peer);
                    self.close_socket(sid);
                    return;
                }

                self.heartbeat.add(sid, Instant::now());

                if self.map.established(peer) {
                    logging::debug!(self.log, "channel established";
                                    "context" => "handshake",
                                    "socket" => %sid,
                                    "peer" => %peer);
                    self.events.push(ChannelEvent::Established {
                        peer,
                        name,
                        is_gateway,
                    });
                }
            }

            HandshakeAction::Decline { reply } => {
                // The dialer closes once it reads the rejection.
                self.writer.enqueue(sid, 0, reply);
            }

            HandshakeAction::Duplicate { peer, reply } => {
                let addr = self
                    .sockets
                    .entry(sid)
                    .and_then(|entry| entry.dial_addr);

                if let Some(dialed) = addr {
                    self.no_reconnect.insert(dialed);
                }

                self.events.push(ChannelEvent::DuplicateId { peer, addr });

                match reply {
                    // Accepting side: tell the dialer, let it close.
                    Some(reply) => {
                        self.writer.enqueue(sid, 0, reply);
                    }
                    // Dialing side: the collision is confirmed, close now.
                    None => self.close_socket(sid),
                }
            }

            HandshakeAction::Rejected { peer } => {
                // The peer won the id contest and will dial us instead.
                logging::debug!(self.log, "handshake rejected by peer";
                                "context" => "handshake",
                                "socket" => %sid,
                                "peer" => %peer);

                if let Some(dialed) = self.sockets.entry(sid).and_then(|entry| entry.dial_addr) {
                    self.no_reconnect.insert(dialed);
                }

                self.close_socket(sid);
            }

            HandshakeAction::Stale => {
                self.close_socket(sid);
            }
        }
    }

    /// Tears a socket out of every pool and controller. If the socket was
    /// part of an established channel, the whole channel goes with it.
    fn close_socket(&mut self, sid: SocketId) {
        self.detach_socket(sid);

        if let Some((peer, sids)) = self.map.remove_by_socket(sid) {
            for other in sids {
                if other != sid {
                    self.detach_socket(other);
                }
            }

            logging::debug!(self.log, "channel destroyed";
                            "context" => "close", "peer" => %peer);
            self.events.push(ChannelEvent::Destroyed { peer });
        }
    }

    fn detach_socket(&mut self, sid: SocketId) {
        self.handshake.cancel(sid);
        self.heartbeat.remove(sid);
        self.input.remove(sid);
        self.reader.remove_later(sid);
        self.writer.remove_later(sid);
        self.sockets.remove_later(sid);
    }

    /// Schedules a redial when this side originally dialed the socket and
    /// the policy allows it. Accepted sockets are never re-dialled.
    fn schedule_reconnection(&mut self, sid: SocketId) {
        let addr = match self.sockets.entry(sid) {
            Some(entry) if !entry.accepted => match entry.dial_addr {
                Some(addr) => addr,
                None => return,
            },
            _ => return,
        };

        self.schedule_redial(addr);
    }

    fn schedule_redial(&mut self, addr: SocketAddr) {
        if self.no_reconnect.contains(&addr) {
            return;
        }

        let attempt = {
            let counter = self.attempts.entry(addr).or_insert(0);
            let current = *counter;
            *counter += 1;
            current
        };

        if let Some(delay) = self.config.reconnect.delay(attempt) {
            logging::debug!(self.log, "reconnect scheduled";
                            "context" => "reconnect",
                            "delay_ms" => delay.as_millis() as u64,
                            "attempt" => attempt);
            self.connecting.connect_deferred(delay, addr);
        }
    }
}

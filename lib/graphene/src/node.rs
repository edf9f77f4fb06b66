//! One endpoint: a channel plus its routing table view and alive tracking.
//!
//! The node consumes channel events and turns them into mesh-level behavior:
//! route discovery floods, reverse-path recording, global data forwarding,
//! unreachability reporting and liveness announcements. Everything the pool
//! needs to see is drained as `NodeEvent` values.

use crate::alive::{AliveController, AliveVerdict};
use crate::channel::{Channel, ChannelEvent};
use crate::config::MeshConfig;
use crate::identity::{NodeId, PeerIndex};
use crate::packet::{AlivePacket, RoutePacket, UnreachablePacket};
use crate::poll::{Backend, ConnStatus};
use crate::routing::{RouteChange, RoutingTable};
use crate::support::NetworkResult;
use phonon::logging::{self, Logger};
use phonon::time::Countdown;
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

/// Flood requests stop growing past this many recorded hops.
const MAX_ROUTE_HOPS: usize = 32;

#[derive(Debug, Eq, PartialEq)]
pub enum NodeEvent {
    ChannelEstablished {
        peer: NodeId,
        name: String,
        is_gateway: bool,
    },
    ChannelDestroyed {
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
    RouteReady {
        dest: NodeId,
        index: usize,
    },
    RouteLost {
        dest: NodeId,
        index: usize,
    },
    Unreachable {
        dest: NodeId,
    },
    Alive {
        id: NodeId,
    },
    Expired {
        id: NodeId,
    },
    /// Domestic data payload from a direct neighbor.
    Data {
        sender: NodeId,
        priority: usize,
        bytes: Vec<u8>,
    },
    /// Global data payload addressed to this node.
    GlobalData {
        sender: NodeId,
        priority: usize,
        bytes: Vec<u8>,
    },
    Error {
        message: String,
    },
}

pub struct Node<B: Backend> {
    index: PeerIndex,
    id: NodeId,
    is_gateway: bool,
    channel: Channel<B>,
    routing: RoutingTable,
    alive: AliveController,
    listener_addrs: Vec<SocketAddr>,
    events: Vec<NodeEvent>,
    log: Logger,
}

impl<B: Backend> Node<B> {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        index: PeerIndex,
        id: NodeId,
        config: &MeshConfig,
        backend: &B,
        log: L,
    ) -> NetworkResult<Node<B>> {
        let log = logging::child(log);

        let channel = Channel::new(
            id,
            &config.name,
            config.gateway,
            config.behind_nat,
            config.channel_config(),
            backend,
            &log,
        )?;

        Ok(Node {
            index,
            id,
            is_gateway: config.gateway,
            channel,
            routing: RoutingTable::new(config.route_stale_after()),
            alive: AliveController::new(id, config.alive_interval()),
            listener_addrs: Vec::new(),
            events: Vec::new(),
            log,
        })
    }

    #[inline]
    pub fn index(&self) -> PeerIndex {
        self.index
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn is_gateway(&self) -> bool {
        self.is_gateway
    }

    pub fn add_listener(&mut self, addr: SocketAddr) -> NetworkResult<SocketAddr> {
        let bound = self.channel.add_listener(addr)?;
        self.listener_addrs.push(bound);
        Ok(bound)
    }

    /// Actual bound listener addresses (port 0 requests resolved).
    pub fn listener_addrs(&self) -> &[SocketAddr] {
        &self.listener_addrs
    }

    pub fn listen(&mut self, backlog: u32) -> NetworkResult<()> {
        self.channel.listen(backlog)
    }

    pub fn connect_to(&mut self, addr: SocketAddr, behind_nat: bool) -> ConnStatus {
        self.channel.connect_to(addr, behind_nat)
    }

    #[inline]
    pub fn has_writer(&self, peer: NodeId) -> bool {
        self.channel.has_writer(peer)
    }

    #[inline]
    pub fn has_route(&self, dest: NodeId) -> bool {
        self.routing.has_route(dest)
    }

    pub fn set_frame_size(&mut self, peer: NodeId, frame_size: u16) {
        self.channel.set_frame_size(peer, frame_size);
    }

    pub fn dump_routing_records(&self) -> Vec<String> {
        self.routing.dump_records()
    }

    /// Sends a payload towards `dest`: domestic when it is a neighbor,
    /// global through the preferred gateway chain otherwise. False when no
    /// usable path exists.
    pub fn send_to(
        &mut self,
        dest: NodeId,
        priority: usize,
        force_checksum: bool,
        bytes: &[u8],
    ) -> bool {
        if self.channel.has_writer(dest) {
            return self
                .channel
                .enqueue(dest, priority, force_checksum, bytes)
                .is_ok();
        }

        let hop = match self.routing.next_hop(dest) {
            Some(hop) => hop,
            None => return false,
        };

        if !self.channel.has_writer(hop) {
            return false;
        }

        let sender = self.id;
        let sent = self
            .channel
            .enqueue_global(hop, sender, dest, priority, force_checksum, bytes)
            .is_ok();

        if sent {
            self.routing.mark_forwarded(dest, Instant::now());
        }

        sent
    }

    /// Floods a route discovery request to every neighbor.
    pub fn broadcast_route_request(&mut self, request_id: u64) {
        // Remember our own request so flood echoes die here.
        self.routing
            .note_request(self.id, request_id, Instant::now());

        let packet = RoutePacket::request(request_id, self.id, Vec::new()).serialize();

        for peer in self.channel.writer_peers() {
            drop(self.channel.enqueue_control(peer, packet.clone()));
        }
    }

    /// Drains all events accumulated since the previous call.
    pub fn poll_events(&mut self) -> Vec<NodeEvent> {
        self.events.split_off(0)
    }

    pub fn step(&mut self, budget: Duration) {
        let countdown = Countdown::new(budget);

        self.channel.step(Duration::from_millis(0));

        for event in self.channel.poll_events() {
            self.process_channel_event(event);
        }

        let now = Instant::now();

        if self.alive.announce_due(now) {
            self.alive.mark_announced(now);

            let packet = AlivePacket { id: self.id }.serialize();

            for peer in self.channel.writer_peers() {
                drop(self.channel.enqueue_control(peer, packet.clone()));
            }
        }

        // Expiry is a liveness signal only; routes go away through explicit
        // breakage or the staleness sweep below.
        for id in self.alive.check_expiration(now) {
            self.events.push(NodeEvent::Expired { id });
        }

        let stale = self.routing.sweep_stale(now);
        self.push_route_changes(stale);

        if budget > Duration::from_millis(0) && !countdown.expired() {
            thread::sleep(countdown.remain());
        }
    }

    fn push_route_changes(&mut self, changes: Vec<RouteChange>) {
        for change in changes {
            match change {
                RouteChange::Ready { dest, index } => {
                    self.events.push(NodeEvent::RouteReady { dest, index })
                }
                RouteChange::Lost { dest, index } => {
                    self.events.push(NodeEvent::RouteLost { dest, index })
                }
                RouteChange::Unreachable { dest } => {
                    self.events.push(NodeEvent::Unreachable { dest })
                }
            }
        }
    }

    fn process_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Established {
                peer,
                name,
                is_gateway,
            } => {
                self.alive.add_sibling(peer);

                let change = self.routing.insert_neighbor(peer, Instant::now());
                self.push_route_changes(change.into_iter().collect());

                self.events.push(NodeEvent::Alive { id: peer });
                self.events.push(NodeEvent::ChannelEstablished {
                    peer,
                    name,
                    is_gateway,
                });
            }

            ChannelEvent::Destroyed { peer } => {
                self.alive.expire(peer);

                let changes = self.routing.neighbor_lost(peer);
                self.push_route_changes(changes);

                self.events.push(NodeEvent::ChannelDestroyed { peer });
            }

            ChannelEvent::DuplicateId { peer, addr } => {
                self.events.push(NodeEvent::DuplicateId { peer, addr });
            }

            ChannelEvent::BytesWritten { peer, count } => {
                self.events.push(NodeEvent::BytesWritten { peer, count });
            }

            ChannelEvent::MessageReceived {
                peer,
                priority,
                bytes,
            } => {
                self.events.push(NodeEvent::Data {
                    sender: peer,
                    priority,
                    bytes,
                });
            }

            ChannelEvent::GlobalMessageReceived {
                peer,
                sender,
                receiver,
                priority,
                bytes,
            } => {
                self.process_global(peer, sender, receiver, priority, bytes);
            }

            ChannelEvent::RouteReceived { peer, packet } => {
                if packet.is_response {
                    self.process_route_response(peer, packet);
                } else {
                    self.process_route_request(peer, packet);
                }
            }

            ChannelEvent::AliveReceived { peer, id } => {
                self.process_alive(peer, id);
            }

            ChannelEvent::UnreachableReceived { peer, packet } => {
                self.process_unreachable(peer, packet);
            }

            ChannelEvent::Error { message } => {
                self.events.push(NodeEvent::Error { message });
            }
        }
    }

    fn process_global(
        &mut self,
        from: NodeId,
        sender: NodeId,
        receiver: NodeId,
        priority: usize,
        bytes: Vec<u8>,
    ) {
        if receiver == self.id {
            self.events.push(NodeEvent::GlobalData {
                sender,
                priority,
                bytes,
            });
            return;
        }

        if !self.is_gateway {
            // Not ours and we do not forward: drop.
            return;
        }

        // Forward along our own view of the route towards the receiver.
        let hop = if self.channel.has_writer(receiver) {
            Some(receiver)
        } else {
            self.routing
                .next_hop(receiver)
                .filter(|&hop| hop != from && self.channel.has_writer(hop))
        };

        match hop {
            Some(hop) => {
                let forwarded = self
                    .channel
                    .enqueue_global(hop, sender, receiver, priority, false, &bytes)
                    .is_ok();

                if forwarded {
                    self.routing.mark_forwarded(receiver, Instant::now());
                    return;
                }

                self.report_unreachable(sender, receiver);
            }
            None => {
                logging::debug!(self.log, "no forward path, reporting unreachable";
                                "context" => "forward",
                                "receiver" => %receiver);
                self.report_unreachable(sender, receiver);
            }
        }
    }

    /// Tells the original sender that `receiver` cannot be reached through
    /// this gateway.
    fn report_unreachable(&mut self, sender: NodeId, receiver: NodeId) {
        let packet = UnreachablePacket {
            gateway: self.id,
            sender,
            receiver,
        }
        .serialize();

        if self.channel.has_writer(sender) {
            drop(self.channel.enqueue_control(sender, packet));
            return;
        }

        if let Some(hop) = self.routing.next_hop(sender) {
            if self.channel.has_writer(hop) {
                drop(self.channel.enqueue_control(hop, packet));
            }
        }
    }

    fn process_route_request(&mut self, from: NodeId, packet: RoutePacket) {
        // Our own flood came back around.
        if packet.initiator == self.id {
            return;
        }

        // Loop or duplicate flood.
        if packet.route.contains(&self.id) {
            return;
        }

        if !self
            .routing
            .note_request(packet.initiator, packet.request_id, Instant::now())
        {
            return;
        }

        // The travelled route, reversed, is our path back to the initiator.
        let reverse: Vec<NodeId> = packet.route.iter().rev().cloned().collect();
        let change = self
            .routing
            .record_chain(packet.initiator, reverse, Instant::now());
        self.push_route_changes(change.into_iter().collect());

        // Every receiver answers; the initiator collects one chain per
        // responder out of a single flood.
        let response = RoutePacket::response(
            packet.request_id,
            packet.initiator,
            self.id,
            packet.route.clone(),
        );
        drop(self.channel.enqueue_control(from, response.serialize()));

        if self.is_gateway && packet.route.len() < MAX_ROUTE_HOPS {
            let mut travelled = packet.route;
            travelled.push(self.id);

            let forward =
                RoutePacket::request(packet.request_id, packet.initiator, travelled).serialize();

            for peer in self.channel.writer_peers() {
                if peer != from && peer != packet.initiator {
                    drop(self.channel.enqueue_control(peer, forward.clone()));
                }
            }
        }
    }

    fn process_route_response(&mut self, _from: NodeId, packet: RoutePacket) {
        if packet.initiator == self.id {
            let change =
                self.routing
                    .record_chain(packet.responder, packet.route.clone(), Instant::now());
            self.push_route_changes(change.into_iter().collect());
            return;
        }

        // We are a gateway along the travelled route. Record the suffix
        // towards the responder and hand the response to the previous hop.
        let pos = match packet.route.iter().position(|&id| id == self.id) {
            Some(pos) => pos,
            None => return,
        };

        let suffix: Vec<NodeId> = packet.route[pos + 1..].to_vec();
        let change = self
            .routing
            .record_chain(packet.responder, suffix, Instant::now());
        self.push_route_changes(change.into_iter().collect());

        let next = if pos == 0 {
            packet.initiator
        } else {
            packet.route[pos - 1]
        };

        if self.channel.has_writer(next) {
            drop(self.channel.enqueue_control(next, packet.serialize()));
        }
    }

    fn process_alive(&mut self, from: NodeId, id: NodeId) {
        if id == self.id {
            return;
        }

        let verdict = self.alive.update_if(id, Instant::now());

        match verdict {
            // An echo of something we already flooded recently.
            AliveVerdict::Suppressed => return,
            AliveVerdict::NewlyAlive => {
                self.events.push(NodeEvent::Alive { id });
            }
            // Sibling announcements still travel on: a gateway bridges its
            // neighbors' liveness into the other subnets.
            AliveVerdict::Sibling | AliveVerdict::Refreshed => (),
        }

        // Gateways re-flood accepted announcements so liveness crosses
        // subnet boundaries.
        if self.is_gateway {
            let packet = AlivePacket { id }.serialize();

            for peer in self.channel.writer_peers() {
                if peer != from && peer != id {
                    drop(self.channel.enqueue_control(peer, packet.clone()));
                }
            }
        }
    }

    fn process_unreachable(&mut self, _from: NodeId, packet: UnreachablePacket) {
        let changes = self.routing.gateway_lost(packet.receiver, packet.gateway);
        let had_changes = !changes.is_empty();
        self.push_route_changes(changes);

        if packet.sender == self.id {
            // We originated the traffic; make sure the unreachability
            // surfaces even without a recorded route.
            if !had_changes {
                self.events.push(NodeEvent::Unreachable {
                    dest: packet.receiver,
                });
            }

            return;
        }

        // Pass the notification on towards the sender.
        let packet_bytes = packet.serialize();

        if self.channel.has_writer(packet.sender) {
            drop(self.channel.enqueue_control(packet.sender, packet_bytes));
        } else if let Some(hop) = self.routing.next_hop(packet.sender) {
            if self.channel.has_writer(hop) {
                drop(self.channel.enqueue_control(hop, packet_bytes));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::sim::{SimBackend, SimNet};

    const ZERO: Duration = Duration::from_millis(0);

    fn make_node(net: &SimNet, index: PeerIndex, id: u128, gateway: bool) -> Node<SimBackend> {
        make_node_announcing(net, index, id, gateway, 5)
    }

    fn make_node_announcing(
        net: &SimNet,
        index: PeerIndex,
        id: u128,
        gateway: bool,
        alive_secs: u64,
    ) -> Node<SimBackend> {
        let backend = SimBackend::new(net);
        let mut config = MeshConfig::default();
        config.name = format!("node-{:x}", id);
        config.gateway = gateway;
        config.alive_interval_secs = alive_secs;

        Node::new(index, NodeId(id), &config, &backend, None).unwrap()
    }

    fn listen_on(node: &mut Node<SimBackend>, port: u16) -> SocketAddr {
        let addr = format!("10.0.1.1:{}", port).parse().unwrap();
        let bound = node.add_listener(addr).unwrap();
        node.listen(50).unwrap();
        bound
    }

    fn step_all(nodes: &mut [&mut Node<SimBackend>], rounds: usize) {
        for _ in 0..rounds {
            for node in nodes.iter_mut() {
                node.step(ZERO);
            }
        }
    }

    #[test]
    fn test_neighbors_become_routes() {
        let net = SimNet::new();
        let mut a = make_node(&net, 1, 0xA, false);
        let mut b = make_node(&net, 1, 0xB, false);

        let addr = listen_on(&mut b, 5000);
        a.connect_to(addr, false);

        step_all(&mut [&mut a, &mut b], 6);

        let events = a.poll_events();

        assert!(events
            .iter()
            .any(|event| matches!(event, NodeEvent::ChannelEstablished { peer, .. } if *peer == NodeId(0xB))));
        assert!(events
            .iter()
            .any(|event| matches!(event, NodeEvent::RouteReady { dest, index: 0 } if *dest == NodeId(0xB))));
        assert!(a.has_route(NodeId(0xB)));
    }

    #[test]
    fn test_route_discovery_through_gateway() {
        // a - g - b, with g a gateway. After discovery a can reach b.
        let net = SimNet::new();
        let mut a = make_node(&net, 1, 0xA, false);
        let mut g = make_node(&net, 1, 0x100, true);
        let mut b = make_node(&net, 1, 0xB, false);

        // Both leaves dial the gateway; its id is the highest so both
        // handshakes settle on the dialed sockets.
        let g_addr = listen_on(&mut g, 5001);

        a.connect_to(g_addr, false);
        b.connect_to(g_addr, false);

        step_all(&mut [&mut a, &mut g, &mut b], 8);
        a.poll_events();
        g.poll_events();
        b.poll_events();

        a.broadcast_route_request(1);
        step_all(&mut [&mut a, &mut g, &mut b], 8);

        let events = a.poll_events();

        assert!(events
            .iter()
            .any(|event| matches!(event, NodeEvent::RouteReady { dest, .. } if *dest == NodeId(0xB))));
        assert!(a.has_route(NodeId(0xB)));

        // The reverse path got recorded on b while the flood travelled.
        assert!(b.has_route(NodeId(0xA)));

        // Data now flows a -> b through the gateway.
        assert!(a.send_to(NodeId(0xB), 0, false, b"over the hill"));
        step_all(&mut [&mut a, &mut g, &mut b], 8);

        let received = b.poll_events().into_iter().find_map(|event| match event {
            NodeEvent::GlobalData { sender, bytes, .. } => Some((sender, bytes)),
            _ => None,
        });

        let (sender, bytes) = received.expect("global data not delivered");
        assert_eq!(sender, NodeId(0xA));
        assert_eq!(bytes, b"over the hill");
    }

    #[test]
    fn test_send_to_unknown_destination_fails() {
        let net = SimNet::new();
        let mut a = make_node(&net, 1, 0xA, false);

        assert!(!a.send_to(NodeId(0xDEAD), 0, false, b"void"));
    }

    #[test]
    fn test_alive_flood_crosses_gateway() {
        // Zero announce interval makes the announcements step-driven so the
        // test does not wait out wall-clock time.
        let net = SimNet::new();
        let mut a = make_node_announcing(&net, 1, 0xA, false, 0);
        let mut g = make_node_announcing(&net, 1, 0x100, true, 0);
        let mut b = make_node_announcing(&net, 1, 0xB, false, 0);

        let g_addr = listen_on(&mut g, 5003);

        a.connect_to(g_addr, false);
        b.connect_to(g_addr, false);

        step_all(&mut [&mut a, &mut g, &mut b], 8);
        a.poll_events();
        b.poll_events();

        // The gateway re-floods each announcement to its other neighbors.
        step_all(&mut [&mut a, &mut g, &mut b], 8);

        let b_alive = b.poll_events().into_iter().any(
            |event| matches!(event, NodeEvent::Alive { id } if id == NodeId(0xA)),
        );

        assert!(b_alive);
    }

    #[test]
    fn test_channel_loss_fires_unreachable() {
        let net = SimNet::new();
        let mut a = make_node(&net, 1, 0xA, false);
        let mut b = make_node(&net, 1, 0xB, false);

        let addr = listen_on(&mut b, 5005);
        a.connect_to(addr, false);
        step_all(&mut [&mut a, &mut b], 6);
        a.poll_events();

        drop(b);
        for _ in 0..6 {
            a.step(ZERO);
        }

        let events = a.poll_events();

        assert!(events
            .iter()
            .any(|event| matches!(event, NodeEvent::ChannelDestroyed { peer } if *peer == NodeId(0xB))));
        assert!(events
            .iter()
            .any(|event| matches!(event, NodeEvent::Unreachable { dest } if *dest == NodeId(0xB))));
        assert!(!a.has_route(NodeId(0xB)));
    }
}

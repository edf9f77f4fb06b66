//! Node pool: the user-facing aggregate.
//!
//! A pool owns one or more endpoints (nodes), the delivery manager and the
//! global view of reachability. It arbitrates which endpoint carries a flow
//! (writer first, then routed), re-floods discovery for unreachable
//! destinations and pumps the delivery layer's outbound packets back into
//! the transport.

use crate::config::MeshConfig;
use crate::delivery::{DeliveryEvent, DeliveryManager, Outbound};
use crate::identity::{MessageId, NodeId, PeerIndex};
use crate::node::{Node, NodeEvent};
use crate::poll::{Backend, ConnStatus};
use crate::support::{ErrorType, NetworkError, NetworkResult};
use hashbrown::HashMap;
use phonon::logging::{self, Logger};
use phonon::time::Countdown;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Eq, PartialEq)]
pub enum PoolEvent {
    ChannelEstablished {
        index: PeerIndex,
        peer: NodeId,
        name: String,
        is_gateway: bool,
    },
    ChannelDestroyed {
        index: PeerIndex,
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
    NodeUnreachable {
        dest: NodeId,
    },
    Alive {
        id: NodeId,
    },
    Expired {
        id: NodeId,
    },
    ReceiverReady {
        peer: NodeId,
    },
    MessageReceived {
        peer: NodeId,
        msgid: MessageId,
        priority: usize,
        bytes: Vec<u8>,
    },
    MessageDelivered {
        peer: NodeId,
        msgid: MessageId,
    },
    MessageLost {
        peer: NodeId,
        msgid: MessageId,
    },
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
    Error {
        message: String,
    },
}

/// Cloneable handle for interrupting `run()` from another thread.
#[derive(Clone)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn interrupted(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

pub struct NodePool<B: Backend> {
    id: NodeId,
    config: MeshConfig,
    backend: B,
    nodes: Vec<Node<B>>,
    delivery: DeliveryManager,
    interrupted: Arc<AtomicBool>,
    next_request_id: u64,
    /// Destinations awaiting a route, with the next flood time.
    discovery: HashMap<NodeId, Instant>,
    events: Vec<PoolEvent>,
    log: Logger,
}

impl<B: Backend> NodePool<B> {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        id: NodeId,
        config: MeshConfig,
        backend: B,
        log: L,
    ) -> NodePool<B> {
        let delivery = DeliveryManager::new(
            &config.priority_weights,
            config.part_size,
            config.delivery_timeout(),
        );

        NodePool {
            id,
            delivery,
            backend,
            nodes: Vec::new(),
            interrupted: Arc::new(AtomicBool::new(false)),
            next_request_id: 0,
            discovery: HashMap::new(),
            events: Vec::new(),
            log: logging::child(log),
            config,
        }
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn is_gateway(&self) -> bool {
        self.config.gateway
    }

    /// Registers a new endpoint with its listener addresses. Returns the
    /// endpoint's index (1-based).
    pub fn add_endpoint(&mut self, listeners: &[SocketAddr]) -> NetworkResult<PeerIndex> {
        let index = self.nodes.len() + 1;
        let mut node = Node::new(index, self.id, &self.config, &self.backend, &self.log)?;

        for &addr in listeners {
            node.add_listener(addr)?;
        }

        self.nodes.push(node);
        Ok(index)
    }

    /// Begins accepting on every endpoint.
    pub fn listen(&mut self, backlog: u32) -> NetworkResult<()> {
        for node in self.nodes.iter_mut() {
            node.listen(backlog)?;
        }

        Ok(())
    }

    /// Schedules an outbound dial on the given endpoint.
    pub fn connect_peer(
        &mut self,
        index: PeerIndex,
        addr: SocketAddr,
        behind_nat: bool,
    ) -> NetworkResult<()> {
        let node = self
            .node_mut(index)
            .ok_or(NetworkError::Fatal(ErrorType::PeerNotFound))?;

        match node.connect_to(addr, behind_nat) {
            ConnStatus::Failure => Err(NetworkError::Fatal(ErrorType::Unreachable)),
            _ => Ok(()),
        }
    }

    fn node_mut(&mut self, index: PeerIndex) -> Option<&mut Node<B>> {
        if index == 0 {
            return None;
        }

        self.nodes.get_mut(index - 1)
    }

    /// Caps the outbound frame size used for `peer` on one endpoint.
    pub fn set_frame_size(&mut self, index: PeerIndex, peer: NodeId, frame_size: u16) {
        if let Some(node) = self.node_mut(index) {
            node.set_frame_size(peer, frame_size);
        }
    }

    /// Bound listener addresses of one endpoint.
    pub fn listener_addrs(&self, index: PeerIndex) -> Vec<SocketAddr> {
        if index == 0 {
            return Vec::new();
        }

        self.nodes
            .get(index - 1)
            .map(|node| node.listener_addrs().to_vec())
            .unwrap_or_default()
    }

    /// True when some endpoint can carry traffic towards `dest`.
    pub fn is_reachable(&self, dest: NodeId) -> bool {
        self.nodes
            .iter()
            .any(|node| node.has_writer(dest) || node.has_route(dest))
    }

    /// Queues a reliable message. Returns false when the destination is
    /// paused or (not yet) reachable; in the latter case the message stays
    /// queued, route discovery starts and delivery resumes by itself once
    /// a route is found.
    pub fn enqueue_message(
        &mut self,
        dest: NodeId,
        msgid: MessageId,
        priority: usize,
        force_checksum: bool,
        bytes: Vec<u8>,
    ) -> bool {
        if !self
            .delivery
            .enqueue_message(dest, msgid, priority, force_checksum, bytes)
        {
            return false;
        }

        if self.is_reachable(dest) {
            return true;
        }

        logging::debug!(self.log, "destination not reachable, starting discovery";
                        "context" => "enqueue", "dest" => %dest);

        self.delivery.pause(dest);
        self.events.push(PoolEvent::NodeUnreachable { dest });
        self.start_discovery(dest);
        false
    }

    /// Fire-and-forget payload on the unreliable path.
    pub fn enqueue_report(&mut self, dest: NodeId, priority: usize, bytes: &[u8]) -> bool {
        let packet = DeliveryManager::serialize_report(bytes);

        if self.enqueue_private(dest, priority, false, &packet) {
            return true;
        }

        self.events.push(PoolEvent::NodeUnreachable { dest });
        self.start_discovery(dest);
        false
    }

    /// Hands raw delivery bytes to the endpoint arbitration: the first
    /// endpoint with a writer for `dest`, else the first with a route.
    fn enqueue_private(
        &mut self,
        dest: NodeId,
        priority: usize,
        force_checksum: bool,
        bytes: &[u8],
    ) -> bool {
        let chosen = self
            .nodes
            .iter()
            .position(|node| node.has_writer(dest))
            .or_else(|| self.nodes.iter().position(|node| node.has_route(dest)));

        match chosen {
            Some(position) => self.nodes[position].send_to(dest, priority, force_checksum, bytes),
            None => false,
        }
    }

    fn start_discovery(&mut self, dest: NodeId) {
        self.discovery.entry(dest).or_insert_with(Instant::now);
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Relaxed);
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Relaxed)
    }

    pub fn clear_interrupted(&self) {
        self.interrupted.store(false, Ordering::Relaxed);
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            flag: self.interrupted.clone(),
        }
    }

    /// Drains all events accumulated since the previous call.
    pub fn poll_events(&mut self) -> Vec<PoolEvent> {
        self.events.split_off(0)
    }

    pub fn dump_routing_records(&self) -> Vec<String> {
        let mut lines = Vec::new();

        for node in &self.nodes {
            lines.extend(node.dump_routing_records());
        }

        lines
    }

    /// One cooperative pass over every endpoint and the delivery layer.
    /// Returns a rough count of the work done, zero meaning fully idle.
    pub fn step(&mut self) -> usize {
        let now = Instant::now();
        let events_before = self.events.len();
        let mut delivery_events = Vec::new();
        let mut outbound = Vec::new();

        for position in 0..self.nodes.len() {
            self.nodes[position].step(Duration::from_millis(0));

            let index = self.nodes[position].index();

            for event in self.nodes[position].poll_events() {
                self.process_node_event(index, event, &mut delivery_events, &mut outbound);
            }
        }

        self.flood_discoveries(now);

        self.delivery.step(now, &mut outbound);

        let mut count = outbound.len();

        for packet in outbound {
            let peer = packet.peer;

            if !self.enqueue_private(peer, packet.priority, packet.force_checksum, &packet.bytes) {
                logging::debug!(self.log, "transport refused delivery packet, pausing";
                                "context" => "step", "peer" => %peer);
                self.delivery.pause(peer);
                self.events.push(PoolEvent::NodeUnreachable { dest: peer });
                self.start_discovery(peer);
            }
        }

        for event in delivery_events {
            self.process_delivery_event(event);
        }

        count += self.events.len() - events_before;
        count
    }

    /// Re-floods discovery requests for destinations still without routes.
    fn flood_discoveries(&mut self, now: Instant) {
        if self.discovery.is_empty() {
            return;
        }

        let targets: Vec<NodeId> = self.discovery.keys().cloned().collect();
        let interval = self.config.alive_interval();

        for dest in targets {
            if self.is_reachable(dest) {
                self.discovery.remove(&dest);
                continue;
            }

            let due = self
                .discovery
                .get(&dest)
                .map_or(false, |&next| next <= now);

            if !due {
                continue;
            }

            self.next_request_id += 1;
            let request_id = self.next_request_id;

            logging::debug!(self.log, "flooding route discovery";
                            "context" => "discovery",
                            "dest" => %dest,
                            "request_id" => request_id);

            for node in self.nodes.iter_mut() {
                node.broadcast_route_request(request_id);
            }

            self.discovery.insert(dest, now + interval);
        }
    }

    fn process_node_event(
        &mut self,
        index: PeerIndex,
        event: NodeEvent,
        delivery_events: &mut Vec<DeliveryEvent>,
        outbound: &mut Vec<Outbound>,
    ) {
        match event {
            NodeEvent::ChannelEstablished {
                peer,
                name,
                is_gateway,
            } => {
                self.events.push(PoolEvent::ChannelEstablished {
                    index,
                    peer,
                    name,
                    is_gateway,
                });
            }

            NodeEvent::ChannelDestroyed { peer } => {
                self.events
                    .push(PoolEvent::ChannelDestroyed { index, peer });
            }

            NodeEvent::DuplicateId { peer, addr } => {
                self.events.push(PoolEvent::DuplicateId { peer, addr });
            }

            NodeEvent::BytesWritten { peer, count } => {
                self.events.push(PoolEvent::BytesWritten { peer, count });
            }

            NodeEvent::RouteReady { dest, index } => {
                // A route appeared: paused flows towards the destination
                // may resume (re-synchronizing first).
                if self.delivery.is_paused(dest) {
                    self.delivery.resume(dest);
                }

                self.discovery.remove(&dest);
                self.events.push(PoolEvent::RouteReady { dest, index });
            }

            NodeEvent::RouteLost { dest, index } => {
                self.events.push(PoolEvent::RouteLost { dest, index });
            }

            NodeEvent::Unreachable { dest } => {
                self.delivery.pause(dest);

                // Paused flows with queued messages want their route back.
                if self.delivery.has_backlog(dest) {
                    self.start_discovery(dest);
                }

                self.events.push(PoolEvent::NodeUnreachable { dest });
            }

            NodeEvent::Alive { id } => {
                self.events.push(PoolEvent::Alive { id });
            }

            NodeEvent::Expired { id } => {
                self.events.push(PoolEvent::Expired { id });
            }

            NodeEvent::Data {
                sender,
                priority,
                bytes,
            }
            | NodeEvent::GlobalData {
                sender,
                priority,
                bytes,
            } => {
                let result =
                    self.delivery
                        .process_input(sender, priority, &bytes, delivery_events, outbound);

                if let Err(error) = result {
                    self.events.push(PoolEvent::Error {
                        message: format!("delivery input from {}: {:?}", sender, error),
                    });
                }
            }

            NodeEvent::Error { message } => {
                self.events.push(PoolEvent::Error { message });
            }
        }
    }

    fn process_delivery_event(&mut self, event: DeliveryEvent) {
        let mapped = match event {
            DeliveryEvent::ReceiverReady { peer } => PoolEvent::ReceiverReady { peer },
            DeliveryEvent::MessageReceived {
                peer,
                msgid,
                priority,
                bytes,
            } => PoolEvent::MessageReceived {
                peer,
                msgid,
                priority,
                bytes,
            },
            DeliveryEvent::MessageDelivered { peer, msgid } => {
                PoolEvent::MessageDelivered { peer, msgid }
            }
            DeliveryEvent::MessageLost { peer, msgid } => PoolEvent::MessageLost { peer, msgid },
            DeliveryEvent::MessageBegin {
                peer,
                msgid,
                total_size,
            } => PoolEvent::MessageBegin {
                peer,
                msgid,
                total_size,
            },
            DeliveryEvent::MessageProgress {
                peer,
                msgid,
                received_size,
                total_size,
            } => PoolEvent::MessageProgress {
                peer,
                msgid,
                received_size,
                total_size,
            },
            DeliveryEvent::ReportReceived {
                peer,
                priority,
                bytes,
            } => PoolEvent::ReportReceived {
                peer,
                priority,
                bytes,
            },
            DeliveryEvent::Error { message } => PoolEvent::Error { message },
        };

        self.events.push(mapped);
    }

    /// Thread-confined main loop: step, then sleep away the remainder of
    /// each interval. Returns once `interrupt()` is observed.
    pub fn run(&mut self, loop_interval: Duration) {
        self.clear_interrupted();

        while !self.interrupted() {
            let countdown = Countdown::new(loop_interval);
            let work = self.step();

            if work == 0 && !countdown.expired() {
                thread::sleep(countdown.remain());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::sim::{SimBackend, SimNet};

    fn make_pool(net: &SimNet, id: u128, gateway: bool) -> NodePool<SimBackend> {
        let mut config = MeshConfig::default();
        config.name = format!("pool-{:x}", id);
        config.gateway = gateway;

        NodePool::new(NodeId(id), config, SimBackend::new(net), None)
    }

    fn endpoint_on(pool: &mut NodePool<SimBackend>, port: u16) -> SocketAddr {
        let addr: SocketAddr = format!("10.0.2.1:{}", port).parse().unwrap();
        pool.add_endpoint(&[addr]).unwrap();
        pool.listen(50).unwrap();
        addr
    }

    #[test]
    fn test_add_endpoint_indices() {
        let net = SimNet::new();
        let mut pool = make_pool(&net, 0xA, false);

        let first = pool.add_endpoint(&[]).unwrap();
        let second = pool.add_endpoint(&[]).unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[test]
    fn test_duplicate_listener_address_fails() {
        let net = SimNet::new();
        let mut pool = make_pool(&net, 0xA, false);
        let addr: SocketAddr = "10.0.2.1:6000".parse().unwrap();

        pool.add_endpoint(&[addr]).unwrap();

        assert!(pool.add_endpoint(&[addr]).is_err());
    }

    #[test]
    fn test_connect_bad_endpoint_index() {
        let net = SimNet::new();
        let mut pool = make_pool(&net, 0xA, false);
        let addr: SocketAddr = "10.0.2.1:6001".parse().unwrap();

        assert!(pool.connect_peer(0, addr, false).is_err());
        assert!(pool.connect_peer(3, addr, false).is_err());
    }

    #[test]
    fn test_interrupt_stops_run() {
        let net = SimNet::new();
        let mut pool = make_pool(&net, 0xA, false);
        pool.add_endpoint(&[]).unwrap();

        let handle = pool.interrupt_handle();
        handle.interrupt();

        // With the flag already set the loop exits on the first check.
        pool.run(Duration::from_millis(1));

        assert!(pool.interrupted());
        pool.clear_interrupted();
        assert!(!pool.interrupted());
    }

    #[test]
    fn test_enqueue_unreachable_pauses_and_discovers() {
        let net = SimNet::new();
        let mut pool = make_pool(&net, 0xA, false);
        pool.add_endpoint(&[]).unwrap();

        let accepted =
            pool.enqueue_message(NodeId(0xB), MessageId(1), 0, false, b"queued".to_vec());

        assert!(!accepted);

        let events = pool.poll_events();

        assert!(events
            .iter()
            .any(|event| matches!(event, PoolEvent::NodeUnreachable { dest } if *dest == NodeId(0xB))));

        // The controller is paused: further enqueues are refused outright.
        assert!(!pool.enqueue_message(NodeId(0xB), MessageId(2), 0, false, b"more".to_vec()));
    }

    #[test]
    fn test_report_between_neighbors() {
        let net = SimNet::new();
        let mut a = make_pool(&net, 0xA, false);
        let mut b = make_pool(&net, 0xB, false);

        let b_addr = endpoint_on(&mut b, 6002);
        a.add_endpoint(&[]).unwrap();
        a.connect_peer(1, b_addr, false).unwrap();

        for _ in 0..8 {
            a.step();
            b.step();
        }
        a.poll_events();
        b.poll_events();

        assert!(a.enqueue_report(NodeId(0xB), 1, b"fire and forget"));

        for _ in 0..8 {
            a.step();
            b.step();
        }

        let report = b.poll_events().into_iter().find_map(|event| match event {
            PoolEvent::ReportReceived {
                peer,
                priority,
                bytes,
            } => Some((peer, priority, bytes)),
            _ => None,
        });

        let (peer, priority, bytes) = report.expect("report not delivered");
        assert_eq!(peer, NodeId(0xA));
        assert_eq!(priority, 1);
        assert_eq!(bytes, b"fire and forget");
    }
}

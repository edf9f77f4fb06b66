//! Multi-node mesh scenarios over the in-process backend.

use graphene::poll::sim::{SimBackend, SimNet};
use graphene::pool::{NodePool, PoolEvent};
use graphene::{MeshConfig, MessageId, NodeId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::SocketAddr;

struct Mesh {
    net: SimNet,
    pools: Vec<NodePool<SimBackend>>,
}

impl Mesh {
    fn new() -> Mesh {
        Mesh {
            net: SimNet::new(),
            pools: Vec::new(),
        }
    }

    /// Adds a pool with one endpoint listening on an automatic port.
    /// Returns (pool position, listener address).
    fn add_node(&mut self, id: u128, gateway: bool) -> (usize, SocketAddr) {
        self.add_node_configured(id, gateway, 5)
    }

    fn add_node_configured(
        &mut self,
        id: u128,
        gateway: bool,
        alive_secs: u64,
    ) -> (usize, SocketAddr) {
        let mut config = MeshConfig::default();
        config.name = format!("node-{:x}", id);
        config.gateway = gateway;
        config.alive_interval_secs = alive_secs;

        let mut pool = NodePool::new(NodeId(id), config, SimBackend::new(&self.net), None);

        let listen: SocketAddr = "10.9.0.1:0".parse().unwrap();
        let endpoint = pool.add_endpoint(&[listen]).unwrap();
        pool.listen(50).unwrap();

        let addr = pool.listener_addrs(endpoint)[0];

        self.pools.push(pool);
        (self.pools.len() - 1, addr)
    }

    fn connect(&mut self, dialer: usize, addr: SocketAddr) {
        self.pools[dialer].connect_peer(1, addr, false).unwrap();
    }

    fn connect_behind_nat(&mut self, dialer: usize, addr: SocketAddr) {
        self.pools[dialer].connect_peer(1, addr, true).unwrap();
    }

    fn step_all(&mut self, rounds: usize) {
        for _ in 0..rounds {
            for pool in self.pools.iter_mut() {
                pool.step();
            }
        }
    }

    /// Steps everything, collecting each pool's events, until the predicate
    /// holds on the collected history or the round budget runs out.
    fn run_until<F: Fn(&[Vec<PoolEvent>]) -> bool>(
        &mut self,
        rounds: usize,
        predicate: F,
    ) -> Vec<Vec<PoolEvent>> {
        let mut history: Vec<Vec<PoolEvent>> = self.pools.iter().map(|_| Vec::new()).collect();

        for _ in 0..rounds {
            for (position, pool) in self.pools.iter_mut().enumerate() {
                pool.step();
                history[position].extend(pool.poll_events());
            }

            if predicate(&history) {
                break;
            }
        }

        history
    }
}

fn established_with(history: &[PoolEvent], peer: NodeId) -> bool {
    history
        .iter()
        .any(|event| matches!(event, PoolEvent::ChannelEstablished { peer: p, .. } if *p == peer))
}

#[test]
fn two_node_single_link() {
    // A dials B; B carries the higher id and accepts the dialed socket as
    // the one channel of the pair. Both sides observe establishment.
    let mut mesh = Mesh::new();
    let (a, _) = mesh.add_node(0xA0, false);
    let (b, b_addr) = mesh.add_node(0xB0, false);

    mesh.connect(a, b_addr);

    let history = mesh.run_until(20, |history| {
        established_with(&history[0], NodeId(0xB0)) && established_with(&history[1], NodeId(0xA0))
    });

    assert!(established_with(&history[a], NodeId(0xB0)));
    assert!(established_with(&history[b], NodeId(0xA0)));

    // Exactly one channel per side.
    let count = history[a]
        .iter()
        .filter(|event| matches!(event, PoolEvent::ChannelEstablished { .. }))
        .count();
    assert_eq!(count, 1);
}

#[test]
fn duplicate_id_rejected() {
    let mut mesh = Mesh::new();
    let (a, _) = mesh.add_node(0xA0, false);
    let (_clone, clone_addr) = mesh.add_node(0xA0, false);

    mesh.connect(a, clone_addr);

    let history = mesh.run_until(20, |history| {
        history
            .iter()
            .all(|events| events.iter().any(|event| matches!(event, PoolEvent::DuplicateId { .. })))
    });

    for events in &history {
        assert!(events
            .iter()
            .any(|event| matches!(event, PoolEvent::DuplicateId { .. })));
        assert!(!established_with(events, NodeId(0xA0)));
    }

    // No channel appears later either (reconnection suppressed).
    mesh.step_all(10);
    for pool in mesh.pools.iter_mut() {
        assert!(!pool
            .poll_events()
            .iter()
            .any(|event| matches!(event, PoolEvent::ChannelEstablished { .. })));
    }
}

#[test]
fn behind_nat_dialer_accepted() {
    // The dialer has the higher id and would normally be rejected, but the
    // behind-NAT flag exempts it from the contest.
    let mut mesh = Mesh::new();
    let (low, low_addr) = mesh.add_node(0x10, false);
    let (high, _) = mesh.add_node(0x500, false);

    mesh.connect_behind_nat(high, low_addr);

    let history = mesh.run_until(20, |history| {
        established_with(&history[0], NodeId(0x500)) && established_with(&history[1], NodeId(0x10))
    });

    assert!(established_with(&history[low], NodeId(0x500)));
    assert!(established_with(&history[high], NodeId(0x10)));
}

#[test]
fn route_discovery_line_topology() {
    // A - g1 - g2 - B with both gateways forwarding. The first enqueue
    // reports unreachability, discovery finds the chain, the message then
    // completes without being re-enqueued.
    let mut mesh = Mesh::new();
    let (a, _) = mesh.add_node_configured(0x0A, false, 0);
    let (g1, g1_addr) = mesh.add_node_configured(0x100, true, 0);
    let (g2, g2_addr) = mesh.add_node_configured(0x200, true, 0);
    let (b, b_addr) = mesh.add_node_configured(0x300, false, 0);

    mesh.connect(a, g1_addr);
    mesh.pools[g1].connect_peer(1, g2_addr, false).unwrap();
    mesh.pools[g2].connect_peer(1, b_addr, false).unwrap();

    mesh.step_all(10);
    for pool in mesh.pools.iter_mut() {
        pool.poll_events();
    }

    let payload: Vec<u8> = (0..40_000u32).map(|value| value as u8).collect();
    let accepted = mesh.pools[a].enqueue_message(
        NodeId(0x300),
        MessageId(0x77),
        1,
        false,
        payload.clone(),
    );

    // No route yet: refused but queued, discovery kicks off.
    assert!(!accepted);

    let history = mesh.run_until(200, |history| {
        history[0]
            .iter()
            .any(|event| matches!(event, PoolEvent::MessageDelivered { .. }))
    });

    // The unreachable report came first, then the discovered route.
    assert!(history[a]
        .iter()
        .any(|event| matches!(event, PoolEvent::NodeUnreachable { dest } if *dest == NodeId(0x300))));
    assert!(history[a]
        .iter()
        .any(|event| matches!(event, PoolEvent::RouteReady { dest, .. } if *dest == NodeId(0x300))));
    assert!(history[a]
        .iter()
        .any(|event| matches!(event,
            PoolEvent::MessageDelivered { peer, msgid } if *peer == NodeId(0x300) && *msgid == MessageId(0x77))));

    let received = history[b].iter().find_map(|event| match event {
        PoolEvent::MessageReceived {
            peer,
            msgid,
            priority,
            bytes,
        } => Some((*peer, *msgid, *priority, bytes.clone())),
        _ => None,
    });

    let (peer, msgid, priority, bytes) = received.expect("message did not arrive");
    assert_eq!(peer, NodeId(0x0A));
    assert_eq!(msgid, MessageId(0x77));
    assert_eq!(priority, 1);
    assert_eq!(bytes, payload);

    // Received exactly once.
    let receive_count = history[b]
        .iter()
        .filter(|event| matches!(event, PoolEvent::MessageReceived { .. }))
        .count();
    assert_eq!(receive_count, 1);
}

#[test]
fn multipart_large_message() {
    // 1 MiB at the default 16 KiB part size: 64 parts, one receipt.
    let mut mesh = Mesh::new();
    let (a, _) = mesh.add_node(0xA0, false);
    let (b, b_addr) = mesh.add_node(0xB0, false);

    mesh.connect(a, b_addr);
    mesh.step_all(10);
    for pool in mesh.pools.iter_mut() {
        pool.poll_events();
    }

    let mut rng = StdRng::seed_from_u64(0x5EED);
    let payload: Vec<u8> = (0..(1usize << 20)).map(|_| rng.gen()).collect();
    assert!(mesh.pools[a].enqueue_message(
        NodeId(0xB0),
        MessageId(0x5),
        0,
        true,
        payload.clone(),
    ));

    let history = mesh.run_until(400, |history| {
        history[0]
            .iter()
            .any(|event| matches!(event, PoolEvent::MessageDelivered { .. }))
    });

    assert!(history[a]
        .iter()
        .any(|event| matches!(event, PoolEvent::MessageDelivered { .. })));

    let received = history[b].iter().find_map(|event| match event {
        PoolEvent::MessageReceived { bytes, .. } => Some(bytes.clone()),
        _ => None,
    });

    assert_eq!(received.expect("message did not arrive"), payload);

    // Progress was observed from begin to completion.
    assert!(history[b]
        .iter()
        .any(|event| matches!(event, PoolEvent::MessageBegin { total_size, .. } if *total_size == 1 << 20)));
    assert!(history[b]
        .iter()
        .any(|event| matches!(event, PoolEvent::MessageProgress { .. })));
}

#[test]
fn receiver_ready_after_sync() {
    let mut mesh = Mesh::new();
    let (a, _) = mesh.add_node(0xA0, false);
    let (_b, b_addr) = mesh.add_node(0xB0, false);

    mesh.connect(a, b_addr);
    mesh.step_all(10);
    for pool in mesh.pools.iter_mut() {
        pool.poll_events();
    }

    assert!(mesh.pools[a].enqueue_message(NodeId(0xB0), MessageId(1), 0, false, vec![1, 2, 3]));

    let history = mesh.run_until(50, |history| {
        history[0]
            .iter()
            .any(|event| matches!(event, PoolEvent::ReceiverReady { .. }))
    });

    assert!(history[a]
        .iter()
        .any(|event| matches!(event, PoolEvent::ReceiverReady { peer } if *peer == NodeId(0xB0))));
}

#[test]
fn pause_and_resume_across_gateway_loss() {
    // A - g - B. The gateway dies mid-message; the sender pauses. A new
    // gateway appears, discovery finds it, and the same message completes
    // without being enqueued again.
    let mut mesh = Mesh::new();
    let (a, _) = mesh.add_node_configured(0x0A, false, 0);
    let (g, g_addr) = mesh.add_node_configured(0x300, true, 0);
    let (b, _) = mesh.add_node_configured(0x200, false, 0);

    mesh.connect(a, g_addr);
    mesh.connect(b, g_addr);

    mesh.step_all(10);
    for pool in mesh.pools.iter_mut() {
        pool.poll_events();
    }

    // Discover the route first so the message starts flowing.
    mesh.pools[a].enqueue_message(NodeId(0x200), MessageId(0x9), 0, false, vec![0u8; 256 * 1024]);

    let history = mesh.run_until(60, |history| {
        history[0]
            .iter()
            .any(|event| matches!(event, PoolEvent::MessageBegin { .. }))
            || history[2]
                .iter()
                .any(|event| matches!(event, PoolEvent::MessageBegin { .. }))
    });

    // Transfer started but is far from done.
    assert!(history[b]
        .iter()
        .any(|event| matches!(event, PoolEvent::MessageBegin { .. })));
    assert!(!history[b]
        .iter()
        .any(|event| matches!(event, PoolEvent::MessageReceived { .. })));

    // The gateway vanishes.
    let dead = mesh.pools.remove(g);
    drop(dead);

    let history = mesh.run_until(40, |history| {
        history[0]
            .iter()
            .any(|event| matches!(event, PoolEvent::NodeUnreachable { dest } if *dest == NodeId(0x200)))
    });

    assert!(history[0]
        .iter()
        .any(|event| matches!(event, PoolEvent::NodeUnreachable { dest } if *dest == NodeId(0x200))));

    // A replacement gateway shows up; both sides dial it.
    let (_g2, g2_addr) = mesh.add_node_configured(0x400, true, 0);
    mesh.pools[0].connect_peer(1, g2_addr, false).unwrap();
    mesh.pools[1].connect_peer(1, g2_addr, false).unwrap();

    let history = mesh.run_until(400, |history| {
        history[0]
            .iter()
            .any(|event| matches!(event, PoolEvent::MessageDelivered { .. }))
    });

    assert!(history[0]
        .iter()
        .any(|event| matches!(event, PoolEvent::MessageDelivered { peer, msgid }
            if *peer == NodeId(0x200) && *msgid == MessageId(0x9))));

    let received = history[1].iter().find_map(|event| match event {
        PoolEvent::MessageReceived { msgid, bytes, .. } => Some((*msgid, bytes.len())),
        _ => None,
    });

    let (msgid, len) = received.expect("message did not complete after resume");
    assert_eq!(msgid, MessageId(0x9));
    assert_eq!(len, 256 * 1024);
}

#[test]
fn alive_and_expiry_across_mesh() {
    let mut mesh = Mesh::new();
    let (a, _) = mesh.add_node_configured(0x0A, false, 0);
    let (g, g_addr) = mesh.add_node_configured(0x300, true, 0);
    let (b, _) = mesh.add_node_configured(0x200, false, 0);

    mesh.connect(a, g_addr);
    mesh.connect(b, g_addr);

    let history = mesh.run_until(30, |history| {
        history[2]
            .iter()
            .any(|event| matches!(event, PoolEvent::Alive { id } if *id == NodeId(0x0A)))
    });

    // B learned that A is alive although they are not neighbors.
    assert!(history[b]
        .iter()
        .any(|event| matches!(event, PoolEvent::Alive { id } if *id == NodeId(0x0A))));

    let _ = (a, g);
}

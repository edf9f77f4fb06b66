//! Delivery manager: one controller per peer plus the user-facing API.
//!
//! The controller map is the only shared state in the core; a mutex guards
//! it because `enqueue_message`/`enqueue_report` may be called from a thread
//! other than the one driving `step()`.

use crate::delivery::controller::{DeliveryController, DeliveryEvent, Outbound};
use crate::delivery::packet::ReportPacket;
use crate::identity::{MessageId, NodeId};
use crate::support::NetworkResult;
use hashbrown::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct DeliveryManager {
    weights: Vec<usize>,
    part_size: u32,
    exp_timeout: Duration,
    controllers: Mutex<HashMap<NodeId, DeliveryController>>,
}

impl DeliveryManager {
    pub fn new(weights: &[usize], part_size: u32, exp_timeout: Duration) -> DeliveryManager {
        DeliveryManager {
            weights: weights.to_vec(),
            part_size,
            exp_timeout,
            controllers: Mutex::new(HashMap::new()),
        }
    }

    fn with_controller<R, F: FnOnce(&mut DeliveryController) -> R>(&self, peer: NodeId, f: F) -> R {
        let mut controllers = self.controllers.lock().expect("delivery manager poisoned");

        let controller = controllers.entry(peer).or_insert_with(|| {
            DeliveryController::new(peer, &self.weights, self.part_size, self.exp_timeout)
        });

        f(controller)
    }

    /// Queues a reliable message towards `peer`. False when the controller
    /// is paused (the peer is unreachable).
    pub fn enqueue_message(
        &self,
        peer: NodeId,
        msgid: MessageId,
        priority: usize,
        force_checksum: bool,
        bytes: Vec<u8>,
    ) -> bool {
        self.with_controller(peer, |controller| {
            controller.enqueue_message(msgid, priority, force_checksum, bytes)
        })
    }

    /// Serializes a fire-and-forget report. The caller hands the result to
    /// the transport directly; no per-peer state is involved.
    pub fn serialize_report(bytes: &[u8]) -> Vec<u8> {
        ReportPacket::serialize(bytes)
    }

    pub fn pause(&self, peer: NodeId) {
        self.with_controller(peer, |controller| controller.pause());
    }

    pub fn resume(&self, peer: NodeId) {
        self.with_controller(peer, |controller| controller.resume());
    }

    pub fn is_paused(&self, peer: NodeId) -> bool {
        let controllers = self.controllers.lock().expect("delivery manager poisoned");

        controllers
            .get(&peer)
            .map_or(false, |controller| controller.is_paused())
    }

    pub fn has_backlog(&self, peer: NodeId) -> bool {
        let controllers = self.controllers.lock().expect("delivery manager poisoned");

        controllers
            .get(&peer)
            .map_or(false, |controller| controller.has_backlog())
    }

    /// Routes one inbound DDATA/GDATA payload to the peer's controller.
    pub fn process_input(
        &self,
        peer: NodeId,
        priority: usize,
        bytes: &[u8],
        events: &mut Vec<DeliveryEvent>,
        out: &mut Vec<Outbound>,
    ) -> NetworkResult<()> {
        self.with_controller(peer, |controller| {
            controller.process_input(priority, bytes, events, out)
        })
    }

    /// Drives every controller once.
    pub fn step(&self, now: Instant, out: &mut Vec<Outbound>) -> usize {
        let mut controllers = self.controllers.lock().expect("delivery manager poisoned");
        let mut count = 0;

        for controller in controllers.values_mut() {
            count += controller.step(now, out);
        }

        count
    }
}

//! Peer identity exchange.
//!
//! The dialing side sends a handshake request and caches the socket with a
//! deadline; the accepting side answers with a response that either accepts
//! the socket into a channel or declines it. In single-link mode the node id
//! order decides which side owns the one socket of the pair (behind-NAT
//! dialers are exempt since only they can dial). In dual-link mode each side
//! keeps its own socket: the acceptor takes the reader slot, the initiator
//! the writer slot.

use crate::identity::{NodeId, SocketId};
use crate::packet::HandshakePacket;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LinkMode {
    /// One socket serves as both reader and writer.
    Single,
    /// Reader and writer are distinct sockets, one dialed from each side.
    Dual,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HandshakeRole {
    Both,
    Reader,
    Writer,
}

/// What the channel must do with a socket after one handshake packet.
#[derive(Debug, Eq, PartialEq)]
pub enum HandshakeAction {
    /// The socket joins the channel to `peer` in the given role. `reply`
    /// holds response bytes to enqueue first, when we are the acceptor.
    Accept {
        peer: NodeId,
        name: String,
        is_gateway: bool,
        role: HandshakeRole,
        reply: Option<Vec<u8>>,
    },
    /// We turned the request down; the reply tells the dialer to close.
    Decline { reply: Vec<u8> },
    /// The peer carries our own identifier. On the accepting side a
    /// rejection reply is attached so the dialer learns of the collision
    /// and closes; on the dialing side the socket is closed here.
    Duplicate { peer: NodeId, reply: Option<Vec<u8>> },
    /// Our own request was turned down.
    Rejected { peer: NodeId },
    /// A response arrived for a socket that is no longer cached.
    Stale,
}

pub struct HandshakeController {
    id: NodeId,
    name: String,
    is_gateway: bool,
    mode: LinkMode,
    timeout: Duration,
    cache: HashMap<SocketId, Instant>,
}

impl HandshakeController {
    pub fn new(id: NodeId, name: &str, is_gateway: bool, mode: LinkMode) -> HandshakeController {
        HandshakeController {
            id,
            name: name.to_string(),
            is_gateway,
            mode,
            timeout: DEFAULT_TIMEOUT,
            cache: HashMap::new(),
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Begins the handshake on a freshly connected outbound socket. Returns
    /// the serialized request; the caller enqueues it at priority 0.
    pub fn start(&mut self, sid: SocketId, behind_nat: bool) -> Vec<u8> {
        self.cache.insert(sid, Instant::now() + self.timeout);

        HandshakePacket::request(self.id, &self.name, self.is_gateway, behind_nat).serialize()
    }

    pub fn cancel(&mut self, sid: SocketId) {
        self.cache.remove(&sid);
    }

    #[inline]
    pub fn pending(&self, sid: SocketId) -> bool {
        self.cache.contains_key(&sid)
    }

    /// Sweeps the request cache; sockets past their deadline are returned
    /// for closing.
    pub fn step(&mut self, now: Instant) -> Vec<SocketId> {
        let mut expired = Vec::new();

        self.cache.retain(|&sid, &mut deadline| {
            if deadline <= now {
                expired.push(sid);
                false
            } else {
                true
            }
        });

        expired
    }

    pub fn process(&mut self, sid: SocketId, pkt: &HandshakePacket) -> HandshakeAction {
        if pkt.is_response {
            self.process_response(sid, pkt)
        } else {
            self.process_request(pkt)
        }
    }

    fn process_response(&mut self, sid: SocketId, pkt: &HandshakePacket) -> HandshakeAction {
        if !self.pending(sid) {
            return HandshakeAction::Stale;
        }

        self.cancel(sid);

        if pkt.id == self.id {
            return HandshakeAction::Duplicate {
                peer: pkt.id,
                reply: None,
            };
        }

        if !pkt.accepted {
            return HandshakeAction::Rejected { peer: pkt.id };
        }

        let role = match self.mode {
            LinkMode::Single => HandshakeRole::Both,
            LinkMode::Dual => HandshakeRole::Writer,
        };

        HandshakeAction::Accept {
            peer: pkt.id,
            name: pkt.name.clone(),
            is_gateway: pkt.is_gateway,
            role,
            reply: None,
        }
    }

    fn process_request(&mut self, pkt: &HandshakePacket) -> HandshakeAction {
        if pkt.id == self.id {
            let reply =
                HandshakePacket::response(self.id, &self.name, self.is_gateway, false).serialize();

            return HandshakeAction::Duplicate {
                peer: pkt.id,
                reply: Some(reply),
            };
        }

        let accepted = match self.mode {
            // The id comparison deterministically picks the side whose dialed
            // socket survives; a behind-NAT dialer always wins since only it
            // can dial.
            LinkMode::Single => pkt.behind_nat || self.id > pkt.id,
            LinkMode::Dual => true,
        };

        if !accepted {
            let reply =
                HandshakePacket::response(self.id, &self.name, self.is_gateway, false).serialize();

            return HandshakeAction::Decline { reply };
        }

        let role = match self.mode {
            LinkMode::Single => HandshakeRole::Both,
            LinkMode::Dual => HandshakeRole::Reader,
        };

        let reply =
            HandshakePacket::response(self.id, &self.name, self.is_gateway, true).serialize();

        HandshakeAction::Accept {
            peer: pkt.id,
            name: pkt.name.clone(),
            is_gateway: pkt.is_gateway,
            role,
            reply: Some(reply),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOW: NodeId = NodeId(10);
    const HIGH: NodeId = NodeId(20);

    fn controller(id: NodeId, mode: LinkMode) -> HandshakeController {
        HandshakeController::new(id, "test", false, mode)
    }

    #[test]
    fn test_higher_id_accepts_request() {
        let mut hs = controller(HIGH, LinkMode::Single);
        let request = HandshakePacket::request(LOW, "low", false, false);

        match hs.process(SocketId(1), &request) {
            HandshakeAction::Accept {
                peer, role, reply, ..
            } => {
                assert_eq!(peer, LOW);
                assert_eq!(role, HandshakeRole::Both);
                assert!(reply.is_some());
            }
            other => panic!("Unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_lower_id_declines_request() {
        let mut hs = controller(LOW, LinkMode::Single);
        let request = HandshakePacket::request(HIGH, "high", false, false);

        match hs.process(SocketId(1), &request) {
            HandshakeAction::Decline { .. } => (),
            other => panic!("Unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_behind_nat_always_accepted() {
        let mut hs = controller(LOW, LinkMode::Single);
        let request = HandshakePacket::request(HIGH, "high", false, true);

        match hs.process(SocketId(1), &request) {
            HandshakeAction::Accept { peer, .. } => assert_eq!(peer, HIGH),
            other => panic!("Unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_id_on_request() {
        let mut hs = controller(LOW, LinkMode::Single);
        let request = HandshakePacket::request(LOW, "other-low", false, false);

        match hs.process(SocketId(1), &request) {
            HandshakeAction::Duplicate { peer, reply } => {
                assert_eq!(peer, LOW);
                assert!(reply.is_some());
            }
            other => panic!("Unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_id_on_response() {
        let mut hs = controller(LOW, LinkMode::Single);
        let sid = SocketId(2);

        hs.start(sid, false);

        // The acceptor rejected us with our own identifier attached.
        let response = HandshakePacket::response(LOW, "other-low", false, false);

        match hs.process(sid, &response) {
            HandshakeAction::Duplicate { peer, reply } => {
                assert_eq!(peer, LOW);
                assert!(reply.is_none());
            }
            other => panic!("Unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_accepted_response_completes() {
        let mut hs = controller(LOW, LinkMode::Single);
        let sid = SocketId(3);

        hs.start(sid, false);
        assert!(hs.pending(sid));

        let response = HandshakePacket::response(HIGH, "high", true, true);

        match hs.process(sid, &response) {
            HandshakeAction::Accept {
                peer,
                is_gateway,
                role,
                reply,
                ..
            } => {
                assert_eq!(peer, HIGH);
                assert!(is_gateway);
                assert_eq!(role, HandshakeRole::Both);
                assert!(reply.is_none());
            }
            other => panic!("Unexpected action {:?}", other),
        }

        assert!(!hs.pending(sid));
    }

    #[test]
    fn test_rejected_response() {
        let mut hs = controller(HIGH, LinkMode::Single);
        let sid = SocketId(4);

        hs.start(sid, false);

        let response = HandshakePacket::response(LOW, "low", false, false);

        assert_eq!(
            hs.process(sid, &response),
            HandshakeAction::Rejected { peer: LOW }
        );
    }

    #[test]
    fn test_stale_response_ignored() {
        let mut hs = controller(LOW, LinkMode::Single);
        let response = HandshakePacket::response(HIGH, "high", false, true);

        assert_eq!(hs.process(SocketId(9), &response), HandshakeAction::Stale);
    }

    #[test]
    fn test_deadline_expiry() {
        let mut hs = controller(LOW, LinkMode::Single);
        hs.set_timeout(Duration::from_millis(0));

        hs.start(SocketId(5), false);

        let expired = hs.step(Instant::now() + Duration::from_millis(1));

        assert_eq!(expired, vec![SocketId(5)]);
        assert!(!hs.pending(SocketId(5)));
    }

    #[test]
    fn test_dual_link_roles() {
        let mut hs = controller(LOW, LinkMode::Dual);
        let request = HandshakePacket::request(HIGH, "high", false, false);

        match hs.process(SocketId(1), &request) {
            HandshakeAction::Accept { role, .. } => assert_eq!(role, HandshakeRole::Reader),
            other => panic!("Unexpected action {:?}", other),
        }

        let sid = SocketId(2);
        hs.start(sid, false);

        let response = HandshakePacket::response(HIGH, "high", false, true);

        match hs.process(sid, &response) {
            HandshakeAction::Accept { role, .. } => assert_eq!(role, HandshakeRole::Writer),
            other => panic!("Unexpected action {:?}", other),
        }
    }
}

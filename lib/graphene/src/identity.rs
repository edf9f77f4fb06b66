//! Identifiers used across the mesh: node, message, socket and endpoint.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// 128-bit node identifier with a total order. The handshake uses the order
/// to break ties when two nodes dial each other simultaneously.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(pub u128);

impl NodeId {
    /// Reserved "no node" value.
    pub const NIL: NodeId = NodeId(0);

    #[inline]
    pub fn new(high: u64, low: u64) -> NodeId {
        NodeId(((high as u128) << 64) | low as u128)
    }

    #[inline]
    pub fn high(self) -> u64 {
        (self.0 >> 64) as u64
    }

    #[inline]
    pub fn low(self) -> u64 {
        self.0 as u64
    }

    #[inline]
    pub fn is_nil(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// 128-bit message identifier allocated by the sender of a reliable message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MessageId(pub u128);

impl MessageId {
    /// Reserved "no message" value, used in synchronization packets for
    /// priority classes with nothing in flight.
    pub const NIL: MessageId = MessageId(0);

    #[inline]
    pub fn is_nil(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Endpoint index within a node pool. 0 is reserved as invalid; the first
/// endpoint added gets index 1.
pub type PeerIndex = usize;

pub const INVALID_PEER_INDEX: PeerIndex = 0;

/// Opaque identifier of one open byte stream. Unique within the process
/// regardless of which backend produced the stream.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SocketId(pub u64);

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

impl SocketId {
    pub const INVALID: SocketId = SocketId(0);

    /// Allocates a fresh process-unique socket identifier.
    #[inline]
    pub fn next() -> SocketId {
        SocketId(NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Serial number of one delivery part. Allocated monotonically per
/// (peer, priority) stream; 0 is reserved as invalid/initial.
pub type SerialNumber = u64;

pub const INVALID_SERIAL: SerialNumber = 0;

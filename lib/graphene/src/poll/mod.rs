//! Socket pool contracts and socket ownership.
//!
//! The core drives four pools per channel (connecting, listener, reader,
//! writer) and owns the sockets themselves in a `SocketTable`. Each pool
//! trait mirrors the same lifecycle: mutate, `step()` to collect events,
//! `remove_later`/`apply_remove` for deferred teardown at the bottom of the
//! channel's step. Two families implement the contracts: `tcp` over mio and
//! `sim` over in-process pipes for deterministic tests.

pub mod sim;
pub mod tcp;

use crate::identity::SocketId;
use crate::support::{NetworkError, NetworkResult, RecvStatus, SendStatus};
use hashbrown::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Outcome of a dial attempt.
#[derive(Debug, Eq, PartialEq)]
pub enum ConnStatus {
    Connected,
    Connecting,
    Deferred,
    Failure,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RefusedReason {
    Refused,
    Unreachable,
    TimedOut,
}

#[derive(Debug)]
pub enum ConnectingEvent<S> {
    Connected(S),
    Refused {
        addr: SocketAddr,
        reason: RefusedReason,
    },
    Failure {
        addr: SocketAddr,
        error: NetworkError,
    },
}

#[derive(Debug)]
pub enum ListenerEvent<S> {
    Accepted(S),
    Failure { error: NetworkError },
}

#[derive(Debug)]
pub enum ReaderEvent {
    DataReady { sid: SocketId, bytes: Vec<u8> },
    Disconnected { sid: SocketId },
    Failure { sid: SocketId, error: NetworkError },
}

#[derive(Debug)]
pub enum WriterEvent {
    BytesWritten { sid: SocketId, count: u64 },
    Failure { sid: SocketId, error: NetworkError },
}

/// One non-blocking byte stream handed out by a backend.
pub trait StreamSocket {
    fn id(&self) -> SocketId;
    fn peer_addr(&self) -> Option<SocketAddr>;
    fn send(&mut self, data: &[u8]) -> SendStatus;
    fn recv(&mut self, buf: &mut [u8]) -> RecvStatus;
}

pub trait ConnectingPool {
    type Socket: StreamSocket;

    fn connect(&mut self, addr: SocketAddr) -> ConnStatus;

    /// Schedules a dial for later; reconnection policies land here.
    fn connect_deferred(&mut self, delay: Duration, addr: SocketAddr);

    fn remove_later(&mut self, sid: SocketId);
    fn apply_remove(&mut self);

    fn step(&mut self, events: &mut Vec<ConnectingEvent<Self::Socket>>) -> usize;
}

pub trait ListenerPool {
    type Socket: StreamSocket;

    /// Binds the address and returns the actual bound address (port 0 gets
    /// resolved here).
    fn add(&mut self, addr: SocketAddr) -> NetworkResult<SocketAddr>;

    /// Starts accepting on every bound address.
    fn listen(&mut self, backlog: u32) -> NetworkResult<()>;

    fn step(&mut self, events: &mut Vec<ListenerEvent<Self::Socket>>) -> usize;
}

pub trait ReaderPool {
    type Socket: StreamSocket;

    fn add(&mut self, sock: &Self::Socket);
    fn remove_later(&mut self, sid: SocketId);
    fn apply_remove(&mut self);

    fn step(
        &mut self,
        sockets: &mut SocketTable<Self::Socket>,
        events: &mut Vec<ReaderEvent>,
    ) -> usize;
}

pub trait WriterPool {
    type Socket: StreamSocket;

    /// Creates the account (queue and frame size) for a socket.
    fn ensure(&mut self, sock: &Self::Socket, frame_size: u16);

    /// Caps outbound frame size for an existing account.
    fn set_frame_size(&mut self, sid: SocketId, frame_size: u16);

    /// Queues bytes at a priority. False when the socket has no account.
    fn enqueue(&mut self, sid: SocketId, priority: usize, bytes: Vec<u8>) -> bool;

    /// Total payload bytes pending across all accounts.
    fn remain_bytes(&self) -> u64;

    fn remove_later(&mut self, sid: SocketId);
    fn apply_remove(&mut self);

    fn step(
        &mut self,
        sockets: &mut SocketTable<Self::Socket>,
        events: &mut Vec<WriterEvent>,
    ) -> usize;
}

/// One pool family. A channel is generic over this and nothing else touches
/// the concrete socket type.
pub trait Backend {
    type Socket: StreamSocket;
    type Connecting: ConnectingPool<Socket = Self::Socket>;
    type Listener: ListenerPool<Socket = Self::Socket>;
    type Reader: ReaderPool<Socket = Self::Socket>;
    type Writer: WriterPool<Socket = Self::Socket>;

    fn connecting_pool(&self) -> NetworkResult<Self::Connecting>;
    fn listener_pool(&self) -> NetworkResult<Self::Listener>;
    fn reader_pool(&self) -> NetworkResult<Self::Reader>;
    fn writer_pool(&self, weights: &[usize]) -> NetworkResult<Self::Writer>;
}

pub struct SocketEntry<S> {
    pub socket: S,
    /// True when the listener produced this socket. Accepted sockets are
    /// never re-dialled.
    pub accepted: bool,
    /// The address this side dialed, kept for reconnection.
    pub dial_addr: Option<SocketAddr>,
}

/// Owner of the open sockets of one channel. Pools borrow sockets during
/// their step; removal is deferred and applied after every pool finished,
/// so the table must be the last to apply.
pub struct SocketTable<S> {
    map: HashMap<SocketId, SocketEntry<S>>,
    removable: Vec<SocketId>,
}

impl<S: StreamSocket> SocketTable<S> {
    pub fn new() -> SocketTable<S> {
        SocketTable {
            map: HashMap::new(),
            removable: Vec::new(),
        }
    }

    pub fn insert(&mut self, socket: S, accepted: bool, dial_addr: Option<SocketAddr>) {
        let sid = socket.id();

        self.map.insert(
            sid,
            SocketEntry {
                socket,
                accepted,
                dial_addr,
            },
        );
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn entry(&self, sid: SocketId) -> Option<&SocketEntry<S>> {
        self.map.get(&sid)
    }

    #[inline]
    pub fn socket_mut(&mut self, sid: SocketId) -> Option<&mut S> {
        self.map.get_mut(&sid).map(|entry| &mut entry.socket)
    }

    pub fn remove_later(&mut self, sid: SocketId) {
        self.removable.push(sid);
    }

    pub fn apply_remove(&mut self) {
        if !self.removable.is_empty() {
            for sid in self.removable.drain(..) {
                self.map.remove(&sid);
            }
        }
    }
}

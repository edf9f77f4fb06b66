//! In-process pool family for deterministic tests.
//!
//! A `SimNet` hub stands in for the OS: listeners bind addresses in a shared
//! registry and dials produce paired pipe sockets. Readiness is trivial:
//! the reader pool drains whatever the pipes hold and the writer pool
//! retries would-block on the next step. Single-threaded only.

use crate::identity::SocketId;
use crate::poll::{
    Backend, ConnStatus, ConnectingEvent, ConnectingPool, ListenerEvent, ListenerPool, ReaderEvent,
    ReaderPool, RefusedReason, SocketTable, StreamSocket, WriterEvent, WriterPool,
};
use crate::queue::PriorityWriterQueue;
use crate::support::{NetworkError, NetworkResult, RecvStatus, SendStatus};
use hashbrown::HashMap;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub const DEFAULT_PIPE_CAPACITY: usize = 1 << 20;

struct Pipe {
    buf: VecDeque<u8>,
    closed: bool,
    capacity: usize,
}

impl Pipe {
    fn new(capacity: usize) -> Rc<RefCell<Pipe>> {
        Rc::new(RefCell::new(Pipe {
            buf: VecDeque::new(),
            closed: false,
            capacity,
        }))
    }
}

pub struct SimSocket {
    id: SocketId,
    peer: SocketAddr,
    outgoing: Rc<RefCell<Pipe>>,
    incoming: Rc<RefCell<Pipe>>,
}

impl SimSocket {
    /// Builds a connected socket pair: (dialer end, acceptor end).
    fn pair(dialer_seen_addr: SocketAddr, acceptor_seen_addr: SocketAddr, capacity: usize) -> (SimSocket, SimSocket) {
        let a_to_b = Pipe::new(capacity);
        let b_to_a = Pipe::new(capacity);

        let dialer = SimSocket {
            id: SocketId::next(),
            peer: dialer_seen_addr,
            outgoing: a_to_b.clone(),
            incoming: b_to_a.clone(),
        };

        let acceptor = SimSocket {
            id: SocketId::next(),
            peer: acceptor_seen_addr,
            outgoing: b_to_a,
            incoming: a_to_b,
        };

        (dialer, acceptor)
    }
}

impl Drop for SimSocket {
    fn drop(&mut self) {
        // The peer sees a clean disconnect once it drained the pipe.
        self.outgoing.borrow_mut().closed = true;
        self.incoming.borrow_mut().closed = true;
    }
}

impl StreamSocket for SimSocket {
    #[inline]
    fn id(&self) -> SocketId {
        self.id
    }

    #[inline]
    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    fn send(&mut self, data: &[u8]) -> SendStatus {
        let mut pipe = self.outgoing.borrow_mut();

        if pipe.closed {
            return SendStatus::Closed;
        }

        let free = pipe.capacity - pipe.buf.len();

        if free == 0 {
            return SendStatus::Again;
        }

        let take = free.min(data.len());
        pipe.buf.extend(&data[..take]);
        SendStatus::Sent(take)
    }

    fn recv(&mut self, buf: &mut [u8]) -> RecvStatus {
        let mut pipe = self.incoming.borrow_mut();

        if pipe.buf.is_empty() {
            return if pipe.closed {
                RecvStatus::Closed
            } else {
                RecvStatus::Again
            };
        }

        let take = buf.len().min(pipe.buf.len());

        for slot in buf.iter_mut().take(take) {
            *slot = pipe.buf.pop_front().expect("sim pipe underrun");
        }

        RecvStatus::Received(take)
    }
}

struct Binding {
    listening: bool,
    accept_queue: VecDeque<SimSocket>,
}

struct SimNetInner {
    bindings: HashMap<SocketAddr, Binding>,
    next_auto_port: u16,
    pipe_capacity: usize,
}

/// Shared fabric connecting every sim backend of one test.
#[derive(Clone)]
pub struct SimNet {
    inner: Rc<RefCell<SimNetInner>>,
}

impl SimNet {
    pub fn new() -> SimNet {
        SimNet::with_pipe_capacity(DEFAULT_PIPE_CAPACITY)
    }

    /// Small capacities let tests exercise writer back-pressure.
    pub fn with_pipe_capacity(pipe_capacity: usize) -> SimNet {
        SimNet {
            inner: Rc::new(RefCell::new(SimNetInner {
                bindings: HashMap::new(),
                next_auto_port: 40000,
                pipe_capacity,
            })),
        }
    }

    fn bind(&self, addr: SocketAddr) -> NetworkResult<SocketAddr> {
        let mut inner = self.inner.borrow_mut();

        let mut bound = addr;

        if bound.port() == 0 {
            let port = inner.next_auto_port;
            inner.next_auto_port += 1;
            bound.set_port(port);
        }

        if inner.bindings.contains_key(&bound) {
            return Err(NetworkError::Fatal(crate::support::ErrorType::Io(
                std::io::ErrorKind::AddrInUse,
            )));
        }

        inner.bindings.insert(
            bound,
            Binding {
                listening: false,
                accept_queue: VecDeque::new(),
            },
        );

        Ok(bound)
    }

    fn listen(&self, addr: SocketAddr) {
        if let Some(binding) = self.inner.borrow_mut().bindings.get_mut(&addr) {
            binding.listening = true;
        }
    }

    fn connect(&self, addr: SocketAddr) -> Result<SimSocket, RefusedReason> {
        let mut inner = self.inner.borrow_mut();
        let capacity = inner.pipe_capacity;

        match inner.bindings.get_mut(&addr) {
            Some(binding) if binding.listening => {
                let (dialer, acceptor) = SimSocket::pair(addr, addr, capacity);
                binding.accept_queue.push_back(acceptor);
                Ok(dialer)
            }
            Some(_) => Err(RefusedReason::Refused),
            None => Err(RefusedReason::Unreachable),
        }
    }

    fn drain_accepted(&self, addr: SocketAddr, out: &mut Vec<SimSocket>) {
        if let Some(binding) = self.inner.borrow_mut().bindings.get_mut(&addr) {
            out.extend(binding.accept_queue.drain(..));
        }
    }
}

pub struct SimConnectingPool {
    net: SimNet,
    ready: Vec<ConnectingEvent<SimSocket>>,
    deferred: Vec<(Instant, SocketAddr)>,
}

impl ConnectingPool for SimConnectingPool {
    type Socket = SimSocket;

    fn connect(&mut self, addr: SocketAddr) -> ConnStatus {
        match self.net.connect(addr) {
            Ok(sock) => {
                self.ready.push(ConnectingEvent::Connected(sock));
                ConnStatus::Connecting
            }
            Err(reason) => {
                self.ready.push(ConnectingEvent::Refused { addr, reason });
                ConnStatus::Connecting
            }
        }
    }

    fn connect_deferred(&mut self, delay: Duration, addr: SocketAddr) {
        self.deferred.push((Instant::now() + delay, addr));
    }

    fn remove_later(&mut self, _sid: SocketId) {}

    fn apply_remove(&mut self) {}

    fn step(&mut self, events: &mut Vec<ConnectingEvent<SimSocket>>) -> usize {
        let now = Instant::now();
        let mut due = Vec::new();

        self.deferred.retain(|&(at, addr)| {
            if at <= now {
                due.push(addr);
                false
            } else {
                true
            }
        });

        for addr in due {
            self.connect(addr);
        }

        let count = self.ready.len();
        events.append(&mut self.ready);
        count
    }
}

pub struct SimListenerPool {
    net: SimNet,
    bound: Vec<SocketAddr>,
}

impl ListenerPool for SimListenerPool {
    type Socket = SimSocket;

    fn add(&mut self, addr: SocketAddr) -> NetworkResult<SocketAddr> {
        let bound = self.net.bind(addr)?;
        self.bound.push(bound);
        Ok(bound)
    }

    fn listen(&mut self, _backlog: u32) -> NetworkResult<()> {
        for &addr in &self.bound {
            self.net.listen(addr);
        }

        Ok(())
    }

    fn step(&mut self, events: &mut Vec<ListenerEvent<SimSocket>>) -> usize {
        let mut accepted = Vec::new();

        for &addr in &self.bound {
            self.net.drain_accepted(addr, &mut accepted);
        }

        let count = accepted.len();

        for sock in accepted {
            events.push(ListenerEvent::Accepted(sock));
        }

        count
    }
}

pub struct SimReaderPool {
    registered: Vec<SocketId>,
    removable: Vec<SocketId>,
}

impl ReaderPool for SimReaderPool {
    type Socket = SimSocket;

    fn add(&mut self, sock: &SimSocket) {
        self.registered.push(sock.id);
    }

    fn remove_later(&mut self, sid: SocketId) {
        self.removable.push(sid);
    }

    fn apply_remove(&mut self) {
        for sid in self.removable.drain(..) {
            self.registered.retain(|&other| other != sid);
        }
    }

    fn step(
        &mut self,
        sockets: &mut SocketTable<SimSocket>,
        events: &mut Vec<ReaderEvent>,
    ) -> usize {
        let mut count = 0;
        let sids = self.registered.clone();

        for sid in sids {
            let sock = match sockets.socket_mut(sid) {
                Some(sock) => sock,
                None => continue,
            };

            let mut chunk = Vec::new();
            let mut buf = [0u8; 2048];
            let mut disconnected = false;

            loop {
                match sock.recv(&mut buf) {
                    RecvStatus::Received(n) => chunk.extend_from_slice(&buf[..n]),
                    RecvStatus::Again => break,
                    RecvStatus::Closed => {
                        disconnected = true;
                        break;
                    }
                    RecvStatus::Failure(error) => {
                        count += 1;
                        events.push(ReaderEvent::Failure {
                            sid,
                            error: NetworkError::Fatal(error),
                        });
                        disconnected = true;
                        break;
                    }
                }
            }

            if !chunk.is_empty() {
                count += 1;
                events.push(ReaderEvent::DataReady { sid, bytes: chunk });
            }

            if disconnected {
                count += 1;
                events.push(ReaderEvent::Disconnected { sid });
                self.removable.push(sid);
            }
        }

        count
    }
}

struct SimWriterAccount {
    queue: PriorityWriterQueue,
    frame_size: u16,
}

pub struct SimWriterPool {
    weights: Vec<usize>,
    // Insertion-ordered so the send loop visits accounts deterministically.
    accounts: IndexMap<SocketId, SimWriterAccount>,
    removable: Vec<SocketId>,
}

impl WriterPool for SimWriterPool {
    type Socket = SimSocket;

    fn ensure(&mut self, sock: &SimSocket, frame_size: u16) {
        if let Some(account) = self.accounts.get_mut(&sock.id) {
            account.frame_size = frame_size;
            return;
        }

        self.accounts.insert(
            sock.id,
            SimWriterAccount {
                queue: PriorityWriterQueue::new(&self.weights),
                frame_size,
            },
        );
    }

    fn set_frame_size(&mut self, sid: SocketId, frame_size: u16) {
        if let Some(account) = self.accounts.get_mut(&sid) {
            account.frame_size = frame_size;
        }
    }

    fn enqueue(&mut self, sid: SocketId, priority: usize, bytes: Vec<u8>) -> bool {
        match self.accounts.get_mut(&sid) {
            Some(account) => {
                account.queue.enqueue(priority, bytes);
                true
            }
            None => false,
        }
    }

    fn remain_bytes(&self) -> u64 {
        self.accounts
            .values()
            .map(|account| account.queue.remain_bytes())
            .sum()
    }

    fn remove_later(&mut self, sid: SocketId) {
        self.removable.push(sid);
    }

    fn apply_remove(&mut self) {
        for sid in self.removable.drain(..) {
            self.accounts.remove(&sid);
        }
    }

    fn step(
        &mut self,
        sockets: &mut SocketTable<SimSocket>,
        events: &mut Vec<WriterEvent>,
    ) -> usize {
        let mut count = 0;
        let mut frame = Vec::new();
        let sids: Vec<SocketId> = self.accounts.keys().cloned().collect();

        for sid in sids {
            let account = self.accounts.get_mut(&sid).expect("writer account vanished");

            if account.queue.is_empty() {
                continue;
            }

            let sock = match sockets.socket_mut(sid) {
                Some(sock) => sock,
                None => {
                    self.removable.push(sid);
                    continue;
                }
            };

            let mut written = 0u64;

            loop {
                frame.clear();

                if !account.queue.acquire_frame(account.frame_size as usize, &mut frame) {
                    break;
                }

                match sock.send(&frame) {
                    SendStatus::Sent(n) => {
                        account.queue.shift(n);
                        written += n as u64;
                    }
                    SendStatus::Again => break,
                    SendStatus::Closed => {
                        count += 1;
                        events.push(WriterEvent::Failure {
                            sid,
                            error: NetworkError::Fatal(crate::support::ErrorType::Io(
                                std::io::ErrorKind::ConnectionReset,
                            )),
                        });
                        self.removable.push(sid);
                        break;
                    }
                    SendStatus::Failure(error) => {
                        count += 1;
                        events.push(WriterEvent::Failure {
                            sid,
                            error: NetworkError::Fatal(error),
                        });
                        self.removable.push(sid);
                        break;
                    }
                }
            }

            if written > 0 {
                count += 1;
                events.push(WriterEvent::BytesWritten {
                    sid,
                    count: written,
                });
            }
        }

        count
    }
}

/// Pool family over the in-process fabric. Clone the inner `SimNet` across
/// backends so their sockets can reach each other.
#[derive(Clone)]
pub struct SimBackend {
    net: SimNet,
}

impl SimBackend {
    pub fn new(net: &SimNet) -> SimBackend {
        SimBackend { net: net.clone() }
    }
}

impl Backend for SimBackend {
    type Socket = SimSocket;
    type Connecting = SimConnectingPool;
    type Listener = SimListenerPool;
    type Reader = SimReaderPool;
    type Writer = SimWriterPool;

    fn connecting_pool(&self) -> NetworkResult<SimConnectingPool> {
        Ok(SimConnectingPool {
            net: self.net.clone(),
            ready: Vec::new(),
            deferred: Vec::new(),
        })
    }

    fn listener_pool(&self) -> NetworkResult<SimListenerPool> {
        Ok(SimListenerPool {
            net: self.net.clone(),
            bound: Vec::new(),
        })
    }

    fn reader_pool(&self) -> NetworkResult<SimReaderPool> {
        Ok(SimReaderPool {
            registered: Vec::new(),
            removable: Vec::new(),
        })
    }

    fn writer_pool(&self, weights: &[usize]) -> NetworkResult<SimWriterPool> {
        Ok(SimWriterPool {
            weights: weights.to_vec(),
            accounts: IndexMap::new(),
            removable: Vec::new(),
        })
    }
}

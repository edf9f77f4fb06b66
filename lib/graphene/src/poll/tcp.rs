//! mio-backed pool family.
//!
//! Each pool runs its own `mio::Poll` instance polled with a zero timeout,
//! so a channel `step()` never blocks. Sockets are edge-registered and
//! drained/filled until the OS reports would-block.

use crate::identity::SocketId;
use crate::poll::{
    Backend, ConnStatus, ConnectingEvent, ConnectingPool, ListenerEvent, ListenerPool, ReaderEvent,
    ReaderPool, RefusedReason, SocketTable, StreamSocket, WriterEvent, WriterPool,
};
use crate::queue::PriorityWriterQueue;
use crate::support::{ErrorType, NetworkError, NetworkResult, RecvStatus, SendStatus};
use hashbrown::{HashMap, HashSet};
use indexmap::IndexMap;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Poll, PollOpt, Ready, Token};
use std::io;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const POLL_CAPACITY: usize = 1024;
const READ_CHUNK: usize = 2048;

#[inline]
fn token(sid: SocketId) -> Token {
    Token(sid.0 as usize)
}

#[inline]
fn sid_of(token: Token) -> SocketId {
    SocketId(token.0 as u64)
}

#[inline]
fn zero_timeout() -> Option<Duration> {
    Some(Duration::from_millis(0))
}

pub struct TcpSocket {
    id: SocketId,
    stream: TcpStream,
    peer: Option<SocketAddr>,
}

impl TcpSocket {
    fn new(stream: TcpStream) -> TcpSocket {
        let peer = stream.peer_addr().ok();

        TcpSocket {
            id: SocketId::next(),
            stream,
            peer,
        }
    }
}

impl StreamSocket for TcpSocket {
    #[inline]
    fn id(&self) -> SocketId {
        self.id
    }

    #[inline]
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer.or_else(|| self.stream.peer_addr().ok())
    }

    fn send(&mut self, data: &[u8]) -> SendStatus {
        match self.stream.write(data) {
            Ok(0) => SendStatus::Again,
            Ok(count) => SendStatus::Sent(count),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => SendStatus::Again,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => SendStatus::Again,
            Err(ref err) if err.kind() == io::ErrorKind::BrokenPipe => SendStatus::Closed,
            Err(ref err) if err.kind() == io::ErrorKind::ConnectionReset => SendStatus::Closed,
            Err(err) => SendStatus::Failure(ErrorType::Io(err.kind())),
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> RecvStatus {
        match self.stream.read(buf) {
            Ok(0) => RecvStatus::Closed,
            Ok(count) => RecvStatus::Received(count),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => RecvStatus::Again,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => RecvStatus::Again,
            Err(ref err) if err.kind() == io::ErrorKind::ConnectionReset => RecvStatus::Closed,
            Err(err) => RecvStatus::Failure(ErrorType::Io(err.kind())),
        }
    }
}

struct PendingDial {
    stream: TcpStream,
    addr: SocketAddr,
}

pub struct TcpConnectingPool {
    poll: Poll,
    events: Events,
    pending: HashMap<SocketId, PendingDial>,
    deferred: Vec<(Instant, SocketAddr)>,
    ready: Vec<ConnectingEvent<TcpSocket>>,
    removable: Vec<SocketId>,
}

impl TcpConnectingPool {
    pub fn new() -> io::Result<TcpConnectingPool> {
        Ok(TcpConnectingPool {
            poll: Poll::new()?,
            events: Events::with_capacity(POLL_CAPACITY),
            pending: HashMap::new(),
            deferred: Vec::new(),
            ready: Vec::new(),
            removable: Vec::new(),
        })
    }
}

impl ConnectingPool for TcpConnectingPool {
    type Socket = TcpSocket;

    fn connect(&mut self, addr: SocketAddr) -> ConnStatus {
        let stream = match TcpStream::connect(&addr) {
            Ok(stream) => stream,
            Err(err) => {
                self.ready.push(ConnectingEvent::Failure {
                    addr,
                    error: err.into(),
                });
                return ConnStatus::Failure;
            }
        };

        let sid = SocketId::next();

        if let Err(err) = self
            .poll
            .register(&stream, token(sid), Ready::writable(), PollOpt::edge())
        {
            self.ready.push(ConnectingEvent::Failure {
                addr,
                error: err.into(),
            });
            return ConnStatus::Failure;
        }

        self.pending.insert(sid, PendingDial { stream, addr });
        ConnStatus::Connecting
    }

    fn connect_deferred(&mut self, delay: Duration, addr: SocketAddr) {
        self.deferred.push((Instant::now() + delay, addr));
    }

    fn remove_later(&mut self, sid: SocketId) {
        self.removable.push(sid);
    }

    fn apply_remove(&mut self) {
        for sid in self.removable.split_off(0) {
            if let Some(dial) = self.pending.remove(&sid) {
                drop(self.poll.deregister(&dial.stream));
            }
        }
    }

    fn step(&mut self, events: &mut Vec<ConnectingEvent<TcpSocket>>) -> usize {
        // Fire deferred dials that came due.
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

        let mut count = self.ready.len();
        events.append(&mut self.ready);

        if self.poll.poll(&mut self.events, zero_timeout()).is_err() {
            return count;
        }

        let mut finished = Vec::new();

        for event in &self.events {
            finished.push(sid_of(event.token()));
        }

        for sid in finished {
            let dial = match self.pending.remove(&sid) {
                Some(dial) => dial,
                None => continue,
            };

            drop(self.poll.deregister(&dial.stream));

            match dial.stream.take_error() {
                Ok(None) => {
                    count += 1;
                    events.push(ConnectingEvent::Connected(TcpSocket::new(dial.stream)));
                }
                Ok(Some(err)) => {
                    count += 1;
                    let reason = match err.kind() {
                        io::ErrorKind::ConnectionRefused => RefusedReason::Refused,
                        io::ErrorKind::TimedOut => RefusedReason::TimedOut,
                        _ => RefusedReason::Unreachable,
                    };
                    events.push(ConnectingEvent::Refused {
                        addr: dial.addr,
                        reason,
                    });
                }
                Err(err) => {
                    count += 1;
                    events.push(ConnectingEvent::Failure {
                        addr: dial.addr,
                        error: err.into(),
                    });
                }
            }
        }

        count
    }
}

pub struct TcpListenerPool {
    poll: Poll,
    events: Events,
    listeners: Vec<TcpListener>,
    listening: bool,
}

impl TcpListenerPool {
    pub fn new() -> io::Result<TcpListenerPool> {
        Ok(TcpListenerPool {
            poll: Poll::new()?,
            events: Events::with_capacity(POLL_CAPACITY),
            listeners: Vec::new(),
            listening: false,
        })
    }
}

impl ListenerPool for TcpListenerPool {
    type Socket = TcpSocket;

    fn add(&mut self, addr: SocketAddr) -> NetworkResult<SocketAddr> {
        let listener = TcpListener::bind(&addr)?;
        let bound = listener.local_addr()?;

        self.listeners.push(listener);
        Ok(bound)
    }

    fn listen(&mut self, _backlog: u32) -> NetworkResult<()> {
        // The OS backlog is fixed at bind time here; accepting starts once
        // the listeners are registered.
        for (index, listener) in self.listeners.iter().enumerate() {
            self.poll
                .register(listener, Token(index), Ready::readable(), PollOpt::edge())
                .map_err(NetworkError::from)?;
        }

        self.listening = true;
        Ok(())
    }

    fn step(&mut self, events: &mut Vec<ListenerEvent<TcpSocket>>) -> usize {
        if !self.listening {
            return 0;
        }

        if self.poll.poll(&mut self.events, zero_timeout()).is_err() {
            return 0;
        }

        let mut indices = Vec::new();

        for event in &self.events {
            indices.push(event.token().0);
        }

        let mut count = 0;

        for index in indices {
            let listener = match self.listeners.get(index) {
                Some(listener) => listener,
                None => continue,
            };

            loop {
                match listener.accept() {
                    Ok((stream, _)) => {
                        count += 1;
                        events.push(ListenerEvent::Accepted(TcpSocket::new(stream)));
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        count += 1;
                        events.push(ListenerEvent::Failure { error: err.into() });
                        break;
                    }
                }
            }
        }

        count
    }
}

pub struct TcpReaderPool {
    poll: Poll,
    events: Events,
    registered: HashSet<SocketId>,
    removable: Vec<SocketId>,
}

impl TcpReaderPool {
    pub fn new() -> io::Result<TcpReaderPool> {
        Ok(TcpReaderPool {
            poll: Poll::new()?,
            events: Events::with_capacity(POLL_CAPACITY),
            registered: HashSet::new(),
            removable: Vec::new(),
        })
    }
}

impl ReaderPool for TcpReaderPool {
    type Socket = TcpSocket;

    fn add(&mut self, sock: &TcpSocket) {
        if self
            .poll
            .register(
                &sock.stream,
                token(sock.id),
                Ready::readable(),
                PollOpt::edge(),
            )
            .is_ok()
        {
            self.registered.insert(sock.id);
        }
    }

    fn remove_later(&mut self, sid: SocketId) {
        self.removable.push(sid);
    }

    fn apply_remove(&mut self) {
        // The fd leaves the poll set when the socket table drops the stream.
        for sid in self.removable.drain(..) {
            self.registered.remove(&sid);
        }
    }

    fn step(
        &mut self,
        sockets: &mut SocketTable<TcpSocket>,
        events: &mut Vec<ReaderEvent>,
    ) -> usize {
        if self.poll.poll(&mut self.events, zero_timeout()).is_err() {
            return 0;
        }

        let mut ready = Vec::new();

        for event in &self.events {
            if event.readiness().is_readable() {
                ready.push(sid_of(event.token()));
            }
        }

        let mut count = 0;

        for sid in ready {
            if !self.registered.contains(&sid) {
                continue;
            }

            let sock = match sockets.socket_mut(sid) {
                Some(sock) => sock,
                None => {
                    self.removable.push(sid);
                    continue;
                }
            };

            let mut chunk = Vec::new();
            let mut buf = [0u8; READ_CHUNK];
            let mut disconnected = false;
            let mut failure = None;

            loop {
                match sock.recv(&mut buf) {
                    RecvStatus::Received(n) => chunk.extend_from_slice(&buf[..n]),
                    RecvStatus::Again => break,
                    RecvStatus::Closed => {
                        disconnected = true;
                        break;
                    }
                    RecvStatus::Failure(error) => {
                        failure = Some(error);
                        break;
                    }
                }
            }

            if !chunk.is_empty() {
                count += 1;
                events.push(ReaderEvent::DataReady { sid, bytes: chunk });
            }

            if let Some(error) = failure {
                count += 1;
                events.push(ReaderEvent::Failure {
                    sid,
                    error: NetworkError::Fatal(error),
                });
            } else if disconnected {
                count += 1;
                events.push(ReaderEvent::Disconnected { sid });
            }
        }

        count
    }
}

struct WriterAccount {
    queue: PriorityWriterQueue,
    frame_size: u16,
    writable: bool,
}

pub struct TcpWriterPool {
    poll: Poll,
    events: Events,
    weights: Vec<usize>,
    // Insertion-ordered so the send loop visits accounts deterministically.
    accounts: IndexMap<SocketId, WriterAccount>,
    removable: Vec<SocketId>,
}

impl TcpWriterPool {
    pub fn new(weights: &[usize]) -> io::Result<TcpWriterPool> {
        Ok(TcpWriterPool {
            poll: Poll::new()?,
            events: Events::with_capacity(POLL_CAPACITY),
            weights: weights.to_vec(),
            accounts: IndexMap::new(),
            removable: Vec::new(),
        })
    }
}

impl WriterPool for TcpWriterPool {
    type Socket = TcpSocket;

    fn ensure(&mut self, sock: &TcpSocket, frame_size: u16) {
        if let Some(account) = self.accounts.get_mut(&sock.id) {
            account.frame_size = frame_size;
            return;
        }

        // Oneshot writable registration acts as the back-pressure signal:
        // rearmed whenever a send hits would-block.
        drop(self.poll.register(
            &sock.stream,
            token(sock.id),
            Ready::writable(),
            PollOpt::edge() | PollOpt::oneshot(),
        ));

        self.accounts.insert(
            sock.id,
            WriterAccount {
                queue: PriorityWriterQueue::new(&self.weights),
                frame_size,
                writable: false,
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
        sockets: &mut SocketTable<TcpSocket>,
        events: &mut Vec<WriterEvent>,
    ) -> usize {
        if self.poll.poll(&mut self.events, zero_timeout()).is_ok() {
            for event in &self.events {
                if let Some(account) = self.accounts.get_mut(&sid_of(event.token())) {
                    if event.readiness().is_writable() {
                        account.writable = true;
                    }
                }
            }
        }

        let mut count = 0;
        let mut frame = Vec::new();
        let sids: Vec<SocketId> = self.accounts.keys().cloned().collect();

        for sid in sids {
            let account = self.accounts.get_mut(&sid).expect("writer account vanished");

            if !account.writable || account.queue.is_empty() {
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
                    SendStatus::Again => {
                        account.writable = false;

                        drop(self.poll.reregister(
                            &sock.stream,
                            token(sid),
                            Ready::writable(),
                            PollOpt::edge() | PollOpt::oneshot(),
                        ));
                        break;
                    }
                    SendStatus::Closed => {
                        count += 1;
                        events.push(WriterEvent::Failure {
                            sid,
                            error: NetworkError::Fatal(ErrorType::Io(
                                io::ErrorKind::ConnectionReset,
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

/// The production pool family over mio TCP.
pub struct TcpBackend;

impl Backend for TcpBackend {
    type Socket = TcpSocket;
    type Connecting = TcpConnectingPool;
    type Listener = TcpListenerPool;
    type Reader = TcpReaderPool;
    type Writer = TcpWriterPool;

    fn connecting_pool(&self) -> NetworkResult<TcpConnectingPool> {
        TcpConnectingPool::new().map_err(Into::into)
    }

    fn listener_pool(&self) -> NetworkResult<TcpListenerPool> {
        TcpListenerPool::new().map_err(Into::into)
    }

    fn reader_pool(&self) -> NetworkResult<TcpReaderPool> {
        TcpReaderPool::new().map_err(Into::into)
    }

    fn writer_pool(&self, weights: &[usize]) -> NetworkResult<TcpWriterPool> {
        TcpWriterPool::new(weights).map_err(Into::into)
    }
}

//! Shared error taxonomy and I/O status plumbing.

use std::io;
use std::net;

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Every fallible operation in the core resolves to either "try again later"
/// or a fatal condition scoped to one socket/peer.
#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    AddrParse,
    Checksum,
    Corrupt,
    DuplicateNodeId,
    EmptyPayload,
    PayloadTooLarge,
    PeerNotFound,
    ProtocolMismatch,
    Serialization,
    UnknownPacket,
    Unreachable,
    VersionMismatch,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorType::AddrParse)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}

/// Outcome of one non-blocking send attempt on a stream socket.
#[derive(Debug, Eq, PartialEq)]
pub enum SendStatus {
    /// This many bytes left the buffer.
    Sent(usize),
    /// The socket cannot take more data right now.
    Again,
    /// The peer closed the stream.
    Closed,
    Failure(ErrorType),
}

/// Outcome of one non-blocking receive attempt on a stream socket.
#[derive(Debug, Eq, PartialEq)]
pub enum RecvStatus {
    /// This many bytes arrived.
    Received(usize),
    /// Nothing available right now.
    Again,
    /// The peer closed the stream.
    Closed,
    Failure(ErrorType),
}

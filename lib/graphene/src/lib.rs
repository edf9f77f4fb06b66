//! `graphene` is a mesh-overlay networking library: processes form a
//! partially connected peer-to-peer graph and exchange priority-ordered,
//! optionally reliably-delivered messages. Gateway nodes forward traffic
//! between subnets, routes are discovered by flooding and sessions survive
//! peer restarts.
//!
//! The entry point is [`pool::NodePool`]: add endpoints, listen, dial peers
//! and drive everything with `step()`/`run()`, draining typed events after
//! each pass. The pool is generic over a [`poll::Backend`] supplying the
//! socket pools; [`poll::tcp::TcpBackend`] is the production family and
//! [`poll::sim::SimBackend`] an in-process fabric for tests.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod alive;
pub mod channel;
pub mod config;
pub mod delivery;
pub mod envelope;
pub mod frame;
pub mod handshake;
pub mod heartbeat;
pub mod identity;
pub mod input;
pub mod node;
pub mod packet;
pub mod poll;
pub mod pool;
pub mod queue;
pub mod routing;
pub mod support;
pub mod wire;

pub use crate::config::MeshConfig;
pub use crate::identity::{MessageId, NodeId, PeerIndex, SocketId};
pub use crate::pool::{InterruptHandle, NodePool, PoolEvent};
pub use crate::support::{ErrorType, NetworkError, NetworkResult};

//! Reliable, segmented, prioritized delivery over the unreliable
//! node-to-node message path.
//!
//! The sub-protocol rides inside DDATA/GDATA payloads: SYN synchronizes the
//! per-priority serial number streams, MESSAGE/PART carry segments, ACK
//! confirms them one by one and REPORT is the fire-and-forget path. Serial
//! numbers are strictly per (peer, priority); streams of distinct priorities
//! are independent.

pub mod assembler;
pub mod controller;
pub mod manager;
pub mod packet;
pub mod tracker;

pub use self::controller::{DeliveryController, DeliveryEvent, Outbound};
pub use self::manager::DeliveryManager;

//! Tuning knobs for a node pool, loadable from a TOML file.

use crate::channel::{ChannelConfig, ReconnectPolicy};
use crate::handshake::LinkMode;
use crate::queue;
use serde_derive::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Serialize, Deserialize, Clone)]
pub struct MeshConfig {
    /// Printable node name exchanged during the handshake.
    pub name: String,
    /// Whether this node forwards global messages for others.
    pub gateway: bool,
    /// Marks every outbound dial as coming from behind NAT.
    pub behind_nat: bool,
    /// Keep a dedicated socket per direction instead of sharing one.
    pub dual_link: bool,
    /// Outbound frame size cap per peer.
    pub frame_size: u16,
    /// Weighted round-robin distribution, highest priority first.
    pub priority_weights: Vec<usize>,
    pub heartbeat_interval_secs: u64,
    pub handshake_timeout_secs: u64,
    /// Gap between self-announcements; expiry is three times this and the
    /// looping floor half of it.
    pub alive_interval_secs: u64,
    /// Segment size for reliable delivery.
    pub part_size: u32,
    /// Delivery SYN/retry expiration timeout.
    pub delivery_timeout_millis: u64,
    /// First reconnect delay; 0 disables reconnection.
    pub reconnect_delay_secs: u64,
    /// Backoff ceiling; 0 keeps the delay fixed.
    pub reconnect_ceiling_secs: u64,
    /// Main loop interval for `run()`.
    pub loop_interval_millis: u64,
}

impl Default for MeshConfig {
    fn default() -> MeshConfig {
        MeshConfig {
            name: String::new(),
            gateway: false,
            behind_nat: false,
            dual_link: false,
            frame_size: crate::channel::DEFAULT_FRAME_SIZE,
            priority_weights: queue::exponential_weights(4),
            heartbeat_interval_secs: 5,
            handshake_timeout_secs: 3,
            alive_interval_secs: 5,
            part_size: crate::delivery::controller::DEFAULT_PART_SIZE,
            delivery_timeout_millis: 3000,
            reconnect_delay_secs: 1,
            reconnect_ceiling_secs: 15,
            loop_interval_millis: 10,
        }
    }
}

impl MeshConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> MeshConfig {
        serdeconv::from_toml_file(path).expect("Error loading mesh configuration file")
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        match (self.reconnect_delay_secs, self.reconnect_ceiling_secs) {
            (0, _) => ReconnectPolicy::Never,
            (delay, 0) => ReconnectPolicy::Fixed(Duration::from_secs(delay)),
            (delay, ceiling) => ReconnectPolicy::Backoff {
                start: Duration::from_secs(delay),
                ceiling: Duration::from_secs(ceiling.max(delay)),
            },
        }
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            frame_size: self.frame_size,
            weights: self.priority_weights.clone(),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            link_mode: if self.dual_link {
                LinkMode::Dual
            } else {
                LinkMode::Single
            },
            reconnect: self.reconnect_policy(),
        }
    }

    pub fn alive_interval(&self) -> Duration {
        Duration::from_secs(self.alive_interval_secs)
    }

    /// A chain with no forwarded data for ten alive intervals is stale.
    /// Floored so degenerate announce intervals cannot wipe fresh routes.
    pub fn route_stale_after(&self) -> Duration {
        Duration::from_secs((self.alive_interval_secs * 10).max(30))
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_millis)
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_millis)
    }
}

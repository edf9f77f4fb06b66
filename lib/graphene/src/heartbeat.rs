//! Channel liveness probes.
//!
//! Each established socket gets a heartbeat packet every `interval` seconds.
//! Any inbound traffic refreshes the liveness deadline; a socket silent for
//! `3 * interval` is declared expired and its channel torn down.

use crate::identity::SocketId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

const EXPIRY_FACTOR: u32 = 3;

struct HeartbeatEntry {
    next_probe: Instant,
    deadline: Instant,
}

pub struct HeartbeatController {
    interval: Duration,
    entries: HashMap<SocketId, HeartbeatEntry>,
}

impl HeartbeatController {
    pub fn new(interval: Duration) -> HeartbeatController {
        HeartbeatController {
            interval,
            entries: HashMap::new(),
        }
    }

    pub fn add(&mut self, sid: SocketId, now: Instant) {
        self.entries.insert(
            sid,
            HeartbeatEntry {
                next_probe: now + self.interval,
                deadline: now + self.interval * EXPIRY_FACTOR,
            },
        );
    }

    pub fn remove(&mut self, sid: SocketId) {
        self.entries.remove(&sid);
    }

    /// Refreshes the liveness deadline after inbound traffic on the socket.
    pub fn touch(&mut self, sid: SocketId, now: Instant) {
        if let Some(entry) = self.entries.get_mut(&sid) {
            entry.deadline = now + self.interval * EXPIRY_FACTOR;
        }
    }

    /// Collects sockets due for a probe and sockets whose peers went silent.
    /// Expired sockets are dropped from the controller.
    pub fn step(&mut self, now: Instant) -> (Vec<SocketId>, Vec<SocketId>) {
        let mut probes = Vec::new();
        let mut expired = Vec::new();
        let interval = self.interval;

        self.entries.retain(|&sid, entry| {
            if entry.deadline <= now {
                expired.push(sid);
                return false;
            }

            if entry.next_probe <= now {
                entry.next_probe = now + interval;
                probes.push(sid);
            }

            true
        });

        (probes, expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SID: SocketId = SocketId(1);

    #[test]
    fn test_probe_schedule() {
        let mut hb = HeartbeatController::new(Duration::from_secs(5));
        let start = Instant::now();

        hb.add(SID, start);

        let (probes, expired) = hb.step(start + Duration::from_secs(1));
        assert!(probes.is_empty());
        assert!(expired.is_empty());

        let (probes, expired) = hb.step(start + Duration::from_secs(6));
        assert_eq!(probes, vec![SID]);
        assert!(expired.is_empty());

        // The probe rearmed itself off the step time.
        let (probes, _) = hb.step(start + Duration::from_secs(7));
        assert!(probes.is_empty());

        let (probes, _) = hb.step(start + Duration::from_secs(12));
        assert_eq!(probes, vec![SID]);
    }

    #[test]
    fn test_silent_socket_expires() {
        let mut hb = HeartbeatController::new(Duration::from_secs(5));
        let start = Instant::now();

        hb.add(SID, start);

        let (_, expired) = hb.step(start + Duration::from_secs(16));

        assert_eq!(expired, vec![SID]);

        // Expired sockets are gone for good.
        let (probes, expired) = hb.step(start + Duration::from_secs(32));
        assert!(probes.is_empty());
        assert!(expired.is_empty());
    }

    #[test]
    fn test_touch_defers_expiry() {
        let mut hb = HeartbeatController::new(Duration::from_secs(5));
        let start = Instant::now();

        hb.add(SID, start);
        hb.touch(SID, start + Duration::from_secs(10));

        let (_, expired) = hb.step(start + Duration::from_secs(16));
        assert!(expired.is_empty());

        let (_, expired) = hb.step(start + Duration::from_secs(26));
        assert_eq!(expired, vec![SID]);
    }

    #[test]
    fn test_remove() {
        let mut hb = HeartbeatController::new(Duration::from_secs(5));
        let start = Instant::now();

        hb.add(SID, start);
        hb.remove(SID);

        let (probes, expired) = hb.step(start + Duration::from_secs(60));
        assert!(probes.is_empty());
        assert!(expired.is_empty());
    }
}

//! Heartbeat keepalive for message channels.
//!
//! Each channel sends a HEARTBEAT on channel 0 every interval. Any inbound
//! frame counts as a sign of life; once `max_missed` heartbeats in a row go
//! unanswered the channel is considered broken.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Default time between two heartbeats
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of unanswered heartbeats before a channel is broken
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 3;

/// Keepalive settings of a channel service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Time between two heartbeats
    pub interval: Duration,
    /// Unanswered heartbeats tolerated before the channel is broken
    pub max_missed: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_missed: DEFAULT_MAX_MISSED_HEARTBEATS,
        }
    }
}

/// What to do on a keepalive tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveAction {
    /// Send the next heartbeat
    SendHeartbeat,
    /// Too many heartbeats went unanswered
    Expired {
        /// Heartbeats sent without any inbound traffic
        missed: u32,
    },
}

/// Counts heartbeats that have not been followed by inbound traffic
#[derive(Debug, Default)]
pub struct HeartbeatTracker {
    missed: AtomicU32,
}

impl HeartbeatTracker {
    /// Create a tracker with no outstanding heartbeats
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide on a tick. Counts the heartbeat as outstanding when one is to
    /// be sent.
    pub fn on_tick(&self, max_missed: u32) -> KeepaliveAction {
        let missed = self.missed.fetch_add(1, Ordering::SeqCst);
        if missed >= max_missed {
            KeepaliveAction::Expired { missed }
        } else {
            KeepaliveAction::SendHeartbeat
        }
    }

    /// The remote side showed a sign of life
    pub fn on_inbound(&self) {
        self.missed.store(0, Ordering::SeqCst);
    }

    /// Heartbeats currently outstanding
    pub fn missed(&self) -> u32 {
        self.missed.load(Ordering::SeqCst)
    }
}

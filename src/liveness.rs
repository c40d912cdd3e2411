//! Heartbeat and stale-peer cleanup
//!
//! Both run once per control-loop iteration before any socket is read.
//! Time is passed in so the schedule can be driven from tests.

use std::time::{Duration, Instant};

use crate::framing::ConnectionId;
use crate::peers::{Peer, PeerRegistry};

// ============================================================================
// Constants
// ============================================================================

/// Minimum gap between KEEPALIVE rounds
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Direct peers silent for longer than this are dropped
pub const PEER_TIMEOUT: Duration = Duration::from_secs(300);

pub const KEEPALIVE: &str = "KEEPALIVE";

// ============================================================================
// Liveness Tracker
// ============================================================================

#[derive(Debug)]
pub struct Liveness {
    interval: Duration,
    timeout: Duration,
    last_heartbeat: Option<Instant>,
}

impl Liveness {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Liveness {
            interval,
            timeout,
            last_heartbeat: None,
        }
    }

    /// Connections owed a KEEPALIVE, or `None` if the interval has not
    /// elapsed since the last round. Only identified direct peers qualify.
    pub fn heartbeat(&mut self, peers: &PeerRegistry, now: Instant) -> Option<Vec<ConnectionId>> {
        if let Some(last) = self.last_heartbeat {
            if now.saturating_duration_since(last) < self.interval {
                return None;
            }
        }

        let targets = peers
            .direct()
            .filter(|p| !p.identity.is_empty())
            .filter_map(|p| p.connection)
            .collect();

        self.last_heartbeat = Some(now);
        Some(targets)
    }

    /// Two-pass sweep: drop direct peers past the timeout, then every peer
    /// whose first hop was one of them. Returns everything evicted.
    pub fn cleanup(&self, peers: &mut PeerRegistry, now: Instant) -> Vec<Peer> {
        let stale: Vec<ConnectionId> = peers
            .direct()
            .filter(|p| now.saturating_duration_since(p.last_contact) > self.timeout)
            .filter_map(|p| p.connection)
            .collect();

        let mut evicted: Vec<Peer> = stale.into_iter().filter_map(|conn| peers.evict(conn)).collect();

        let lost: Vec<String> = evicted
            .iter()
            .filter(|p| !p.identity.is_empty())
            .map(|p| p.identity.clone())
            .collect();

        if !lost.is_empty() {
            evicted.extend(peers.evict_routed_through(&lost));
        }

        evicted
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new(HEARTBEAT_INTERVAL, PEER_TIMEOUT)
    }
}

//! Peer registry: this server's view of the mesh
//!
//! Tracks:
//! - Direct peers (distance 1), one per peer-role connection
//! - Relayed peers (distance > 1), learned from a direct peer and reached
//!   through the first identity on their intermediate path
//!
//! Lookups by identity are linear scans. The mesh is capped at a handful of
//! direct peers so this never grows large.

use std::fmt;
use std::time::Instant;

use crate::framing::ConnectionId;

// ============================================================================
// Peer Entry
// ============================================================================

/// Host and port a peer server listens on for other servers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        PeerAddress {
            host: host.into(),
            port,
        }
    }

    /// Placeholder until an ID exchange fills it in
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn is_known(&self) -> bool {
        !self.host.is_empty()
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A known peer server
#[derive(Debug, Clone)]
pub struct Peer {
    /// Set exactly when the peer is directly connected
    pub connection: Option<ConnectionId>,
    /// Empty until the peer answers an ID request
    pub identity: String,
    pub address: PeerAddress,
    /// 1 = direct connection
    pub distance: u32,
    /// Identities between us and the peer; first element is the direct relay
    pub path: Vec<String>,
    pub last_contact: Instant,
}

impl Peer {
    pub fn is_direct(&self) -> bool {
        self.distance == 1
    }

    pub fn first_hop(&self) -> Option<&str> {
        self.path.first().map(String::as_str)
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Vec<Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a directly connected peer, replacing any entry for `conn`
    pub fn register(&mut self, conn: ConnectionId, address: PeerAddress, now: Instant) {
        self.peers.retain(|p| p.connection != Some(conn));

        log::info!("Registering direct peer on {} (address={})", conn, address);

        self.peers.push(Peer {
            connection: Some(conn),
            identity: String::new(),
            address,
            distance: 1,
            path: Vec::new(),
            last_contact: now,
        });
    }

    /// Register a peer reached through `path`. Distance is one more than the
    /// number of intermediates.
    ///
    /// Returns false (and changes nothing) if the path is empty or the
    /// identity is blank or already known.
    pub fn register_relayed(
        &mut self,
        identity: &str,
        address: PeerAddress,
        path: Vec<String>,
        now: Instant,
    ) -> bool {
        if path.is_empty() || identity.is_empty() || self.find(identity).is_some() {
            return false;
        }

        log::info!(
            "Registering relayed peer '{}' via {:?} (address={})",
            identity,
            path,
            address
        );

        self.peers.push(Peer {
            connection: None,
            identity: identity.to_string(),
            address,
            distance: path.len() as u32 + 1,
            path,
            last_contact: now,
        });
        true
    }

    /// Find a peer by identity. Direct entries win over relayed ones.
    pub fn find(&self, identity: &str) -> Option<&Peer> {
        if identity.is_empty() {
            return None;
        }
        self.peers
            .iter()
            .filter(|p| p.identity == identity)
            .min_by_key(|p| p.distance)
    }

    pub fn get(&self, conn: ConnectionId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.connection == Some(conn))
    }

    pub fn get_mut(&mut self, conn: ConnectionId) -> Option<&mut Peer> {
        self.peers.iter_mut().find(|p| p.connection == Some(conn))
    }

    pub fn contains(&self, conn: ConnectionId) -> bool {
        self.get(conn).is_some()
    }

    /// All peers in registration order
    pub fn all(&self) -> &[Peer] {
        &self.peers
    }

    pub fn direct(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter().filter(|p| p.is_direct())
    }

    pub fn direct_count(&self) -> usize {
        self.direct().count()
    }

    /// Refresh last-contact time. No-op for connections that are not peers.
    pub fn touch(&mut self, conn: ConnectionId, now: Instant) {
        if let Some(peer) = self.get_mut(conn) {
            peer.last_contact = now;
        }
    }

    /// Record the identity a direct peer reported, plus its address if still
    /// unknown. A relayed entry for the same identity is superseded.
    pub fn identify(&mut self, conn: ConnectionId, identity: &str, address: Option<PeerAddress>) -> bool {
        let Some(peer) = self.get_mut(conn) else {
            return false;
        };

        peer.identity = identity.to_string();
        if let Some(address) = address {
            if !peer.address.is_known() {
                peer.address = address;
            }
        }
        log::info!("Peer on {} identified as '{}' ({})", conn, identity, peer.address);

        self.peers
            .retain(|p| p.is_direct() || p.identity != identity);
        true
    }

    /// Remove the direct peer on `conn`
    pub fn evict(&mut self, conn: ConnectionId) -> Option<Peer> {
        let index = self.peers.iter().position(|p| p.connection == Some(conn))?;
        let peer = self.peers.remove(index);
        log::info!(
            "Evicted peer '{}' on {} (address={})",
            peer.identity,
            conn,
            peer.address
        );
        Some(peer)
    }

    /// Remove every peer whose first hop is one of `relays`
    pub fn evict_routed_through(&mut self, relays: &[String]) -> Vec<Peer> {
        let (evicted, kept): (Vec<Peer>, Vec<Peer>) = self
            .peers
            .drain(..)
            .partition(|p| p.first_hop().is_some_and(|hop| relays.iter().any(|r| r == hop)));
        self.peers = kept;

        for peer in &evicted {
            log::info!(
                "Evicted relayed peer '{}' (lost relay '{}')",
                peer.identity,
                peer.first_hop().unwrap_or("")
            );
        }
        evicted
    }
}

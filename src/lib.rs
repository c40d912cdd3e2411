//! Mesh Chat Relay Server
//!
//! A single-threaded relay that:
//! - Accepts chat users on a control port (CONNECT, MSG, WHO, LEAVE)
//! - Links to other relay servers on a peer port and keeps a routing table
//! - Delegates commands across the mesh with correlated CMD/RSP envelopes
//! - Answers status queries over UDP

// ============================================================================
// Modules
// ============================================================================

pub mod access;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod dispatcher;
pub mod error;
pub mod framing;
pub mod liveness;
pub mod peers;
pub mod server;
pub mod users;

pub use config::Config;
pub use error::RelayError;
pub use server::Server;

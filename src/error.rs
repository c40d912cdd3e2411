//! Error type for the relay server
//!
//! Only infrastructure failures surface as `RelayError`. Malformed user input
//! is answered with a reply string and never reaches this type.

use std::fmt;
use std::io;

/// Errors raised while setting up or driving the relay
#[derive(Debug)]
pub enum RelayError {
    /// Underlying socket or poll failure
    Io(io::Error),
    /// Host name did not resolve to any address
    Resolve(String),
    /// Outbound connection to a peer server failed
    Connect { address: String, source: io::Error },
    /// Configuration could not be loaded or is inconsistent
    Config(String),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Io(e) => write!(f, "i/o error: {}", e),
            RelayError::Resolve(host) => write!(f, "unable to resolve host '{}'", host),
            RelayError::Connect { address, source } => {
                write!(f, "unable to connect to {}: {}", address, source)
            }
            RelayError::Config(msg) => write!(f, "configuration error: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RelayError::Io(e) => Some(e),
            RelayError::Connect { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for RelayError {
    fn from(e: io::Error) -> Self {
        RelayError::Io(e)
    }
}

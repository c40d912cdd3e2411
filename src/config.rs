//! Server configuration
//!
//! Defaults, optionally overlaid by a JSON file (`--config <path>`), then by
//! command line flags. The positional form `<peer port> <status port>` is
//! accepted as well.

use std::net::{IpAddr, UdpSocket};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::RelayError;

// ============================================================================
// Defaults
// ============================================================================

const DEFAULT_SERVER_ID: &str = "RELAY_1";
const DEFAULT_CONTROL_PORT: u16 = 4050;
const DEFAULT_PEER_PORT: u16 = 4044;
const DEFAULT_STATUS_PORT: u16 = 4045;
const DEFAULT_MAX_PEERS: usize = 5;

/// Number of FETCH reference values
pub const FETCH_SLOTS: usize = 5;

/// MD5 digests of "1" through "5"
const DEFAULT_FETCH_VALUES: [&str; FETCH_SLOTS] = [
    "c4ca4238a0b923820dcc509a6f75849b",
    "c81e728d9d4c2f636f067f89cc14862c",
    "eccbc87e4b5ce2fe28308fd9f2a7baf3",
    "a87ff679a2f3e71d9181a67b7542122c",
    "e4da3b7fbbce2345d7772b0674a318d5",
];

/// Any routable address works; nothing is sent, the socket is only connected
/// so the OS picks the outbound interface.
const ROUTE_PROBE_ADDR: &str = "8.8.8.8:53";

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server_id: String,
    pub bind_address: IpAddr,
    pub control_port: u16,
    pub peer_port: u16,
    pub status_port: u16,
    /// Address reported in ID replies; discovered when absent
    pub advertise_ip: Option<String>,
    pub max_peers: usize,
    pub heartbeat_interval_secs: u64,
    pub peer_timeout_secs: u64,
    pub poll_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub fetch_values: Vec<String>,
    /// Control connections from these addresses get the root role
    pub operators: Vec<IpAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_id: DEFAULT_SERVER_ID.to_string(),
            bind_address: IpAddr::from([0, 0, 0, 0]),
            control_port: DEFAULT_CONTROL_PORT,
            peer_port: DEFAULT_PEER_PORT,
            status_port: DEFAULT_STATUS_PORT,
            advertise_ip: None,
            max_peers: DEFAULT_MAX_PEERS,
            heartbeat_interval_secs: 60,
            peer_timeout_secs: 300,
            poll_timeout_ms: 2_000,
            connect_timeout_ms: 3_000,
            fetch_values: DEFAULT_FETCH_VALUES.iter().map(|v| v.to_string()).collect(),
            operators: Vec::new(),
        }
    }
}

impl Config {
    /// Load a JSON config file. Missing fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RelayError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, RelayError> {
        serde_json::from_str(text).map_err(|e| RelayError::Config(e.to_string()))
    }

    /// Build configuration from process arguments (`args[0]` is the program)
    pub fn from_args(args: &[String]) -> Result<Self, RelayError> {
        let mut config = match parse_arg(args, "--config") {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };

        let positional = positional_args(args);
        if let Some(port) = positional.first() {
            config.peer_port = parse_port(port)?;
        }
        if let Some(port) = positional.get(1) {
            config.status_port = parse_port(port)?;
        }

        if let Some(id) = parse_arg(args, "--id") {
            config.server_id = id;
        }
        if let Some(port) = parse_arg(args, "--control-port") {
            config.control_port = parse_port(&port)?;
        }
        if let Some(port) = parse_arg(args, "--peer-port") {
            config.peer_port = parse_port(&port)?;
        }
        if let Some(port) = parse_arg(args, "--status-port") {
            config.status_port = parse_port(&port)?;
        }
        if let Some(addr) = parse_arg(args, "--bind") {
            config.bind_address = addr
                .parse()
                .map_err(|_| RelayError::Config(format!("invalid bind address '{}'", addr)))?;
        }
        if let Some(ip) = parse_arg(args, "--advertise") {
            config.advertise_ip = Some(ip);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.server_id.is_empty() {
            return Err(RelayError::Config("server_id must not be empty".into()));
        }
        if self.server_id.contains(|c: char| c == ',' || c.is_whitespace()) {
            return Err(RelayError::Config(format!(
                "server_id '{}' must not contain commas or whitespace",
                self.server_id
            )));
        }
        if self.max_peers == 0 {
            return Err(RelayError::Config("max_peers must be at least 1".into()));
        }
        if self.fetch_values.len() != FETCH_SLOTS {
            return Err(RelayError::Config(format!(
                "fetch_values needs exactly {} entries, got {}",
                FETCH_SLOTS,
                self.fetch_values.len()
            )));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Address to report in ID replies
    pub fn advertised_ip(&self) -> String {
        if let Some(ip) = &self.advertise_ip {
            return ip.clone();
        }
        match discover_local_ip() {
            Ok(ip) => ip.to_string(),
            Err(e) => {
                log::warn!("Could not discover local address ({}), using 127.0.0.1", e);
                "127.0.0.1".to_string()
            }
        }
    }
}

fn discover_local_ip() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(ROUTE_PROBE_ADDR)?;
    Ok(socket.local_addr()?.ip())
}

// ============================================================================
// Argument Helpers
// ============================================================================

const VALUE_FLAGS: [&str; 7] = [
    "--config",
    "--id",
    "--control-port",
    "--peer-port",
    "--status-port",
    "--bind",
    "--advertise",
];

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn positional_args(args: &[String]) -> Vec<&str> {
    let mut positional = Vec::new();
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        if VALUE_FLAGS.contains(&arg.as_str()) {
            iter.next();
        } else if !arg.starts_with("--") {
            positional.push(arg.as_str());
        }
    }
    positional
}

fn parse_port(value: &str) -> Result<u16, RelayError> {
    value
        .parse()
        .map_err(|_| RelayError::Config(format!("invalid port '{}'", value)))
}

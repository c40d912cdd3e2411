//! Socket layer: listeners, accepted streams and outgoing buffers
//!
//! Three listening sockets share one mio poll:
//! - control (TCP): users and operators
//! - peer (TCP): other relay servers
//! - status (UDP): each datagram is answered with the server list
//!
//! Streams are registered edge-triggered for both directions. Reads are
//! drained until `WouldBlock`; writes go to a per-connection buffer that is
//! flushed immediately and again whenever the socket turns writable.
//!
//! Outbound peer connections are dialled without blocking. Output queued
//! while the dial is in flight is held until the first writable event shows
//! the connection established; a dial that fails or outlives the connect
//! timeout is reported through `take_failed` like any broken stream.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Token};

use crate::access::Role;
use crate::config::Config;
use crate::dispatcher::Network;
use crate::error::RelayError;
use crate::framing::{frame, split, ConnectionId, OutboundMessage};
use crate::peers::PeerAddress;

// ============================================================================
// Constants
// ============================================================================

pub const CONTROL_LISTENER: Token = Token(0);
pub const PEER_LISTENER: Token = Token(1);
pub const STATUS_SOCKET: Token = Token(2);

/// Replies addressed here go out on the status socket
pub const STATUS_CONNECTION: ConnectionId = ConnectionId(STATUS_SOCKET.0);

/// Stream tokens start above the listener tokens
const FIRST_STREAM: usize = 16;

const READ_CHUNK: usize = 4096;

/// Maximum UDP payload
const MAX_DATAGRAM_SIZE: usize = 65_507;

// ============================================================================
// Connections
// ============================================================================

struct Connection {
    stream: TcpStream,
    role: Role,
    address: SocketAddr,
    outgoing: Vec<u8>,
    /// Set while an outbound dial has not completed
    dial_deadline: Option<Instant>,
}

/// State of an in-flight dial after a writable event
enum Dial {
    Established,
    Pending,
    Failed(io::Error),
}

fn dial_state(stream: &TcpStream) -> Dial {
    match stream.take_error() {
        Ok(Some(e)) | Err(e) => return Dial::Failed(e),
        Ok(None) => {}
    }
    match stream.peer_addr() {
        Ok(_) => Dial::Established,
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Dial::Pending,
        Err(e) => Dial::Failed(e),
    }
}

/// What one readable event produced
#[derive(Debug, Default)]
pub struct ReadOutcome {
    pub messages: Vec<String>,
    pub closed: bool,
}

pub struct ConnectionRegistry {
    poll: Poll,
    control: TcpListener,
    peer: TcpListener,
    status: UdpSocket,
    streams: HashMap<ConnectionId, Connection>,
    next_id: usize,
    /// Sender of the status datagram being handled
    status_requester: Option<SocketAddr>,
    /// Streams that failed while flushing, waiting to be reaped
    failed: Vec<ConnectionId>,
    operators: Vec<std::net::IpAddr>,
    connect_timeout: Duration,
    recv_buf: Vec<u8>,
}

impl ConnectionRegistry {
    pub fn bind(config: &Config) -> Result<Self, RelayError> {
        let poll = Poll::new()?;

        let mut control = TcpListener::bind(SocketAddr::new(config.bind_address, config.control_port))?;
        let mut peer = TcpListener::bind(SocketAddr::new(config.bind_address, config.peer_port))?;
        let mut status = UdpSocket::bind(SocketAddr::new(config.bind_address, config.status_port))?;

        poll.registry()
            .register(&mut control, CONTROL_LISTENER, Interest::READABLE)?;
        poll.registry()
            .register(&mut peer, PEER_LISTENER, Interest::READABLE)?;
        poll.registry()
            .register(&mut status, STATUS_SOCKET, Interest::READABLE)?;

        log::info!("Control listener on {}", control.local_addr()?);
        log::info!("Peer listener on {}", peer.local_addr()?);
        log::info!("Status socket on {}", status.local_addr()?);

        Ok(ConnectionRegistry {
            poll,
            control,
            peer,
            status,
            streams: HashMap::new(),
            next_id: FIRST_STREAM,
            status_requester: None,
            failed: Vec::new(),
            operators: config.operators.clone(),
            connect_timeout: config.connect_timeout(),
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE],
        })
    }

    pub fn control_addr(&self) -> io::Result<SocketAddr> {
        self.control.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.peer.local_addr()
    }

    pub fn status_addr(&self) -> io::Result<SocketAddr> {
        self.status.local_addr()
    }

    pub fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        self.poll.poll(events, timeout)
    }

    pub fn role(&self, conn: ConnectionId) -> Option<Role> {
        self.streams.get(&conn).map(|c| c.role)
    }

    /// Registered and not waiting to be reaped
    pub fn is_open(&self, conn: ConnectionId) -> bool {
        self.streams.contains_key(&conn) && !self.failed.contains(&conn)
    }

    /// Whether an outbound dial on `conn` is still in flight
    pub fn is_dialling(&self, conn: ConnectionId) -> bool {
        self.streams
            .get(&conn)
            .is_some_and(|c| c.dial_deadline.is_some())
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Accept every pending connection on a listener
    pub fn accept(&mut self, listener: Token) -> Vec<ConnectionId> {
        let mut accepted = Vec::new();

        loop {
            let result = match listener {
                CONTROL_LISTENER => self.control.accept(),
                PEER_LISTENER => self.peer.accept(),
                _ => return accepted,
            };

            let (stream, address) = match result {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("Accept failed: {}", e);
                    break;
                }
            };

            let role = match listener {
                PEER_LISTENER => Role::Peer,
                _ if self.operators.contains(&address.ip()) => Role::Root,
                _ => Role::Control,
            };

            match self.insert(stream, role, address) {
                Ok(conn) => {
                    log::info!("Accepted {} connection {} from {}", role, conn, address);
                    accepted.push(conn);
                }
                Err(e) => log::warn!("Failed to register connection from {}: {}", address, e),
            }
        }

        accepted
    }

    fn insert(&mut self, mut stream: TcpStream, role: Role, address: SocketAddr) -> io::Result<ConnectionId> {
        let conn = ConnectionId(self.next_id);
        self.poll.registry().register(
            &mut stream,
            conn.token(),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        self.next_id += 1;

        self.streams.insert(
            conn,
            Connection {
                stream,
                role,
                address,
                outgoing: Vec::new(),
                dial_deadline: None,
            },
        );
        Ok(conn)
    }

    /// Drain a readable stream. Each read is split into messages on its own.
    pub fn read(&mut self, conn: ConnectionId) -> ReadOutcome {
        let mut outcome = ReadOutcome::default();
        let Some(connection) = self.streams.get_mut(&conn) else {
            return outcome;
        };

        let mut buf = [0u8; READ_CHUNK];
        loop {
            match connection.stream.read(&mut buf) {
                Ok(0) => {
                    log::info!("Connection {} ({}) closed by peer", conn, connection.address);
                    outcome.closed = true;
                    break;
                }
                Ok(n) => {
                    log::trace!("Read {} bytes from {}", n, conn);
                    outcome.messages.extend(split(&buf[..n]));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("Read error on {}: {}", conn, e);
                    outcome.closed = true;
                    break;
                }
            }
        }
        outcome
    }

    /// Drain the status socket, returning the sender of each datagram.
    /// Contents are ignored: every datagram is a server-list query.
    pub fn read_status(&mut self) -> Vec<SocketAddr> {
        let mut requesters = Vec::new();

        loop {
            match self.status.recv_from(&mut self.recv_buf) {
                Ok((len, from)) => {
                    log::debug!("Status query ({} bytes) from {}", len, from);
                    requesters.push(from);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("Status socket error: {}", e);
                    break;
                }
            }
        }
        requesters
    }

    /// Direct status replies to `requester` until cleared
    pub fn set_status_requester(&mut self, requester: Option<SocketAddr>) {
        self.status_requester = requester;
    }

    /// Write as much buffered output as the socket takes. On a dialled
    /// stream the first call after a writable event completes the dial.
    pub fn flush(&mut self, conn: ConnectionId) {
        let Some(connection) = self.streams.get_mut(&conn) else {
            return;
        };

        if connection.dial_deadline.is_some() {
            match dial_state(&connection.stream) {
                Dial::Established => {
                    log::info!("Connected to peer {} as {}", connection.address, conn);
                    connection.dial_deadline = None;
                }
                Dial::Pending => return,
                Dial::Failed(e) => {
                    log::warn!("Connection to {} failed: {}", connection.address, e);
                    self.mark_failed(conn);
                    return;
                }
            }
        }

        while !connection.outgoing.is_empty() {
            match connection.stream.write(&connection.outgoing) {
                Ok(0) => {
                    self.mark_failed(conn);
                    return;
                }
                Ok(n) => {
                    connection.outgoing.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("Write error on {}: {}", conn, e);
                    self.mark_failed(conn);
                    return;
                }
            }
        }
    }

    /// Fail dials still in flight past their deadline
    pub fn expire_dials(&mut self, now: Instant) {
        let expired: Vec<ConnectionId> = self
            .streams
            .iter()
            .filter(|(_, c)| c.dial_deadline.is_some_and(|deadline| now >= deadline))
            .map(|(id, _)| *id)
            .collect();

        for conn in expired {
            log::warn!("Connection {} timed out after {:?}", conn, self.connect_timeout);
            self.mark_failed(conn);
        }
    }

    pub fn mark_failed(&mut self, conn: ConnectionId) {
        if !self.failed.contains(&conn) {
            self.failed.push(conn);
        }
    }

    /// Connections whose writes or dials failed since the last call
    pub fn take_failed(&mut self) -> Vec<ConnectionId> {
        std::mem::take(&mut self.failed)
    }

    pub fn close(&mut self, conn: ConnectionId) {
        if let Some(mut connection) = self.streams.remove(&conn) {
            if let Err(e) = self.poll.registry().deregister(&mut connection.stream) {
                log::debug!("Deregister {} failed: {}", conn, e);
            }
            log::info!("Closed {} connection {} ({})", connection.role, conn, connection.address);
        }
    }

    fn send_status(&mut self, text: &str) {
        let Some(requester) = self.status_requester else {
            log::debug!("Dropping status reply with no requester");
            return;
        };
        if let Err(e) = self.status.send_to(&frame(text), requester) {
            log::warn!("Status reply to {} failed: {}", requester, e);
        }
    }
}

impl Network for ConnectionRegistry {
    fn send(&mut self, message: OutboundMessage) {
        if message.to == STATUS_CONNECTION {
            self.send_status(&message.text);
            return;
        }

        match self.streams.get_mut(&message.to) {
            Some(connection) => {
                connection.outgoing.extend_from_slice(&frame(&message.text));
                if connection.dial_deadline.is_none() {
                    self.flush(message.to);
                }
            }
            None => log::debug!("Dropping message for closed connection {}", message.to),
        }
    }

    fn connect(&mut self, address: &PeerAddress) -> Result<ConnectionId, RelayError> {
        let target = (address.host.as_str(), address.port)
            .to_socket_addrs()
            .map_err(|e| RelayError::Resolve(format!("{}: {}", address, e)))?
            .next()
            .ok_or_else(|| RelayError::Resolve(address.to_string()))?;

        let stream = TcpStream::connect(target).map_err(|source| RelayError::Connect {
            address: address.to_string(),
            source,
        })?;

        let conn = self.insert(stream, Role::Peer, target)?;
        if let Some(connection) = self.streams.get_mut(&conn) {
            connection.dial_deadline = Some(Instant::now() + self.connect_timeout);
        }
        log::info!("Dialling peer {} as {}", target, conn);
        Ok(conn)
    }

    fn connections(&self, role: Role) -> Vec<ConnectionId> {
        let mut matching: Vec<ConnectionId> = self
            .streams
            .iter()
            .filter(|(_, c)| c.role == role)
            .map(|(id, _)| *id)
            .collect();
        matching.sort();
        matching
    }
}

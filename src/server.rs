//! Control loop
//!
//! One thread, one poll. Each iteration:
//! 1. heartbeat, stale-peer cleanup and overdue dials
//! 2. wait for readiness (bounded by the poll timeout)
//! 3. accept, read and flush, collecting work in arrival order
//! 4. dispatch the collected work

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::Events;

use crate::access::Role;
use crate::config::Config;
use crate::connection::{
    ConnectionRegistry, CONTROL_LISTENER, PEER_LISTENER, STATUS_CONNECTION, STATUS_SOCKET,
};
use crate::dispatcher::{Dispatcher, ServerIdentity};
use crate::error::RelayError;
use crate::framing::{tokenize, Command, ConnectionId};

const EVENTS_CAPACITY: usize = 1024;

/// One unit of work gathered from a poll round
enum Work {
    Command(Command),
    Status(SocketAddr, Command),
    Close(ConnectionId),
}

fn status_query() -> Command {
    Command {
        origin: STATUS_CONNECTION,
        role: Role::Status,
        tokens: vec!["LISTSERVERS".to_string()],
        delegate: None,
        raw: "LISTSERVERS".to_string(),
    }
}

pub struct Server {
    connections: ConnectionRegistry,
    dispatcher: Dispatcher,
    max_peers: usize,
    poll_timeout: Duration,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn bind(config: &Config) -> Result<Self, RelayError> {
        config.validate()?;

        let connections = ConnectionRegistry::bind(config)?;
        let identity = ServerIdentity {
            id: config.server_id.clone(),
            ip: config.advertised_ip(),
            peer_port: connections.peer_addr()?.port(),
        };
        log::info!(
            "Server '{}' advertising {}:{}",
            identity.id,
            identity.ip,
            identity.peer_port
        );

        Ok(Server {
            connections,
            dispatcher: Dispatcher::new(identity, config),
            max_peers: config.max_peers,
            poll_timeout: config.poll_timeout(),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag that stops the loop at the next iteration
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn control_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.connections.control_addr()?)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.connections.peer_addr()?)
    }

    pub fn status_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.connections.status_addr()?)
    }

    pub fn run(&mut self) -> Result<(), RelayError> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        loop {
            if self.shutdown.load(Ordering::Relaxed) || self.dispatcher.shutdown_requested() {
                log::info!("Shutting down ({} open connections)", self.connections.len());
                return Ok(());
            }

            let now = Instant::now();
            self.dispatcher.heartbeat(&mut self.connections, now);
            for conn in self.dispatcher.cleanup(now) {
                self.connections.close(conn);
            }
            self.connections.expire_dials(now);
            self.reap_failed();

            match self.connections.poll(&mut events, Some(self.poll_timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            let mut work = Vec::new();
            for event in events.iter() {
                match event.token() {
                    CONTROL_LISTENER => {
                        self.connections.accept(CONTROL_LISTENER);
                    }
                    PEER_LISTENER => self.accept_peers(&mut work),
                    STATUS_SOCKET => {
                        for from in self.connections.read_status() {
                            work.push(Work::Status(from, status_query()));
                        }
                    }
                    token => {
                        let conn = ConnectionId::from(token);
                        // A failed dial may only show up as an error or hangup
                        if event.is_writable() || event.is_error() || event.is_write_closed() {
                            self.connections.flush(conn);
                        }
                        if event.is_readable() {
                            self.read_stream(conn, &mut work);
                        }
                    }
                }
            }

            self.dispatch(work);
            self.reap_failed();
        }
    }

    fn accept_peers(&mut self, work: &mut Vec<Work>) {
        for conn in self.connections.accept(PEER_LISTENER) {
            if self.dispatcher.peers().direct_count() >= self.max_peers {
                log::warn!("Peer limit ({}) reached, refusing {}", self.max_peers, conn);
                self.connections.close(conn);
                continue;
            }
            let request = self.dispatcher.peer_accepted(conn, Instant::now());
            work.push(Work::Command(request));
        }
    }

    fn read_stream(&mut self, conn: ConnectionId, work: &mut Vec<Work>) {
        let Some(role) = self.connections.role(conn) else {
            return;
        };

        let outcome = self.connections.read(conn);
        for text in outcome.messages {
            work.push(Work::Command(tokenize(conn, role, &text)));
        }
        if outcome.closed {
            work.push(Work::Close(conn));
        }
    }

    fn dispatch(&mut self, work: Vec<Work>) {
        for item in work {
            match item {
                Work::Command(command) => {
                    // Origin may have been closed or failed earlier in this round
                    if command.origin != ConnectionId::INTERNAL
                        && !self.connections.is_open(command.origin)
                    {
                        continue;
                    }
                    self.dispatcher.handle(&mut self.connections, &command);
                }
                Work::Status(from, command) => {
                    self.connections.set_status_requester(Some(from));
                    self.dispatcher.handle(&mut self.connections, &command);
                    self.connections.set_status_requester(None);
                }
                Work::Close(conn) => {
                    self.dispatcher.disconnect(conn);
                    self.connections.close(conn);
                }
            }
        }
    }

    fn reap_failed(&mut self) {
        for conn in self.connections.take_failed() {
            self.dispatcher.disconnect(conn);
            self.connections.close(conn);
        }
    }
}

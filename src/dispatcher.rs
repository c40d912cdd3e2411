//! Command dispatcher: the protocol state machine
//!
//! Consumes parsed commands one at a time, checks them against the
//! permission table, runs the verb and emits replies through a [`Network`].
//!
//! # CMD / RSP Flow
//!
//! ```text
//! A (requester)              R (relay)                  B (target)
//!   │                           │                           │
//!   │── CMD,B,A,LISTROUTES ────►│                           │
//!   │   await on R              │── CMD,B,A,LISTROUTES ────►│
//!   │                           │   await on B              │ runs LISTROUTES
//!   │                           │◄── RSP,A,A,LISTROUTES,… ──│
//!   │◄── RSP,A,A,LISTROUTES,… ──│   resolve B               │
//!   │   resolve R               │                           │
//! ```
//!
//! Replies are addressed to the correlation id, which names the requesting
//! server. Only one request is outstanding per connection.

use std::time::Instant;

use time::macros::format_description;
use time::OffsetDateTime;

use crate::access::{AccessControl, Role, Verb};
use crate::config::Config;
use crate::correlation::{PendingResponse, ResponseTable};
use crate::error::RelayError;
use crate::framing::{cmd_envelope, rsp_envelope, Command, ConnectionId, OutboundMessage};
use crate::liveness::{Liveness, KEEPALIVE};
use crate::peers::{PeerAddress, PeerRegistry};
use crate::users::UserRegistry;

// ============================================================================
// Reply Text
// ============================================================================

pub const NOT_PERMITTED: &str = "Operation not permitted";
pub const INVALID_ARGS: &str = "Invalid number of arguments";
pub const ALREADY_CONNECTED: &str = "You are already connected";
pub const NAME_TAKEN: &str = "Name already taken";
pub const CONNECT_FAILED: &str = "Failed to connect";
pub const MISSING_RECIPIENT: &str = "Missing recipient and/or message";
pub const NOT_CONNECTED: &str = "You must connect before sending messages";
pub const NO_SUCH_USER: &str = "No such user";
pub const MESSAGE_SENT: &str = "Message sent";
pub const LEAVING: &str = "Leaving";
pub const ALREADY_DISCONNECTED: &str = "Already disconnected";
pub const INDEX_OUT_OF_RANGE: &str = "Index out of range";
pub const INVALID_INDEX: &str = "Invalid index";
pub const INVALID_PORT: &str = "Invalid port";
pub const UNABLE_TO_CONNECT: &str = "Unable to connect to server";
pub const MAX_SERVERS: &str = "Maximum number of servers reached";
pub const FORWARDING_FAILED: &str = "Forwarding failed";
pub const UNWARRANTED_RSP: &str = "Unwarranted RSP";
pub const STALE_RSP: &str = "Stale RSP";
pub const NOT_IMPLEMENTED: &str = "Command not implemented";
pub const SHUTTING_DOWN: &str = "Shutting down";

// ============================================================================
// Network Seam
// ============================================================================

/// What the dispatcher needs from the connection layer
pub trait Network {
    /// Queue text for a connection. Framing happens on transmission.
    fn send(&mut self, message: OutboundMessage);

    /// Open an outbound peer connection
    fn connect(&mut self, address: &PeerAddress) -> Result<ConnectionId, RelayError>;

    /// Open connections accepted with `role`
    fn connections(&self, role: Role) -> Vec<ConnectionId>;
}

/// How this server describes itself in ID replies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    pub id: String,
    pub ip: String,
    pub peer_port: u16,
}

/// Result text plus whether it goes back to the origin
#[derive(Debug)]
struct Outcome {
    text: String,
    reply: bool,
}

impl Outcome {
    fn reply(text: impl Into<String>) -> Self {
        Outcome {
            text: text.into(),
            reply: true,
        }
    }

    fn silent(text: impl Into<String>) -> Self {
        Outcome {
            text: text.into(),
            reply: false,
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

pub struct Dispatcher {
    identity: ServerIdentity,
    access: AccessControl,
    users: UserRegistry,
    peers: PeerRegistry,
    responses: ResponseTable,
    liveness: Liveness,
    fetch_values: Vec<String>,
    max_peers: usize,
    shutdown_requested: bool,
}

impl Dispatcher {
    pub fn new(identity: ServerIdentity, config: &Config) -> Self {
        Dispatcher {
            identity,
            access: AccessControl::new(),
            users: UserRegistry::new(),
            peers: PeerRegistry::new(),
            responses: ResponseTable::new(),
            liveness: Liveness::new(config.heartbeat_interval(), config.peer_timeout()),
            fetch_values: config.fetch_values.clone(),
            max_peers: config.max_peers,
            shutdown_requested: false,
        }
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn users(&self) -> &UserRegistry {
        &self.users
    }

    pub fn responses(&self) -> &ResponseTable {
        &self.responses
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Process one command and return its result text
    pub fn handle<N: Network>(&mut self, net: &mut N, command: &Command) -> String {
        self.handle_at(net, command, Instant::now())
    }

    /// `handle` with the receive time supplied. Any message from a peer,
    /// KEEPALIVE included, counts as contact at `now`.
    pub fn handle_at<N: Network>(&mut self, net: &mut N, command: &Command, now: Instant) -> String {
        if command.tokens.is_empty() {
            return String::new();
        }

        self.peers.touch(command.origin, now);

        let outcome = self.execute(net, command);
        log::debug!(
            "{} ({}) {:?} -> {:?}",
            command.origin,
            command.role,
            command.raw,
            outcome.text
        );

        if outcome.reply && command.origin != ConnectionId::INTERNAL {
            net.send(OutboundMessage::new(command.origin, outcome.text.clone()));
        }
        outcome.text
    }

    fn execute<N: Network>(&mut self, net: &mut N, command: &Command) -> Outcome {
        let verb = command.verb();

        // No reply: answering a forged peer could start a reply loop
        if !self.access.permit(command.role, &verb) {
            log::warn!(
                "Denied {} from {} (role {})",
                verb,
                command.origin,
                command.role
            );
            return Outcome::silent(NOT_PERMITTED);
        }
        self.run(net, command, verb)
    }

    fn run<N: Network>(&mut self, net: &mut N, command: &Command, verb: Verb) -> Outcome {
        match verb {
            Verb::Connect => self.connect_user(command),
            Verb::Msg => self.message(net, command),
            Verb::Who => Outcome::reply(self.users.list_names().join("\n")),
            Verb::Leave => self.leave(command),
            Verb::Id => Outcome::reply(self.id_text()),
            Verb::ListServers => Outcome::reply(self.list_servers()),
            Verb::ListRoutes => Outcome::reply(self.list_routes()),
            Verb::AddServer => self.add_server(net, command),
            Verb::Fetch => self.fetch(command),
            Verb::Keepalive => Outcome::silent("Keepalive"),
            Verb::Cmd => self.delegate(net, command),
            Verb::Rsp => self.response(net, command),
            Verb::Shutdown => {
                log::info!("Shutdown requested by {}", command.origin);
                self.shutdown_requested = true;
                Outcome::reply(SHUTTING_DOWN)
            }
            Verb::MetaRequestId => self.meta_request_id(net, command),
            Verb::Unknown(token) => {
                log::warn!("Command not implemented: {}", token);
                Outcome::reply(NOT_IMPLEMENTED)
            }
        }
    }

    // ------------------------------------------------------------------------
    // User verbs
    // ------------------------------------------------------------------------

    fn connect_user(&mut self, command: &Command) -> Outcome {
        if command.tokens.len() != 2 {
            return Outcome::reply(INVALID_ARGS);
        }
        let name = command.arg(1);

        if self.users.is_connected(command.origin) {
            Outcome::reply(ALREADY_CONNECTED)
        } else if self.users.is_name_taken(name) {
            Outcome::reply(NAME_TAKEN)
        } else if self.users.connect_user(command.origin, name) {
            Outcome::reply(format!("Connected as {}", name))
        } else {
            log::warn!("Failed to connect '{}' on {}", name, command.origin);
            Outcome::reply(CONNECT_FAILED)
        }
    }

    fn message<N: Network>(&mut self, net: &mut N, command: &Command) -> Outcome {
        if command.tokens.len() < 2 {
            return Outcome::reply(MISSING_RECIPIENT);
        }

        let Some(sender) = self.users.name_of(command.origin) else {
            return Outcome::reply(NOT_CONNECTED);
        };

        let Some(recipient) = self.users.connection_of(command.arg(1)) else {
            return Outcome::reply(NO_SUCH_USER);
        };

        let mut text = format!("From {}:", sender);
        for word in &command.tokens[2..] {
            text.push(' ');
            text.push_str(word);
        }
        net.send(OutboundMessage::new(recipient, text));

        Outcome::reply(MESSAGE_SENT)
    }

    fn leave(&mut self, command: &Command) -> Outcome {
        match self.users.remove_user(command.origin) {
            Some(_) => Outcome::reply(LEAVING),
            None => Outcome::reply(ALREADY_DISCONNECTED),
        }
    }

    fn fetch(&self, command: &Command) -> Outcome {
        if command.tokens.len() != 2 {
            return Outcome::reply(INVALID_ARGS);
        }
        let Ok(index) = command.arg(1).parse::<i64>() else {
            return Outcome::reply(INVALID_INDEX);
        };

        if index < 1 || index as usize > self.fetch_values.len() {
            return Outcome::reply(INDEX_OUT_OF_RANGE);
        }
        Outcome::reply(self.fetch_values[index as usize - 1].clone())
    }

    // ------------------------------------------------------------------------
    // Server verbs
    // ------------------------------------------------------------------------

    fn id_text(&self) -> String {
        format!(
            "{},{},{}",
            self.identity.id, self.identity.ip, self.identity.peer_port
        )
    }

    /// `id,ip,port` for each identified direct peer, `;`-joined
    fn list_servers(&self) -> String {
        self.peers
            .direct()
            .filter(|p| !p.identity.is_empty())
            .map(|p| format!("{},{},{}", p.identity, p.address.host, p.address.port))
            .collect::<Vec<_>>()
            .join(";")
    }

    fn list_routes(&self) -> String {
        let own = self.identity.id.as_str();
        let known: Vec<_> = self
            .peers
            .all()
            .iter()
            .filter(|p| !p.identity.is_empty())
            .collect();

        let mut header = vec![own.to_string()];
        header.extend(known.iter().map(|p| p.identity.clone()));

        let mut row = vec![own.to_string(), "-".to_string()];
        row.extend(known.iter().map(|p| {
            if p.is_direct() {
                own.to_string()
            } else {
                p.path.join("-")
            }
        }));

        let stamp = OffsetDateTime::now_utc()
            .format(format_description!(
                "[year]-[month]-[day]T[hour]:[minute]:[second]Z"
            ))
            .unwrap_or_else(|e| {
                log::warn!("Routing table timestamp formatting failed: {}", e);
                String::new()
            });

        format!("{}\n{}\n{}", header.join(";"), row.join(";"), stamp)
    }

    fn add_server<N: Network>(&mut self, net: &mut N, command: &Command) -> Outcome {
        if command.tokens.len() != 3 {
            return Outcome::reply(INVALID_ARGS);
        }
        let Ok(port) = command.arg(2).parse::<u16>() else {
            return Outcome::reply(INVALID_PORT);
        };
        if self.peers.direct_count() >= self.max_peers {
            return Outcome::reply(MAX_SERVERS);
        }

        let address = PeerAddress::new(command.arg(1), port);
        match net.connect(&address) {
            Ok(conn) => {
                self.peers.register(conn, address.clone(), Instant::now());
                self.request(net, conn, "ID");
                Outcome::reply(format!("Connected to {} {}", address.host, address.port))
            }
            Err(e) => {
                log::warn!("ADDSERVER {} failed: {}", address, e);
                Outcome::reply(UNABLE_TO_CONNECT)
            }
        }
    }

    fn meta_request_id<N: Network>(&mut self, net: &mut N, command: &Command) -> Outcome {
        let Ok(raw) = command.arg(1).parse::<usize>() else {
            return Outcome::silent(INVALID_ARGS);
        };
        let conn = ConnectionId(raw);
        if !self.peers.contains(conn) {
            return Outcome::silent(format!("No peer on {}", conn));
        }

        self.request(net, conn, "ID");
        Outcome::silent(format!("Requested ID from {}", conn))
    }

    /// Send an internally issued `CMD,,<self>,<sub>` and await its reply
    fn request<N: Network>(&mut self, net: &mut N, conn: ConnectionId, sub: &str) {
        let sub_tokens = vec![sub.to_string()];
        let raw = cmd_envelope("", &self.identity.id, &sub_tokens);
        let sent = vec![
            "CMD".to_string(),
            String::new(),
            self.identity.id.clone(),
            sub.to_string(),
        ];

        net.send(OutboundMessage::new(conn, raw));
        self.responses.await_response(conn, sent, true, Instant::now());
    }

    // ------------------------------------------------------------------------
    // CMD / RSP
    // ------------------------------------------------------------------------

    fn is_local(&self, target: &str) -> bool {
        target.is_empty() || target == self.identity.id
    }

    fn delegate<N: Network>(&mut self, net: &mut N, command: &Command) -> Outcome {
        if command.tokens.len() < 4 {
            return Outcome::reply(INVALID_ARGS);
        }
        let target = command.arg(1);
        let correlation = command.arg(2);

        if self.is_local(target) {
            let sub = Command {
                origin: command.origin,
                role: Role::Peer,
                tokens: command.delegate_tokens().to_vec(),
                delegate: None,
                raw: command.delegate_tokens().join(" "),
            };
            let result = if sub.tokens.is_empty() {
                INVALID_ARGS.to_string()
            } else {
                self.execute(net, &sub).text
            };

            net.send(OutboundMessage::new(
                command.origin,
                rsp_envelope(correlation, correlation, &sub.tokens, &result),
            ));
            return Outcome::silent(result);
        }

        if self.forward(net, command) {
            let text = format!("Forwarded to {}", target);
            if command.role == Role::Peer {
                Outcome::silent(text)
            } else {
                Outcome::reply(text)
            }
        } else {
            log::warn!("Cannot forward CMD to unknown server '{}'", target);
            if command.role == Role::Peer {
                net.send(OutboundMessage::new(
                    command.origin,
                    rsp_envelope(correlation, correlation, command.delegate_tokens(), FORWARDING_FAILED),
                ));
                Outcome::silent(FORWARDING_FAILED)
            } else {
                Outcome::reply(FORWARDING_FAILED)
            }
        }
    }

    fn response<N: Network>(&mut self, net: &mut N, command: &Command) -> Outcome {
        if !self.responses.is_awaiting(command.origin) {
            log::warn!(
                "Unwarranted RSP from {} (possible forgery): {:?}",
                command.origin,
                command.raw
            );
            return Outcome::silent(UNWARRANTED_RSP);
        }
        if command.tokens.len() < 3 {
            return Outcome::silent(INVALID_ARGS);
        }

        let echoed = echoed_verb(command.delegate_tokens());
        let Some(pending) = self.responses.resolve(command.origin, echoed) else {
            log::warn!(
                "Stale RSP from {} answers no outstanding request: {:?}",
                command.origin,
                command.raw
            );
            return Outcome::silent(STALE_RSP);
        };

        let target = command.arg(1);
        if self.is_local(target) {
            return self.resolve_response(net, command, pending);
        }

        if self.forward(net, command) {
            Outcome::silent(format!("Forwarded to {}", target))
        } else {
            log::warn!("Cannot forward RSP to unknown server '{}'", target);
            Outcome::silent(FORWARDING_FAILED)
        }
    }

    /// Send an envelope toward its target: directly for distance 1, else to
    /// the first intermediate only. A forwarded CMD is awaited on the
    /// connection it went out on.
    fn forward<N: Network>(&mut self, net: &mut N, command: &Command) -> bool {
        let target = command.arg(1);
        let Some(peer) = self.peers.find(target) else {
            return false;
        };

        let via = if peer.is_direct() {
            peer.connection
        } else {
            peer.first_hop()
                .and_then(|hop| self.peers.find(hop))
                .and_then(|relay| relay.connection)
        };
        let Some(conn) = via else {
            return false;
        };

        log::debug!("Forwarding {:?} to '{}' via {}", command.raw, target, conn);
        net.send(OutboundMessage::new(conn, command.raw.clone()));

        if command.verb() == Verb::Cmd {
            self.responses
                .await_response(conn, command.tokens.clone(), false, Instant::now());
        }
        true
    }

    fn resolve_response<N: Network>(
        &mut self,
        net: &mut N,
        command: &Command,
        pending: PendingResponse,
    ) -> Outcome {
        let delegate = command.delegate_tokens();

        match pending.sub_verb() {
            Some("ID") if pending.internal => {
                let Some((identity, address)) = parse_id_reply(delegate) else {
                    log::warn!("Malformed ID reply from {}: {:?}", command.origin, command.raw);
                    return Outcome::silent("Malformed ID reply");
                };
                self.peers.identify(command.origin, &identity, address);
                Outcome::silent(format!("Identified {}", identity))
            }
            Some("LISTSERVERS") if pending.internal => {
                let learned = self.learn_routes(command.origin, delegate);
                Outcome::silent(format!("Learned {} routes", learned))
            }
            _ => {
                let mut listeners = net.connections(Role::Control);
                listeners.extend(net.connections(Role::Root));
                for conn in listeners {
                    net.send(OutboundMessage::new(conn, command.raw.clone()));
                }
                Outcome::silent("Relayed response")
            }
        }
    }

    /// Replace the routes learned through the peer on `relay_conn` with the
    /// servers in its LISTSERVERS reply
    fn learn_routes(&mut self, relay_conn: ConnectionId, delegate: &[String]) -> usize {
        let Some(relay) = self
            .peers
            .get(relay_conn)
            .map(|p| p.identity.clone())
            .filter(|id| !id.is_empty())
        else {
            return 0;
        };

        let body = match delegate.first() {
            Some(first) if first == "LISTSERVERS" => &delegate[1..],
            _ => delegate,
        };
        let listing = body.join(",");

        self.peers.evict_routed_through(std::slice::from_ref(&relay));

        let now = Instant::now();
        let mut learned = 0;
        for entry in listing.split(';') {
            let fields: Vec<&str> = entry.split(',').collect();
            let identity = fields.first().copied().unwrap_or("");
            if identity.is_empty() || identity == self.identity.id {
                continue;
            }
            let address = PeerAddress::new(
                fields.get(1).copied().unwrap_or(""),
                fields.get(2).and_then(|p| p.parse().ok()).unwrap_or(0),
            );
            if self
                .peers
                .register_relayed(identity, address, vec![relay.clone()], now)
            {
                learned += 1;
            }
        }
        learned
    }

    // ------------------------------------------------------------------------
    // Connection lifecycle and liveness
    // ------------------------------------------------------------------------

    /// Register a connection accepted on the peer port and build the
    /// synthetic command that asks it for its identity
    pub fn peer_accepted(&mut self, conn: ConnectionId, now: Instant) -> Command {
        self.peers.register(conn, PeerAddress::unknown(), now);
        Command::internal(
            Role::System,
            vec!["META_REQUEST_ID".to_string(), conn.0.to_string()],
        )
    }

    /// Forget everything keyed on a closed connection
    pub fn disconnect(&mut self, conn: ConnectionId) {
        self.users.remove_user(conn);
        self.responses.forget(conn);

        if let Some(peer) = self.peers.evict(conn) {
            if !peer.identity.is_empty() {
                self.peers.evict_routed_through(&[peer.identity]);
            }
        }
    }

    /// KEEPALIVE every identified direct peer once per interval, and ask
    /// idle ones for their server list
    pub fn heartbeat<N: Network>(&mut self, net: &mut N, now: Instant) {
        let Some(targets) = self.liveness.heartbeat(&self.peers, now) else {
            return;
        };

        for conn in targets {
            net.send(OutboundMessage::new(conn, KEEPALIVE));
            if !self.responses.is_awaiting(conn) {
                self.request(net, conn, "LISTSERVERS");
            }
        }
    }

    /// Evict stale peers. Returns the direct connections that should be closed.
    pub fn cleanup(&mut self, now: Instant) -> Vec<ConnectionId> {
        let evicted = self.liveness.cleanup(&mut self.peers, now);

        let closed: Vec<ConnectionId> = evicted.iter().filter_map(|p| p.connection).collect();
        for conn in &closed {
            log::info!("Peer on {} timed out", conn);
            self.responses.forget(*conn);
            self.users.remove_user(*conn);
        }
        closed
    }
}

/// Verb a reply repeats from the command it answers, if its delegate
/// starts with one
fn echoed_verb(delegate: &[String]) -> Option<&str> {
    let first = delegate.first()?;
    match Verb::parse(first) {
        Verb::Unknown(_) => None,
        _ => Some(first.as_str()),
    }
}

/// Identity (and address, when present) from an ID reply delegate:
/// `[ID, identity, ip, port]`, `[ID, identity]` or bare `[identity]`
fn parse_id_reply(delegate: &[String]) -> Option<(String, Option<PeerAddress>)> {
    match delegate {
        [verb, identity, rest @ ..] if verb == "ID" && !identity.is_empty() => {
            let address = match rest {
                [ip, port, ..] => port.parse().ok().map(|port| PeerAddress::new(ip.as_str(), port)),
                _ => None,
            };
            Some((identity.clone(), address))
        }
        [identity] if identity != "ID" => Some((identity.clone(), None)),
        _ => None,
    }
}

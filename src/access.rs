//! Connection roles, command verbs and the role x verb capability matrix

use std::fmt;

// ============================================================================
// Roles
// ============================================================================

/// Trust level of the connection a command arrived on
///
/// Fixed when the connection is accepted; the listening port decides it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// End user on the control port
    Control,
    /// Another server on the peer port (or dialled by ADDSERVER)
    Peer,
    /// Stateless status query on the UDP port
    Status,
    /// Operator connected to the control port from a configured address
    Root,
    /// Commands generated inside this process
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Control => "control",
            Role::Peer => "peer",
            Role::Status => "status",
            Role::Root => "root",
            Role::System => "system",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Verbs
// ============================================================================

/// First token of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verb {
    Connect,
    Msg,
    Who,
    Leave,
    Id,
    ListServers,
    ListRoutes,
    AddServer,
    Fetch,
    Keepalive,
    Cmd,
    Rsp,
    Shutdown,
    MetaRequestId,
    Unknown(String),
}

impl Verb {
    pub fn parse(token: &str) -> Verb {
        match token {
            "CONNECT" => Verb::Connect,
            "MSG" => Verb::Msg,
            "WHO" => Verb::Who,
            "LEAVE" => Verb::Leave,
            "ID" => Verb::Id,
            "LISTSERVERS" => Verb::ListServers,
            "LISTROUTES" => Verb::ListRoutes,
            "ADDSERVER" => Verb::AddServer,
            "FETCH" => Verb::Fetch,
            "KEEPALIVE" => Verb::Keepalive,
            "CMD" => Verb::Cmd,
            "RSP" => Verb::Rsp,
            "SHUTDOWN" => Verb::Shutdown,
            "META_REQUEST_ID" => Verb::MetaRequestId,
            other => Verb::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Verb::Connect => "CONNECT",
            Verb::Msg => "MSG",
            Verb::Who => "WHO",
            Verb::Leave => "LEAVE",
            Verb::Id => "ID",
            Verb::ListServers => "LISTSERVERS",
            Verb::ListRoutes => "LISTROUTES",
            Verb::AddServer => "ADDSERVER",
            Verb::Fetch => "FETCH",
            Verb::Keepalive => "KEEPALIVE",
            Verb::Cmd => "CMD",
            Verb::Rsp => "RSP",
            Verb::Shutdown => "SHUTDOWN",
            Verb::MetaRequestId => "META_REQUEST_ID",
            Verb::Unknown(token) => token,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Capability Matrix
// ============================================================================

const EVERYONE: &[Role] = &[Role::Root, Role::Control, Role::Peer, Role::Status];
const USERS_AND_PEERS: &[Role] = &[Role::Root, Role::Control, Role::Peer];
const OPERATORS: &[Role] = &[Role::Root, Role::Control];
const PEERS: &[Role] = &[Role::Peer];
const INTERNAL: &[Role] = &[Role::Root, Role::System];

/// Static role x verb permission table
#[derive(Debug, Default, Clone, Copy)]
pub struct AccessControl;

impl AccessControl {
    pub fn new() -> Self {
        AccessControl
    }

    /// Whether `role` may invoke `verb`. Unknown verbs are denied to everyone.
    pub fn permit(&self, role: Role, verb: &Verb) -> bool {
        Self::allowed_roles(verb).contains(&role)
    }

    fn allowed_roles(verb: &Verb) -> &'static [Role] {
        match verb {
            Verb::ListServers => EVERYONE,
            Verb::Id
            | Verb::Connect
            | Verb::Who
            | Verb::Msg
            | Verb::Leave
            | Verb::Keepalive
            | Verb::ListRoutes
            | Verb::Cmd
            | Verb::Fetch => USERS_AND_PEERS,
            Verb::Shutdown | Verb::AddServer => OPERATORS,
            Verb::Rsp => PEERS,
            Verb::MetaRequestId => INTERNAL,
            Verb::Unknown(_) => &[],
        }
    }
}

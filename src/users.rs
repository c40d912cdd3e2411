//! Display-name bookkeeping for connected users
//!
//! Two maps kept in lockstep for lookup in either direction.

use std::collections::{BTreeMap, HashMap};

use crate::framing::ConnectionId;

#[derive(Debug, Default)]
pub struct UserRegistry {
    by_connection: HashMap<ConnectionId, String>,
    by_name: BTreeMap<String, ConnectionId>,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `conn`. Fails if either side is already bound.
    pub fn connect_user(&mut self, conn: ConnectionId, name: &str) -> bool {
        if name.is_empty() || self.is_connected(conn) || self.is_name_taken(name) {
            return false;
        }

        self.by_connection.insert(conn, name.to_string());
        self.by_name.insert(name.to_string(), conn);
        log::info!("User '{}' connected on {}", name, conn);
        true
    }

    pub fn is_connected(&self, conn: ConnectionId) -> bool {
        self.by_connection.contains_key(&conn)
    }

    pub fn is_name_taken(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn name_of(&self, conn: ConnectionId) -> Option<&str> {
        self.by_connection.get(&conn).map(String::as_str)
    }

    pub fn connection_of(&self, name: &str) -> Option<ConnectionId> {
        self.by_name.get(name).copied()
    }

    /// Unbind the user on `conn`, returning the name it held
    pub fn remove_user(&mut self, conn: ConnectionId) -> Option<String> {
        let name = self.by_connection.remove(&conn)?;
        self.by_name.remove(&name);
        log::info!("User '{}' left ({})", name, conn);
        Some(name)
    }

    /// Connected names in lexical order
    pub fn list_names(&self) -> Vec<String> {
        self.by_name.keys().cloned().collect()
    }
}

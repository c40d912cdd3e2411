//! Response correlation for outstanding CMD envelopes
//!
//! One request is awaited per peer connection. Sending a second CMD before
//! the first is answered replaces the record; the replaced one is kept aside
//! so a late reply that echoes its verb still finds it. Replies echoing the
//! verb of neither record are stale and resolve nothing.
//!
//! Entries are never expired here; they go away when answered or when the
//! connection they are keyed on is dropped.

use std::collections::HashMap;
use std::time::Instant;

use crate::framing::ConnectionId;

/// A CMD sent to a connection that has not been answered yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingResponse {
    pub sent_at: Instant,
    /// Primary tokens of the envelope as sent: `[CMD, target, correlation, sub...]`
    pub sent_tokens: Vec<String>,
    /// Issued by this server for its own bookkeeping rather than on behalf
    /// of a user or another peer
    pub internal: bool,
}

impl PendingResponse {
    /// Verb of the delegated sub-command, e.g. `ID`
    pub fn sub_verb(&self) -> Option<&str> {
        self.sent_tokens
            .get(3)
            .and_then(|sub| sub.split_whitespace().next())
    }
}

#[derive(Debug, Default)]
pub struct ResponseTable {
    pending: HashMap<ConnectionId, PendingResponse>,
    /// Last record replaced on each connection before it was answered
    displaced: HashMap<ConnectionId, PendingResponse>,
}

impl ResponseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a CMD was sent on `conn`. Returns the record it replaced.
    pub fn await_response(
        &mut self,
        conn: ConnectionId,
        sent_tokens: Vec<String>,
        internal: bool,
        now: Instant,
    ) -> Option<PendingResponse> {
        let replaced = self.pending.insert(
            conn,
            PendingResponse {
                sent_at: now,
                sent_tokens,
                internal,
            },
        );

        if let Some(old) = &replaced {
            log::warn!(
                "Outstanding request {:?} on {} replaced before it was answered",
                old.sent_tokens,
                conn
            );
            self.displaced.insert(conn, old.clone());
        }
        replaced
    }

    pub fn is_awaiting(&self, conn: ConnectionId) -> bool {
        self.pending.contains_key(&conn) || self.displaced.contains_key(&conn)
    }

    /// Take the record a reply on `conn` answers. `echoed` is the verb the
    /// reply repeats, if it repeats one; it must match the record's sub-verb.
    /// Without an echo the current record is taken.
    pub fn resolve(&mut self, conn: ConnectionId, echoed: Option<&str>) -> Option<PendingResponse> {
        let Some(verb) = echoed else {
            return self
                .pending
                .remove(&conn)
                .or_else(|| self.displaced.remove(&conn));
        };

        if self.pending.get(&conn).and_then(|p| p.sub_verb()) == Some(verb) {
            return self.pending.remove(&conn);
        }
        if self.displaced.get(&conn).and_then(|p| p.sub_verb()) == Some(verb) {
            return self.displaced.remove(&conn);
        }
        None
    }

    /// Drop every record keyed on `conn`
    pub fn forget(&mut self, conn: ConnectionId) {
        self.pending.remove(&conn);
        self.displaced.remove(&conn);
    }

    /// Connections with at least one record
    pub fn len(&self) -> usize {
        let displaced_only = self
            .displaced
            .keys()
            .filter(|conn| !self.pending.contains_key(conn))
            .count();
        self.pending.len() + displaced_only
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.displaced.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_await_and_resolve() {
        let mut table = ResponseTable::new();
        let conn = ConnectionId(20);

        assert!(!table.is_awaiting(conn));
        table.await_response(conn, tokens(&["CMD", "", "A", "ID"]), true, Instant::now());
        assert!(table.is_awaiting(conn));

        let pending = table.resolve(conn, Some("ID")).expect("pending");
        assert_eq!(pending.sub_verb(), Some("ID"));
        assert!(pending.internal);
        assert!(!table.is_awaiting(conn));
        assert!(table.resolve(conn, None).is_none());
    }

    #[test]
    fn test_second_request_overwrites_first() {
        let mut table = ResponseTable::new();
        let conn = ConnectionId(20);
        let now = Instant::now();

        assert!(table
            .await_response(conn, tokens(&["CMD", "", "A", "ID"]), true, now)
            .is_none());
        let replaced = table
            .await_response(conn, tokens(&["CMD", "B", "A", "LISTROUTES"]), false, now)
            .expect("first request replaced");

        assert_eq!(replaced.sub_verb(), Some("ID"));
        assert_eq!(table.len(), 1);
        assert_eq!(table.resolve(conn, None).and_then(|p| p.sub_verb().map(String::from)), Some("LISTROUTES".to_string()));
    }

    #[test]
    fn test_late_reply_finds_replaced_request() {
        let mut table = ResponseTable::new();
        let conn = ConnectionId(20);
        let now = Instant::now();

        table.await_response(conn, tokens(&["CMD", "", "A", "LISTSERVERS"]), true, now);
        table.await_response(conn, tokens(&["CMD", "B", "A", "WHO"]), false, now);

        let first = table.resolve(conn, Some("LISTSERVERS")).expect("replaced request");
        assert!(first.internal);
        assert!(table.is_awaiting(conn));

        let second = table.resolve(conn, Some("WHO")).expect("current request");
        assert!(!second.internal);
        assert!(!table.is_awaiting(conn));
    }

    #[test]
    fn test_reply_echoing_other_verb_is_stale() {
        let mut table = ResponseTable::new();
        let conn = ConnectionId(20);
        table.await_response(conn, tokens(&["CMD", "B", "A", "WHO"]), false, Instant::now());

        assert!(table.resolve(conn, Some("LISTSERVERS")).is_none());
        assert!(table.is_awaiting(conn));
        assert!(table.resolve(conn, Some("WHO")).is_some());
    }

    #[test]
    fn test_forget_drops_replaced_request() {
        let mut table = ResponseTable::new();
        let conn = ConnectionId(20);
        let now = Instant::now();
        table.await_response(conn, tokens(&["CMD", "", "A", "ID"]), true, now);
        table.await_response(conn, tokens(&["CMD", "B", "A", "WHO"]), false, now);

        table.forget(conn);
        assert!(!table.is_awaiting(conn));
        assert!(table.resolve(conn, Some("ID")).is_none());
    }

    #[test]
    fn test_sub_verb_of_multi_word_request() {
        let pending = PendingResponse {
            sent_at: Instant::now(),
            sent_tokens: tokens(&["CMD", "B", "A", "FETCH 2"]),
            internal: false,
        };
        assert_eq!(pending.sub_verb(), Some("FETCH"));

        let short = PendingResponse {
            sent_at: Instant::now(),
            sent_tokens: tokens(&["CMD", "B"]),
            internal: false,
        };
        assert_eq!(short.sub_verb(), None);
    }

    #[test]
    fn test_entries_are_per_connection() {
        let mut table = ResponseTable::new();
        let now = Instant::now();
        table.await_response(ConnectionId(20), tokens(&["CMD", "", "A", "ID"]), true, now);
        table.await_response(ConnectionId(21), tokens(&["CMD", "", "A", "ID"]), true, now);

        assert_eq!(table.len(), 2);
        table.resolve(ConnectionId(20), Some("ID"));
        assert!(table.is_awaiting(ConnectionId(21)));
        assert!(!table.is_empty());
    }
}

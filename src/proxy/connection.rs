//! Client connection identity

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A connected (or formerly connected) proxy client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConnection {
    pub id: ConnectionId,

    /// Peer address
    pub address: SocketAddr,

    pub timestamp_start: DateTime<Utc>,

    /// Set once the client has gone away
    pub timestamp_end: Option<DateTime<Utc>>,

    /// Acknowledged by the connect hook
    pub acked: bool,

    /// Labels attached by hooks
    pub tags: Vec<String>,
}

impl ClientConnection {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            id: ConnectionId::new(),
            address,
            timestamp_start: Utc::now(),
            timestamp_end: None,
            acked: false,
            tags: Vec::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.timestamp_end.is_none()
    }

    /// Add a tag if not already present
    pub fn tag(&mut self, tag: &str) {
        if !self.tags.iter().any(|t| t == tag) {
            self.tags.push(tag.to_string());
        }
    }

    pub(crate) fn mark_disconnected(&mut self) {
        if self.timestamp_end.is_none() {
            self.timestamp_end = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_keeps_first_timestamp() {
        let mut conn = ClientConnection::new("127.0.0.1:5000".parse().unwrap());
        assert!(conn.is_connected());

        conn.mark_disconnected();
        let first = conn.timestamp_end;
        conn.mark_disconnected();

        assert!(!conn.is_connected());
        assert_eq!(conn.timestamp_end, first);
    }

    #[test]
    fn test_tags_are_unique() {
        let mut conn = ClientConnection::new("10.0.0.1:80".parse().unwrap());
        conn.tag("internal");
        conn.tag("internal");
        assert_eq!(conn.tags, vec!["internal".to_string()]);
    }
}

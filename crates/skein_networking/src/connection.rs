//! # Connections
//!
//! Identity and metadata of a connected remote peer.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

/// Unique identifier for a connection while it is active.
///
/// Server-side ids start at 1 and are reused after disconnect. A client
/// addresses its server with [`ConnectionId::SERVER`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    /// The server, as seen from a client.
    pub const SERVER: Self = Self(0);

    /// Invalid/null connection ID.
    pub const NULL: Self = Self(u32::MAX);

    /// Returns true if this is a null/invalid ID.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == u32::MAX
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A connected remote peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Connection {
    /// Connection ID.
    pub id: ConnectionId,
    /// Remote address.
    pub address: SocketAddr,
    /// Wall-clock time the connection was accepted.
    pub connected_at: SystemTime,
}

impl Connection {
    /// Creates a connection stamped with the current time.
    #[must_use]
    pub fn new(id: ConnectionId, address: SocketAddr) -> Self {
        Self {
            id,
            address,
            connected_at: SystemTime::now(),
        }
    }

    /// Time since the connection was accepted.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.connected_at.elapsed().unwrap_or_default()
    }
}

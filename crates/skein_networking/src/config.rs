//! # Network Settings
//!
//! Loaded once at startup from TOML. Every key is optional:
//!
//! ```toml
//! protocol = "stream"
//! port = 9000
//! max_clients = 32
//! blacklist_path = "blacklist.toml"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NetError, NetResult};

/// Wire protocol backing a peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Reliable ordered datagrams over UDP.
    #[default]
    Reliable,
    /// Length-prefixed frames over TCP.
    Stream,
    /// Binary WebSocket messages.
    WebSocket,
}

impl Protocol {
    /// Every protocol, in declaration order.
    pub const ALL: [Self; 3] = [Self::Reliable, Self::Stream, Self::WebSocket];

    /// Lowercase name as used in settings files.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Reliable => "reliable",
            Self::Stream => "stream",
            Self::WebSocket => "websocket",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Protocol {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|protocol| protocol.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| NetError::Config(format!("unknown protocol '{s}'")))
    }
}

/// Peer configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetSettings {
    /// Bind `0.0.0.0` regardless of `address` (hosted deployments).
    pub managed_hosting: bool,
    /// Disable Nagle on stream and WebSocket sockets.
    pub no_delay: bool,
    /// Interval between `update()` calls for [`TickLoop`](crate::TickLoop) drivers.
    pub tick_interval_ms: u64,
    /// Wire protocol.
    pub protocol: Protocol,
    /// Server connection cap.
    pub max_clients: usize,
    /// Listen or connect port.
    pub port: u16,
    /// Listen or connect address.
    pub address: String,
    /// Optional TOML file with blocked addresses.
    pub blacklist_path: Option<PathBuf>,
    /// Default RPC timeout.
    pub rpc_timeout_ms: u64,
    /// Client connect timeout.
    pub connect_timeout_ms: u64,
    /// Silence after which a reliable link is dropped.
    pub idle_timeout_ms: u64,
    /// Interval between round-trip probes.
    pub ping_interval_ms: u64,
    /// Largest frame accepted on stream links, and largest encoded message.
    pub max_frame_size: usize,
    /// Idle buffers retained per pool bucket.
    pub max_buffers_per_bucket: usize,
}

impl Default for NetSettings {
    fn default() -> Self {
        Self {
            managed_hosting: false,
            no_delay: true,
            tick_interval_ms: 16,
            protocol: Protocol::Reliable,
            max_clients: 100,
            port: 7777,
            address: "127.0.0.1".to_string(),
            blacklist_path: None,
            rpc_timeout_ms: 5000,
            connect_timeout_ms: 5000,
            idle_timeout_ms: 10_000,
            ping_interval_ms: 1000,
            max_frame_size: 65_536,
            max_buffers_per_bucket: 1024,
        }
    }
}

impl NetSettings {
    /// Reads and validates settings from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> NetResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let settings = Self::from_toml_str(&text)?;
        tracing::info!(path = %path.as_ref().display(), protocol = %settings.protocol, "Loaded network settings");
        Ok(settings)
    }

    /// Parses and validates settings from TOML text.
    pub fn from_toml_str(text: &str) -> NetResult<Self> {
        let settings: Self = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> NetResult<()> {
        if self.address.trim().is_empty() {
            return Err(NetError::Config("address must not be empty".into()));
        }
        if self.max_clients == 0 {
            return Err(NetError::Config("max_clients must be at least 1".into()));
        }
        if self.tick_interval_ms == 0 {
            return Err(NetError::Config("tick_interval_ms must be at least 1".into()));
        }
        if self.ping_interval_ms == 0 {
            return Err(NetError::Config("ping_interval_ms must be at least 1".into()));
        }
        if self.max_frame_size < skein_core::codec::FRAME_HEADER_SIZE
            || self.max_frame_size > u32::MAX as usize
        {
            return Err(NetError::Config(format!(
                "max_frame_size {} out of range",
                self.max_frame_size
            )));
        }
        if self.idle_timeout_ms <= self.ping_interval_ms {
            return Err(NetError::Config(format!(
                "idle_timeout_ms ({}) must exceed ping_interval_ms ({})",
                self.idle_timeout_ms, self.ping_interval_ms
            )));
        }
        Ok(())
    }

    /// Address a server binds to.
    #[must_use]
    pub fn bind_address(&self) -> &str {
        if self.managed_hosting {
            "0.0.0.0"
        } else {
            &self.address
        }
    }

    /// Default RPC timeout.
    #[must_use]
    pub const fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Client connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Reliable link idle timeout.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Round-trip probe interval.
    #[must_use]
    pub const fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Tick interval.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

//! # Address Blacklist
//!
//! Blocked client addresses, stored as TOML:
//!
//! ```toml
//! addresses = ["203.0.113.7", "2001:db8::1"]
//! ```

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::NetResult;

#[derive(Debug, Default, Serialize, Deserialize)]
struct BlacklistFile {
    #[serde(default)]
    addresses: Vec<IpAddr>,
}

/// Set of blocked IP addresses.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Blacklist {
    addresses: BTreeSet<IpAddr>,
}

impl Blacklist {
    /// Creates an empty blacklist.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a blacklist file. A missing file yields an empty list.
    pub fn load(path: impl AsRef<Path>) -> NetResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No blacklist file, starting empty");
            return Ok(Self::default());
        }

        let file: BlacklistFile = toml::from_str(&std::fs::read_to_string(path)?)?;
        let blacklist = Self {
            addresses: file.addresses.into_iter().collect(),
        };
        tracing::info!(path = %path.display(), entries = blacklist.len(), "Loaded blacklist");
        Ok(blacklist)
    }

    /// Writes the blacklist to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> NetResult<()> {
        let file = BlacklistFile {
            addresses: self.addresses.iter().copied().collect(),
        };
        std::fs::write(path, toml::to_string_pretty(&file)?)?;
        Ok(())
    }

    /// Returns true if `address` is blocked.
    #[inline]
    #[must_use]
    pub fn contains(&self, address: IpAddr) -> bool {
        self.addresses.contains(&address)
    }

    /// Blocks `address`. Returns false if it was already blocked.
    pub fn insert(&mut self, address: IpAddr) -> bool {
        self.addresses.insert(address)
    }

    /// Unblocks `address`. Returns false if it was not blocked.
    pub fn remove(&mut self, address: IpAddr) -> bool {
        self.addresses.remove(&address)
    }

    /// Number of blocked addresses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// Returns true if nothing is blocked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Iterates blocked addresses in order.
    pub fn iter(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.addresses.iter().copied()
    }
}

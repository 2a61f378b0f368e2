//! Peer addressing.
//!
//! A radio address is opaque to the protocol: the platform hands one out with
//! every sighting and accepts it back when connecting. It is the only stable
//! identity a peer has; the advertised name is advisory.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Label shown for hosts that advertise without a name.
pub const UNNAMED_PEER: &str = "Board Host";

/// Label a host shows for a joiner whose radio reported no name.
pub const UNNAMED_JOINER: &str = "Unknown Device";

/// An opaque radio address (e.g. `"5C:F3:70:11:22:33"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerAddress(String);

impl PeerAddress {
    /// The address as the platform reported it.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(AddressParseError::Empty);
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(AddressParseError::Whitespace(s.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for PeerAddress {
    type Error = AddressParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl TryFrom<&str> for PeerAddress {
    type Error = AddressParseError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PeerAddress> for String {
    fn from(addr: PeerAddress) -> Self {
        addr.0
    }
}

/// Error parsing an address string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    #[error("peer address cannot be empty")]
    Empty,
    #[error("peer address cannot contain whitespace, got: {0:?}")]
    Whitespace(String),
}

/// A peer seen during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerHandle {
    /// Advertised name, if the advertisement carried one.
    pub display_name: Option<String>,
    pub address: PeerAddress,
}

impl PeerHandle {
    pub fn new(address: PeerAddress, display_name: Option<String>) -> Self {
        Self {
            display_name,
            address,
        }
    }

    /// Name to show a user; falls back to a generic label.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(UNNAMED_PEER)
    }
}

//! Async session subsystem for boardlink.
//!
//! A [`ConnectionManager`] owns one session at a time, as host or joiner,
//! over any [`Radio`]. State is observable through `watch` channels and a
//! broadcast stream of [`SessionEvent`]s.

mod config;
pub mod discovery;
pub mod handshake;
mod manager;
pub mod radio;
pub mod sim;

pub use boardlink_core::{
    ConnectionState, ErrorKind, PeerAddress, PeerHandle, Role, SessionError, SessionPayload,
};
pub use config::{ConfigError, SessionConfig};
pub use discovery::DiscoveryEngine;
pub use handshake::connect_and_fetch;
pub use manager::ConnectionManager;
pub use radio::{GattLink, Radio};

/// Notable things that happened in a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    PeerDiscovered(PeerHandle),
    /// The scan window elapsed; `peers` hosts were found.
    ScanFinished { peers: usize },
    /// Host side: a joiner received the whole board.
    JoinerAccepted(PeerHandle),
    /// Joiner side: the host's board, decoded.
    PayloadReceived(SessionPayload),
}

//! Core types for boardlink.
//!
//! Two nearby devices hand a game board from host to joiner over a
//! short-range radio. This crate holds the pure pieces of that protocol:
//! identifiers, the payload codec, chunk reassembly and the retry policy.
//! The async machinery lives in `boardlink-session`.

mod address;
pub mod chunk;
mod error;
pub mod ids;
mod payload;
pub mod retry;

pub use address::{AddressParseError, PeerAddress, PeerHandle, UNNAMED_JOINER, UNNAMED_PEER};
pub use error::{ErrorKind, RadioError, SessionError};
pub use ids::GattService;
pub use payload::{MIN_BOARD_IDS, SessionPayload};
pub use retry::{Classifier, RetryAttempt, RetryDecision, RetryPolicy};

/// Connection lifecycle state, shared by host and joiner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Nothing in flight.
    #[default]
    Disconnected,
    /// Hosting: GATT server open, advertising.
    Listening,
    /// Joining: scanning or holding scan results.
    Discovering,
    /// Joining: handshake with a chosen peer in progress.
    Connecting,
    /// Board delivered (host) or received (joiner).
    Connected,
    /// The last attempt failed; teardown returns to `Disconnected`.
    Error,
}

impl ConnectionState {
    /// `Connected` and `Error` end an attempt but not the manager.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Connected | Self::Error)
    }
}

/// Which side of the session a manager is playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Joiner,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connected_and_error_are_terminal() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        let terminal: Vec<_> = [
            ConnectionState::Disconnected,
            ConnectionState::Listening,
            ConnectionState::Discovering,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Error,
        ]
        .into_iter()
        .filter(ConnectionState::is_terminal)
        .collect();
        assert_eq!(
            terminal,
            vec![ConnectionState::Connected, ConnectionState::Error]
        );
    }
}

//! Error taxonomy.
//!
//! [`RadioError`] is what a platform radio reports. [`SessionError`] is what
//! crosses the session boundary; the mapping between the two lives in
//! [`crate::retry::Classifier`].

use std::time::Duration;

/// Coarse error class, for callers that branch on category only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TransportUnavailable,
    Transient,
    Permanent,
    Timeout,
    ConnectExhausted,
    BoardTooSmall,
    DecodeFailure,
    Cancelled,
}

/// Errors surfaced by the session subsystem.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Radio missing or switched off. The user has to fix this.
    #[error("radio unavailable: {0}")]
    TransportUnavailable(String),
    #[error("transient link failure: {0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("gave up after {attempts} attempts: {last}")]
    ConnectExhausted {
        attempts: u32,
        last: Box<SessionError>,
    },
    #[error("board has {0} ids, need at least 2")]
    BoardTooSmall(usize),
    #[error("could not decode board data: {0}")]
    DecodeFailure(String),
    /// Superseded by teardown or a newer command.
    #[error("operation cancelled")]
    Cancelled,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransportUnavailable(_) => ErrorKind::TransportUnavailable,
            Self::Transient(_) => ErrorKind::Transient,
            Self::Permanent(_) => ErrorKind::Permanent,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::ConnectExhausted { .. } => ErrorKind::ConnectExhausted,
            Self::BoardTooSmall(_) => ErrorKind::BoardTooSmall,
            Self::DecodeFailure(_) => ErrorKind::DecodeFailure,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether another connect attempt could succeed without outside help.
    ///
    /// A connect timeout counts toward retry exhaustion, so it is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }

    /// Bad game data rather than a failed connection.
    pub fn is_application(&self) -> bool {
        matches!(self, Self::BoardTooSmall(_) | Self::DecodeFailure(_))
    }
}

/// Errors reported by a platform radio.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RadioError {
    /// No adapter, adapter off, or the feature is unsupported.
    #[error("radio unavailable: {0}")]
    Unavailable(String),
    /// A raw platform status code (GATT status on the wire).
    #[error("radio status {0}")]
    Status(u16),
    #[error("link lost")]
    LinkLost,
    #[error("no such peer: {0}")]
    NotFound(String),
}

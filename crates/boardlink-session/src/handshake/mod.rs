//! Connect handshake, both sides.

pub mod host;
pub mod joiner;

use crate::config::SessionConfig;
use crate::radio::Radio;
use boardlink_core::{PeerHandle, RetryAttempt, RetryDecision, SessionError, SessionPayload};

pub use host::{HostConnState, HostHandshake, HostReaction};
pub use joiner::{JoinerEvent, JoinerHandshake, JoinerState, JoinerStep};

/// Fetch the board from `peer`, retrying transient failures with backoff.
///
/// Each attempt opens a fresh link. Returns after success, a failure that
/// is not worth retrying, or when the attempt budget is spent.
pub async fn connect_and_fetch(
    radio: &dyn Radio,
    peer: &PeerHandle,
    config: &SessionConfig,
) -> Result<SessionPayload, SessionError> {
    let policy = &config.retry;
    let classifier = config.classifier();
    let mut attempt = 1;
    let mut delay = policy.delay_before(attempt);
    tracing::debug!(
        address = %peer.address,
        max_attempts = policy.max_attempts,
        worst_case_ms = policy.worst_case().as_millis() as u64,
        "fetching board"
    );

    loop {
        tokio::time::sleep(delay).await;
        tracing::info!(address = %peer.address, attempt, "connecting");

        let outcome = joiner::attempt(
            radio,
            &peer.address,
            &classifier,
            config.max_payload_bytes,
            policy.attempt_timeout(),
        )
        .await;

        let last_error = match outcome {
            Ok(bytes) => {
                tracing::info!(address = %peer.address, attempt, bytes = bytes.len(), "board received");
                return SessionPayload::decode(&bytes);
            }
            Err(err) => err,
        };

        tracing::warn!(address = %peer.address, attempt, error = %last_error, "attempt failed");
        match policy.after_failure(RetryAttempt {
            attempt_number: attempt,
            last_error,
        }) {
            RetryDecision::Retry {
                attempt: next,
                after,
            } => {
                tracing::debug!(next, delay_ms = after.as_millis() as u64, "retrying");
                attempt = next;
                delay = after;
            }
            RetryDecision::GiveUp(err) => {
                tracing::warn!(address = %peer.address, error = %err, "giving up");
                return Err(err);
            }
        }
    }
}

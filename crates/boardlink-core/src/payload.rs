//! Board payload codec.
//!
//! The host exports its board as a compact JSON object
//! `{"board_ids":[..],"host_selection_id":7}` and the joiner decodes it after
//! the whole byte sequence has been reassembled.

use crate::SessionError;
use serde::{Deserialize, Deserializer, Serialize};

/// Smallest board a game can be played on.
pub const MIN_BOARD_IDS: usize = 2;

/// The board descriptor handed from host to joiner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPayload {
    /// Card ids in board order.
    pub board_ids: Vec<u32>,
    /// The host's secret pick, if it chose one.
    #[serde(
        default,
        deserialize_with = "selection_or_sentinel",
        skip_serializing_if = "Option::is_none"
    )]
    pub host_selection_id: Option<u32>,
}

impl SessionPayload {
    pub fn new(board_ids: Vec<u32>, host_selection_id: Option<u32>) -> Self {
        Self {
            board_ids,
            host_selection_id,
        }
    }

    /// Encode for transfer. Boards too small to play are refused here too,
    /// so a host never advertises something every joiner would reject.
    pub fn encode(&self) -> Result<Vec<u8>, SessionError> {
        self.validate()?;
        serde_json::to_vec(self).map_err(|e| SessionError::Permanent(format!("encode board: {e}")))
    }

    /// Decode a fully reassembled payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, SessionError> {
        let payload: Self = serde_json::from_slice(bytes)
            .map_err(|e| SessionError::DecodeFailure(e.to_string()))?;
        payload.validate()?;
        Ok(payload)
    }

    fn validate(&self) -> Result<(), SessionError> {
        if self.board_ids.len() < MIN_BOARD_IDS {
            return Err(SessionError::BoardTooSmall(self.board_ids.len()));
        }
        Ok(())
    }
}

// Older hosts sent -1 for "no selection"; zero is a real card id.
fn selection_or_sentinel<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<i64>::deserialize(deserializer)?;
    match raw {
        Some(id) if id >= 0 => u32::try_from(id)
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("selection id {id} out of range"))),
        _ => Ok(None),
    }
}

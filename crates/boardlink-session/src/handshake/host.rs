//! Host side of the handshake.
//!
//! The host serves one frozen board to at most one joiner. Each connection
//! must write the JOIN token before it may read; anything else written gets
//! a failure status and that connection is dropped, while advertising and
//! other connections carry on.
//!
//! The claim belongs to the joiner's address, not to a connection, so a
//! joiner whose link dropped mid-transfer can reconnect and read again.

use crate::radio::{ConnectionId, Radio, ServerEvent};
use boardlink_core::chunk::{completes, serve_slice};
use boardlink_core::ids::{
    BOARD_CHARACTERISTIC_UUID, GATT_FAILURE, GATT_READ_NOT_PERMITTED, GATT_SUCCESS,
    GATT_WRITE_NOT_PERMITTED, JOIN_TOKEN,
};
use boardlink_core::{PeerAddress, PeerHandle};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostConnState {
    AwaitingJoin,
    Serving,
    /// Served the last byte of the board.
    Delivered,
    Rejected,
}

/// Side effect the serve loop must carry out after answering a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostReaction {
    None,
    DropConnection(ConnectionId),
    /// Fires once per hosted session.
    Delivered(PeerHandle),
}

#[derive(Debug)]
struct Client {
    peer: PeerHandle,
    state: HostConnState,
}

#[derive(Debug)]
pub struct HostHandshake {
    board: Vec<u8>,
    frame_cap: usize,
    clients: HashMap<ConnectionId, Client>,
    /// Address that sent an accepted JOIN. Released if it leaves before
    /// delivery, kept forever after.
    claimed: Option<PeerAddress>,
    delivered: bool,
}

impl HostHandshake {
    /// `board` is the encoded payload; it never changes for this session.
    /// No read is answered with more than `frame_cap` bytes, whatever the
    /// link would allow.
    pub fn new(board: Vec<u8>, frame_cap: usize) -> Self {
        Self {
            board,
            frame_cap: frame_cap.max(1),
            clients: HashMap::new(),
            claimed: None,
            delivered: false,
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered
    }

    pub fn client_state(&self, conn: ConnectionId) -> Option<HostConnState> {
        self.clients.get(&conn).map(|c| c.state)
    }

    pub fn on_connected(&mut self, conn: ConnectionId, peer: PeerHandle) {
        tracing::info!(conn, address = %peer.address, "joiner connected");
        self.clients.insert(
            conn,
            Client {
                peer,
                state: HostConnState::AwaitingJoin,
            },
        );
    }

    /// Returns the GATT status to answer with.
    pub fn on_write(
        &mut self,
        conn: ConnectionId,
        characteristic: Uuid,
        value: &[u8],
    ) -> (u16, HostReaction) {
        if characteristic != BOARD_CHARACTERISTIC_UUID {
            return (GATT_WRITE_NOT_PERMITTED, HostReaction::None);
        }
        let Some(client) = self.clients.get_mut(&conn) else {
            return (GATT_FAILURE, HostReaction::DropConnection(conn));
        };
        let claimed_elsewhere = self
            .claimed
            .as_ref()
            .is_some_and(|owner| *owner != client.peer.address);

        if value != JOIN_TOKEN {
            tracing::warn!(conn, bytes = value.len(), "malformed join request, dropping connection");
            client.state = HostConnState::Rejected;
            return (GATT_FAILURE, HostReaction::DropConnection(conn));
        }
        if claimed_elsewhere {
            tracing::warn!(conn, "board already claimed, dropping connection");
            client.state = HostConnState::Rejected;
            return (GATT_FAILURE, HostReaction::DropConnection(conn));
        }
        match client.state {
            HostConnState::AwaitingJoin if self.delivered => {
                tracing::info!(conn, address = %client.peer.address, "joiner back after delivery");
                client.state = HostConnState::Delivered;
                (GATT_SUCCESS, HostReaction::None)
            }
            HostConnState::AwaitingJoin => {
                tracing::info!(conn, address = %client.peer.address, "join accepted");
                client.state = HostConnState::Serving;
                self.claimed = Some(client.peer.address.clone());
                (GATT_SUCCESS, HostReaction::None)
            }
            HostConnState::Serving | HostConnState::Delivered => (GATT_SUCCESS, HostReaction::None),
            HostConnState::Rejected => (GATT_FAILURE, HostReaction::DropConnection(conn)),
        }
    }

    /// Serve up to `max_len` bytes at `offset` (never more than the host's
    /// frame cap), or a GATT status refusing it.
    pub fn on_read(
        &mut self,
        conn: ConnectionId,
        characteristic: Uuid,
        offset: usize,
        max_len: usize,
    ) -> (Result<Vec<u8>, u16>, HostReaction) {
        if characteristic != BOARD_CHARACTERISTIC_UUID {
            return (Err(GATT_READ_NOT_PERMITTED), HostReaction::None);
        }
        let Some(client) = self.clients.get_mut(&conn) else {
            return (Err(GATT_READ_NOT_PERMITTED), HostReaction::None);
        };
        if !matches!(
            client.state,
            HostConnState::Serving | HostConnState::Delivered
        ) {
            tracing::debug!(conn, offset, "read before join refused");
            return (Err(GATT_READ_NOT_PERMITTED), HostReaction::None);
        }

        let chunk = serve_slice(&self.board, offset, max_len.min(self.frame_cap));
        tracing::debug!(conn, offset, bytes = chunk.len(), "served chunk");
        let reaction = if client.state == HostConnState::Serving
            && !self.delivered
            && completes(self.board.len(), offset, chunk.len())
        {
            client.state = HostConnState::Delivered;
            self.delivered = true;
            tracing::info!(conn, address = %client.peer.address, bytes = self.board.len(), "board delivered");
            HostReaction::Delivered(client.peer.clone())
        } else {
            HostReaction::None
        };
        (Ok(chunk.to_vec()), reaction)
    }

    pub fn on_disconnected(&mut self, conn: ConnectionId) {
        let Some(gone) = self.clients.remove(&conn) else {
            return;
        };
        tracing::debug!(conn, "joiner disconnected");
        if self.delivered || self.claimed.as_ref() != Some(&gone.peer.address) {
            return;
        }
        let still_serving = self
            .clients
            .values()
            .any(|c| c.peer.address == gone.peer.address && c.state == HostConnState::Serving);
        if !still_serving {
            tracing::debug!(address = %gone.peer.address, "claim released");
            self.claimed = None;
        }
    }
}

/// Answer server traffic until the server closes. `delivered` fires with
/// the joiner that received the whole board.
pub async fn serve(
    mut events: mpsc::UnboundedReceiver<ServerEvent>,
    mut machine: HostHandshake,
    radio: Arc<dyn Radio>,
    delivered: oneshot::Sender<PeerHandle>,
) {
    let mut delivered = Some(delivered);
    while let Some(event) = events.recv().await {
        let reaction = match event {
            ServerEvent::Connected { conn, peer } => {
                machine.on_connected(conn, peer);
                HostReaction::None
            }
            ServerEvent::Write {
                conn,
                characteristic,
                value,
                reply,
            } => {
                let (status, reaction) = machine.on_write(conn, characteristic, &value);
                let _ = reply.send(status);
                reaction
            }
            ServerEvent::Read {
                conn,
                characteristic,
                offset,
                max_len,
                reply,
            } => {
                let (response, reaction) = machine.on_read(conn, characteristic, offset, max_len);
                let _ = reply.send(response);
                reaction
            }
            ServerEvent::Disconnected { conn } => {
                machine.on_disconnected(conn);
                HostReaction::None
            }
        };

        match reaction {
            HostReaction::None => {}
            HostReaction::DropConnection(conn) => {
                radio.drop_connection(conn).await;
                machine.on_disconnected(conn);
            }
            HostReaction::Delivered(peer) => {
                if let Some(tx) = delivered.take() {
                    let _ = tx.send(peer);
                }
            }
        }
    }
    tracing::debug!(delivered = machine.is_delivered(), "gatt server closed");
}

//! Radio abstraction.
//!
//! Platform stacks deliver advertising, scan results and GATT traffic as
//! callbacks on their own threads. Implementations of [`Radio`] turn those
//! into channels: a scan is a stream of [`Sighting`]s, a GATT server is a
//! stream of [`ServerEvent`]s whose requests carry a one-shot reply.

use async_trait::async_trait;
use boardlink_core::{GattService, PeerAddress, PeerHandle, RadioError};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Server-side handle for one connected client.
pub type ConnectionId = u64;

/// What a host broadcasts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub service: Uuid,
    /// Included in the packet where the platform has room for it.
    pub local_name: Option<String>,
    pub connectable: bool,
}

/// One received advertisement packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    pub peer: PeerHandle,
    /// Service UUIDs listed in the packet.
    pub services: Vec<Uuid>,
    pub rssi: i16,
}

/// Traffic arriving at an open GATT server.
#[derive(Debug)]
pub enum ServerEvent {
    Connected {
        conn: ConnectionId,
        peer: PeerHandle,
    },
    Write {
        conn: ConnectionId,
        characteristic: Uuid,
        value: Vec<u8>,
        /// GATT status for the write response.
        reply: oneshot::Sender<u16>,
    },
    Read {
        conn: ConnectionId,
        characteristic: Uuid,
        offset: usize,
        /// Most bytes the link can carry in one read response.
        max_len: usize,
        reply: oneshot::Sender<Result<Vec<u8>, u16>>,
    },
    Disconnected {
        conn: ConnectionId,
    },
}

/// A device's short-range radio.
#[async_trait]
pub trait Radio: Send + Sync {
    /// Adapter present and powered.
    fn is_available(&self) -> bool;

    async fn start_advertising(&self, advert: Advertisement) -> Result<(), RadioError>;

    /// Idempotent.
    async fn stop_advertising(&self);

    /// Start a scan. Platforms may or may not honor `service` as a filter.
    async fn start_scan(
        &self,
        service: Uuid,
    ) -> Result<mpsc::UnboundedReceiver<Sighting>, RadioError>;

    /// Idempotent. Closes the sighting stream.
    async fn stop_scan(&self);

    async fn open_gatt_server(
        &self,
        service: GattService,
    ) -> Result<mpsc::UnboundedReceiver<ServerEvent>, RadioError>;

    /// Idempotent. Drops every client connected to the server.
    async fn close_gatt_server(&self);

    /// Server side: disconnect one client.
    async fn drop_connection(&self, conn: ConnectionId);

    /// Client side: open a link to a peer. Each call yields a fresh link.
    async fn connect(&self, address: &PeerAddress) -> Result<Box<dyn GattLink>, RadioError>;
}

/// Client side of one connected link.
///
/// Dropping a link must release it; [`GattLink::disconnect`] does so
/// explicitly and is idempotent.
#[async_trait]
pub trait GattLink: Send {
    fn peer(&self) -> &PeerAddress;

    /// Negotiated bytes per read.
    fn frame_cap(&self) -> usize;

    async fn discover_services(&mut self) -> Result<Vec<GattService>, RadioError>;

    async fn write(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), RadioError>;

    async fn read(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        offset: usize,
    ) -> Result<Vec<u8>, RadioError>;

    async fn disconnect(&mut self);
}

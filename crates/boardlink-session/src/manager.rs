//! The connection manager.
//!
//! One manager owns one session at a time. Commands are serialized through
//! a single slot lock; starting anything first releases whatever the
//! previous session held. Every release bumps a generation counter, and
//! results are only published under the slot lock when their generation is
//! still current, so nothing from a released session leaks out after the
//! releasing call returns.

use crate::SessionEvent;
use crate::config::{ConfigError, SessionConfig};
use crate::discovery::DiscoveryEngine;
use crate::handshake::{self, host};
use crate::radio::Radio;
use boardlink_core::ids::SERVICE_UUID;
use boardlink_core::{
    ConnectionState, GattService, PeerHandle, RadioError, Role, SessionError, SessionPayload,
    UNNAMED_JOINER,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, MutexGuard, broadcast, oneshot, watch};
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 64;

/// Host/joiner facade over discovery and the handshake.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    radio: Arc<dyn Radio>,
    config: SessionConfig,
    discovery: DiscoveryEngine,
    state: watch::Sender<ConnectionState>,
    role: watch::Sender<Option<Role>>,
    connected_peer: watch::Sender<Option<PeerHandle>>,
    last_error: watch::Sender<Option<SessionError>>,
    events: broadcast::Sender<SessionEvent>,
    generation: AtomicU64,
    slot: Mutex<Slot>,
}

/// Resources held by the current session.
#[derive(Default)]
struct Slot {
    host_task: Option<JoinHandle<()>>,
    connect: Option<PendingConnect>,
}

/// Handle on an in-flight `connect_to`.
struct PendingConnect {
    cancel: oneshot::Sender<()>,
    /// Resolves once the connect has dropped its link.
    released: oneshot::Receiver<()>,
}

impl ConnectionManager {
    pub fn new(radio: Arc<dyn Radio>, config: SessionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let discovery = DiscoveryEngine::new(Arc::clone(&radio), SERVICE_UUID, events.clone());
        Ok(Self {
            inner: Arc::new(Inner {
                radio,
                config,
                discovery,
                state: watch::Sender::new(ConnectionState::Disconnected),
                role: watch::Sender::new(None),
                connected_peer: watch::Sender::new(None),
                last_error: watch::Sender::new(None),
                events,
                generation: AtomicU64::new(0),
                slot: Mutex::new(Slot::default()),
            }),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    // Observers

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn role(&self) -> Option<Role> {
        *self.inner.role.borrow()
    }

    pub fn discovered_peers(&self) -> Vec<PeerHandle> {
        self.inner.discovery.peers()
    }

    pub fn watch_peers(&self) -> watch::Receiver<Vec<PeerHandle>> {
        self.inner.discovery.watch_peers()
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.discovery.is_scanning()
    }

    pub async fn is_advertising(&self) -> bool {
        self.inner.discovery.is_advertising().await
    }

    /// The other side of a completed session: the host we joined, or the
    /// joiner we delivered to.
    pub fn connected_peer(&self) -> Option<PeerHandle> {
        self.inner.connected_peer.borrow().clone()
    }

    /// Display name for [`Self::connected_peer`].
    pub fn connected_peer_name(&self) -> Option<String> {
        let peer = self.connected_peer()?;
        Some(match (self.role(), &peer.display_name) {
            (_, Some(name)) => name.clone(),
            (Some(Role::Host), None) => UNNAMED_JOINER.to_string(),
            (_, None) => peer.label().to_string(),
        })
    }

    pub fn last_error(&self) -> Option<SessionError> {
        self.inner.last_error.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_radio_available(&self) -> bool {
        self.inner.radio.is_available()
    }

    // Commands

    /// Freeze `payload`, open the board service and advertise it.
    ///
    /// Advertising is best effort: if it fails the manager still listens, so
    /// a joiner that knows this device's address can connect.
    pub async fn start_hosting(&self, payload: SessionPayload) -> Result<(), SessionError> {
        let board = payload.encode()?;
        let bytes = board.len();
        let inner = &self.inner;
        let mut slot = inner.slot.lock().await;
        inner.release(&mut slot).await;
        let generation = inner.generation.load(Ordering::SeqCst);
        inner.begin(Role::Host);

        let server_events = match inner
            .radio
            .open_gatt_server(GattService::board_service())
            .await
        {
            Ok(events) => events,
            Err(e) => {
                tracing::error!(error = %e, "could not open board service");
                let err = match e {
                    RadioError::Unavailable(msg) => SessionError::TransportUnavailable(msg),
                    other => SessionError::Permanent(format!("board service: {other}")),
                };
                inner.fail(err.clone());
                return Err(err);
            }
        };

        let (delivered_tx, delivered_rx) = oneshot::channel();
        let serving = host::serve(
            server_events,
            host::HostHandshake::new(board, inner.config.frame_cap),
            Arc::clone(&inner.radio),
            delivered_tx,
        );
        let weak = Arc::downgrade(&self.inner);
        slot.host_task = Some(tokio::spawn(async move {
            let accepted = async move {
                if let Ok(peer) = delivered_rx.await {
                    joiner_accepted(weak, generation, peer).await;
                }
            };
            tokio::join!(serving, accepted);
        }));

        inner.set_state(ConnectionState::Listening);
        tracing::info!(bytes, ids = payload.board_ids.len(), "hosting board");
        let _ = inner
            .discovery
            .start_advertising(inner.config.device_name.clone())
            .await;
        Ok(())
    }

    /// Stop advertising and close the board service. No-op unless hosting.
    pub async fn stop_hosting(&self) {
        let inner = &self.inner;
        let mut slot = inner.slot.lock().await;
        if inner.role() != Some(Role::Host) {
            return;
        }
        inner.release(&mut slot).await;
        inner.set_state(ConnectionState::Disconnected);
    }

    /// Scan for hosts for the configured window. Returns once the scan runs.
    pub async fn start_joining(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        let mut slot = inner.slot.lock().await;
        inner.release(&mut slot).await;
        inner.begin(Role::Joiner);

        match inner
            .discovery
            .start_scanning(inner.config.scan_window())
            .await
        {
            Ok(()) => {
                inner.set_state(ConnectionState::Discovering);
                Ok(())
            }
            Err(err) => {
                inner.fail(err.clone());
                Err(err)
            }
        }
    }

    /// Stop the scan early. The peers found so far stay available for
    /// [`Self::connect_to`].
    pub async fn stop_joining(&self) {
        let inner = &self.inner;
        let _slot = inner.slot.lock().await;
        if inner.role() == Some(Role::Joiner) {
            inner.discovery.stop_scanning().await;
        }
    }

    /// Connect to `peer` and fetch its board.
    ///
    /// Resolves once the board is received, a non-retryable failure occurs,
    /// or the retry budget is spent. A teardown or newer command while this
    /// runs makes it return [`SessionError::Cancelled`] without touching the
    /// manager's state.
    pub async fn connect_to(&self, peer: &PeerHandle) -> Result<SessionPayload, SessionError> {
        let inner = &self.inner;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (released_tx, released_rx) = oneshot::channel();

        let generation = {
            let mut slot = inner.slot.lock().await;
            if inner.role() == Some(Role::Host) {
                return Err(SessionError::Permanent(
                    "cannot join while hosting".into(),
                ));
            }
            if let Some(previous) = slot.connect.take() {
                previous.cancel_and_wait().await;
            }
            inner.discovery.stop_scanning().await;
            let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            inner.begin(Role::Joiner);
            slot.connect = Some(PendingConnect {
                cancel: cancel_tx,
                released: released_rx,
            });
            inner.set_state(ConnectionState::Connecting);
            generation
        };

        let result = tokio::select! {
            result = handshake::connect_and_fetch(inner.radio.as_ref(), peer, &inner.config) => result,
            _ = cancel_rx => Err(SessionError::Cancelled),
        };
        let _ = released_tx.send(());

        let mut slot = inner.slot.lock().await;
        if inner.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(address = %peer.address, "connect superseded");
            return Err(SessionError::Cancelled);
        }
        slot.connect = None;
        match result {
            Ok(payload) => {
                tracing::info!(address = %peer.address, name = peer.label(), "joined session");
                inner.connected_peer.send_replace(Some(peer.clone()));
                inner.set_state(ConnectionState::Connected);
                let _ = inner
                    .events
                    .send(SessionEvent::PayloadReceived(payload.clone()));
                Ok(payload)
            }
            Err(err) => {
                inner.fail(err.clone());
                Err(err)
            }
        }
    }

    /// Release everything and return to `Disconnected`. Safe from any state.
    pub async fn teardown(&self) {
        let inner = &self.inner;
        let mut slot = inner.slot.lock().await;
        inner.release(&mut slot).await;
        inner.set_state(ConnectionState::Disconnected);
        tracing::info!("session torn down");
    }
}

async fn joiner_accepted(inner: Weak<Inner>, generation: u64, peer: PeerHandle) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let _slot = inner.slot.lock().await;
    if inner.generation.load(Ordering::SeqCst) != generation {
        return;
    }
    inner.discovery.stop_advertising().await;
    inner.connected_peer.send_replace(Some(peer.clone()));
    inner.set_state(ConnectionState::Connected);
    let _ = inner.events.send(SessionEvent::JoinerAccepted(peer));
}

impl Inner {
    fn role(&self) -> Option<Role> {
        *self.role.borrow()
    }

    /// Fresh session for `role`.
    fn begin(&self, role: Role) {
        self.role.send_replace(Some(role));
        self.connected_peer.send_replace(None);
        self.last_error.send_replace(None);
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            tracing::info!(state = ?next, "state changed");
            let _ = self.events.send(SessionEvent::StateChanged(next));
        }
    }

    fn fail(&self, err: SessionError) {
        tracing::warn!(error = %err, kind = ?err.kind(), "session failed");
        self.last_error.send_replace(Some(err));
        self.set_state(ConnectionState::Error);
    }

    /// Release everything the current session holds. Caller holds the slot.
    async fn release(&self, slot: &mut MutexGuard<'_, Slot>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(pending) = slot.connect.take() {
            pending.cancel_and_wait().await;
        }
        if let Some(task) = slot.host_task.take() {
            task.abort();
            let _ = task.await;
        }
        self.discovery.stop_scanning().await;
        self.discovery.stop_advertising().await;
        if self.role() == Some(Role::Host) {
            self.radio.close_gatt_server().await;
        }
        self.role.send_replace(None);
        self.connected_peer.send_replace(None);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.slot.get_mut().host_task.take() {
            task.abort();
        }
    }
}

impl PendingConnect {
    async fn cancel_and_wait(self) {
        let _ = self.cancel.send(());
        let _ = self.released.await;
    }
}

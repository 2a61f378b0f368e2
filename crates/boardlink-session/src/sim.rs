//! In-memory radio medium for tests and demos.
//!
//! An [`Ether`] is a shared room; every [`SimRadio`] attached to it can
//! advertise, scan, host a GATT server and connect to other nodes. Advertisers
//! are re-announced every interval while a scan runs, so scanners see the same
//! peer many times the way real ones do. Connect attempts can be scripted to
//! fail, stall or drop.

use crate::radio::{Advertisement, ConnectionId, GattLink, Radio, ServerEvent, Sighting};
use async_trait::async_trait;
use boardlink_core::ids::{GATT_REQUEST_NOT_SUPPORTED, GATT_SUCCESS};
use boardlink_core::{GattService, PeerAddress, PeerHandle, RadioError};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

const DEFAULT_FRAME_CAP: usize = 20;
const DEFAULT_ADVERT_INTERVAL: Duration = Duration::from_millis(100);
const SIM_RSSI: i16 = -58;

/// Scripted outcome for one connect attempt against a target.
#[derive(Debug, Clone)]
pub enum ConnectFault {
    Fail(RadioError),
    /// Never completes; only a deadline gets the caller out.
    Stall,
    /// Connects, then the link is gone before the first request.
    DropAfterConnect,
}

/// Shared simulated medium.
#[derive(Clone)]
pub struct Ether {
    medium: Arc<Mutex<Medium>>,
    advert_interval: Duration,
}

#[derive(Default)]
struct Medium {
    nodes: HashMap<PeerAddress, Node>,
    links: HashMap<ConnectionId, Link>,
    next_conn: ConnectionId,
    next_scan: u64,
    connect_attempts: HashMap<PeerAddress, u32>,
    faults: HashMap<PeerAddress, VecDeque<ConnectFault>>,
}

struct Node {
    name: Option<String>,
    powered: bool,
    can_advertise: bool,
    frame_cap: usize,
    advert: Option<Advertisement>,
    scan: Option<Scan>,
    server: Option<Server>,
}

struct Scan {
    id: u64,
    tx: mpsc::UnboundedSender<Sighting>,
}

struct Server {
    service: GattService,
    events: mpsc::UnboundedSender<ServerEvent>,
}

struct Link {
    host: PeerAddress,
}

impl Default for Ether {
    fn default() -> Self {
        Self::new()
    }
}

impl Ether {
    pub fn new() -> Self {
        Self::with_advert_interval(DEFAULT_ADVERT_INTERVAL)
    }

    pub fn with_advert_interval(advert_interval: Duration) -> Self {
        Self {
            medium: Arc::new(Mutex::new(Medium::default())),
            advert_interval,
        }
    }

    fn medium(&self) -> MutexGuard<'_, Medium> {
        self.medium.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put a powered radio into the room.
    pub fn attach(&self, address: PeerAddress, name: Option<String>) -> SimRadio {
        self.medium().nodes.insert(
            address.clone(),
            Node {
                name,
                powered: true,
                can_advertise: true,
                frame_cap: DEFAULT_FRAME_CAP,
                advert: None,
                scan: None,
                server: None,
            },
        );
        SimRadio {
            ether: self.clone(),
            address,
        }
    }

    /// Largest read this node accepts; links use the smaller of both ends.
    pub fn set_frame_cap(&self, address: &PeerAddress, frame_cap: usize) {
        if let Some(node) = self.medium().nodes.get_mut(address) {
            node.frame_cap = frame_cap.max(1);
        }
    }

    /// Switching a radio off drops everything it held.
    pub fn set_powered(&self, address: &PeerAddress, powered: bool) {
        let mut m = self.medium();
        if let Some(node) = m.nodes.get_mut(address) {
            node.powered = powered;
            if !powered {
                node.advert = None;
                node.scan = None;
                node.server = None;
                m.links.retain(|_, link| &link.host != address);
            }
        }
    }

    /// Make advertising fail on this node while leaving the rest working.
    pub fn disable_advertising(&self, address: &PeerAddress) {
        if let Some(node) = self.medium().nodes.get_mut(address) {
            node.can_advertise = false;
        }
    }

    /// Queue outcomes for the next connect attempts that target `target`.
    pub fn inject_connect_faults(
        &self,
        target: &PeerAddress,
        faults: impl IntoIterator<Item = ConnectFault>,
    ) {
        self.medium()
            .faults
            .entry(target.clone())
            .or_default()
            .extend(faults);
    }

    /// Connect attempts made against `target` so far.
    pub fn connect_attempts(&self, target: &PeerAddress) -> u32 {
        self.medium()
            .connect_attempts
            .get(target)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_scanning(&self, address: &PeerAddress) -> bool {
        self.medium()
            .nodes
            .get(address)
            .is_some_and(|n| n.scan.is_some())
    }

    pub fn is_advertising(&self, address: &PeerAddress) -> bool {
        self.medium()
            .nodes
            .get(address)
            .is_some_and(|n| n.advert.is_some())
    }

    pub fn has_gatt_server(&self, address: &PeerAddress) -> bool {
        self.medium()
            .nodes
            .get(address)
            .is_some_and(|n| n.server.is_some())
    }

    /// Links currently held open between any two nodes.
    pub fn open_links(&self) -> usize {
        self.medium().links.len()
    }

    fn link_alive(&self, conn: ConnectionId) -> bool {
        self.medium().links.contains_key(&conn)
    }

    fn remove_link(&self, conn: ConnectionId) -> bool {
        self.medium().links.remove(&conn).is_some()
    }

    /// Deliver every current advertisement to one scanner. Returns false once
    /// that scan is over.
    fn announce(&self, scanner: &PeerAddress, scan_id: u64) -> bool {
        let m = self.medium();
        let Some(scan) = m.nodes.get(scanner).and_then(|n| n.scan.as_ref()) else {
            return false;
        };
        if scan.id != scan_id || scan.tx.is_closed() {
            return false;
        }
        for (address, node) in &m.nodes {
            if address == scanner || !node.powered {
                continue;
            }
            if let Some(advert) = &node.advert {
                let _ = scan.tx.send(Sighting {
                    peer: PeerHandle::new(address.clone(), advert.local_name.clone()),
                    services: vec![advert.service],
                    rssi: SIM_RSSI,
                });
            }
        }
        true
    }
}

/// One node's radio.
#[derive(Clone)]
pub struct SimRadio {
    ether: Ether,
    address: PeerAddress,
}

impl SimRadio {
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    fn unavailable() -> RadioError {
        RadioError::Unavailable("adapter powered off".into())
    }
}

enum Dial {
    Stall,
    Link(SimLink),
}

#[async_trait]
impl Radio for SimRadio {
    fn is_available(&self) -> bool {
        self.ether
            .medium()
            .nodes
            .get(&self.address)
            .is_some_and(|n| n.powered)
    }

    async fn start_advertising(&self, advert: Advertisement) -> Result<(), RadioError> {
        let mut m = self.ether.medium();
        let node = m
            .nodes
            .get_mut(&self.address)
            .filter(|n| n.powered)
            .ok_or_else(Self::unavailable)?;
        if !node.can_advertise {
            return Err(RadioError::Status(GATT_REQUEST_NOT_SUPPORTED));
        }
        node.advert = Some(advert);
        Ok(())
    }

    async fn stop_advertising(&self) {
        if let Some(node) = self.ether.medium().nodes.get_mut(&self.address) {
            node.advert = None;
        }
    }

    async fn start_scan(
        &self,
        _service: Uuid,
    ) -> Result<mpsc::UnboundedReceiver<Sighting>, RadioError> {
        let (rx, scan_id) = {
            let mut m = self.ether.medium();
            m.next_scan += 1;
            let scan_id = m.next_scan;
            let node = m
                .nodes
                .get_mut(&self.address)
                .filter(|n| n.powered)
                .ok_or_else(Self::unavailable)?;
            let (tx, rx) = mpsc::unbounded_channel();
            node.scan = Some(Scan { id: scan_id, tx });
            (rx, scan_id)
        };

        let ether = self.ether.clone();
        let scanner = self.address.clone();
        tokio::spawn(async move {
            while ether.announce(&scanner, scan_id) {
                tokio::time::sleep(ether.advert_interval).await;
            }
        });
        Ok(rx)
    }

    async fn stop_scan(&self) {
        if let Some(node) = self.ether.medium().nodes.get_mut(&self.address) {
            node.scan = None;
        }
    }

    async fn open_gatt_server(
        &self,
        service: GattService,
    ) -> Result<mpsc::UnboundedReceiver<ServerEvent>, RadioError> {
        let mut m = self.ether.medium();
        let node = m
            .nodes
            .get_mut(&self.address)
            .filter(|n| n.powered)
            .ok_or_else(Self::unavailable)?;
        let (events, rx) = mpsc::unbounded_channel();
        node.server = Some(Server { service, events });
        Ok(rx)
    }

    async fn close_gatt_server(&self) {
        let mut m = self.ether.medium();
        if let Some(node) = m.nodes.get_mut(&self.address) {
            node.server = None;
        }
        m.links.retain(|_, link| link.host != self.address);
    }

    async fn drop_connection(&self, conn: ConnectionId) {
        let mut m = self.ether.medium();
        if m.links.get(&conn).is_some_and(|l| l.host == self.address) {
            m.links.remove(&conn);
        }
    }

    async fn connect(&self, address: &PeerAddress) -> Result<Box<dyn GattLink>, RadioError> {
        let dial = {
            let mut m = self.ether.medium();
            let (client_name, client_cap) = match m.nodes.get(&self.address) {
                Some(node) if node.powered => (node.name.clone(), node.frame_cap),
                _ => return Err(Self::unavailable()),
            };
            *m.connect_attempts.entry(address.clone()).or_default() += 1;
            m.next_conn += 1;
            let conn = m.next_conn;

            let fault = m.faults.get_mut(address).and_then(VecDeque::pop_front);
            match fault {
                Some(ConnectFault::Fail(err)) => return Err(err),
                Some(ConnectFault::Stall) => Dial::Stall,
                Some(ConnectFault::DropAfterConnect) => {
                    let (events, _) = mpsc::unbounded_channel();
                    Dial::Link(SimLink {
                        ether: self.ether.clone(),
                        conn,
                        peer: address.clone(),
                        frame_cap: client_cap,
                        service: GattService::board_service(),
                        events,
                        open: true,
                    })
                }
                None => {
                    let (server, host_cap) = match m.nodes.get(address) {
                        Some(Node {
                            powered: true,
                            server: Some(server),
                            frame_cap,
                            ..
                        }) => (
                            (server.service.clone(), server.events.clone()),
                            *frame_cap,
                        ),
                        _ => return Err(RadioError::NotFound(address.to_string())),
                    };
                    let (service, events) = server;
                    events
                        .send(ServerEvent::Connected {
                            conn,
                            peer: PeerHandle::new(self.address.clone(), client_name),
                        })
                        .map_err(|_| RadioError::LinkLost)?;
                    m.links.insert(
                        conn,
                        Link {
                            host: address.clone(),
                        },
                    );
                    Dial::Link(SimLink {
                        ether: self.ether.clone(),
                        conn,
                        peer: address.clone(),
                        frame_cap: client_cap.min(host_cap),
                        service,
                        events,
                        open: true,
                    })
                }
            }
        };

        match dial {
            Dial::Stall => std::future::pending().await,
            Dial::Link(link) => {
                let link: Box<dyn GattLink> = Box::new(link);
                Ok(link)
            }
        }
    }
}

/// Client end of a simulated link.
pub struct SimLink {
    ether: Ether,
    conn: ConnectionId,
    peer: PeerAddress,
    frame_cap: usize,
    service: GattService,
    events: mpsc::UnboundedSender<ServerEvent>,
    open: bool,
}

impl SimLink {
    fn ensure_open(&self) -> Result<(), RadioError> {
        if self.open && self.ether.link_alive(self.conn) {
            Ok(())
        } else {
            Err(RadioError::LinkLost)
        }
    }

    fn ensure_exposed(&self, service: Uuid, characteristic: Uuid) -> Result<(), RadioError> {
        if service == self.service.uuid && self.service.has_characteristic(characteristic) {
            Ok(())
        } else {
            Err(RadioError::Status(GATT_REQUEST_NOT_SUPPORTED))
        }
    }

    fn release(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if self.ether.remove_link(self.conn) {
            let _ = self
                .events
                .send(ServerEvent::Disconnected { conn: self.conn });
        }
    }
}

impl Drop for SimLink {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl GattLink for SimLink {
    fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    fn frame_cap(&self) -> usize {
        self.frame_cap
    }

    async fn discover_services(&mut self) -> Result<Vec<GattService>, RadioError> {
        self.ensure_open()?;
        Ok(vec![self.service.clone()])
    }

    async fn write(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), RadioError> {
        self.ensure_open()?;
        self.ensure_exposed(service, characteristic)?;
        let (reply, status) = oneshot::channel();
        self.events
            .send(ServerEvent::Write {
                conn: self.conn,
                characteristic,
                value: value.to_vec(),
                reply,
            })
            .map_err(|_| RadioError::LinkLost)?;
        match status.await {
            Ok(GATT_SUCCESS) => Ok(()),
            Ok(code) => Err(RadioError::Status(code)),
            Err(_) => Err(RadioError::LinkLost),
        }
    }

    async fn read(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        offset: usize,
    ) -> Result<Vec<u8>, RadioError> {
        self.ensure_open()?;
        self.ensure_exposed(service, characteristic)?;
        let (reply, response) = oneshot::channel();
        self.events
            .send(ServerEvent::Read {
                conn: self.conn,
                characteristic,
                offset,
                max_len: self.frame_cap,
                reply,
            })
            .map_err(|_| RadioError::LinkLost)?;
        match response.await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(code)) => Err(RadioError::Status(code)),
            Err(_) => Err(RadioError::LinkLost),
        }
    }

    async fn disconnect(&mut self) {
        self.release();
    }
}

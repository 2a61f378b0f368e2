//! Advertising and scanning.
//!
//! A host makes itself findable by advertising the board service; a joiner
//! scans for it. Scans always end on their own once the window elapses.

use crate::SessionEvent;
use crate::radio::{Advertisement, Radio, Sighting};
use boardlink_core::{PeerHandle, RadioError, SessionError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

struct Shared {
    peers: watch::Sender<Vec<PeerHandle>>,
    scanning: watch::Sender<bool>,
    /// Bumped whenever a scan is started or stopped; results from an older
    /// epoch are dropped.
    epoch: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
}

impl Shared {
    /// Record a sighting. Returns true if it was a new peer.
    fn record(&self, epoch: u64, service: Uuid, sighting: Sighting) -> bool {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return false;
        }
        if !sighting.services.contains(&service) {
            tracing::trace!(address = %sighting.peer.address, "ignoring foreign advertisement");
            return false;
        }
        let peer = sighting.peer;
        let added = self.peers.send_if_modified(|peers| {
            if peers.iter().any(|p| p.address == peer.address) {
                false
            } else {
                peers.push(peer.clone());
                true
            }
        });
        if added {
            tracing::info!(
                address = %peer.address,
                name = peer.label(),
                rssi = sighting.rssi,
                "found board host"
            );
            let _ = self.events.send(SessionEvent::PeerDiscovered(peer));
        }
        added
    }
}

/// Finds hosts (joiner side) or makes this device findable (host side).
pub struct DiscoveryEngine {
    radio: Arc<dyn Radio>,
    service: Uuid,
    shared: Arc<Shared>,
    advertising: Mutex<bool>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryEngine {
    pub fn new(
        radio: Arc<dyn Radio>,
        service: Uuid,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            radio,
            service,
            shared: Arc::new(Shared {
                peers: watch::Sender::new(Vec::new()),
                scanning: watch::Sender::new(false),
                epoch: AtomicU64::new(0),
                events,
            }),
            advertising: Mutex::new(false),
            scan_task: Mutex::new(None),
        }
    }

    /// Peers seen in the current (or last) scan, in first-seen order.
    pub fn peers(&self) -> Vec<PeerHandle> {
        self.shared.peers.borrow().clone()
    }

    pub fn watch_peers(&self) -> watch::Receiver<Vec<PeerHandle>> {
        self.shared.peers.subscribe()
    }

    pub fn is_scanning(&self) -> bool {
        *self.shared.scanning.borrow()
    }

    pub fn watch_scanning(&self) -> watch::Receiver<bool> {
        self.shared.scanning.subscribe()
    }

    pub async fn is_advertising(&self) -> bool {
        *self.advertising.lock().await
    }

    /// Start broadcasting the board service. Best effort: a failure is
    /// logged and returned but leaves nothing half-started, and a joiner that
    /// already knows our address can still connect. No-op while advertising.
    pub async fn start_advertising(&self, self_name: Option<String>) -> Result<(), SessionError> {
        let mut advertising = self.advertising.lock().await;
        if *advertising {
            return Ok(());
        }
        let advert = Advertisement {
            service: self.service,
            local_name: self_name,
            connectable: true,
        };
        match self.radio.start_advertising(advert).await {
            Ok(()) => {
                *advertising = true;
                tracing::info!(service = %self.service, "advertising started");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "advertising failed to start");
                Err(match e {
                    RadioError::Unavailable(msg) => SessionError::TransportUnavailable(msg),
                    other => SessionError::Permanent(format!("advertising: {other}")),
                })
            }
        }
    }

    /// Idempotent.
    pub async fn stop_advertising(&self) {
        let mut advertising = self.advertising.lock().await;
        if *advertising {
            self.radio.stop_advertising().await;
            *advertising = false;
            tracing::info!("advertising stopped");
        }
    }

    /// Clear the peer list and scan for `window`. Returns once the scan is
    /// running; it stops by itself when the window elapses.
    pub async fn start_scanning(&self, window: Duration) -> Result<(), SessionError> {
        self.stop_scanning().await;
        self.shared.peers.send_replace(Vec::new());

        let sightings = self.radio.start_scan(self.service).await.map_err(|e| {
            tracing::error!(error = %e, "could not start scan");
            SessionError::TransportUnavailable(e.to_string())
        })?;

        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.scanning.send_replace(true);
        tracing::info!(window_ms = window.as_millis() as u64, "scan started");

        let task = tokio::spawn(run_scan(
            Arc::clone(&self.shared),
            Arc::clone(&self.radio),
            self.service,
            sightings,
            window,
            epoch,
        ));
        *self.scan_task.lock().await = Some(task);
        Ok(())
    }

    /// Cancel the window and any running scan. Idempotent; once this returns
    /// no further peers are recorded.
    pub async fn stop_scanning(&self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.scan_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        if self.shared.scanning.send_replace(false) {
            self.radio.stop_scan().await;
            tracing::info!("scan stopped");
        }
    }
}

async fn run_scan(
    shared: Arc<Shared>,
    radio: Arc<dyn Radio>,
    service: Uuid,
    mut sightings: mpsc::UnboundedReceiver<Sighting>,
    window: Duration,
    epoch: u64,
) {
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                tracing::info!("scan window elapsed");
                break;
            }
            sighting = sightings.recv() => match sighting {
                Some(sighting) => {
                    shared.record(epoch, service, sighting);
                }
                None => {
                    tracing::warn!("radio ended the scan early");
                    break;
                }
            }
        }
    }

    if shared.epoch.load(Ordering::SeqCst) == epoch {
        radio.stop_scan().await;
        shared.scanning.send_replace(false);
        let peers = shared.peers.borrow().len();
        let _ = shared.events.send(SessionEvent::ScanFinished { peers });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Ether;
    use boardlink_core::PeerAddress;
    use boardlink_core::ids::SERVICE_UUID;

    fn addr(s: &str) -> PeerAddress {
        s.parse().unwrap()
    }

    fn engine(radio: Arc<dyn Radio>) -> (DiscoveryEngine, broadcast::Receiver<SessionEvent>) {
        let (events, rx) = broadcast::channel(64);
        (DiscoveryEngine::new(radio, SERVICE_UUID, events), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_sightings_collapse() {
        let ether = Ether::new();
        let host = ether.attach(addr("host"), None);
        let (host_engine, _) = engine(Arc::new(host));
        host_engine
            .start_advertising(Some("Misty".into()))
            .await
            .unwrap();

        let (joiner, _) = engine(Arc::new(ether.attach(addr("joiner"), None)));
        joiner
            .start_scanning(Duration::from_secs(2))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;

        let peers = joiner.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].address, addr("host"));
        assert_eq!(peers[0].label(), "Misty");
        assert!(joiner.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn first_seen_order_kept() {
        let ether = Ether::new();
        let (joiner, _) = engine(Arc::new(ether.attach(addr("joiner"), None)));
        joiner
            .start_scanning(Duration::from_secs(5))
            .await
            .unwrap();

        for name in ["h1", "h2", "h3"] {
            let (host, _) = engine(Arc::new(ether.attach(addr(name), None)));
            host.start_advertising(None).await.unwrap();
            tokio::time::sleep(Duration::from_millis(250)).await;
            // engine dropped here; the advert stays on the medium
        }

        let order: Vec<_> = joiner
            .peers()
            .into_iter()
            .map(|p| p.address.to_string())
            .collect();
        assert_eq!(order, ["h1", "h2", "h3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_service_ignored() {
        let ether = Ether::new();
        let other = ether.attach(addr("speaker"), None);
        other
            .start_advertising(Advertisement {
                service: Uuid::from_u128(0x180d),
                local_name: Some("HR strap".into()),
                connectable: true,
            })
            .await
            .unwrap();

        let (joiner, _) = engine(Arc::new(ether.attach(addr("joiner"), None)));
        joiner
            .start_scanning(Duration::from_millis(500))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(joiner.peers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn scan_stops_itself_after_window() {
        let ether = Ether::new();
        let (joiner, mut events) = engine(Arc::new(ether.attach(addr("joiner"), None)));
        joiner
            .start_scanning(Duration::from_millis(500))
            .await
            .unwrap();
        assert!(ether.is_scanning(&addr("joiner")));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!joiner.is_scanning());
        assert!(!ether.is_scanning(&addr("joiner")));
        assert!(joiner.peers().is_empty());
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::ScanFinished { peers: 0 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn new_scan_clears_previous_peers() {
        let ether = Ether::new();
        let (host, _) = engine(Arc::new(ether.attach(addr("host"), None)));
        host.start_advertising(None).await.unwrap();
        let (joiner, _) = engine(Arc::new(ether.attach(addr("joiner"), None)));

        joiner
            .start_scanning(Duration::from_millis(300))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(joiner.peers().len(), 1);

        host.stop_advertising().await;
        joiner
            .start_scanning(Duration::from_millis(300))
            .await
            .unwrap();
        assert!(joiner.peers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_scanning_is_idempotent() {
        let ether = Ether::new();
        let (joiner, _) = engine(Arc::new(ether.attach(addr("joiner"), None)));
        joiner.stop_scanning().await;
        joiner
            .start_scanning(Duration::from_secs(10))
            .await
            .unwrap();
        joiner.stop_scanning().await;
        joiner.stop_scanning().await;
        assert!(!joiner.is_scanning());
        assert!(!ether.is_scanning(&addr("joiner")));
    }

    #[tokio::test]
    async fn radio_off_is_unavailable() {
        let ether = Ether::new();
        let radio = ether.attach(addr("joiner"), None);
        ether.set_powered(&addr("joiner"), false);
        let (joiner, _) = engine(Arc::new(radio));
        let err = joiner
            .start_scanning(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::TransportUnavailable(_)));
        assert!(!joiner.is_scanning());
    }

    #[tokio::test]
    async fn advertising_is_idempotent() {
        let ether = Ether::new();
        let (host, _) = engine(Arc::new(ether.attach(addr("host"), None)));
        host.start_advertising(None).await.unwrap();
        host.start_advertising(None).await.unwrap();
        assert!(host.is_advertising().await);
        host.stop_advertising().await;
        host.stop_advertising().await;
        assert!(!ether.is_advertising(&addr("host")));
    }
}

//! End-to-end sessions over the simulated radio.

use boardlink_core::ids::{BOARD_CHARACTERISTIC_UUID, SERVICE_UUID};
use boardlink_core::GattService;
use boardlink_session::handshake::host::{self, HostHandshake};
use boardlink_session::sim::Ether;
use boardlink_session::{
    ConnectionManager, ConnectionState, GattLink, PeerAddress, PeerHandle, Radio,
    SessionConfig, SessionError, SessionEvent, SessionPayload,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

fn addr(s: &str) -> PeerAddress {
    s.parse().unwrap()
}

fn manager(ether: &Ether, name: &str, config: SessionConfig) -> ConnectionManager {
    let radio = ether.attach(addr(name), Some(name.into()));
    ConnectionManager::new(Arc::new(radio), config).unwrap()
}

#[tokio::test(start_paused = true)]
async fn board_travels_from_host_to_joiner() {
    let ether = Ether::new();
    let board = SessionPayload::new((1..=25).collect(), Some(7));

    let host_config = SessionConfig {
        device_name: Some("Misty".into()),
        ..SessionConfig::default()
    };
    let host = manager(&ether, "host", host_config);
    host.start_hosting(board.clone()).await.unwrap();
    assert_eq!(host.state(), ConnectionState::Listening);

    let joiner = manager(&ether, "joiner", SessionConfig::default());
    let mut joiner_events = joiner.subscribe();
    joiner.start_joining().await.unwrap();
    assert_eq!(joiner.state(), ConnectionState::Discovering);

    joiner
        .watch_peers()
        .wait_for(|peers| !peers.is_empty())
        .await
        .unwrap();
    let peers = joiner.discovered_peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].label(), "Misty");

    let received = joiner.connect_to(&peers[0]).await.unwrap();
    assert_eq!(received, board);
    assert_eq!(joiner.state(), ConnectionState::Connected);
    assert_eq!(joiner.connected_peer_name().as_deref(), Some("Misty"));

    host.watch_state()
        .wait_for(|s| *s == ConnectionState::Connected)
        .await
        .unwrap();
    assert_eq!(host.connected_peer_name().as_deref(), Some("joiner"));
    assert!(!host.is_advertising().await);

    // the joiner closes its link once the board is in
    assert_eq!(ether.open_links(), 0);

    let mut states = Vec::new();
    while let Ok(event) = joiner_events.try_recv() {
        if let SessionEvent::StateChanged(state) = event {
            states.push(state);
        }
    }
    assert_eq!(
        states,
        [
            ConnectionState::Discovering,
            ConnectionState::Connecting,
            ConnectionState::Connected
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn board_survives_tiny_frames() {
    let ether = Ether::new();
    let board = SessionPayload::new((100..160).collect(), None);
    let host = manager(&ether, "host", SessionConfig::default());
    ether.set_frame_cap(&addr("host"), 3);
    host.start_hosting(board.clone()).await.unwrap();

    let joiner = manager(&ether, "joiner", SessionConfig::default());
    let target = PeerHandle::new(addr("host"), None);
    assert_eq!(joiner.connect_to(&target).await.unwrap(), board);
}

#[tokio::test(start_paused = true)]
async fn connecting_to_empty_air_fails() {
    let ether = Ether::new();
    let joiner = manager(&ether, "joiner", SessionConfig::default());
    let nobody = PeerHandle::new(addr("AA:BB:CC:DD:EE:FF"), None);

    let err = joiner.connect_to(&nobody).await.unwrap_err();
    assert!(matches!(err, SessionError::Permanent(_)), "got {err:?}");
    assert_eq!(joiner.state(), ConnectionState::Error);
    assert_eq!(joiner.last_error(), Some(err));
    assert_eq!(ether.connect_attempts(&nobody.address), 1);

    joiner.teardown().await;
    assert_eq!(joiner.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn empty_scan_stops_on_its_own() {
    let ether = Ether::new();
    let config = SessionConfig {
        scan_window_ms: 500,
        ..SessionConfig::default()
    };
    let joiner = manager(&ether, "joiner", config);
    let mut events = joiner.subscribe();
    joiner.start_joining().await.unwrap();
    assert!(joiner.is_scanning());

    tokio::time::sleep(Duration::from_millis(501)).await;
    assert!(joiner.discovered_peers().is_empty());
    assert!(!joiner.is_scanning());
    assert!(!ether.is_scanning(&addr("joiner")));
    // a quiet scan is not an error
    assert_eq!(joiner.state(), ConnectionState::Discovering);
    assert!(joiner.last_error().is_none());

    assert_eq!(
        events.recv().await.unwrap(),
        SessionEvent::StateChanged(ConnectionState::Discovering)
    );
    assert_eq!(
        events.recv().await.unwrap(),
        SessionEvent::ScanFinished { peers: 0 }
    );
}

#[test]
fn single_id_board_is_too_small() {
    let err = SessionPayload::decode(br#"{"board_ids":[42],"host_selection_id":-1}"#).unwrap_err();
    assert_eq!(err, SessionError::BoardTooSmall(1));
    assert!(err.is_application());
}

#[tokio::test(start_paused = true)]
async fn single_id_board_rejected_after_transfer() {
    let ether = Ether::new();
    let legacy_host = ether.attach(addr("legacy"), None);
    let server = legacy_host
        .open_gatt_server(GattService::board_service())
        .await
        .unwrap();
    let raw = br#"{"board_ids":[42],"host_selection_id":-1}"#.to_vec();
    let (delivered, accepted) = oneshot::channel();
    tokio::spawn(host::serve(
        server,
        HostHandshake::new(raw, 20),
        Arc::new(legacy_host.clone()),
        delivered,
    ));

    let joiner = manager(&ether, "joiner", SessionConfig::default());
    let err = joiner
        .connect_to(&PeerHandle::new(addr("legacy"), None))
        .await
        .unwrap_err();
    assert_eq!(err, SessionError::BoardTooSmall(1));
    assert_eq!(joiner.state(), ConnectionState::Error);
    assert_eq!(ether.connect_attempts(&addr("legacy")), 1);

    // the transfer itself completed
    assert!(accepted.await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn direct_connect_works_without_advertising() {
    let ether = Ether::new();
    let board = SessionPayload::new(vec![3, 1, 4, 1, 5], None);
    let host = manager(&ether, "host", SessionConfig::default());
    ether.disable_advertising(&addr("host"));
    host.start_hosting(board.clone()).await.unwrap();
    assert_eq!(host.state(), ConnectionState::Listening);
    assert!(!host.is_advertising().await);

    let config = SessionConfig {
        scan_window_ms: 1_000,
        ..SessionConfig::default()
    };
    let joiner = manager(&ether, "joiner", config);
    joiner.start_joining().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert!(joiner.discovered_peers().is_empty());

    let known = PeerHandle::new(addr("host"), None);
    assert_eq!(joiner.connect_to(&known).await.unwrap(), board);
}

#[tokio::test(start_paused = true)]
async fn reading_before_join_is_refused() {
    let ether = Ether::new();
    let host = manager(&ether, "host", SessionConfig::default());
    host.start_hosting(SessionPayload::new(vec![1, 2], None))
        .await
        .unwrap();

    let snooper = ether.attach(addr("snooper"), None);
    let mut link = snooper.connect(&addr("host")).await.unwrap();
    let err = link
        .read(SERVICE_UUID, BOARD_CHARACTERISTIC_UUID, 0)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        boardlink_core::RadioError::Status(boardlink_core::ids::GATT_READ_NOT_PERMITTED)
    );
    assert_eq!(host.state(), ConnectionState::Listening);
}

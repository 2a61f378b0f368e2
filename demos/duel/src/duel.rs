//! One host, one joiner, one shared room.

use anyhow::{Context, bail};
use boardlink_core::ids::GATT_ERROR;
use boardlink_core::{PeerAddress, RadioError, SessionPayload};
use boardlink_session::sim::{ConnectFault, Ether};
use boardlink_session::{ConnectionManager, ConnectionState, SessionConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

const HOST_ADDRESS: &str = "5C:F3:70:00:00:01";
const JOINER_ADDRESS: &str = "5C:F3:70:00:00:02";

pub async fn run(config: SessionConfig, board: SessionPayload, flaky: usize) -> anyhow::Result<()> {
    let ether = Ether::new();
    let host_address: PeerAddress = HOST_ADDRESS.parse()?;
    let joiner_address: PeerAddress = JOINER_ADDRESS.parse()?;

    let host_name = config
        .device_name
        .clone()
        .or_else(|| Some("Host".to_string()));
    let host_radio = ether.attach(host_address.clone(), host_name.clone());
    let joiner_radio = ether.attach(joiner_address.clone(), Some("Joiner".to_string()));
    if flaky > 0 {
        ether.inject_connect_faults(
            &host_address,
            std::iter::repeat_n(ConnectFault::Fail(RadioError::Status(GATT_ERROR)), flaky),
        );
    }

    let host_config = SessionConfig {
        device_name: host_name,
        ..config.clone()
    };
    let host = ConnectionManager::new(Arc::new(host_radio), host_config)?;
    let joiner = ConnectionManager::new(Arc::new(joiner_radio), config.clone())?;
    log_events("host", &host);
    log_events("joiner", &joiner);

    host.start_hosting(board.clone()).await?;
    joiner.start_joining().await?;

    let mut peers = joiner.watch_peers();
    let peer = {
        let found = tokio::time::timeout(config.scan_window(), peers.wait_for(|p| !p.is_empty()))
            .await
            .context("no board host in range")??;
        found[0].clone()
    };
    tracing::info!(host = peer.label(), address = %peer.address, "picked host");

    let received = match joiner.connect_to(&peer).await {
        Ok(payload) => payload,
        Err(e) if e.is_application() => bail!("bad game data: {e}"),
        Err(e) => bail!("connection failed: {e}"),
    };
    if received != board {
        bail!("board changed in transit");
    }

    let mut host_state = host.watch_state();
    let settled = *tokio::time::timeout(
        Duration::from_secs(1),
        host_state.wait_for(ConnectionState::is_terminal),
    )
    .await
    .context("host never saw the hand-off complete")??;
    if settled != ConnectionState::Connected {
        bail!("host ended in {settled:?}: {:?}", host.last_error());
    }

    tracing::info!(
        cards = received.board_ids.len(),
        pick = ?received.host_selection_id,
        joiner = host.connected_peer_name().as_deref().unwrap_or("?"),
        attempts = ether.connect_attempts(&host_address),
        "board handed over"
    );

    host.teardown().await;
    joiner.teardown().await;
    Ok(())
}

fn log_events(side: &'static str, manager: &ConnectionManager) {
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::debug!(side, ?event, "session event"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(side, skipped, "event log fell behind")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

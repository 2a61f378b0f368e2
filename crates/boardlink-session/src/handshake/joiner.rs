//! Joiner side of the handshake.
//!
//! [`JoinerHandshake`] is a plain state machine: feed it what the radio
//! reported, it answers with the next thing to ask the radio for. It holds
//! no I/O, so a single attempt's ordering rules live in one place and can
//! be tested without a transport. [`attempt`] is the driver that pairs it
//! with a real link.

use crate::radio::{GattLink, Radio};
use boardlink_core::chunk::{Progress, Reassembler};
use boardlink_core::ids::{BOARD_CHARACTERISTIC_UUID, JOIN_TOKEN, SERVICE_UUID};
use boardlink_core::{Classifier, GattService, PeerAddress, RadioError, SessionError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinerState {
    Idle,
    Connecting,
    ServiceDiscovery,
    Writing,
    Reading { offset: usize },
    Closed,
}

/// What the radio reported back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinerEvent {
    Connected { frame_cap: usize },
    ServicesDiscovered(Vec<GattService>),
    JoinAcked,
    ChunkRead(Vec<u8>),
    RadioFailed(RadioError),
}

/// What the driver should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinerStep {
    Connect,
    DiscoverServices,
    WriteJoin,
    ReadAt(usize),
    /// The attempt is over; collect the outcome.
    Finish,
}

/// One connect attempt against one host.
#[derive(Debug)]
pub struct JoinerHandshake {
    state: JoinerState,
    classifier: Classifier,
    max_payload_bytes: usize,
    reassembler: Option<Reassembler>,
    outcome: Option<Result<Vec<u8>, SessionError>>,
}

impl JoinerHandshake {
    pub fn new(classifier: Classifier, max_payload_bytes: usize) -> Self {
        Self {
            state: JoinerState::Idle,
            classifier,
            max_payload_bytes,
            reassembler: None,
            outcome: None,
        }
    }

    pub fn state(&self) -> JoinerState {
        self.state
    }

    pub fn start(&mut self) -> JoinerStep {
        if self.state != JoinerState::Idle {
            return self.step();
        }
        self.state = JoinerState::Connecting;
        JoinerStep::Connect
    }

    pub fn handle(&mut self, event: JoinerEvent) -> JoinerStep {
        let state = self.state;
        match (state, event) {
            (JoinerState::Idle | JoinerState::Closed, _) => {}
            (_, JoinerEvent::RadioFailed(err)) => {
                let err = self.classifier.classify(&err);
                self.fail(err);
            }
            (JoinerState::Connecting, JoinerEvent::Connected { frame_cap }) => {
                self.reassembler = Some(Reassembler::new(frame_cap, self.max_payload_bytes));
                self.state = JoinerState::ServiceDiscovery;
            }
            (JoinerState::ServiceDiscovery, JoinerEvent::ServicesDiscovered(services)) => {
                match services.iter().find(|s| s.uuid == SERVICE_UUID) {
                    None => self.fail(SessionError::Permanent(
                        "peer does not expose the board service".into(),
                    )),
                    Some(service) if !service.has_characteristic(BOARD_CHARACTERISTIC_UUID) => {
                        self.fail(SessionError::Permanent(
                            "board characteristic missing".into(),
                        ))
                    }
                    Some(_) => self.state = JoinerState::Writing,
                }
            }
            (JoinerState::Writing, JoinerEvent::JoinAcked) => {
                self.state = JoinerState::Reading { offset: 0 };
            }
            (JoinerState::Reading { .. }, JoinerEvent::ChunkRead(chunk)) => {
                let progress = match self.reassembler.as_mut() {
                    Some(reassembler) => reassembler.accept(&chunk),
                    None => Err(SessionError::Permanent("read before connect".into())),
                };
                match progress {
                    Ok(Progress::ReadAt(offset)) => {
                        self.state = JoinerState::Reading { offset };
                    }
                    Ok(Progress::Complete) => {
                        let bytes = self
                            .reassembler
                            .take()
                            .map(Reassembler::into_bytes)
                            .unwrap_or_default();
                        self.outcome = Some(Ok(bytes));
                        self.state = JoinerState::Closed;
                    }
                    Err(err) => self.fail(err),
                }
            }
            (state, event) => self.fail(SessionError::Permanent(format!(
                "unexpected {event:?} while {state:?}"
            ))),
        }
        self.step()
    }

    /// The attempt's deadline passed. No effect once closed.
    pub fn timed_out(&mut self, after: Duration) {
        if self.state != JoinerState::Closed {
            self.fail(SessionError::Timeout(after));
        }
    }

    /// Reassembled bytes, or why the attempt failed.
    pub fn into_outcome(self) -> Result<Vec<u8>, SessionError> {
        self.outcome.unwrap_or(Err(SessionError::Cancelled))
    }

    fn fail(&mut self, err: SessionError) {
        self.reassembler = None;
        self.outcome = Some(Err(err));
        self.state = JoinerState::Closed;
    }

    fn step(&self) -> JoinerStep {
        match self.state {
            JoinerState::Idle | JoinerState::Closed => JoinerStep::Finish,
            JoinerState::Connecting => JoinerStep::Connect,
            JoinerState::ServiceDiscovery => JoinerStep::DiscoverServices,
            JoinerState::Writing => JoinerStep::WriteJoin,
            JoinerState::Reading { offset } => JoinerStep::ReadAt(offset),
        }
    }
}

/// Run one attempt against `peer`: a fresh link, bounded by the attempt
/// timeout, always disconnected before returning.
pub async fn attempt(
    radio: &dyn Radio,
    peer: &PeerAddress,
    classifier: &Classifier,
    max_payload_bytes: usize,
    timeout: Duration,
) -> Result<Vec<u8>, SessionError> {
    let mut machine = JoinerHandshake::new(classifier.clone(), max_payload_bytes);
    let mut link: Option<Box<dyn GattLink>> = None;

    let driven = tokio::time::timeout(timeout, drive(radio, peer, &mut machine, &mut link)).await;
    if let Some(mut link) = link.take() {
        link.disconnect().await;
    }
    if driven.is_err() {
        tracing::warn!(address = %peer, timeout_ms = timeout.as_millis() as u64, "attempt timed out");
        machine.timed_out(timeout);
    }
    machine.into_outcome()
}

async fn drive(
    radio: &dyn Radio,
    peer: &PeerAddress,
    machine: &mut JoinerHandshake,
    link: &mut Option<Box<dyn GattLink>>,
) {
    let mut step = machine.start();
    loop {
        let event = match step {
            JoinerStep::Finish => return,
            JoinerStep::Connect => match radio.connect(peer).await {
                Ok(opened) => {
                    let frame_cap = opened.frame_cap();
                    tracing::debug!(address = %peer, frame_cap, "link open");
                    *link = Some(opened);
                    JoinerEvent::Connected { frame_cap }
                }
                Err(err) => JoinerEvent::RadioFailed(err),
            },
            step => match link.as_deref_mut() {
                Some(link) => perform(link, step).await,
                None => JoinerEvent::RadioFailed(RadioError::LinkLost),
            },
        };
        if let JoinerEvent::RadioFailed(err) = &event {
            tracing::debug!(address = %peer, ?step, error = %err, "radio request failed");
        }
        step = machine.handle(event);
    }
}

async fn perform(link: &mut dyn GattLink, step: JoinerStep) -> JoinerEvent {
    let result = match step {
        JoinerStep::DiscoverServices => link
            .discover_services()
            .await
            .map(JoinerEvent::ServicesDiscovered),
        JoinerStep::WriteJoin => link
            .write(SERVICE_UUID, BOARD_CHARACTERISTIC_UUID, JOIN_TOKEN)
            .await
            .map(|()| JoinerEvent::JoinAcked),
        JoinerStep::ReadAt(offset) => {
            let read = link
                .read(SERVICE_UUID, BOARD_CHARACTERISTIC_UUID, offset)
                .await;
            if let Ok(chunk) = &read {
                tracing::debug!(address = %link.peer(), offset, bytes = chunk.len(), "read chunk");
            }
            read.map(JoinerEvent::ChunkRead)
        }
        JoinerStep::Connect | JoinerStep::Finish => Err(RadioError::LinkLost),
    };
    result.unwrap_or_else(JoinerEvent::RadioFailed)
}

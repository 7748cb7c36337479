//! Network peer: the transport channel and its ICE-driven connectivity
//!
//! Runs as a task on the network context, owning the ICE transport and the
//! transport-mode encrypted connection. The handle is a typed proxy: every
//! method posts a command into the task's queue, so the owned state is only
//! ever touched on its own context.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::network::connection::{
    ConnectionType, DecryptedMessage, EncryptedConnection, ServiceCause,
};
use crate::network::encryption::EncryptionKey;
use crate::network::ice::{IceConfig, IceEvent, IceTransport, IceTransportFactory};
use crate::protocol::{IceCandidate, Message};

/// Events the network peer reports to its owner
#[derive(Debug)]
pub enum NetworkEvent {
    /// Connectivity changed
    StateUpdated { is_ready_to_send: bool },
    /// A message decoded from the transport channel
    TransportMessage(DecryptedMessage),
    /// A message (gathered candidates) to forward over signaling
    SignalingMessage(Message),
}

enum Command {
    StartGathering,
    SendMessage(Message),
    AddRemoteCandidates(Vec<IceCandidate>),
    ServiceTick(ServiceCause),
    Stop,
}

/// Typed proxy to the network task
#[derive(Clone)]
pub struct NetworkPeer {
    commands: mpsc::UnboundedSender<Command>,
}

impl NetworkPeer {
    /// Spawn the network task
    ///
    /// `events` receives connectivity changes, gathered candidates, and
    /// decrypted transport messages.
    pub fn spawn(
        key: EncryptionKey,
        config: IceConfig,
        factory: IceTransportFactory,
        events: mpsc::UnboundedSender<NetworkEvent>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (ice_tx, ice_rx) = mpsc::unbounded_channel();

        let transport = factory(config, ice_tx);

        // Service wakeups loop back into this task's queue after their delay
        let service_tx = command_tx.clone();
        let connection = EncryptedConnection::new(
            ConnectionType::Transport,
            key,
            Box::new(move |delay_ms, cause| {
                let tx = service_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    let _ = tx.send(Command::ServiceTick(cause));
                });
            }),
        );

        tokio::spawn(run(transport, connection, command_rx, ice_rx, events));

        Self {
            commands: command_tx,
        }
    }

    /// Begin ICE candidate gathering
    pub fn start_gathering(&self) {
        let _ = self.commands.send(Command::StartGathering);
    }

    /// Frame and send one message over the transport channel
    pub fn send_message(&self, message: Message) {
        let _ = self.commands.send(Command::SendMessage(message));
    }

    /// Feed candidates received from the peer over signaling
    pub fn add_remote_candidates(&self, candidates: Vec<IceCandidate>) {
        let _ = self.commands.send(Command::AddRemoteCandidates(candidates));
    }

    /// Tear the task down; pending commands are drained first
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }
}

async fn run(
    mut transport: Box<dyn IceTransport>,
    mut connection: EncryptedConnection,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut ice_events: mpsc::UnboundedReceiver<IceEvent>,
    events: mpsc::UnboundedSender<NetworkEvent>,
) {
    let mut is_ready = false;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                None | Some(Command::Stop) => break,
                Some(Command::StartGathering) => transport.start_gathering(),
                Some(Command::SendMessage(message)) => {
                    match connection.prepare_for_sending(&message) {
                        Some(prepared) => transport.send_packet(&prepared.bytes),
                        None => warn!("Transport message could not be framed"),
                    }
                }
                Some(Command::AddRemoteCandidates(candidates)) => {
                    for candidate in candidates {
                        transport.add_remote_candidate(candidate);
                    }
                }
                Some(Command::ServiceTick(cause)) => {
                    if let Some(prepared) = connection.prepare_for_sending_service(cause) {
                        transport.send_packet(&prepared.bytes);
                    }
                }
            },
            ice_event = ice_events.recv() => match ice_event {
                None => break,
                Some(IceEvent::CandidateGathered(candidate)) => {
                    debug!("Local candidate {}", candidate.to_sdp());
                    let _ = events.send(NetworkEvent::SignalingMessage(Message::CandidatesList {
                        candidates: vec![candidate],
                    }));
                }
                Some(IceEvent::StateChanged(state)) => {
                    let ready = state.is_ready_to_send();
                    if ready != is_ready {
                        is_ready = ready;
                        let _ = events.send(NetworkEvent::StateUpdated {
                            is_ready_to_send: ready,
                        });
                    }
                }
                Some(IceEvent::PacketReceived(bytes)) => {
                    if let Some(packet) = connection.handle_incoming_packet(&bytes) {
                        let _ = events.send(NetworkEvent::TransportMessage(packet.main));
                        for message in packet.additional {
                            let _ = events.send(NetworkEvent::TransportMessage(message));
                        }
                    }
                }
            },
        }
    }
    debug!("Network peer stopped");
}

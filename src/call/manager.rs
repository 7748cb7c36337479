//! Call manager: top-level coordination and the call state machine
//!
//! Owns the signaling encrypted connection and the handles to the network
//! and media peers. Decrypted messages are dispatched by variant: candidate
//! lists to the network peer, everything media-related to the media peer.
//! Connectivity reports drive the `Reconnecting / Established / Failed`
//! machine; `Failed` is terminal and only reached when connectivity was
//! never achieved within the descriptor's budget.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::media::{MediaEngine, MediaEvent, MediaPeer, VideoCapture, VideoSink};
use crate::network::{
    ConnectionType, DecryptedMessage, EncryptedConnection, EncryptionKey, IceConfig,
    IceTransportFactory, NetworkEvent, NetworkPeer, RtcServer, ServiceCause,
};
use crate::protocol::Message;

/// Call connectivity state visible to the embedder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Reconnecting,
    Established,
    Failed,
}

/// Video readiness visible to the embedder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoState {
    /// No common codec; video cannot happen this session
    Inactive,
    /// Video could be started by either side
    Possible,
    /// This side asked to receive video
    OutgoingRequested,
    /// The remote side's video is flowing
    Active,
}

fn compute_video_state(impossible: bool, remote_active: bool, requested: bool) -> VideoState {
    if impossible {
        VideoState::Inactive
    } else if remote_active {
        VideoState::Active
    } else if requested {
        VideoState::OutgoingRequested
    } else {
        VideoState::Possible
    }
}

/// Everything needed to run one call
pub struct Descriptor {
    /// Session secret; its role flag makes this side initiator or responder
    pub encryption_key: EncryptionKey,
    /// STUN/TURN servers; empty means the built-in defaults
    pub rtc_servers: Vec<RtcServer>,
    /// When false, only relayed connectivity is allowed
    pub enable_p2p: bool,
    pub enable_flexfec: bool,
    /// Capture to send from the beginning of the call
    pub video_capture: Option<Arc<dyn VideoCapture>>,
    /// Budget for reaching connectivity at least once before the call fails
    pub connect_timeout: Duration,
    pub media_engine: Box<dyn MediaEngine>,
    pub transport_factory: IceTransportFactory,
    /// Coalesced state transitions
    pub state_updated: Box<dyn Fn(State, VideoState) + Send>,
    /// Bytes the embedder must deliver to the peer's signaling input; loss
    /// and reordering are tolerated
    pub signaling_data_emitted: Box<dyn Fn(Vec<u8>) + Send>,
    pub remote_video_is_active_updated: Box<dyn Fn(bool) + Send>,
}

enum Command {
    Start,
    ReceiveSignalingData(Vec<u8>),
    RequestVideo(Arc<dyn VideoCapture>),
    SetMuteOutgoingAudio(bool),
    SetIncomingVideoOutput(Arc<dyn VideoSink>),
    SendSignalingMessage(Message),
    SignalingServiceTick(ServiceCause),
    ConnectTimeout,
    Stop,
}

/// Handle to a running call
///
/// Dropping the manager tears the call down: already queued work drains,
/// then media stops, then network, then signaling, and no embedder
/// callback fires once teardown completes.
pub struct Manager {
    commands: mpsc::UnboundedSender<Command>,
}

impl Manager {
    pub fn new(descriptor: Descriptor) -> Self {
        let Descriptor {
            encryption_key,
            rtc_servers,
            enable_p2p,
            enable_flexfec,
            video_capture,
            connect_timeout,
            media_engine,
            transport_factory,
            state_updated,
            signaling_data_emitted,
            remote_video_is_active_updated,
        } = descriptor;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (network_tx, network_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::unbounded_channel();

        let is_outgoing = encryption_key.is_outgoing();
        let network = NetworkPeer::spawn(
            encryption_key.clone(),
            IceConfig::new(is_outgoing, enable_p2p, rtc_servers),
            transport_factory,
            network_tx,
        );

        let media_signal_tx = command_tx.clone();
        let network_for_media = network.clone();
        let media = MediaPeer::spawn(
            media_engine,
            video_capture.clone(),
            enable_flexfec,
            Box::new(move |message| {
                let _ = media_signal_tx.send(Command::SendSignalingMessage(message));
            }),
            Arc::new(move |message| network_for_media.send_message(message)),
            media_tx,
        );

        // Signaling service wakeups loop back into this task's queue
        let service_tx = command_tx.clone();
        let signaling = EncryptedConnection::new(
            ConnectionType::Signaling,
            encryption_key,
            Box::new(move |delay_ms, cause| {
                let tx = service_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    let _ = tx.send(Command::SignalingServiceTick(cause));
                });
            }),
        );

        let task = Task {
            signaling,
            network,
            media,
            state: State::Reconnecting,
            video_state: VideoState::Possible,
            did_connect_once: false,
            requested_video: false,
            has_initial_capture: video_capture.is_some(),
            video_impossible: false,
            remote_video_active: false,
            connect_timeout,
            commands: command_tx.clone(),
            state_updated,
            signaling_data_emitted,
            remote_video_is_active_updated,
            last_emitted: None,
        };
        tokio::spawn(task.run(command_rx, network_rx, media_rx));

        Self {
            commands: command_tx,
        }
    }

    /// Begin gathering, announce video formats, and arm the connect budget
    pub fn start(&self) {
        let _ = self.commands.send(Command::Start);
    }

    /// Bytes received from the peer's signaling channel
    pub fn receive_signaling_data(&self, data: Vec<u8>) {
        let _ = self.commands.send(Command::ReceiveSignalingData(data));
    }

    /// Ask to receive video and start sending from this capture
    pub fn request_video(&self, capture: Arc<dyn VideoCapture>) {
        let _ = self.commands.send(Command::RequestVideo(capture));
    }

    pub fn set_mute_outgoing_audio(&self, mute: bool) {
        let _ = self.commands.send(Command::SetMuteOutgoingAudio(mute));
    }

    pub fn set_incoming_video_output(&self, sink: Arc<dyn VideoSink>) {
        let _ = self.commands.send(Command::SetIncomingVideoOutput(sink));
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Stop);
    }
}

struct Task {
    signaling: EncryptedConnection,
    network: NetworkPeer,
    media: MediaPeer,
    state: State,
    video_state: VideoState,
    did_connect_once: bool,
    requested_video: bool,
    has_initial_capture: bool,
    video_impossible: bool,
    remote_video_active: bool,
    connect_timeout: Duration,
    commands: mpsc::UnboundedSender<Command>,
    state_updated: Box<dyn Fn(State, VideoState) + Send>,
    signaling_data_emitted: Box<dyn Fn(Vec<u8>) + Send>,
    remote_video_is_active_updated: Box<dyn Fn(bool) + Send>,
    last_emitted: Option<(State, VideoState)>,
}

impl Task {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut network_events: mpsc::UnboundedReceiver<NetworkEvent>,
        mut media_events: mpsc::UnboundedReceiver<MediaEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    None | Some(Command::Stop) => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = network_events.recv() => self.handle_network_event(event),
                Some(event) = media_events.recv() => self.handle_media_event(event),
            }
        }

        // Teardown order: media, then network; the signaling connection goes
        // down with this task
        self.media.stop();
        self.network.stop();
        debug!("Manager stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start => self.start(),
            Command::ReceiveSignalingData(data) => self.receive_signaling_data(&data),
            Command::RequestVideo(capture) => {
                self.requested_video = true;
                self.media.set_send_video(Some(capture));
                self.send_signaling_message(Message::RequestVideo);
                self.refresh_video_state();
            }
            Command::SetMuteOutgoingAudio(mute) => self.media.set_mute_outgoing_audio(mute),
            Command::SetIncomingVideoOutput(sink) => self.media.set_incoming_video_output(sink),
            Command::SendSignalingMessage(message) => self.send_signaling_message(message),
            Command::SignalingServiceTick(cause) => {
                if let Some(prepared) = self.signaling.prepare_for_sending_service(cause) {
                    (self.signaling_data_emitted)(prepared.bytes);
                }
            }
            Command::ConnectTimeout => {
                if !self.did_connect_once {
                    warn!(
                        "Connectivity not reached within {:?}",
                        self.connect_timeout
                    );
                    self.state = State::Failed;
                    self.emit_state();
                }
            }
            Command::Stop => unreachable!("handled by the run loop"),
        }
    }

    fn start(&mut self) {
        info!("Starting call");
        self.network.start_gathering();
        self.media.start();
        if self.has_initial_capture {
            self.requested_video = true;
            self.send_signaling_message(Message::RequestVideo);
        }
        self.refresh_video_state();
        self.emit_state();

        let commands = self.commands.clone();
        let budget = self.connect_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            let _ = commands.send(Command::ConnectTimeout);
        });
    }

    fn receive_signaling_data(&mut self, data: &[u8]) {
        let Some(packet) = self.signaling.handle_incoming_packet(data) else {
            return;
        };
        self.dispatch_message(packet.main, true);
        for message in packet.additional {
            self.dispatch_message(message, true);
        }
    }

    fn dispatch_message(&mut self, decrypted: DecryptedMessage, from_signaling: bool) {
        let counter = decrypted.counter;
        match decrypted.message {
            Message::CandidatesList { candidates } => {
                debug!("Routing {} remote candidate(s)", candidates.len());
                self.network.add_remote_candidates(candidates);
            }
            Message::UnstructuredData { .. } => {
                debug!("Dropping unstructured data message");
            }
            Message::AudioData { .. } | Message::VideoData { .. } if from_signaling => {
                debug!("Ignoring media data on the signaling channel");
            }
            message => {
                self.media
                    .receive_message(DecryptedMessage { counter, message });
            }
        }
    }

    fn send_signaling_message(&mut self, message: Message) {
        match self.signaling.prepare_for_sending(&message) {
            Some(prepared) => (self.signaling_data_emitted)(prepared.bytes),
            None => warn!("Signaling message dropped, outbox saturated"),
        }
    }

    fn handle_network_event(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::StateUpdated { is_ready_to_send } => {
                if self.state == State::Failed {
                    return;
                }
                self.media.set_is_connected(is_ready_to_send);
                if is_ready_to_send {
                    self.did_connect_once = true;
                    self.state = State::Established;
                } else if self.did_connect_once {
                    self.state = State::Reconnecting;
                }
                self.emit_state();
            }
            NetworkEvent::SignalingMessage(message) => self.send_signaling_message(message),
            NetworkEvent::TransportMessage(decrypted) => self.dispatch_message(decrypted, false),
        }
    }

    fn handle_media_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::RemoteVideoIsActiveUpdated(active) => {
                self.remote_video_active = active;
                (self.remote_video_is_active_updated)(active);
                self.refresh_video_state();
            }
            MediaEvent::VideoNegotiated(outcome) => {
                self.video_impossible = outcome.is_none();
                self.refresh_video_state();
            }
        }
    }

    fn refresh_video_state(&mut self) {
        self.video_state = compute_video_state(
            self.video_impossible,
            self.remote_video_active,
            self.requested_video,
        );
        self.emit_state();
    }

    fn emit_state(&mut self) {
        let pair = (self.state, self.video_state);
        if self.last_emitted == Some(pair) {
            return;
        }
        self.last_emitted = Some(pair);
        info!("Call state {:?}, video {:?}", pair.0, pair.1);
        (self.state_updated)(pair.0, pair.1);
    }
}

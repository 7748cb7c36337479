//! Media peer: channels, codec negotiation, and send gating
//!
//! Runs as a task on the media context. The audio channel exists for the
//! whole session; the video channel is created once the peer's format list
//! arrives and a common codec exists. Outgoing media is gated on
//! connectivity, and outgoing video additionally on negotiation, on the
//! remote's `RequestVideo`, and on a local capture being attached.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::media::{
    select_outgoing_format, MediaChannel, MediaEngine, MediaInterface, SsrcSet, VideoCapture,
    VideoSink,
};
use crate::network::DecryptedMessage;
use crate::protocol::{Message, VideoFormat};

/// Events the media peer reports to its owner
#[derive(Debug)]
pub enum MediaEvent {
    /// The remote side reported its outgoing video started or stopped
    RemoteVideoIsActiveUpdated(bool),
    /// Outcome of codec negotiation; `None` means video is impossible for
    /// this session
    VideoNegotiated(Option<VideoFormat>),
}

enum Command {
    Start,
    SetIsConnected(bool),
    SetMuteOutgoingAudio(bool),
    SetSendVideo(Option<Arc<dyn VideoCapture>>),
    SetIncomingVideoOutput(Arc<dyn VideoSink>),
    ReceiveMessage(DecryptedMessage),
    Stop,
}

/// Typed proxy to the media task
#[derive(Clone)]
pub struct MediaPeer {
    commands: mpsc::UnboundedSender<Command>,
}

impl MediaPeer {
    /// Spawn the media task
    ///
    /// `send_signaling` carries negotiation messages; `send_transport`
    /// carries media data and in-call control messages.
    pub fn spawn(
        mut engine: Box<dyn MediaEngine>,
        video_capture: Option<Arc<dyn VideoCapture>>,
        enable_flexfec: bool,
        send_signaling: Box<dyn Fn(Message) + Send>,
        send_transport: Arc<dyn Fn(Message) + Send + Sync>,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let (local_formats, local_encoders) = engine.supported_video_formats();
        let connected = Arc::new(AtomicBool::new(false));
        let audio_ssrc = SsrcSet::generate(enable_flexfec);
        let video_ssrc = SsrcSet::generate(enable_flexfec);
        let audio_interface =
            MediaInterface::new(false, connected.clone(), send_transport.clone());
        let audio = engine.create_audio_channel(audio_ssrc, audio_interface);

        let task = Task {
            engine,
            audio,
            video: None,
            local_formats,
            local_encoders,
            outgoing_format: None,
            peer_formats_received: false,
            video_ssrc,
            connected,
            mute_outgoing_audio: false,
            remote_requested_video: false,
            is_sending_video: false,
            capture: video_capture,
            sink: None,
            send_signaling,
            send_transport,
            events,
        };
        tokio::spawn(task.run(command_rx));

        Self {
            commands: command_tx,
        }
    }

    /// Announce the local video formats to the peer
    pub fn start(&self) {
        let _ = self.commands.send(Command::Start);
    }

    pub fn set_is_connected(&self, connected: bool) {
        let _ = self.commands.send(Command::SetIsConnected(connected));
    }

    pub fn set_mute_outgoing_audio(&self, mute: bool) {
        let _ = self.commands.send(Command::SetMuteOutgoingAudio(mute));
    }

    pub fn set_send_video(&self, capture: Option<Arc<dyn VideoCapture>>) {
        let _ = self.commands.send(Command::SetSendVideo(capture));
    }

    pub fn set_incoming_video_output(&self, sink: Arc<dyn VideoSink>) {
        let _ = self.commands.send(Command::SetIncomingVideoOutput(sink));
    }

    /// Dispatch one decrypted message addressed to the media layer
    pub fn receive_message(&self, message: DecryptedMessage) {
        let _ = self.commands.send(Command::ReceiveMessage(message));
    }

    /// Tear the task down; pending commands are drained first
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }
}

struct Task {
    engine: Box<dyn MediaEngine>,
    audio: Box<dyn MediaChannel>,
    video: Option<Box<dyn MediaChannel>>,
    local_formats: Vec<VideoFormat>,
    local_encoders: u8,
    outgoing_format: Option<VideoFormat>,
    peer_formats_received: bool,
    video_ssrc: SsrcSet,
    connected: Arc<AtomicBool>,
    mute_outgoing_audio: bool,
    remote_requested_video: bool,
    is_sending_video: bool,
    capture: Option<Arc<dyn VideoCapture>>,
    sink: Option<Arc<dyn VideoSink>>,
    send_signaling: Box<dyn Fn(Message) + Send>,
    send_transport: Arc<dyn Fn(Message) + Send + Sync>,
    events: mpsc::UnboundedSender<MediaEvent>,
}

impl Task {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Start => self.start(),
                Command::SetIsConnected(connected) => self.set_is_connected(connected),
                Command::SetMuteOutgoingAudio(mute) => self.set_mute_outgoing_audio(mute),
                Command::SetSendVideo(capture) => self.set_send_video(capture),
                Command::SetIncomingVideoOutput(sink) => self.set_incoming_video_output(sink),
                Command::ReceiveMessage(message) => self.receive_message(message),
                Command::Stop => break,
            }
        }
        debug!("Media peer stopped");
    }

    fn start(&mut self) {
        (self.send_signaling)(Message::VideoFormats {
            formats: self.local_formats.clone(),
            encoders_count: self.local_encoders,
        });
    }

    fn set_is_connected(&mut self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        self.update_audio_sending();
        self.update_video_sending();
    }

    fn set_mute_outgoing_audio(&mut self, mute: bool) {
        self.mute_outgoing_audio = mute;
        self.update_audio_sending();
    }

    fn set_send_video(&mut self, capture: Option<Arc<dyn VideoCapture>>) {
        self.capture = capture;
        if let Some(video) = self.video.as_mut() {
            video.set_capture(self.capture.clone());
        }
        self.update_video_sending();
    }

    fn set_incoming_video_output(&mut self, sink: Arc<dyn VideoSink>) {
        self.sink = Some(sink);
        if let Some(video) = self.video.as_mut() {
            video.set_output(self.sink.clone());
        }
    }

    fn update_audio_sending(&mut self) {
        let sending = self.connected.load(Ordering::SeqCst) && !self.mute_outgoing_audio;
        self.audio.set_sending(sending);
    }

    fn compute_is_sending_video(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
            && self.outgoing_format.is_some()
            && self.remote_requested_video
            && self.capture.is_some()
    }

    fn update_video_sending(&mut self) {
        let sending = self.compute_is_sending_video();
        if sending == self.is_sending_video {
            return;
        }
        self.is_sending_video = sending;
        if let Some(video) = self.video.as_mut() {
            video.set_sending(sending);
        }
        info!(
            "Outgoing video {}",
            if sending { "started" } else { "stopped" }
        );
        (self.send_transport)(Message::RemoteVideoIsActive { active: sending });
    }

    fn set_peer_video_formats(&mut self, formats: Vec<VideoFormat>, encoders_count: u8) {
        if self.peer_formats_received {
            debug!("Peer video formats already received");
            return;
        }
        self.peer_formats_received = true;
        debug!(
            "Peer offers {} video format(s), {} encodable",
            formats.len(),
            encoders_count
        );

        self.outgoing_format =
            select_outgoing_format(&self.local_formats, self.local_encoders, &formats);
        match self.outgoing_format.clone() {
            Some(format) => {
                info!("Negotiated outgoing video codec {}", format.name);
                let interface =
                    MediaInterface::new(true, self.connected.clone(), self.send_transport.clone());
                let mut channel =
                    self.engine
                        .create_video_channel(format, self.video_ssrc, interface);
                channel.set_capture(self.capture.clone());
                channel.set_output(self.sink.clone());
                self.video = Some(channel);
            }
            None => warn!("No common video codec; session is audio only"),
        }
        let _ = self
            .events
            .send(MediaEvent::VideoNegotiated(self.outgoing_format.clone()));
        self.update_video_sending();
    }

    fn receive_message(&mut self, decrypted: DecryptedMessage) {
        match decrypted.message {
            Message::VideoFormats {
                formats,
                encoders_count,
            } => self.set_peer_video_formats(formats, encoders_count),
            Message::AudioData { data } => self.audio.receive_packet(&data),
            Message::VideoData { data } => match self.video.as_mut() {
                Some(video) => video.receive_packet(&data),
                None => debug!("Video data before negotiation, dropping"),
            },
            Message::RequestVideo => {
                if !self.remote_requested_video {
                    info!("Peer requested video");
                }
                self.remote_requested_video = true;
                self.update_video_sending();
            }
            Message::RemoteVideoIsActive { active } => {
                let _ = self
                    .events
                    .send(MediaEvent::RemoteVideoIsActiveUpdated(active));
            }
            Message::CandidatesList { .. } | Message::UnstructuredData { .. } => {
                debug!("Unexpected message on the media path");
            }
        }
    }
}

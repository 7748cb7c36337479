//! Shared fixtures for the integration tests
//!
//! An in-memory transport pair with a controllable link, a probe media
//! engine that records what the call core asks of it, and helpers to wire
//! two managers together over piped signaling.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use parley::media::{MediaChannel, MediaEngine, MediaInterface, SsrcSet, VideoCapture};
use parley::network::{IceEvent, IceState, IceTransport, IceTransportFactory};
use parley::protocol::IceCandidate;
use parley::{Descriptor, EncryptionKey, Manager, State, VideoFormat, VideoState};

/// Deterministic session secret shared by both endpoints
pub fn session_secret() -> [u8; 256] {
    let mut secret = [0u8; 256];
    for (i, byte) in secret.iter_mut().enumerate() {
        *byte = (i as u8).wrapping_mul(7).wrapping_add(3);
    }
    secret
}

#[derive(Clone, Copy, PartialEq)]
enum Side {
    A,
    B,
}

#[derive(Default)]
struct LinkShared {
    up: AtomicBool,
    a_events: Mutex<Option<mpsc::UnboundedSender<IceEvent>>>,
    b_events: Mutex<Option<mpsc::UnboundedSender<IceEvent>>>,
    a_remote: Mutex<Vec<IceCandidate>>,
    b_remote: Mutex<Vec<IceCandidate>>,
    last_a_packet: Mutex<Option<Vec<u8>>>,
}

impl LinkShared {
    fn events_of(&self, side: Side) -> Option<mpsc::UnboundedSender<IceEvent>> {
        let slot = match side {
            Side::A => &self.a_events,
            Side::B => &self.b_events,
        };
        slot.lock().unwrap().clone()
    }
}

/// Test control over the in-memory "network" between the two transports
pub struct LinkControl {
    shared: Arc<LinkShared>,
}

impl LinkControl {
    /// Bring the link up or down; both sides observe the transition
    pub fn set_up(&self, up: bool) {
        self.shared.up.store(up, Ordering::SeqCst);
        let state = if up {
            IceState::Connected
        } else {
            IceState::Disconnected
        };
        for side in [Side::A, Side::B] {
            if let Some(events) = self.shared.events_of(side) {
                let _ = events.send(IceEvent::StateChanged(state));
            }
        }
    }

    /// Candidates the A side received from its peer
    pub fn remote_candidates_at_a(&self) -> Vec<IceCandidate> {
        self.shared.a_remote.lock().unwrap().clone()
    }

    /// Candidates the B side received from its peer
    pub fn remote_candidates_at_b(&self) -> Vec<IceCandidate> {
        self.shared.b_remote.lock().unwrap().clone()
    }

    /// Re-deliver A's most recent transport packet to B, as a network-level
    /// replay would
    pub fn replay_last_a_packet(&self) {
        let last = self.shared.last_a_packet.lock().unwrap().clone();
        if let (Some(bytes), Some(events)) = (last, self.shared.events_of(Side::B)) {
            let _ = events.send(IceEvent::PacketReceived(bytes));
        }
    }
}

struct InMemoryTransport {
    side: Side,
    shared: Arc<LinkShared>,
}

impl InMemoryTransport {
    fn fake_host_candidate(side: Side) -> IceCandidate {
        let addr = match side {
            Side::A => "10.0.0.1:41000",
            Side::B => "10.0.0.2:42000",
        };
        IceCandidate::host(addr.parse().unwrap())
    }
}

impl IceTransport for InMemoryTransport {
    fn start_gathering(&mut self) {
        if let Some(events) = self.shared.events_of(self.side) {
            let _ = events.send(IceEvent::CandidateGathered(Self::fake_host_candidate(
                self.side,
            )));
        }
    }

    fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        let slot = match self.side {
            Side::A => &self.shared.a_remote,
            Side::B => &self.shared.b_remote,
        };
        slot.lock().unwrap().push(candidate);

        // Knowing a remote candidate while the link is up means connectivity
        if self.shared.up.load(Ordering::SeqCst) {
            if let Some(events) = self.shared.events_of(self.side) {
                let _ = events.send(IceEvent::StateChanged(IceState::Connected));
            }
        }
    }

    fn send_packet(&mut self, bytes: &[u8]) {
        if self.side == Side::A {
            *self.shared.last_a_packet.lock().unwrap() = Some(bytes.to_vec());
        }
        if !self.shared.up.load(Ordering::SeqCst) {
            return;
        }
        let peer = match self.side {
            Side::A => Side::B,
            Side::B => Side::A,
        };
        if let Some(events) = self.shared.events_of(peer) {
            let _ = events.send(IceEvent::PacketReceived(bytes.to_vec()));
        }
    }
}

/// Build a linked pair of in-memory transport factories
pub fn transport_pair() -> (IceTransportFactory, IceTransportFactory, LinkControl) {
    let shared = Arc::new(LinkShared {
        up: AtomicBool::new(true),
        ..LinkShared::default()
    });

    let factory = |side: Side, shared: Arc<LinkShared>| -> IceTransportFactory {
        Box::new(move |_config, events| {
            let slot = match side {
                Side::A => &shared.a_events,
                Side::B => &shared.b_events,
            };
            *slot.lock().unwrap() = Some(events);
            Box::new(InMemoryTransport { side, shared })
        })
    };

    (
        factory(Side::A, shared.clone()),
        factory(Side::B, shared.clone()),
        LinkControl { shared },
    )
}

/// What the call core asked of the media engine
#[derive(Default)]
pub struct MediaProbe {
    pub audio_received: Mutex<Vec<Vec<u8>>>,
    pub audio_interface: Mutex<Option<MediaInterface>>,
    pub audio_sending: Mutex<Option<bool>>,
    pub video_codec: Mutex<Option<VideoFormat>>,
    pub video_sending: Mutex<Option<bool>>,
}

struct ProbeChannel {
    probe: Arc<MediaProbe>,
    is_video: bool,
}

impl MediaChannel for ProbeChannel {
    fn set_sending(&mut self, sending: bool) {
        let slot = if self.is_video {
            &self.probe.video_sending
        } else {
            &self.probe.audio_sending
        };
        *slot.lock().unwrap() = Some(sending);
    }

    fn receive_packet(&mut self, data: &[u8]) {
        if !self.is_video {
            self.probe.audio_received.lock().unwrap().push(data.to_vec());
        }
    }
}

struct ProbeEngine {
    formats: Vec<VideoFormat>,
    encoders: u8,
    probe: Arc<MediaProbe>,
}

impl MediaEngine for ProbeEngine {
    fn supported_video_formats(&self) -> (Vec<VideoFormat>, u8) {
        (self.formats.clone(), self.encoders)
    }

    fn create_audio_channel(
        &mut self,
        _ssrc: SsrcSet,
        interface: MediaInterface,
    ) -> Box<dyn MediaChannel> {
        *self.probe.audio_interface.lock().unwrap() = Some(interface);
        Box::new(ProbeChannel {
            probe: self.probe.clone(),
            is_video: false,
        })
    }

    fn create_video_channel(
        &mut self,
        codec: VideoFormat,
        _ssrc: SsrcSet,
        _interface: MediaInterface,
    ) -> Box<dyn MediaChannel> {
        *self.probe.video_codec.lock().unwrap() = Some(codec);
        Box::new(ProbeChannel {
            probe: self.probe.clone(),
            is_video: true,
        })
    }
}

pub fn probe_engine(formats: &[&str], encoders: u8) -> (Box<dyn MediaEngine>, Arc<MediaProbe>) {
    let probe = Arc::new(MediaProbe::default());
    let engine = ProbeEngine {
        formats: formats.iter().copied().map(VideoFormat::new).collect(),
        encoders,
        probe: probe.clone(),
    };
    (Box::new(engine), probe)
}

pub struct NullCapture;
impl VideoCapture for NullCapture {}

/// One wired endpoint and everything its callbacks recorded
pub struct Endpoint {
    pub manager: Arc<Manager>,
    pub states: Arc<Mutex<Vec<(State, VideoState)>>>,
    pub remote_video: Arc<Mutex<Vec<bool>>>,
    pub probe: Arc<MediaProbe>,
    pub signaling_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

pub fn endpoint(
    is_outgoing: bool,
    formats: &[&str],
    encoders: u8,
    transport_factory: IceTransportFactory,
    connect_timeout: Duration,
) -> Endpoint {
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (media_engine, probe) = probe_engine(formats, encoders);
    let states: Arc<Mutex<Vec<(State, VideoState)>>> = Arc::new(Mutex::new(Vec::new()));
    let remote_video: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));

    let manager = Manager::new(Descriptor {
        encryption_key: EncryptionKey::new(session_secret(), is_outgoing),
        rtc_servers: Vec::new(),
        enable_p2p: true,
        enable_flexfec: true,
        video_capture: None,
        connect_timeout,
        media_engine,
        transport_factory,
        state_updated: Box::new({
            let states = states.clone();
            move |state, video_state| states.lock().unwrap().push((state, video_state))
        }),
        signaling_data_emitted: Box::new(move |bytes| {
            let _ = signal_tx.send(bytes);
        }),
        remote_video_is_active_updated: Box::new({
            let remote_video = remote_video.clone();
            move |active| remote_video.lock().unwrap().push(active)
        }),
    });

    Endpoint {
        manager: Arc::new(manager),
        states,
        remote_video,
        probe,
        signaling_rx: Some(signal_rx),
    }
}

/// Forward signaling bytes into a manager, dropping frames the filter
/// rejects
pub fn pipe_signaling(
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    target: Arc<Manager>,
    mut keep: impl FnMut(&[u8]) -> bool + Send + 'static,
) {
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if keep(&bytes) {
                target.receive_signaling_data(bytes);
            }
        }
    });
}

/// Poll until the condition holds
pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let result = timeout(Duration::from_secs(10), async {
        loop {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for: {}", what);
}

/// Poll until some recorded state matches
pub async fn wait_for_state(
    states: &Arc<Mutex<Vec<(State, VideoState)>>>,
    what: &str,
    pred: impl Fn(&[(State, VideoState)]) -> bool,
) {
    let states = states.clone();
    eventually(what, move || pred(&states.lock().unwrap())).await;
}

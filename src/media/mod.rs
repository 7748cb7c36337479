//! Media layer: engine seams and the media peer
//!
//! Concrete encoders, decoders, capture, and rendering live outside this
//! crate. The peer drives them through the traits defined here and routes
//! their packets onto the encrypted transport channel.

mod formats;
mod peer;

pub use formats::{common_formats, select_outgoing_format};
pub use peer::{MediaEvent, MediaPeer};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::protocol::{Message, VideoFormat};

/// RTP stream identifiers for one media kind
///
/// FEC identifiers are zero when forward error correction is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SsrcSet {
    pub incoming: u32,
    pub outgoing: u32,
    pub fec_incoming: u32,
    pub fec_outgoing: u32,
}

fn random_nonzero() -> u32 {
    loop {
        let value: u32 = rand::random();
        if value != 0 {
            return value;
        }
    }
}

impl SsrcSet {
    /// Draw random nonzero identifiers for a session
    pub fn generate(with_fec: bool) -> Self {
        Self {
            incoming: random_nonzero(),
            outgoing: random_nonzero(),
            fec_incoming: if with_fec { random_nonzero() } else { 0 },
            fec_outgoing: if with_fec { random_nonzero() } else { 0 },
        }
    }
}

/// Opaque handle to a camera or screen source
pub trait VideoCapture: Send + Sync {}

/// Opaque handle to a frame renderer
pub trait VideoSink: Send + Sync {}

/// One send+receive channel inside the media engine
pub trait MediaChannel: Send {
    /// Start or stop producing outgoing packets
    fn set_sending(&mut self, sending: bool);

    /// Inject one received packet into the channel
    fn receive_packet(&mut self, data: &[u8]);

    /// Attach or detach the frame source (video channels)
    fn set_capture(&mut self, capture: Option<Arc<dyn VideoCapture>>) {
        let _ = capture;
    }

    /// Attach the frame renderer (video channels)
    fn set_output(&mut self, sink: Option<Arc<dyn VideoSink>>) {
        let _ = sink;
    }
}

/// Factory for the engine-side media stack
pub trait MediaEngine: Send {
    /// Locally supported video formats; the first `encoders_count` entries
    /// are those the engine can encode
    fn supported_video_formats(&self) -> (Vec<VideoFormat>, u8);

    /// Create the always-present audio channel
    fn create_audio_channel(
        &mut self,
        ssrc: SsrcSet,
        interface: MediaInterface,
    ) -> Box<dyn MediaChannel>;

    /// Create the video channel once an outgoing codec is negotiated
    fn create_video_channel(
        &mut self,
        codec: VideoFormat,
        ssrc: SsrcSet,
        interface: MediaInterface,
    ) -> Box<dyn MediaChannel>;
}

/// Where engine channels write their outgoing RTP and RTCP packets
///
/// Wraps the bytes in the matching data message and hands them to the
/// transport path. Packets are dropped while the call is disconnected, so
/// no media frame reaches the network layer before connectivity.
#[derive(Clone)]
pub struct MediaInterface {
    is_video: bool,
    connected: Arc<AtomicBool>,
    send_transport: Arc<dyn Fn(Message) + Send + Sync>,
}

impl MediaInterface {
    pub(crate) fn new(
        is_video: bool,
        connected: Arc<AtomicBool>,
        send_transport: Arc<dyn Fn(Message) + Send + Sync>,
    ) -> Self {
        Self {
            is_video,
            connected,
            send_transport,
        }
    }

    fn send(&self, data: &[u8]) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            trace!("Dropping media packet while disconnected");
            return false;
        }
        let data = data.to_vec();
        let message = if self.is_video {
            Message::VideoData { data }
        } else {
            Message::AudioData { data }
        };
        (self.send_transport)(message);
        true
    }

    /// Send one RTP packet; `false` when gated off
    pub fn send_packet(&self, data: &[u8]) -> bool {
        self.send(data)
    }

    /// Send one RTCP packet, multiplexed onto the same flow
    pub fn send_rtcp(&self, data: &[u8]) -> bool {
        self.send(data)
    }
}

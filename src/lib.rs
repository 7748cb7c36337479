//! parley - Peer-to-peer encrypted voice and video calls
//!
//! This library provides the call-control core: a tagged binary message
//! codec, an encrypted framed connection with replay protection and
//! retransmission, ICE-driven connectivity at a contract level, media
//! routing with codec negotiation, and the call manager tying them
//! together. Signaling delivery, codecs, capture, and rendering are the
//! embedder's.

pub mod call;
pub mod media;
pub mod network;
pub mod protocol;

pub use call::{Descriptor, Manager, State, VideoState};
pub use network::{EncryptionKey, RtcServer, UdpIceTransport};
pub use protocol::{IceCandidate, Message, VideoFormat};

//! Network layer for the call
//!
//! Frame encryption, replay protection, the encrypted connection used by
//! both the signaling and transport channels, the ICE transport contract,
//! and the network peer that ties them together.

mod connection;
mod encryption;
mod error;
mod ice;
mod peer;
mod replay;
mod stun;
mod udp;

pub use connection::{
    ConnectionType, DecryptedMessage, DecryptedPacket, EncryptedConnection, PreparedPacket,
    RequestService, ServiceCause,
};
pub use encryption::{EncryptionKey, MESSAGE_KEY_SIZE, SESSION_KEY_SIZE};
pub use error::NetworkError;
pub use ice::{
    default_rtc_servers, IceConfig, IceCredentials, IceEvent, IceState, IceTransport,
    IceTransportFactory, RtcServer,
};
pub use peer::{NetworkEvent, NetworkPeer};
pub use replay::ReplayWindow;
pub use udp::{TransportStats, UdpIceTransport};

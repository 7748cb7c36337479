//! Network error types

use thiserror::Error;

/// Errors that can occur in the network subsystem
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Malformed packet")]
    MalformedPacket,

    #[error("Invalid key material")]
    InvalidKey,

    #[error("STUN failed: {0}")]
    StunFailed(String),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Not connected")]
    NotConnected,
}

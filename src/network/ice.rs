//! ICE transport contract and configuration
//!
//! The connectivity engine itself is a collaborator: implementations own
//! sockets and relay allocations, gather candidates, and run connectivity
//! checks. The call core only needs the surface defined here: candidates
//! in and out, connectivity state changes, and raw packet exchange.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::protocol::IceCandidate;

/// A STUN or TURN server the call may use
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtcServer {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub is_turn: bool,
}

/// Servers used when the caller supplies none
pub fn default_rtc_servers() -> Vec<RtcServer> {
    vec![
        RtcServer {
            host: "134.122.52.178".to_string(),
            port: 3478,
            username: String::new(),
            password: String::new(),
            is_turn: false,
        },
        RtcServer {
            host: "134.122.52.178".to_string(),
            port: 3478,
            username: "openrelay".to_string(),
            password: "openrelay".to_string(),
            is_turn: true,
        },
    ]
}

/// Fixed ICE credentials
///
/// Both pairs are known to both sides, so each endpoint can pre-compute the
/// remote credentials without an extra signaling exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: &'static str,
    pub pwd: &'static str,
}

const OUTGOING_CREDENTIALS: IceCredentials = IceCredentials {
    ufrag: "gcp3",
    pwd: "zWDKozH8/3JWt8he3M/CMj5R",
};

const INCOMING_CREDENTIALS: IceCredentials = IceCredentials {
    ufrag: "acp3",
    pwd: "aWDKozH8/3JWt8he3M/CMj5R",
};

impl IceCredentials {
    /// Credentials this side authenticates with
    pub fn local(is_outgoing: bool) -> IceCredentials {
        if is_outgoing {
            OUTGOING_CREDENTIALS
        } else {
            INCOMING_CREDENTIALS
        }
    }

    /// Credentials expected from the peer
    pub fn remote(is_outgoing: bool) -> IceCredentials {
        Self::local(!is_outgoing)
    }
}

/// Connectivity state reported by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
}

impl IceState {
    /// Whether data can flow in this state
    pub fn is_ready_to_send(self) -> bool {
        matches!(self, IceState::Connected | IceState::Completed)
    }
}

/// Events a transport posts into the network context
#[derive(Debug)]
pub enum IceEvent {
    /// A new local candidate; may arrive at any time (continual gathering)
    CandidateGathered(IceCandidate),
    StateChanged(IceState),
    PacketReceived(Vec<u8>),
}

/// Role and server configuration handed to a transport implementation
#[derive(Debug, Clone)]
pub struct IceConfig {
    /// The initiator is ICE-controlling, the responder controlled
    pub is_outgoing: bool,
    /// When false, host and server-reflexive paths are disabled and only
    /// relayed connectivity remains
    pub enable_p2p: bool,
    pub servers: Vec<RtcServer>,
}

impl IceConfig {
    /// Build a config, falling back to the built-in server list when
    /// `servers` is empty
    pub fn new(is_outgoing: bool, enable_p2p: bool, servers: Vec<RtcServer>) -> Self {
        let servers = if servers.is_empty() {
            default_rtc_servers()
        } else {
            servers
        };
        Self {
            is_outgoing,
            enable_p2p,
            servers,
        }
    }

    pub fn local_credentials(&self) -> IceCredentials {
        IceCredentials::local(self.is_outgoing)
    }

    pub fn remote_credentials(&self) -> IceCredentials {
        IceCredentials::remote(self.is_outgoing)
    }
}

/// The connectivity engine seam
///
/// All calls happen on the network context; implementations post their
/// events into the channel received at construction.
pub trait IceTransport: Send {
    /// Begin candidate gathering; gathering continues for the session
    fn start_gathering(&mut self);

    /// Feed one candidate learned from the peer over signaling
    fn add_remote_candidate(&mut self, candidate: IceCandidate);

    /// Write one framed packet to the selected path
    fn send_packet(&mut self, bytes: &[u8]);
}

/// Builds a transport wired to the given event sender
pub type IceTransportFactory =
    Box<dyn FnOnce(IceConfig, mpsc::UnboundedSender<IceEvent>) -> Box<dyn IceTransport> + Send>;

//! ICE candidate model and its SDP-style text form
//!
//! Candidates cross the signaling channel as one text line each:
//!
//! ```text
//! candidate:<foundation> <component> <proto> <priority> <ip> <port> typ <kind>
//!     [raddr <ip> rport <port>] [username <u> password <p>]
//! ```

use std::net::{IpAddr, SocketAddr};

/// How a candidate address was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    /// Local interface address
    Host,
    /// Public mapping learned from a STUN server
    ServerReflexive,
    /// Address allocated on a TURN relay
    Relay,
}

impl CandidateKind {
    fn as_sdp(self) -> &'static str {
        match self {
            CandidateKind::Host => "host",
            CandidateKind::ServerReflexive => "srflx",
            CandidateKind::Relay => "relay",
        }
    }

    fn from_sdp(token: &str) -> Option<Self> {
        match token {
            "host" => Some(CandidateKind::Host),
            "srflx" => Some(CandidateKind::ServerReflexive),
            "relay" => Some(CandidateKind::Relay),
            _ => None,
        }
    }

    /// RFC 5245 type preference used in priority computation
    fn type_preference(self) -> u32 {
        match self {
            CandidateKind::Host => 126,
            CandidateKind::ServerReflexive => 100,
            CandidateKind::Relay => 0,
        }
    }
}

/// Credentials for a relay-allocated candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnCredentials {
    pub username: String,
    pub password: String,
}

/// A transport address one peer offers for connectivity checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub foundation: String,
    pub component: u16,
    pub protocol: String,
    pub priority: u32,
    pub address: SocketAddr,
    pub kind: CandidateKind,
    /// Base address behind a reflexive or relayed candidate
    pub related_address: Option<SocketAddr>,
    pub turn: Option<TurnCredentials>,
}

fn compute_priority(kind: CandidateKind, address: &SocketAddr, component: u16) -> u32 {
    // IPv6 slightly preferred over IPv4 within the same type
    let local_pref: u32 = if address.is_ipv6() { 65535 } else { 65534 };
    (kind.type_preference() << 24) | (local_pref << 8) | (256 - component as u32)
}

impl IceCandidate {
    /// Create a host candidate for a local interface address
    pub fn host(address: SocketAddr) -> Self {
        Self {
            foundation: "1".to_string(),
            component: 1,
            protocol: "udp".to_string(),
            priority: compute_priority(CandidateKind::Host, &address, 1),
            address,
            kind: CandidateKind::Host,
            related_address: None,
            turn: None,
        }
    }

    /// Create a server-reflexive candidate from a STUN mapping
    pub fn server_reflexive(address: SocketAddr, base: SocketAddr) -> Self {
        Self {
            foundation: "2".to_string(),
            component: 1,
            protocol: "udp".to_string(),
            priority: compute_priority(CandidateKind::ServerReflexive, &address, 1),
            address,
            kind: CandidateKind::ServerReflexive,
            related_address: Some(base),
            turn: None,
        }
    }

    /// Create a relay candidate for a TURN allocation
    pub fn relay(address: SocketAddr, base: SocketAddr, turn: TurnCredentials) -> Self {
        Self {
            foundation: "3".to_string(),
            component: 1,
            protocol: "udp".to_string(),
            priority: compute_priority(CandidateKind::Relay, &address, 1),
            address,
            kind: CandidateKind::Relay,
            related_address: Some(base),
            turn: Some(turn),
        }
    }

    /// Serialize to the wire text line
    pub fn to_sdp(&self) -> String {
        let mut line = format!(
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.protocol,
            self.priority,
            self.address.ip(),
            self.address.port(),
            self.kind.as_sdp(),
        );
        if let Some(related) = self.related_address {
            line.push_str(&format!(" raddr {} rport {}", related.ip(), related.port()));
        }
        if let Some(ref turn) = self.turn {
            line.push_str(&format!(
                " username {} password {}",
                turn.username, turn.password
            ));
        }
        line
    }

    /// Parse the wire text line; `None` on any malformed field
    pub fn from_sdp(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();

        let first = tokens.next()?;
        let foundation = first.strip_prefix("candidate:")?.to_string();
        if foundation.is_empty() {
            return None;
        }

        let component: u16 = tokens.next()?.parse().ok()?;
        let protocol = tokens.next()?.to_ascii_lowercase();
        let priority: u32 = tokens.next()?.parse().ok()?;
        let ip: IpAddr = tokens.next()?.parse().ok()?;
        let port: u16 = tokens.next()?.parse().ok()?;

        if tokens.next()? != "typ" {
            return None;
        }
        let kind = CandidateKind::from_sdp(tokens.next()?)?;

        let mut related_ip: Option<IpAddr> = None;
        let mut related_port: Option<u16> = None;
        let mut username: Option<String> = None;
        let mut password: Option<String> = None;

        while let Some(key) = tokens.next() {
            let value = tokens.next()?;
            match key {
                "raddr" => related_ip = Some(value.parse().ok()?),
                "rport" => related_port = Some(value.parse().ok()?),
                "username" => username = Some(value.to_string()),
                "password" => password = Some(value.to_string()),
                // Unknown extension attributes are skipped
                _ => {}
            }
        }

        let related_address = match (related_ip, related_port) {
            (Some(ip), Some(port)) => Some(SocketAddr::new(ip, port)),
            (None, None) => None,
            _ => return None,
        };
        let turn = match (username, password) {
            (Some(username), Some(password)) => Some(TurnCredentials { username, password }),
            (None, None) => None,
            _ => return None,
        };

        Some(Self {
            foundation,
            component,
            protocol,
            priority,
            address: SocketAddr::new(ip, port),
            kind,
            related_address,
            turn,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_candidate_roundtrip() {
        let candidate = IceCandidate::host("192.168.1.100:5000".parse().unwrap());
        let line = candidate.to_sdp();
        let parsed = IceCandidate::from_sdp(&line).expect("Failed to parse");
        assert_eq!(parsed, candidate);
    }

    #[test]
    fn test_ipv6_host_candidate_roundtrip() {
        let candidate = IceCandidate::host("[2001:db8::1]:5000".parse().unwrap());
        let parsed = IceCandidate::from_sdp(&candidate.to_sdp()).unwrap();
        assert_eq!(parsed, candidate);
    }

    #[test]
    fn test_server_reflexive_roundtrip() {
        let candidate = IceCandidate::server_reflexive(
            "203.0.113.50:40000".parse().unwrap(),
            "192.168.1.100:5000".parse().unwrap(),
        );
        let parsed = IceCandidate::from_sdp(&candidate.to_sdp()).unwrap();
        assert_eq!(parsed, candidate);
        assert_eq!(parsed.kind, CandidateKind::ServerReflexive);
    }

    #[test]
    fn test_relay_roundtrip_with_credentials() {
        let candidate = IceCandidate::relay(
            "198.51.100.7:3478".parse().unwrap(),
            "192.168.1.100:5000".parse().unwrap(),
            TurnCredentials {
                username: "openrelay".to_string(),
                password: "openrelay".to_string(),
            },
        );
        let parsed = IceCandidate::from_sdp(&candidate.to_sdp()).unwrap();
        assert_eq!(parsed, candidate);
    }

    #[test]
    fn test_priority_ordering() {
        let host = IceCandidate::host("192.168.1.100:5000".parse().unwrap());
        let srflx = IceCandidate::server_reflexive(
            "203.0.113.50:40000".parse().unwrap(),
            "192.168.1.100:5000".parse().unwrap(),
        );
        let relay = IceCandidate::relay(
            "198.51.100.7:3478".parse().unwrap(),
            "192.168.1.100:5000".parse().unwrap(),
            TurnCredentials {
                username: "u".to_string(),
                password: "p".to_string(),
            },
        );

        assert!(host.priority > srflx.priority);
        assert!(srflx.priority > relay.priority);

        let host_v6 = IceCandidate::host("[2001:db8::1]:5000".parse().unwrap());
        assert!(host_v6.priority > host.priority);
    }

    #[test]
    fn test_parse_external_line() {
        let line = "candidate:842163049 1 udp 1677729535 203.0.113.9 46000 typ srflx raddr 10.0.0.2 rport 46000";
        let parsed = IceCandidate::from_sdp(line).unwrap();
        assert_eq!(parsed.foundation, "842163049");
        assert_eq!(parsed.priority, 1677729535);
        assert_eq!(parsed.address, "203.0.113.9:46000".parse().unwrap());
        assert_eq!(parsed.related_address, Some("10.0.0.2:46000".parse().unwrap()));
    }

    #[test]
    fn test_malformed_lines_rejected() {
        assert!(IceCandidate::from_sdp("").is_none());
        assert!(IceCandidate::from_sdp("candidate:").is_none());
        assert!(IceCandidate::from_sdp("candidate:1 1 udp notanumber 1.2.3.4 5 typ host").is_none());
        assert!(IceCandidate::from_sdp("candidate:1 1 udp 100 1.2.3.4 5 typ floating").is_none());
        assert!(IceCandidate::from_sdp("candidate:1 1 udp 100 1.2.3.4 5 typ host raddr 1.2.3.4").is_none());
        assert!(IceCandidate::from_sdp("candidate:1 1 udp 100 1.2.3.4 99999 typ host").is_none());
    }
}

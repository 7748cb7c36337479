//! Direct UDP transport with candidate gathering and liveness probing
//!
//! The default [`IceTransport`]: a socket task that gathers host and
//! server-reflexive candidates, probes remote candidates with keepalives,
//! and exchanges framed packets over the selected path. TCP paths are never
//! offered. TURN allocation is left to embedder-provided transports, so with
//! P2P disabled this transport gathers no candidates at all.
//!
//! Probes carry the sender's fixed ICE ufrag; a probe with an unexpected
//! ufrag (wrong role, or our own reflected back) is ignored.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, error, info, trace, warn};

use crate::network::error::NetworkError;
use crate::network::ice::{IceConfig, IceEvent, IceState, IceTransport, IceTransportFactory};
use crate::network::stun;
use crate::protocol::IceCandidate;

const PROBE_MAGIC: &[u8; 8] = b"parley/p";
const PROBE_PING: u8 = 0x01;
const PROBE_PONG: u8 = 0x02;
/// magic + kind + 4-byte ufrag
const PROBE_SIZE: usize = 13;

const PROBE_INTERVAL: Duration = Duration::from_secs(1);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct StatsCounters {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// Transport statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

enum Command {
    Gather,
    AddRemote(IceCandidate),
    Send(Vec<u8>),
}

/// Handle to the socket task; implements the transport contract
pub struct UdpIceTransport {
    commands: mpsc::UnboundedSender<Command>,
    stats: Arc<StatsCounters>,
    local_addr: SocketAddr,
}

impl UdpIceTransport {
    /// Bind a socket and spawn the transport task
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(
        bind_addr: &str,
        config: IceConfig,
        events: mpsc::UnboundedSender<IceEvent>,
    ) -> Result<Self, NetworkError> {
        let socket = bind_socket(bind_addr)?;
        let local_addr = socket.local_addr()?;
        info!("UDP transport bound to {}", local_addr);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(StatsCounters::default());

        let task = Task {
            config,
            events,
            stats: stats.clone(),
            remote_candidates: Vec::new(),
            selected: None,
            last_heard: None,
            state: IceState::New,
            pending_stun: HashMap::new(),
            gathered: Vec::new(),
        };
        tokio::spawn(task.run(socket, command_rx));

        Ok(Self {
            commands: command_tx,
            stats,
            local_addr,
        })
    }

    /// Transport factory for a manager descriptor
    pub fn factory(bind_addr: &str) -> IceTransportFactory {
        let bind_addr = bind_addr.to_string();
        Box::new(move |config, events| {
            match UdpIceTransport::bind(&bind_addr, config, events.clone()) {
                Ok(transport) => Box::new(transport),
                Err(err) => {
                    error!("Failed to bind UDP transport on {}: {}", bind_addr, err);
                    let _ = events.send(IceEvent::StateChanged(IceState::Failed));
                    Box::new(FailedTransport)
                }
            }
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            packets_sent: self.stats.packets_sent.load(Ordering::Relaxed),
            packets_received: self.stats.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
        }
    }
}

impl IceTransport for UdpIceTransport {
    fn start_gathering(&mut self) {
        let _ = self.commands.send(Command::Gather);
    }

    fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        let _ = self.commands.send(Command::AddRemote(candidate));
    }

    fn send_packet(&mut self, bytes: &[u8]) {
        let _ = self.commands.send(Command::Send(bytes.to_vec()));
    }
}

/// Stand-in returned when binding fails; drops everything
struct FailedTransport;

impl IceTransport for FailedTransport {
    fn start_gathering(&mut self) {}
    fn add_remote_candidate(&mut self, _candidate: IceCandidate) {}
    fn send_packet(&mut self, _bytes: &[u8]) {}
}

/// Bind a UDP socket with SO_REUSEADDR so a call can quickly rebind the
/// port it just released
fn bind_socket(addr: &str) -> Result<UdpSocket, NetworkError> {
    let parsed: SocketAddr = addr.parse()?;
    let domain = if parsed.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&parsed.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

struct Task {
    config: IceConfig,
    events: mpsc::UnboundedSender<IceEvent>,
    stats: Arc<StatsCounters>,
    remote_candidates: Vec<SocketAddr>,
    selected: Option<SocketAddr>,
    last_heard: Option<Instant>,
    state: IceState,
    /// Outstanding STUN transactions by transaction id, with the local base
    /// address each was sent from
    pending_stun: HashMap<[u8; 12], SocketAddr>,
    /// Local candidates already announced
    gathered: Vec<SocketAddr>,
}

impl Task {
    async fn run(
        mut self,
        socket: UdpSocket,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let mut buf = vec![0u8; 2048];
        let mut probe_timer = interval(PROBE_INTERVAL);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    None => break,
                    Some(Command::Gather) => self.gather(&socket).await,
                    Some(Command::AddRemote(candidate)) => {
                        self.add_remote(&socket, candidate).await;
                    }
                    Some(Command::Send(bytes)) => self.send_data(&socket, &bytes).await,
                },
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        let data = buf[..len].to_vec();
                        self.handle_datagram(&socket, &data, from).await;
                    }
                    Err(err) => warn!("UDP receive error: {}", err),
                },
                _ = probe_timer.tick() => self.tick(&socket).await,
            }
        }
        debug!("UDP transport task stopped");
    }

    fn set_state(&mut self, state: IceState) {
        if self.state != state {
            debug!("Transport state {:?} -> {:?}", self.state, state);
            self.state = state;
            let _ = self.events.send(IceEvent::StateChanged(state));
        }
    }

    fn announce(&mut self, candidate: IceCandidate) {
        if self.gathered.contains(&candidate.address) {
            return;
        }
        self.gathered.push(candidate.address);
        let _ = self.events.send(IceEvent::CandidateGathered(candidate));
    }

    async fn gather(&mut self, socket: &UdpSocket) {
        if !self.config.enable_p2p {
            warn!("P2P disabled; the UDP transport cannot allocate relays and gathers nothing");
            return;
        }

        let local = match socket.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                warn!("Cannot read local address: {}", err);
                return;
            }
        };

        if local.ip().is_unspecified() {
            // Bound to the wildcard: advertise every usable interface
            match local_ip_address::list_afinet_netifas() {
                Ok(interfaces) => {
                    for (_, ip) in interfaces {
                        if ip.is_loopback() {
                            continue;
                        }
                        self.announce(IceCandidate::host(SocketAddr::new(ip, local.port())));
                    }
                }
                Err(err) => warn!("Interface enumeration failed: {}", err),
            }
        } else {
            self.announce(IceCandidate::host(local));
        }

        // Learn our public mapping from each STUN server; responses come
        // back on the data socket
        for server in self.config.servers.clone() {
            if server.is_turn {
                debug!(
                    "Skipping TURN server {}:{} (relay allocation is delegated)",
                    server.host, server.port
                );
                continue;
            }
            let target = format!("{}:{}", server.host, server.port);
            let resolved = match tokio::net::lookup_host(&target).await {
                Ok(mut addrs) => addrs.next(),
                Err(err) => {
                    warn!("STUN lookup for {} failed: {}", target, err);
                    continue;
                }
            };
            let Some(server_addr) = resolved else {
                continue;
            };

            let transaction_id: [u8; 12] = rand::random();
            self.pending_stun.insert(transaction_id, local);
            if let Err(err) = socket
                .send_to(&stun::binding_request(&transaction_id), server_addr)
                .await
            {
                debug!("STUN request to {} failed: {}", server_addr, err);
                self.pending_stun.remove(&transaction_id);
            }
        }
    }

    async fn add_remote(&mut self, socket: &UdpSocket, candidate: IceCandidate) {
        if !candidate.protocol.eq_ignore_ascii_case("udp") {
            debug!("Ignoring non-UDP candidate {}", candidate.to_sdp());
            return;
        }
        if self.remote_candidates.contains(&candidate.address) {
            return;
        }
        info!("Remote candidate {}", candidate.to_sdp());
        self.remote_candidates.push(candidate.address);

        if self.state == IceState::New {
            self.set_state(IceState::Checking);
        }
        self.send_probe(socket, PROBE_PING, candidate.address).await;
    }

    async fn send_data(&mut self, socket: &UdpSocket, bytes: &[u8]) {
        let Some(addr) = self.selected else {
            trace!("No selected path, dropping {} bytes", bytes.len());
            return;
        };
        match socket.send_to(bytes, addr).await {
            Ok(sent) => {
                self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
            }
            Err(err) => warn!("UDP send to {} failed: {}", addr, err),
        }
    }

    async fn send_probe(&self, socket: &UdpSocket, kind: u8, addr: SocketAddr) {
        let mut probe = Vec::with_capacity(PROBE_SIZE);
        probe.extend_from_slice(PROBE_MAGIC);
        probe.push(kind);
        probe.extend_from_slice(self.config.local_credentials().ufrag.as_bytes());
        if let Err(err) = socket.send_to(&probe, addr).await {
            trace!("Probe to {} failed: {}", addr, err);
        }
    }

    async fn handle_datagram(&mut self, socket: &UdpSocket, data: &[u8], from: SocketAddr) {
        if data.len() == PROBE_SIZE && data.starts_with(PROBE_MAGIC) {
            self.handle_probe(socket, data, from).await;
            return;
        }

        if let Some(transaction_id) = stun::response_transaction_id(data) {
            self.handle_stun_response(data, transaction_id);
            return;
        }

        self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_received
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        let _ = self.events.send(IceEvent::PacketReceived(data.to_vec()));
    }

    async fn handle_probe(&mut self, socket: &UdpSocket, data: &[u8], from: SocketAddr) {
        let expected = self.config.remote_credentials().ufrag.as_bytes();
        if &data[9..PROBE_SIZE] != expected {
            debug!("Ignoring probe with unexpected ufrag from {}", from);
            return;
        }

        if !self.remote_candidates.contains(&from) {
            // A path the peer never signaled: peer-reflexive
            debug!("Learned peer-reflexive candidate {}", from);
            self.remote_candidates.push(from);
        }

        self.last_heard = Some(Instant::now());
        if data[8] == PROBE_PING {
            self.send_probe(socket, PROBE_PONG, from).await;
        }
        if self.selected != Some(from) {
            info!("Selected path {}", from);
        }
        self.selected = Some(from);
        self.set_state(IceState::Connected);
    }

    fn handle_stun_response(&mut self, data: &[u8], transaction_id: [u8; 12]) {
        let Some(base) = self.pending_stun.remove(&transaction_id) else {
            trace!("Unsolicited STUN response");
            return;
        };
        match stun::mapped_address(data, &transaction_id) {
            Ok(mapped) => {
                info!("STUN mapped address {}", mapped);
                if mapped != base {
                    self.announce(IceCandidate::server_reflexive(mapped, base));
                }
            }
            Err(err) => debug!("Bad STUN response: {}", err),
        }
    }

    async fn tick(&mut self, socket: &UdpSocket) {
        if let (IceState::Connected, Some(heard)) = (self.state, self.last_heard) {
            if heard.elapsed() > DISCONNECT_TIMEOUT {
                warn!("No traffic for {:?}, path lost", DISCONNECT_TIMEOUT);
                self.selected = None;
                self.set_state(IceState::Disconnected);
            }
        }

        match self.selected {
            Some(addr) => self.send_probe(socket, PROBE_PING, addr).await,
            None => {
                for addr in self.remote_candidates.clone() {
                    self.send_probe(socket, PROBE_PING, addr).await;
                }
            }
        }
    }
}

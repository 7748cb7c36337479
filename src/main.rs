//! parley - Peer-to-peer encrypted voice and video calls

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rand::RngCore;
use tokio::sync::mpsc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use parley::media::{MediaChannel, MediaEngine, MediaInterface, SsrcSet};
use parley::protocol::VideoFormat;
use parley::{Descriptor, EncryptionKey, Manager, RtcServer, UdpIceTransport};

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Peer-to-peer encrypted voice and video calls")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run two endpoints against each other over localhost
    Loopback {
        /// How long to keep the call running, in seconds
        #[arg(long, default_value = "10")]
        seconds: u64,

        /// JSON file with a STUN/TURN server list
        #[arg(long)]
        servers: Option<PathBuf>,
    },
}

/// Toy media engine: emits a steady stream of dummy audio frames and counts
/// what arrives
struct ToneEngine {
    received: Arc<AtomicU64>,
}

struct ToneChannel {
    interface: MediaInterface,
    received: Arc<AtomicU64>,
    ticker: Option<tokio::task::JoinHandle<()>>,
}

impl MediaChannel for ToneChannel {
    fn set_sending(&mut self, sending: bool) {
        if sending && self.ticker.is_none() {
            let interface = self.interface.clone();
            self.ticker = Some(tokio::spawn(async move {
                let mut timer = tokio::time::interval(Duration::from_millis(20));
                let mut frame = 0u32;
                loop {
                    timer.tick().await;
                    let mut payload = vec![0u8; 160];
                    payload[..4].copy_from_slice(&frame.to_be_bytes());
                    interface.send_packet(&payload);
                    frame = frame.wrapping_add(1);
                }
            }));
        } else if !sending {
            if let Some(handle) = self.ticker.take() {
                handle.abort();
            }
        }
    }

    fn receive_packet(&mut self, _data: &[u8]) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for ToneChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.ticker.take() {
            handle.abort();
        }
    }
}

impl MediaEngine for ToneEngine {
    fn supported_video_formats(&self) -> (Vec<VideoFormat>, u8) {
        (vec![VideoFormat::new("VP8")], 1)
    }

    fn create_audio_channel(
        &mut self,
        _ssrc: SsrcSet,
        interface: MediaInterface,
    ) -> Box<dyn MediaChannel> {
        Box::new(ToneChannel {
            interface,
            received: self.received.clone(),
            ticker: None,
        })
    }

    fn create_video_channel(
        &mut self,
        _codec: VideoFormat,
        _ssrc: SsrcSet,
        interface: MediaInterface,
    ) -> Box<dyn MediaChannel> {
        Box::new(ToneChannel {
            interface,
            received: self.received.clone(),
            ticker: None,
        })
    }
}

fn endpoint(
    label: &'static str,
    secret: [u8; 256],
    is_outgoing: bool,
    servers: Vec<RtcServer>,
    signaling_out: mpsc::UnboundedSender<Vec<u8>>,
    received: Arc<AtomicU64>,
) -> Manager {
    Manager::new(Descriptor {
        encryption_key: EncryptionKey::new(secret, is_outgoing),
        rtc_servers: servers,
        enable_p2p: true,
        enable_flexfec: true,
        video_capture: None,
        connect_timeout: Duration::from_secs(20),
        media_engine: Box::new(ToneEngine { received }),
        transport_factory: UdpIceTransport::factory("127.0.0.1:0"),
        state_updated: Box::new(move |state, video| {
            info!("[{}] state {:?}, video {:?}", label, state, video);
        }),
        signaling_data_emitted: Box::new(move |bytes| {
            let _ = signaling_out.send(bytes);
        }),
        remote_video_is_active_updated: Box::new(move |active| {
            info!("[{}] remote video active: {}", label, active);
        }),
    })
}

async fn run_loopback(seconds: u64, servers: Vec<RtcServer>) -> Result<()> {
    let mut secret = [0u8; 256];
    rand::thread_rng().fill_bytes(&mut secret);

    let (alice_out, mut alice_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (bob_out, mut bob_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let alice_received = Arc::new(AtomicU64::new(0));
    let bob_received = Arc::new(AtomicU64::new(0));

    let alice = Arc::new(endpoint(
        "alice",
        secret,
        true,
        servers.clone(),
        alice_out,
        alice_received.clone(),
    ));
    let bob = Arc::new(endpoint(
        "bob",
        secret,
        false,
        servers,
        bob_out,
        bob_received.clone(),
    ));

    // Each side's signaling bytes feed the other side's signaling input
    {
        let bob = bob.clone();
        tokio::spawn(async move {
            while let Some(bytes) = alice_rx.recv().await {
                bob.receive_signaling_data(bytes);
            }
        });
    }
    {
        let alice = alice.clone();
        tokio::spawn(async move {
            while let Some(bytes) = bob_rx.recv().await {
                alice.receive_signaling_data(bytes);
            }
        });
    }

    alice.start();
    bob.start();

    tokio::time::sleep(Duration::from_secs(seconds)).await;
    info!(
        "alice received {} frame(s), bob received {} frame(s)",
        alice_received.load(Ordering::Relaxed),
        bob_received.load(Ordering::Relaxed)
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Loopback { seconds, servers } => {
            let servers: Vec<RtcServer> = match servers {
                Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
                None => Vec::new(),
            };
            run_loopback(seconds, servers).await
        }
    }
}

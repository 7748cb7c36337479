//! Encrypted framed connection for the signaling and transport channels
//!
//! Frame plaintext layout:
//!
//! ```text
//! messages | ack_0 .. ack_n-1 (u32 BE each) | ack_count (u8)
//! ```
//!
//! The acknowledgement trailer ends with its count byte so it can be
//! stripped from the tail before the messages region is parsed; the final
//! data payload of a transport frame therefore stays unprefixed. The
//! messages region is one message serialized in single-message framing
//! (transport), one or more messages in length-prefixed framing
//! (signaling), or a bare u32 counter (service frame: acks and keepalive
//! only).
//!
//! Signaling keeps every sent message in an outbox until the peer
//! acknowledges its counter; a scheduled service pass re-sends overdue
//! entries with pacing that grows with the message's age. Transport sends
//! are fire-and-forget. Both directions dedupe inbound counters through a
//! replay window.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::network::encryption::{decrypt_frame, encrypt_frame, EncryptionKey};
use crate::network::replay::ReplayWindow;
use crate::protocol::{deserialize_message, serialize_message, Message, Reader};

/// Which channel a connection frames for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    /// Out-of-band channel delivered by the embedder; reliable via
    /// retransmission
    Signaling,
    /// In-band UDP flow through the ICE transport; best-effort
    Transport,
}

/// Condition a delayed service wakeup should re-evaluate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceCause {
    /// An outbox entry may be due for re-sending
    Retransmit,
    /// Pending acknowledgements should be flushed
    FlushAcks,
}

/// Posts a delayed `(delay_ms, cause)` service wakeup into the context that
/// owns the connection
pub type RequestService = Box<dyn Fn(u64, ServiceCause) + Send>;

/// An encrypted frame ready for the wire
pub struct PreparedPacket {
    pub counter: u32,
    pub bytes: Vec<u8>,
}

/// One authenticated, deduplicated inbound message
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedMessage {
    pub counter: u32,
    pub message: Message,
}

/// All fresh messages carried by one inbound frame
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedPacket {
    pub main: DecryptedMessage,
    pub additional: Vec<DecryptedMessage>,
}

/// A sent signaling message awaiting acknowledgement
struct OutboundFrame {
    counter: u32,
    message: Message,
    first_sent_at: Instant,
    last_sent_at: Instant,
}

/// Unacknowledged messages retained before new sends are refused
const MAX_PENDING: usize = 64;

/// Acknowledgements carried per frame (trailer count is a u8)
const MAX_ACKS_PER_FRAME: usize = 255;

/// Bounds of the retransmission pacing interval
const MIN_RESEND_INTERVAL: Duration = Duration::from_millis(300);
const MAX_RESEND_INTERVAL: Duration = Duration::from_secs(8);

/// Delay before a service frame flushes pending acknowledgements
const ACK_FLUSH_DELAY_MS: u64 = 100;

/// Pacing interval for a message first sent `age` ago
fn retransmit_interval(age: Duration) -> Duration {
    (age / 2).clamp(MIN_RESEND_INTERVAL, MAX_RESEND_INTERVAL)
}

/// Stateful framing layer above the codec
pub struct EncryptedConnection {
    kind: ConnectionType,
    key: EncryptionKey,
    next_counter: u32,
    seen: ReplayWindow,
    outbox: Vec<OutboundFrame>,
    acks_to_send: Vec<u32>,
    request_service: RequestService,
}

impl EncryptedConnection {
    pub fn new(kind: ConnectionType, key: EncryptionKey, request_service: RequestService) -> Self {
        Self {
            kind,
            key,
            next_counter: 1,
            seen: ReplayWindow::new(),
            outbox: Vec::new(),
            acks_to_send: Vec::new(),
            request_service,
        }
    }

    fn is_signaling(&self) -> bool {
        self.kind == ConnectionType::Signaling
    }

    /// Transport frames carry exactly one message with an unprefixed tail
    fn single_message_packet(&self) -> bool {
        self.kind == ConnectionType::Transport
    }

    fn take_counter(&mut self) -> u32 {
        let counter = self.next_counter;
        self.next_counter = self.next_counter.wrapping_add(1);
        counter
    }

    fn append_ack_trailer(&mut self, plaintext: &mut Vec<u8>) {
        let count = self.acks_to_send.len().min(MAX_ACKS_PER_FRAME);
        for ack in self.acks_to_send.drain(..count) {
            plaintext.extend_from_slice(&ack.to_be_bytes());
        }
        plaintext.push(count as u8);
    }

    fn encrypt(&self, plaintext: &[u8]) -> Option<Vec<u8>> {
        match encrypt_frame(self.key.send_part(self.is_signaling()), plaintext) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!("Failed to encrypt outbound frame: {}", err);
                None
            }
        }
    }

    /// Frame a message for the wire
    ///
    /// Returns `None` when the signaling outbox is saturated; the caller may
    /// retry the message at a higher level.
    pub fn prepare_for_sending(&mut self, message: &Message) -> Option<PreparedPacket> {
        if self.is_signaling() && self.outbox.len() >= MAX_PENDING {
            warn!("Signaling outbox saturated, refusing message");
            return None;
        }

        let counter = self.take_counter();
        let mut plaintext = serialize_message(message, counter, self.single_message_packet());

        if self.is_signaling() {
            let now = Instant::now();
            self.outbox.push(OutboundFrame {
                counter,
                message: message.clone(),
                first_sent_at: now,
                last_sent_at: now,
            });
            (self.request_service)(
                MIN_RESEND_INTERVAL.as_millis() as u64,
                ServiceCause::Retransmit,
            );
        }

        self.append_ack_trailer(&mut plaintext);
        let bytes = self.encrypt(&plaintext)?;
        Some(PreparedPacket { counter, bytes })
    }

    /// Emit a frame carrying only retransmissions and acknowledgements
    ///
    /// Returns `None` when nothing is due.
    pub fn prepare_for_sending_service(&mut self, cause: ServiceCause) -> Option<PreparedPacket> {
        self.service_frame_at(Instant::now(), cause)
    }

    pub(crate) fn service_frame_at(
        &mut self,
        now: Instant,
        cause: ServiceCause,
    ) -> Option<PreparedPacket> {
        let mut resend: Vec<u8> = Vec::new();
        let mut resend_count = 0usize;

        if self.is_signaling() {
            for frame in &mut self.outbox {
                let interval = retransmit_interval(now.duration_since(frame.first_sent_at));
                if now.duration_since(frame.last_sent_at) >= interval {
                    resend.extend_from_slice(&serialize_message(
                        &frame.message,
                        frame.counter,
                        false,
                    ));
                    resend_count += 1;
                    frame.last_sent_at = now;
                }
            }
            if let Some(next) = self.next_resend_delay(now) {
                (self.request_service)(next.as_millis().max(1) as u64, ServiceCause::Retransmit);
            }
        }

        if resend_count == 0 && self.acks_to_send.is_empty() {
            debug!("Service wakeup ({:?}) with nothing to send", cause);
            return None;
        }

        let counter;
        let mut plaintext;
        if resend_count == 0 {
            // Bare service frame: a fresh counter, then only the ack trailer
            counter = self.take_counter();
            plaintext = counter.to_be_bytes().to_vec();
        } else {
            debug!("Re-sending {} unacknowledged message(s)", resend_count);
            // Re-sent messages keep their original counters
            counter = u32::from_be_bytes(resend[..4].try_into().unwrap());
            plaintext = resend;
        }

        self.append_ack_trailer(&mut plaintext);
        let bytes = self.encrypt(&plaintext)?;
        Some(PreparedPacket { counter, bytes })
    }

    fn next_resend_delay(&self, now: Instant) -> Option<Duration> {
        self.outbox
            .iter()
            .map(|frame| {
                let interval = retransmit_interval(now.duration_since(frame.first_sent_at));
                interval.saturating_sub(now.duration_since(frame.last_sent_at))
            })
            .min()
    }

    fn process_acks(&mut self, acks: &[u32]) {
        if acks.is_empty() {
            return;
        }
        self.outbox.retain(|frame| {
            if acks.contains(&frame.counter) {
                debug!("Peer acknowledged message {}", frame.counter);
                false
            } else {
                true
            }
        });
    }

    /// Authenticate, deduplicate, and decode one inbound frame
    ///
    /// Every failure mode (authentication, parse, replay) drops the frame and
    /// returns `None`; none of them is fatal to the session. Acknowledgements
    /// piggybacked on the frame are honored even when no fresh message
    /// remains.
    pub fn handle_incoming_packet(&mut self, bytes: &[u8]) -> Option<DecryptedPacket> {
        let plaintext = match decrypt_frame(self.key.recv_part(self.is_signaling()), bytes) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                warn!("Dropping undecryptable frame: {}", err);
                return None;
            }
        };

        let Some(&ack_count) = plaintext.last() else {
            warn!("Dropping empty frame");
            return None;
        };
        let trailer_len = 1 + ack_count as usize * 4;
        if plaintext.len() < trailer_len {
            warn!("Dropping frame with malformed ack trailer");
            return None;
        }
        let (region, trailer) = plaintext.split_at(plaintext.len() - trailer_len);
        let acks: Vec<u32> = trailer[..trailer_len - 1]
            .chunks_exact(4)
            .map(|chunk| u32::from_be_bytes(chunk.try_into().unwrap()))
            .collect();
        self.process_acks(&acks);

        if region.len() == 4 {
            // Bare service frame: counter only
            let counter = u32::from_be_bytes(region.try_into().unwrap());
            if !self.seen.observe(counter) {
                debug!("Dropping replayed service frame {}", counter);
            }
            return None;
        }

        let single = self.single_message_packet();
        let mut reader = Reader::new(region);
        let mut fresh: Vec<DecryptedMessage> = Vec::new();
        while !reader.is_empty() {
            let Some((counter, message)) = deserialize_message(&mut reader, single) else {
                warn!("Dropping frame with malformed message");
                return None;
            };
            if !self.seen.observe(counter) {
                debug!("Dropping replayed message {}", counter);
                // The peer is still waiting for our acknowledgement
                if !self.acks_to_send.contains(&counter) {
                    self.acks_to_send.push(counter);
                }
                continue;
            }
            self.acks_to_send.push(counter);
            fresh.push(DecryptedMessage { counter, message });
        }

        if !self.acks_to_send.is_empty() {
            (self.request_service)(ACK_FLUSH_DELAY_MS, ServiceCause::FlushAcks);
        }

        let mut fresh = fresh.into_iter();
        let main = fresh.next()?;
        Some(DecryptedPacket {
            main,
            additional: fresh.collect(),
        })
    }

    /// Number of sent messages still awaiting acknowledgement
    pub fn pending_count(&self) -> usize {
        self.outbox.len()
    }

    /// Whether a sent message with this counter still awaits acknowledgement
    pub fn is_pending(&self, counter: u32) -> bool {
        self.outbox.iter().any(|frame| frame.counter == counter)
    }
}

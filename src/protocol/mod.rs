//! Wire protocol for the call control and media channels
//!
//! Typed messages, their tagged binary encoding, and the text form of ICE
//! candidates. Stateless; framing and encryption live in `network`.

mod candidate;
mod message;

pub use candidate::{CandidateKind, IceCandidate, TurnCredentials};
pub use message::{
    deserialize_message, serialize_message, Message, Reader, VideoFormat, MAX_STRING_LENGTH,
};

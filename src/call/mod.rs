//! Call-level coordination

mod manager;

pub use manager::{Descriptor, Manager, State, VideoState};

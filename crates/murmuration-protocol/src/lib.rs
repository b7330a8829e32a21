//! Wire-level building blocks shared by the Hub, Edge, and Client: the
//! Mumble control/voice codec and the Edge<->Hub cluster envelope.

pub mod cluster;
pub mod error;
pub mod frame;
pub mod model;
pub mod voice;
pub mod wire;

/// Generated from `proto/mumble.proto` by `build.rs`.
pub mod mumble {
    include!(concat!(env!("OUT_DIR"), "/murmuration.rs"));
}

pub use error::ProtocolError;
pub use wire::{ControlMessage, MessageKind};

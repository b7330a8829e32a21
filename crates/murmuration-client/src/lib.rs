//! Protocol-level client library: connect to an edge, run the admission
//! sequence, and expose the resulting state as a mirror plus an event
//! stream alongside a small command API. No audio I/O — encoding, capture,
//! and playback are the embedding application's problem; this crate only
//! speaks the control channel.

mod client;
mod config;
mod error;
mod event;
mod mirror;

pub use client::Client;
pub use config::ClientConfig;
pub use error::ClientError;
pub use event::Event;
pub use mirror::{ChannelInfo, Mirror, UserInfo};

use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::config::EdgeConfig;
use crate::hub_client::HubClient;
use crate::mirror::Mirror;
use crate::session::SessionTable;

/// Everything a connection's reader/writer/voice tasks need a handle to.
/// One of these is built at startup and `Arc`-cloned into every spawned
/// task; nothing here is ever replaced, only mutated through its own
/// interior locking.
pub struct EdgeState {
    pub config: EdgeConfig,
    pub mirror: Mirror,
    pub sessions: SessionTable,
    pub hub: Arc<HubClient>,
    /// The client-facing UDP voice socket, shared so both the voice reader
    /// task and cluster-voice delivery (forwarding a remote edge's audio to
    /// a local recipient) can send through the one bound socket.
    pub voice_socket: Arc<UdpSocket>,
    pub cluster_voice_socket: Arc<UdpSocket>,
}

impl EdgeState {
    pub fn new(
        config: EdgeConfig,
        mirror: Mirror,
        hub: Arc<HubClient>,
        voice_socket: Arc<UdpSocket>,
        cluster_voice_socket: Arc<UdpSocket>,
    ) -> Self {
        Self {
            config,
            mirror,
            sessions: SessionTable::default(),
            hub,
            voice_socket,
            cluster_voice_socket,
        }
    }
}

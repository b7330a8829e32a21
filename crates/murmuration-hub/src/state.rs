use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use parking_lot::RwLock;
use rusqlite::Connection;
use tokio::sync::mpsc;

use murmuration_protocol::cluster::{HubBroadcast, PeerInfo};
use murmuration_protocol::model::{AclEntry, BanEntry, Channel, Group, UserRecord};

use crate::cache::EdgeCache;
use crate::config::HubConfig;
use crate::join::JoinCoordinator;

/// A live Edge<->Hub control connection: the channel used to push
/// broadcasts to it, plus bookkeeping for liveness.
pub struct EdgeHandle {
    pub edge_id: String,
    pub public_addr: String,
    pub voice_addr: String,
    pub tx: mpsc::Sender<HubBroadcast>,
    pub last_heartbeat: std::sync::atomic::AtomicU64,
}

/// Central authoritative state for the Hub: the channel tree, ACLs, bans,
/// the online-user table, and the registry of connected Edges. This is the
/// single source of truth the whole cluster defers to — every mutation an
/// Edge forwards here gets applied and then broadcast back out so every
/// Edge's mirror converges on the same view.
pub struct HubState {
    pub config: HubConfig,
    pub db: Arc<Mutex<Connection>>,
    pub channels: RwLock<HashMap<u32, Channel>>,
    pub groups: RwLock<HashMap<u32, Vec<Group>>>,
    pub acls: RwLock<HashMap<u32, Vec<AclEntry>>>,
    pub bans: RwLock<Vec<BanEntry>>,
    /// Session id -> online user record, across the whole cluster.
    pub users: RwLock<HashMap<u32, UserRecord>>,
    pub edges: RwLock<HashMap<String, Arc<EdgeHandle>>>,
    pub cache: EdgeCache,
    pub join: JoinCoordinator,
    next_session_id: AtomicU32,
    next_channel_id: AtomicU32,
}

impl HubState {
    pub fn new(config: HubConfig, db: Arc<Mutex<Connection>>) -> Self {
        let cache_ttl = std::time::Duration::from_secs(config.message_cache_ttl_secs);
        let cache_cap = config.message_cache_capacity;
        Self {
            config,
            db,
            channels: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            acls: RwLock::new(HashMap::new()),
            bans: RwLock::new(Vec::new()),
            users: RwLock::new(HashMap::new()),
            edges: RwLock::new(HashMap::new()),
            cache: EdgeCache::new(cache_cap, cache_ttl),
            join: JoinCoordinator::new(),
            next_session_id: AtomicU32::new(1),
            next_channel_id: AtomicU32::new(1),
        }
    }

    pub fn allocate_session_id(&self) -> u32 {
        self.next_session_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn allocate_channel_id(&self) -> u32 {
        self.next_channel_id.fetch_add(1, Ordering::SeqCst)
    }

    /// The current cluster roster, as handed out with a join grant.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.edges
            .read()
            .values()
            .map(|handle| PeerInfo {
                edge_id: handle.edge_id.clone(),
                public_addr: handle.public_addr.clone(),
                voice_addr: handle.voice_addr.clone(),
            })
            .collect()
    }

    /// Push `broadcast` to every connected Edge except `exclude_edge_id`
    /// (typically the Edge whose own request caused the mutation, since it
    /// already applied it to its mirror optimistically). Edges that are
    /// momentarily unreachable get the broadcast buffered in the replay
    /// cache instead of losing it outright.
    pub fn broadcast(&self, broadcast: HubBroadcast, exclude_edge_id: Option<&str>) {
        let edges = self.edges.read();
        for (edge_id, handle) in edges.iter() {
            if Some(edge_id.as_str()) == exclude_edge_id {
                continue;
            }
            if handle.tx.try_send(broadcast.clone()).is_err() {
                self.cache.push(edge_id, broadcast.clone());
            }
        }
    }
}

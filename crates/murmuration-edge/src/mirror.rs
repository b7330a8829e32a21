//! The Edge's read-mostly copy of the Hub's authoritative state: channels,
//! groups, ACLs, bans, the cluster's peer roster, and every online user
//! across the whole cluster (local sessions included, keyed the same way
//! so channel membership and voice routing don't need two lookups).
//!
//! Nothing here mutates on a client's say-so. Hydrated once via `FullSync`
//! on connect, then kept current purely by applying `HubBroadcast`
//! messages as the Hub's consumer task receives them — see
//! `crate::hub_client`.

use std::collections::HashMap;

use parking_lot::RwLock;

use murmuration_protocol::cluster::{HubResult, PeerInfo};
use murmuration_protocol::model::{AclEntry, BanEntry, Channel, Group, UserRecord};

#[derive(Default)]
pub struct Mirror {
    pub channels: RwLock<HashMap<u32, Channel>>,
    pub groups: RwLock<HashMap<u32, Vec<Group>>>,
    pub acls: RwLock<HashMap<u32, Vec<AclEntry>>>,
    pub bans: RwLock<Vec<BanEntry>>,
    /// Every online user cluster-wide, including this Edge's own locally
    /// authenticated sessions (kept in lockstep by re-applying the same
    /// `ReportSessionJoined`/`UpdateUserState` calls this Edge makes).
    pub users: RwLock<HashMap<u32, UserRecord>>,
    pub peers: RwLock<HashMap<String, PeerInfo>>,
}

/// `mask` is a CIDR-style prefix length in bits. `stored` and the address
/// bytes of `ip` must be the same length (both v4 or both v6) to match at
/// all — this doesn't attempt v4-in-v6 normalization.
fn ip_matches_ban(ip: std::net::IpAddr, stored: &[u8], mask: u32) -> bool {
    let octets: Vec<u8> = match ip {
        std::net::IpAddr::V4(v4) => v4.octets().to_vec(),
        std::net::IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    if octets.len() != stored.len() {
        return false;
    }

    let full_bytes = (mask / 8) as usize;
    let remaining_bits = mask % 8;
    if full_bytes > octets.len() {
        return false;
    }
    if octets[..full_bytes] != stored[..full_bytes] {
        return false;
    }
    if remaining_bits == 0 || full_bytes == octets.len() {
        return true;
    }
    let shift = 8 - remaining_bits;
    (octets[full_bytes] >> shift) == (stored[full_bytes] >> shift)
}

impl Mirror {
    pub fn hydrate_from_full_sync(&self, result: HubResult) {
        let HubResult::FullSync {
            channels,
            groups,
            acls,
            bans,
            users,
        } = result
        else {
            tracing::error!("fullSync returned an unexpected result shape");
            return;
        };

        let mut channel_map = HashMap::new();
        for channel in channels {
            channel_map.insert(channel.id, channel);
        }
        *self.channels.write() = channel_map;

        let mut group_map: HashMap<u32, Vec<Group>> = HashMap::new();
        for (channel_id, group) in groups {
            group_map.entry(channel_id).or_default().push(group);
        }
        *self.groups.write() = group_map;

        let mut acl_map: HashMap<u32, Vec<AclEntry>> = HashMap::new();
        for (channel_id, acl) in acls {
            acl_map.entry(channel_id).or_default().push(acl);
        }
        *self.acls.write() = acl_map;

        *self.bans.write() = bans;

        let mut user_map = HashMap::new();
        for user in users {
            user_map.insert(user.session_id, user);
        }
        *self.users.write() = user_map;
    }

    pub fn hydrate_acls(&self, channel_id: u32, acls: Vec<AclEntry>, groups: Vec<Group>, inherit_acls: bool) {
        self.acls.write().insert(channel_id, acls);
        self.groups.write().insert(channel_id, groups);
        if let Some(channel) = self.channels.write().get_mut(&channel_id) {
            channel.inherit_acls = inherit_acls;
        }
    }

    pub fn save_channel(&self, channel: Channel) {
        self.channels.write().insert(channel.id, channel);
    }

    pub fn remove_channel(&self, channel_id: u32) {
        self.channels.write().remove(&channel_id);
        self.acls.write().remove(&channel_id);
        self.groups.write().remove(&channel_id);
    }

    pub fn upsert_user(&self, user: UserRecord) {
        self.users.write().insert(user.session_id, user);
    }

    pub fn remove_user(&self, session_id: u32) -> Option<UserRecord> {
        self.users.write().remove(&session_id)
    }

    pub fn channel(&self, id: u32) -> Option<Channel> {
        self.channels.read().get(&id).cloned()
    }

    pub fn all_channels(&self) -> Vec<Channel> {
        self.channels.read().values().cloned().collect()
    }

    pub fn all_users(&self) -> Vec<UserRecord> {
        self.users.read().values().cloned().collect()
    }

    pub fn users_in_channel(&self, channel_id: u32) -> Vec<UserRecord> {
        self.users
            .read()
            .values()
            .filter(|u| u.channel_id == channel_id)
            .cloned()
            .collect()
    }

    /// The parent chain from the root down to `channel_id`, root-first —
    /// exactly the order `effective_permissions` expects.
    pub fn chain_to_root(&self, channel_id: u32) -> Vec<u32> {
        let channels = self.channels.read();
        let mut chain = Vec::new();
        let mut current = Some(channel_id);
        while let Some(id) = current {
            chain.push(id);
            current = channels.get(&id).and_then(|c| c.parent);
        }
        chain.reverse();
        chain
    }

    /// Does any ban entry match this connecting client? Checked by
    /// certificate hash first, then by IP against the stored address/mask.
    /// Expiry (`start` + `duration_secs`) isn't enforced here yet — doing so
    /// properly needs a timestamp-parsing dependency this crate doesn't
    /// otherwise pull in, so for now a ban lasts until it's explicitly
    /// removed.
    pub fn is_banned(&self, ip: std::net::IpAddr, fingerprint: Option<&str>) -> bool {
        self.bans.read().iter().any(|ban| {
            if let (Some(hash), Some(fp)) = (&ban.hash, fingerprint) {
                if hash == fp {
                    return true;
                }
            }
            ip_matches_ban(ip, &ban.address, ban.mask)
        })
    }

    pub fn upsert_peer(&self, peer: PeerInfo) {
        self.peers.write().insert(peer.edge_id.clone(), peer);
    }

    pub fn remove_peer(&self, edge_id: &str) {
        self.peers.write().remove(edge_id);
    }

    pub fn peer(&self, edge_id: &str) -> Option<PeerInfo> {
        self.peers.read().get(edge_id).cloned()
    }
}

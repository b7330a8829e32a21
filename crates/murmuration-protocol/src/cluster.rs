//! The Edge<->Hub control channel: newline-delimited JSON envelopes carried
//! over a persistent TCP connection. Requests from an Edge to the Hub
//! (`EdgeRequest`) get a matching `HubResponse`; the Hub also pushes
//! unsolicited broadcasts to every connected Edge (`HubBroadcast`) when
//! authoritative state changes so each Edge's mirror can stay current.
//!
//! Modeled on the Unix-socket JSON-RPC envelope the daemon used for its
//! desktop client, generalized from a local socket to a cluster-wide TCP
//! link and split into a request/response half and a fire-and-forget
//! broadcast half.

use serde::{Deserialize, Serialize};

use crate::model::{AclEntry, BanEntry, Channel, Group, UserRecord};

/// A request an Edge sends to the Hub, tagged with a correlation id so the
/// response can be matched back up on a connection carrying many in-flight
/// requests at once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeRequest {
    pub id: u64,
    #[serde(flatten)]
    pub method: EdgeMethod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum EdgeMethod {
    /// First message on a new Edge<->Hub connection. The Hub serializes
    /// joins: this either grants the lock immediately or queues the caller
    /// behind whichever Edge is currently joining. A granted lock comes back
    /// as `HubResult::JoinGranted` with a token and the current peer set;
    /// the Edge must register voice endpoints with every listed peer and
    /// then call `ConfirmJoin` with that token before the join timeout
    /// elapses, or the lock is released out from under it.
    RequestJoin {
        edge_id: String,
        public_addr: String,
        voice_addr: String,
    },
    /// Completes a join: the Edge reports which peers it successfully
    /// registered voice endpoints with. The Hub checks that covers every
    /// peer it handed out in the matching `JoinGranted`, then admits the
    /// Edge, releases the join lock, and advances the queue.
    ConfirmJoin {
        token: u64,
        connected_peers: Vec<String>,
    },
    /// Periodic liveness signal; absence for longer than the cluster's
    /// absence timeout causes the Hub to treat the Edge as gone.
    Heartbeat { edge_id: String },
    /// Ask the Hub for a cluster-wide-unique session id for a newly
    /// authenticated connection.
    AllocateSessionId,
    /// Pull the full authoritative state needed to populate a fresh mirror:
    /// channels, ACLs, groups, bans, and currently-online users.
    FullSync,
    GetChannels,
    GetAcls { channel_id: u32 },
    /// Persist a channel create/update. The Hub is the only writer of
    /// record; the Edge applies the echoed broadcast to its own mirror just
    /// like every other Edge does. `actor_session_id` is the session the Edge
    /// already ran its own advisory check against; the Hub resolves it back
    /// to a `user_id` itself rather than trusting a claimed one, and re-runs
    /// the same check against the canonical tables before mutating anything.
    SaveChannel { channel: Channel, actor_session_id: u32 },
    /// Allocate a fresh channel id and create it in one round trip, since an
    /// Edge has no business minting cluster-wide-unique ids itself.
    CreateChannel {
        parent: u32,
        name: String,
        temporary: bool,
        position: i32,
        max_users: Option<u32>,
        actor_session_id: u32,
    },
    RemoveChannel { channel_id: u32, actor_session_id: u32 },
    SaveAcl {
        channel_id: u32,
        acls: Vec<AclEntry>,
        groups: Vec<Group>,
        inherit_acls: bool,
        actor_session_id: u32,
    },
    SaveBan { ban: BanEntry, actor_session_id: u32 },
    /// Report a session joining or leaving this Edge, so the Hub's
    /// authoritative user table and the join coordinator stay accurate.
    ReportSessionJoined { session: UserRecord },
    ReportSessionLeft { session_id: u32 },
    UpdateUserState { session: UserRecord, actor_session_id: u32 },
    /// Forward a freshly-connected client's credentials to the Hub, which
    /// owns the `registered_users` table and is the only place cluster-wide
    /// name collisions can be checked. A certificate-hash match logs the
    /// caller in as that registered identity regardless of the username it
    /// presented; otherwise the username/password pair (or an unregistered
    /// guest name, if neither matches a registered account) is checked.
    Authenticate {
        username: String,
        password: Option<String>,
        certificate_hash: Option<String>,
    },
    RelayTextMessage {
        actor: u32,
        sessions: Vec<u32>,
        channel_ids: Vec<u32>,
        tree_ids: Vec<u32>,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubResponse {
    pub id: u64,
    #[serde(flatten)]
    pub result: HubResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum HubResult {
    Ok,
    Error { message: String },
    /// The join lock, handed to one Edge at a time. `peers` is the current
    /// cluster roster the caller must reach over cluster voice before
    /// confirming.
    JoinGranted { token: u64, peers: Vec<PeerInfo> },
    SessionId { session_id: u32 },
    FullSync {
        channels: Vec<Channel>,
        /// Each group/ACL entry tagged with the channel it belongs to — the
        /// Edge needs this to populate its per-channel maps in one pass
        /// instead of starting empty and waiting on a `SaveAcl` per channel.
        groups: Vec<(u32, Group)>,
        acls: Vec<(u32, AclEntry)>,
        bans: Vec<BanEntry>,
        users: Vec<UserRecord>,
    },
    Channels { channels: Vec<Channel> },
    Acls {
        acls: Vec<AclEntry>,
        groups: Vec<Group>,
        inherit_acls: bool,
    },
    AuthAccepted { user_id: Option<u32>, name: String },
    AuthRejected { reason: AuthReject },
    ChannelCreated { channel: Channel },
}

/// Mirrors the subset of `Reject.RejectType` that an authentication
/// decision can produce; version/server-password mismatches are checked
/// by the Edge itself before it ever asks the Hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthReject {
    InvalidUsername,
    WrongUserPw,
    UsernameInUse,
    NoCertificate,
    AuthenticatorFail,
}

/// Unsolicited, fire-and-forget notifications the Hub pushes to every
/// connected Edge so mutations made through one Edge are reflected in every
/// other Edge's mirror.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum HubBroadcast {
    ChannelSaved { channel: Channel },
    ChannelRemoved { channel_id: u32 },
    AclSaved {
        channel_id: u32,
        acls: Vec<AclEntry>,
        groups: Vec<Group>,
        inherit_acls: bool,
    },
    BanSaved { ban: BanEntry },
    UserStateChanged { session: UserRecord },
    UserLeft { session_id: u32, reason: Option<String>, banned: bool },
    TextMessage {
        actor: u32,
        sessions: Vec<u32>,
        channel_ids: Vec<u32>,
        tree_ids: Vec<u32>,
        message: String,
    },
    /// A peer Edge joined or dropped out of the cluster; used to route
    /// cross-edge voice and to evict cached state for a dead Edge.
    PeerJoined { edge_id: String, public_addr: String, voice_addr: String },
    PeerLeft { edge_id: String },
}

/// One entry in a join grant's peer roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub edge_id: String,
    pub public_addr: String,
    pub voice_addr: String,
}

/// One line of the newline-delimited envelope, in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClusterEnvelope {
    Request(EdgeRequest),
    Response(HubResponse),
    Broadcast(HubBroadcast),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_lines_roundtrip_through_json() {
        let req = ClusterEnvelope::Request(EdgeRequest {
            id: 1,
            method: EdgeMethod::AllocateSessionId,
        });
        let line = serde_json::to_string(&req).unwrap();
        let parsed: ClusterEnvelope = serde_json::from_str(&line).unwrap();
        assert!(matches!(
            parsed,
            ClusterEnvelope::Request(EdgeRequest {
                id: 1,
                method: EdgeMethod::AllocateSessionId
            })
        ));
    }

    #[test]
    fn broadcast_discriminates_by_event_tag() {
        let line = serde_json::to_string(&HubBroadcast::PeerLeft {
            edge_id: "edge-1".into(),
        })
        .unwrap();
        assert!(line.contains("\"event\":\"peerLeft\""));
    }
}

//! The two-plane voice router: one client-facing UDP socket (plus the
//! `UDPTunnel` TCP fallback) and one cluster-internal UDP socket carrying
//! audio between Edges.
//!
//! A voice packet's recipient set is resolved once per packet from the
//! mirror's channel/link topology (normal speech), the sender's registered
//! `VoiceTarget` rules (whisper), or trivially (loopback echoes only to the
//! sender). Local recipients are re-encrypted under their own OCB2 state
//! and delivered directly; a recipient on another Edge is reached by
//! sending this Edge's plaintext packet once to that Edge's registered
//! voice endpoint, wrapped in a small cluster header the receiving Edge
//! uses to redo the recipient-resolution step against its own local
//! clients.
//!
//! Registered whisper targets are local-only state (`Session::voice_targets`
//! isn't replicated across Edges), so a whisper naming a session on another
//! Edge is still forwarded — one cluster datagram per distinct remote
//! target session, header `target_id` set to that session rather than the
//! broadcast sentinel — while a normal-speech packet's cluster header
//! always carries the broadcast sentinel and lets the receiving Edge
//! recompute local recipients from its own (globally replicated) channel
//! membership.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use murmuration_protocol::model::UserRecord;
use murmuration_protocol::mumble;
use murmuration_protocol::voice::{VoiceHeader, VoicePacket, VoiceTarget};

use crate::mirror::Mirror;
use crate::session::{Session, VoiceTargetSlot};
use crate::state::EdgeState;

const CLUSTER_VERSION: u8 = 1;
/// `version(1) + sender_session(4) + target_id(4) + sequence(4) + header(1)`.
const CLUSTER_HEADER_LEN: usize = 14;
/// Sentinel `target_id` meaning "recompute local recipients from channel
/// topology", used for ordinary (non-whisper) speech.
const BROADCAST_TARGET: u32 = 0xFFFF_FFFF;

/// Binds and runs the client-facing UDP voice socket: per-datagram sender
/// discovery bounded to same-source-IP sessions (brute-force OCB2
/// trial-decrypt), then routing through [`route_voice`].
pub async fn run_client_voice(state: Arc<EdgeState>) -> anyhow::Result<()> {
    let socket = Arc::clone(&state.voice_socket);
    tracing::info!(addr = %state.config.voice_addr, "client voice socket listening");
    let mut buf = vec![0u8; 2048];

    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "client voice recv error");
                continue;
            }
        };
        let datagram = &buf[..len];

        // A bare UDP ping (header 0x20 + 8-byte timestamp) isn't tied to
        // any session's crypto state at all; echo it straight back.
        if datagram.len() == 9 && datagram[0] == 0x20 {
            let _ = socket.send_to(datagram, addr).await;
            continue;
        }

        let Some((session, plaintext)) = resolve_sender(&state, addr, datagram) else {
            continue;
        };
        *session.udp_addr.lock() = Some(addr);

        route_voice(&state, &session, plaintext).await;
    }
}

/// If this address is already bound to a session, decrypt with that
/// session's state. Otherwise — first packet from a new port, or a rebind
/// — try every session sharing the source IP and keep whichever one's OCB2
/// state actually accepts the packet. Each candidate is decrypted at most
/// once: `CryptState::decrypt` advances replay-detection state as a side
/// effect, so calling it twice on the same bytes would corrupt it.
fn resolve_sender(state: &Arc<EdgeState>, addr: SocketAddr, datagram: &[u8]) -> Option<(Arc<Session>, Vec<u8>)> {
    let candidates = state.sessions.same_source_ip(addr.ip());

    if let Some(bound) = candidates.iter().find(|s| *s.udp_addr.lock() == Some(addr)) {
        return bound.crypt.lock().decrypt(datagram).ok().map(|p| (Arc::clone(bound), p));
    }

    for candidate in &candidates {
        if let Ok(plaintext) = candidate.crypt.lock().decrypt(datagram) {
            return Some((Arc::clone(candidate), plaintext));
        }
    }
    None
}

/// Route one plaintext voice packet from `sender`, whether it arrived as a
/// decrypted UDP datagram or a `UDPTunnel` frame (already plaintext, since
/// that path rides the TLS-protected control stream).
pub async fn route_voice(state: &Arc<EdgeState>, sender: &Arc<Session>, plaintext: Vec<u8>) {
    if sender.mute.load(Ordering::Relaxed) || sender.self_mute.load(Ordering::Relaxed) || sender.suppress.load(Ordering::Relaxed) {
        return;
    }

    let packet = match VoicePacket::decode_without_session(&plaintext) {
        Ok(p) => p,
        Err(e) => {
            tracing::debug!(session = sender.session_id, error = %e, "malformed voice packet");
            return;
        }
    };

    match packet.header.target.0 {
        0 => route_normal(state, sender, &packet).await,
        31 => deliver_to_local(state, sender, &reencode(&packet, sender.session_id)).await,
        1..=30 => route_whisper(state, sender, &packet).await,
        other => tracing::debug!(target = other, "voice packet names a reserved target"),
    }
}

fn is_deaf(s: &Session) -> bool {
    s.deaf.load(Ordering::Relaxed) || s.self_deaf.load(Ordering::Relaxed)
}

fn channel_and_linked(mirror: &Mirror, channel_id: u32) -> HashSet<u32> {
    let mut set = HashSet::new();
    set.insert(channel_id);
    if let Some(channel) = mirror.channel(channel_id) {
        set.extend(channel.links);
    }
    set
}

async fn route_normal(state: &Arc<EdgeState>, sender: &Arc<Session>, packet: &VoicePacket) {
    let topology = channel_and_linked(&state.mirror, sender.channel_id());
    let out = reencode(packet, sender.session_id);

    for local in state.sessions.all() {
        if local.session_id == sender.session_id || is_deaf(&local) {
            continue;
        }
        let listening = local.listening_channels.read().iter().any(|c| topology.contains(c));
        if topology.contains(&local.channel_id()) || listening {
            deliver_to_local(state, &local, &out).await;
        }
    }

    let remote_edges: HashSet<String> = state
        .mirror
        .all_users()
        .into_iter()
        .filter(|u| topology.contains(&u.channel_id) && u.edge_id != state.config.edge_id)
        .map(|u| u.edge_id)
        .collect();
    for edge_id in remote_edges {
        forward_to_edge(state, &edge_id, sender.session_id, BROADCAST_TARGET, packet).await;
    }
}

fn in_group(mirror: &Mirror, channel_id: u32, group_name: &str, user_id: u32) -> bool {
    let groups = mirror.groups.read();
    match groups.get(&channel_id).and_then(|gs| gs.iter().find(|g| g.name == group_name)) {
        Some(g) => g.add.contains(&user_id) && !g.remove.contains(&user_id),
        None => group_name == "all",
    }
}

/// Every channel whose parent chain passes through `root`, `root` itself
/// included.
fn descendants_of(mirror: &Mirror, root: u32) -> HashSet<u32> {
    mirror
        .all_channels()
        .into_iter()
        .filter(|c| mirror.chain_to_root(c.id).contains(&root))
        .map(|c| c.id)
        .collect()
}

/// Resolve one registered `VoiceTarget` slot (1-30) against the current
/// mirror: named sessions plus every user in a named channel (optionally
/// spanning links/children, optionally filtered to a group).
fn whisper_recipients(mirror: &Mirror, sender_session_id: u32, slot: &VoiceTargetSlot) -> Vec<UserRecord> {
    let all_users = mirror.all_users();
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for rule in &slot.rules {
        for session_id in &rule.sessions {
            if let Some(u) = all_users.iter().find(|u| u.session_id == *session_id) {
                if seen.insert(u.session_id) {
                    out.push(u.clone());
                }
            }
        }

        if let Some(channel_id) = rule.channel_id {
            let mut channels = HashSet::from([channel_id]);
            if rule.links {
                if let Some(c) = mirror.channel(channel_id) {
                    channels.extend(c.links);
                }
            }
            if rule.children {
                channels.extend(descendants_of(mirror, channel_id));
            }

            for u in &all_users {
                if !channels.contains(&u.channel_id) {
                    continue;
                }
                if let Some(group) = &rule.group {
                    match u.user_id {
                        Some(uid) if in_group(mirror, channel_id, group, uid) => {}
                        _ => continue,
                    }
                }
                if seen.insert(u.session_id) {
                    out.push(u.clone());
                }
            }
        }
    }

    out.retain(|u| u.session_id != sender_session_id);
    out
}

async fn route_whisper(state: &Arc<EdgeState>, sender: &Arc<Session>, packet: &VoicePacket) {
    let slot = sender.voice_targets.read()[packet.header.target.0 as usize].clone();
    let recipients = whisper_recipients(&state.mirror, sender.session_id, &slot);
    let out = reencode(packet, sender.session_id);

    for recipient in recipients {
        if recipient.edge_id == state.config.edge_id {
            if let Some(local) = state.sessions.get(recipient.session_id) {
                if !is_deaf(&local) {
                    deliver_to_local(state, &local, &out).await;
                }
            }
        } else {
            forward_to_edge(state, &recipient.edge_id, sender.session_id, recipient.session_id, packet).await;
        }
    }
}

/// Re-stamp a received (session-less) voice packet with the sender's
/// session id for onward delivery — every recipient-facing copy needs it
/// so the client knows who is speaking.
fn reencode(packet: &VoicePacket, sender_session: u32) -> Vec<u8> {
    VoicePacket {
        header: VoiceHeader { codec: packet.header.codec, target: VoiceTarget::NORMAL },
        session: Some(sender_session as u64),
        sequence: packet.sequence,
        payload: packet.payload.clone(),
    }
    .encode()
}

/// Encrypt `plaintext` under `recipient`'s own OCB2 state and deliver
/// either over UDP (if this recipient's address has been discovered) or as
/// a `UDPTunnel` control frame for a TCP-only client.
async fn deliver_to_local(state: &EdgeState, recipient: &Session, plaintext: &[u8]) {
    let udp_addr = *recipient.udp_addr.lock();
    match udp_addr {
        Some(addr) => {
            let encrypted = recipient.crypt.lock().encrypt(plaintext);
            let _ = state.voice_socket.send_to(&encrypted, addr).await;
        }
        None => recipient.send(mumble::UdpTunnel { packet: Some(plaintext.to_vec()) }),
    }
}

async fn forward_to_edge(state: &Arc<EdgeState>, edge_id: &str, sender_session: u32, target_id: u32, packet: &VoicePacket) {
    let Some(peer) = state.mirror.peer(edge_id) else {
        tracing::debug!(edge_id, "no known voice endpoint for peer edge");
        return;
    };
    let Ok(addr) = peer.voice_addr.parse::<SocketAddr>() else {
        tracing::warn!(edge_id, addr = %peer.voice_addr, "unparseable peer voice address");
        return;
    };

    let mut datagram = Vec::with_capacity(CLUSTER_HEADER_LEN + packet.payload.len());
    datagram.push(CLUSTER_VERSION);
    datagram.extend_from_slice(&sender_session.to_be_bytes());
    datagram.extend_from_slice(&target_id.to_be_bytes());
    datagram.extend_from_slice(&(packet.sequence as u32).to_be_bytes());
    datagram.push(packet.header.encode());
    datagram.extend_from_slice(&packet.payload);

    let _ = state.cluster_voice_socket.send_to(&datagram, addr).await;
}

/// Binds and runs the cluster-internal UDP voice socket, decoding the
/// small cluster header off each datagram and redelivering to this Edge's
/// own local clients.
pub async fn run_cluster_voice(state: Arc<EdgeState>) -> anyhow::Result<()> {
    let socket = Arc::clone(&state.cluster_voice_socket);
    tracing::info!(addr = %state.config.cluster_voice_addr, "cluster voice socket listening");
    let mut buf = vec![0u8; 2048];

    loop {
        let (len, _addr) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "cluster voice recv error");
                continue;
            }
        };
        if len < CLUSTER_HEADER_LEN || buf[0] != CLUSTER_VERSION {
            continue;
        }

        let sender_session = u32::from_be_bytes(buf[1..5].try_into().unwrap());
        let target_id = u32::from_be_bytes(buf[5..9].try_into().unwrap());
        let sequence = u32::from_be_bytes(buf[9..13].try_into().unwrap());
        let Ok(header) = VoiceHeader::decode(buf[13]) else {
            continue;
        };

        let out = VoicePacket {
            header: VoiceHeader { codec: header.codec, target: VoiceTarget::NORMAL },
            session: Some(sender_session as u64),
            sequence: sequence as u64,
            payload: buf[CLUSTER_HEADER_LEN..len].to_vec(),
        }
        .encode();

        deliver_remote_voice(&state, sender_session, target_id, &out).await;
    }
}

async fn deliver_remote_voice(state: &Arc<EdgeState>, sender_session: u32, target_id: u32, out: &[u8]) {
    if target_id == BROADCAST_TARGET {
        let Some(sender_record) = state.mirror.all_users().into_iter().find(|u| u.session_id == sender_session) else {
            return;
        };
        let topology = channel_and_linked(&state.mirror, sender_record.channel_id);
        for local in state.sessions.all() {
            if local.session_id == sender_session || is_deaf(&local) {
                continue;
            }
            let listening = local.listening_channels.read().iter().any(|c| topology.contains(c));
            if topology.contains(&local.channel_id()) || listening {
                deliver_to_local(state, &local, out).await;
            }
        }
    } else if let Some(local) = state.sessions.get(target_id) {
        if !is_deaf(&local) {
            deliver_to_local(state, &local, out).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmuration_protocol::model::{Channel, Group};
    use murmuration_protocol::voice::VoiceCodec;
    use crate::session::VoiceTargetRule;

    fn chan(id: u32, parent: Option<u32>, links: Vec<u32>) -> Channel {
        Channel {
            id,
            parent,
            name: format!("c{id}"),
            description: None,
            position: 0,
            temporary: false,
            max_users: None,
            links,
            inherit_acls: true,
        }
    }

    fn user(session_id: u32, channel_id: u32, edge_id: &str) -> UserRecord {
        UserRecord {
            session_id,
            user_id: Some(session_id),
            name: format!("u{session_id}"),
            channel_id,
            mute: false,
            deaf: false,
            self_mute: false,
            self_deaf: false,
            suppress: false,
            priority_speaker: false,
            recording: false,
            comment: None,
            edge_id: edge_id.to_string(),
        }
    }

    #[test]
    fn channel_and_linked_includes_own_channel_and_links() {
        let mirror = Mirror::default();
        mirror.save_channel(chan(0, None, vec![2]));
        mirror.save_channel(chan(2, None, vec![]));
        let set = channel_and_linked(&mirror, 0);
        assert!(set.contains(&0));
        assert!(set.contains(&2));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn descendants_of_walks_the_whole_subtree() {
        let mirror = Mirror::default();
        mirror.save_channel(chan(0, None, vec![]));
        mirror.save_channel(chan(1, Some(0), vec![]));
        mirror.save_channel(chan(2, Some(1), vec![]));
        mirror.save_channel(chan(3, None, vec![])); // unrelated sibling tree

        let set = descendants_of(&mirror, 0);
        assert!(set.contains(&0));
        assert!(set.contains(&1));
        assert!(set.contains(&2));
        assert!(!set.contains(&3));
    }

    #[test]
    fn in_group_defaults_unlisted_group_to_all() {
        let mirror = Mirror::default();
        mirror.save_channel(chan(0, None, vec![]));
        assert!(in_group(&mirror, 0, "all", 42));
        assert!(!in_group(&mirror, 0, "admins", 42));
    }

    #[test]
    fn in_group_honors_explicit_add_and_remove_lists() {
        let mirror = Mirror::default();
        mirror.save_channel(chan(0, None, vec![]));
        mirror.hydrate_acls(
            0,
            vec![],
            vec![Group {
                name: "staff".into(),
                inherit: false,
                inheritable: false,
                add: vec![1, 2],
                remove: vec![2],
            }],
            true,
        );
        assert!(in_group(&mirror, 0, "staff", 1));
        assert!(!in_group(&mirror, 0, "staff", 2));
        assert!(!in_group(&mirror, 0, "staff", 3));
    }

    #[test]
    fn whisper_recipients_resolves_named_sessions_and_excludes_sender() {
        let mirror = Mirror::default();
        mirror.upsert_user(user(1, 0, "edge-1"));
        mirror.upsert_user(user(2, 0, "edge-1"));

        let slot = VoiceTargetSlot {
            rules: vec![VoiceTargetRule {
                sessions: vec![1, 2],
                channel_id: None,
                group: None,
                links: false,
                children: false,
            }],
        };

        let recipients = whisper_recipients(&mirror, 1, &slot);
        let ids: Vec<u32> = recipients.iter().map(|u| u.session_id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn whisper_recipients_channel_rule_spans_links_and_children_with_group_filter() {
        let mirror = Mirror::default();
        mirror.save_channel(chan(0, None, vec![5]));
        mirror.save_channel(chan(1, Some(0), vec![]));
        mirror.save_channel(chan(5, None, vec![]));
        mirror.hydrate_acls(
            0,
            vec![],
            vec![Group {
                name: "staff".into(),
                inherit: false,
                inheritable: false,
                add: vec![10],
                remove: vec![],
            }],
            true,
        );

        mirror.upsert_user(user(10, 0, "edge-1")); // in group, in named channel
        mirror.upsert_user(user(11, 0, "edge-1")); // not in group
        mirror.upsert_user(user(12, 1, "edge-1")); // child channel, no group entry at channel 1
        mirror.upsert_user(user(13, 5, "edge-1")); // linked channel, no group entry at channel 5

        let slot = VoiceTargetSlot {
            rules: vec![VoiceTargetRule {
                sessions: vec![],
                channel_id: Some(0),
                group: Some("staff".into()),
                links: true,
                children: true,
            }],
        };

        let recipients = whisper_recipients(&mirror, 99, &slot);
        let mut ids: Vec<u32> = recipients.iter().map(|u| u.session_id).collect();
        ids.sort_unstable();
        // The group filter checks membership against the rule's own
        // channel_id (0) for every candidate regardless of which linked or
        // child channel they're actually sitting in, so only the member
        // "staff" was explicitly granted at channel 0 survives.
        assert_eq!(ids, vec![10]);
    }

    #[test]
    fn reencode_stamps_sender_session_and_resets_target_to_normal() {
        let packet = VoicePacket {
            header: VoiceHeader { codec: VoiceCodec::Opus, target: VoiceTarget(3) },
            session: None,
            sequence: 42,
            payload: vec![9, 9, 9],
        };
        let encoded = reencode(&packet, 7);
        let decoded = VoicePacket::decode_with_session(&encoded).unwrap();
        assert_eq!(decoded.session, Some(7));
        assert_eq!(decoded.header.target, VoiceTarget::NORMAL);
        assert_eq!(decoded.payload, vec![9, 9, 9]);
    }

    #[test]
    fn cluster_header_roundtrips_codec_and_ids() {
        let packet = VoicePacket {
            header: VoiceHeader { codec: VoiceCodec::CeltBeta, target: VoiceTarget::NORMAL },
            session: None,
            sequence: 1234,
            payload: vec![1, 2, 3, 4, 5],
        };

        let mut datagram = Vec::new();
        datagram.push(CLUSTER_VERSION);
        datagram.extend_from_slice(&7u32.to_be_bytes());
        datagram.extend_from_slice(&BROADCAST_TARGET.to_be_bytes());
        datagram.extend_from_slice(&(packet.sequence as u32).to_be_bytes());
        datagram.push(packet.header.encode());
        datagram.extend_from_slice(&packet.payload);

        assert_eq!(datagram.len(), CLUSTER_HEADER_LEN + packet.payload.len());
        assert_eq!(u32::from_be_bytes(datagram[1..5].try_into().unwrap()), 7);
        assert_eq!(u32::from_be_bytes(datagram[5..9].try_into().unwrap()), BROADCAST_TARGET);
        let header = VoiceHeader::decode(datagram[13]).unwrap();
        assert_eq!(header.codec, VoiceCodec::CeltBeta);
        assert_eq!(&datagram[CLUSTER_HEADER_LEN..], &packet.payload[..]);
    }
}

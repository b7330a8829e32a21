//! Post-admission frame handling and the Hub broadcast consumer.
//!
//! Every mutating client request follows the same shape: validate against
//! the advisory ACL copy, forward to the Hub, and only once the Hub answers
//! apply the change to this Edge's own mirror and rebroadcast it to this
//! Edge's locally-terminated sessions. The Hub's own broadcast of the same
//! mutation skips this Edge (see `murmuration-hub`'s `HubState::broadcast`),
//! since this path already did the local half of the work; every *other*
//! connected Edge picks the mutation up through `run_broadcast_consumer`
//! instead.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;

use murmuration_protocol::cluster::{EdgeMethod, HubBroadcast, HubResult, PeerInfo};
use murmuration_protocol::model::{permissions, AclEntry, BanEntry, Channel, Group, UserRecord};
use murmuration_protocol::mumble;
use murmuration_protocol::wire::ControlMessage;

use crate::acl;
use crate::channel_tree::user_state_from_record;
use crate::mirror::Mirror;
use crate::ninja;
use crate::session::{PreConnectPatch, Session, VoiceTargetRule, VoiceTargetSlot};
use crate::state::EdgeState;

pub fn session_record(state: &EdgeState, session: &Session) -> UserRecord {
    UserRecord {
        session_id: session.session_id,
        user_id: session.user_id(),
        name: session.name(),
        channel_id: session.channel_id(),
        mute: session.mute.load(Ordering::Relaxed),
        deaf: session.deaf.load(Ordering::Relaxed),
        self_mute: session.self_mute.load(Ordering::Relaxed),
        self_deaf: session.self_deaf.load(Ordering::Relaxed),
        suppress: session.suppress.load(Ordering::Relaxed),
        priority_speaker: session.priority_speaker.load(Ordering::Relaxed),
        recording: session.recording.load(Ordering::Relaxed),
        comment: session.comment.read().clone(),
        edge_id: state.config.edge_id.clone(),
    }
}

pub async fn handle_client_message(state: &Arc<EdgeState>, session: &Arc<Session>, msg: ControlMessage) {
    match msg {
        ControlMessage::Ping(ping) => handle_ping(session, &ping),
        ControlMessage::UserState(req) => handle_user_state(state, session, req).await,
        ControlMessage::ChannelState(req) => handle_channel_state(state, session, req).await,
        ControlMessage::ChannelRemove(req) => handle_channel_remove(state, session, req).await,
        ControlMessage::UserRemove(req) => handle_user_remove(state, session, req).await,
        ControlMessage::TextMessage(req) => handle_text_message(state, session, req).await,
        ControlMessage::Acl(req) => handle_acl(state, session, req).await,
        ControlMessage::BanList(req) => handle_ban_list(state, session, req).await,
        ControlMessage::VoiceTarget(req) => handle_voice_target(session, req),
        ControlMessage::PermissionQuery(req) => handle_permission_query(state, session, &req),
        ControlMessage::QueryUsers(req) => handle_query_users(state, session, &req),
        ControlMessage::RequestBlob(req) => handle_request_blob(state, session, &req),
        ControlMessage::ContextActionModify(_) | ControlMessage::ContextAction(_) => {
            tracing::debug!(session = session.session_id, "context actions aren't implemented");
        }
        other => tracing::debug!(kind = ?other.kind(), "unexpected message kind from an admitted client"),
    }
}

fn handle_ping(session: &Session, ping: &mumble::Ping) {
    let crypt = session.crypt.lock();
    session.send(mumble::Ping {
        timestamp: ping.timestamp,
        good: Some(crypt.good),
        late: Some(crypt.late),
        lost: Some(crypt.lost),
        resync: Some(crypt.resync),
        ..Default::default()
    });
}

fn send_permission_denied(
    session: &Session,
    deny_type: mumble::permission_denied::DenyType,
    reason: &str,
    target_session: Option<u32>,
) {
    session.send(mumble::PermissionDenied {
        permission: None,
        channel_id: None,
        session: target_session,
        reason: Some(reason.to_string()),
        r#type: Some(deny_type as i32),
        name: None,
    });
}

fn broadcast_user_state_locally(state: &EdgeState, record: &UserRecord, previous_channel: Option<u32>) {
    for viewer in state.sessions.all() {
        match ninja::deliver_for_viewer(&state.mirror, state.config.channel_ninja, viewer.user_id(), record, previous_channel) {
            ninja::Delivery::State(s) => viewer.send(s),
            ninja::Delivery::Remove(r) => viewer.send(r),
            ninja::Delivery::Drop => {}
        }
    }
}

async fn forward_user_state(state: &Arc<EdgeState>, record: UserRecord, previous_channel: Option<u32>, actor_session_id: u32) {
    match state
        .hub
        .call(EdgeMethod::UpdateUserState { session: record.clone(), actor_session_id })
        .await
    {
        Ok(HubResult::Ok) => {
            state.mirror.upsert_user(record.clone());
            broadcast_user_state_locally(state, &record, previous_channel);
        }
        Ok(other) => tracing::warn!(?other, "unexpected hub response to updateUserState"),
        Err(e) => tracing::warn!(error = %e, "failed to forward user state to hub"),
    }
}

async fn handle_user_state(state: &Arc<EdgeState>, session: &Arc<Session>, req: mumble::UserState) {
    let target_id = req.session.unwrap_or(session.session_id);
    let actor_user_id = session.user_id().unwrap_or(0);

    let Some(target) = state.sessions.get(target_id) else {
        tracing::debug!(target_id, "userState targets a session not local to this edge");
        return;
    };

    let acting_on_self = target_id == session.session_id;
    let previous_channel = target.channel_id();

    if !acting_on_self {
        let required = if req.channel_id.is_some() { permissions::MOVE } else { permissions::MUTE_DEAFEN };
        if !acl::has(&state.mirror, previous_channel, actor_user_id, required) {
            send_permission_denied(session, mumble::permission_denied::DenyType::Permission, "missing permission", Some(target_id));
            return;
        }
    }

    if let Some(channel_id) = req.channel_id {
        let Some(_) = state.mirror.channel(channel_id) else {
            send_permission_denied(session, mumble::permission_denied::DenyType::ChannelName, "no such channel", Some(target_id));
            return;
        };
        if !acl::has(&state.mirror, channel_id, target.user_id().unwrap_or(0), permissions::ENTER) {
            send_permission_denied(session, mumble::permission_denied::DenyType::Permission, "no enter permission", Some(target_id));
            return;
        }
        target.channel_id.store(channel_id, Ordering::Relaxed);
    }
    if let Some(mute) = req.mute {
        target.mute.store(mute, Ordering::Relaxed);
    }
    if let Some(deaf) = req.deaf {
        target.deaf.store(deaf, Ordering::Relaxed);
    }
    if let Some(self_mute) = req.self_mute {
        target.self_mute.store(self_mute, Ordering::Relaxed);
    }
    if let Some(self_deaf) = req.self_deaf {
        target.self_deaf.store(self_deaf, Ordering::Relaxed);
    }
    if let Some(recording) = req.recording {
        target.recording.store(recording, Ordering::Relaxed);
    }
    if let Some(priority_speaker) = req.priority_speaker {
        target.priority_speaker.store(priority_speaker, Ordering::Relaxed);
    }
    if let Some(comment) = req.comment.clone() {
        *target.comment.write() = Some(comment);
    }
    if !req.listening_channel_add.is_empty() || !req.listening_channel_remove.is_empty() {
        let mut listening = target.listening_channels.write();
        for channel_id in &req.listening_channel_add {
            if !listening.contains(channel_id) {
                listening.push(*channel_id);
            }
        }
        listening.retain(|c| !req.listening_channel_remove.contains(c));
    }

    let self_muted = target.self_mute.load(Ordering::Relaxed) || target.mute.load(Ordering::Relaxed);
    let suppress = acl::should_suppress(&state.mirror, target.channel_id(), target.user_id().unwrap_or(0), self_muted);
    target.suppress.store(suppress, Ordering::Relaxed);

    let record = session_record(state, &target);
    let moved = req.channel_id.is_some();
    forward_user_state(
        state,
        record,
        if moved { Some(previous_channel) } else { None },
        session.session_id,
    )
    .await;
}

fn broadcast_channel_state_locally(state: &EdgeState, channel: &Channel) {
    let msg = mumble::ChannelState {
        channel_id: Some(channel.id),
        parent: channel.parent,
        name: Some(channel.name.clone()),
        description: channel.description.clone(),
        temporary: Some(channel.temporary),
        position: Some(channel.position),
        max_users: channel.max_users,
        links: channel.links.clone(),
        ..Default::default()
    };
    for s in state.sessions.all() {
        s.send(msg.clone());
    }
}

async fn handle_channel_state(state: &Arc<EdgeState>, session: &Arc<Session>, req: mumble::ChannelState) {
    let actor_user_id = session.user_id().unwrap_or(0);

    match req.channel_id {
        None => {
            let Some(parent) = req.parent else {
                send_permission_denied(session, mumble::permission_denied::DenyType::ChannelName, "new channel needs a parent", None);
                return;
            };
            let temporary = req.temporary.unwrap_or(false);
            let required = if temporary { permissions::MAKE_TEMP_CHANNEL } else { permissions::MAKE_CHANNEL };
            if !acl::has(&state.mirror, parent, actor_user_id, required) {
                send_permission_denied(session, mumble::permission_denied::DenyType::Permission, "missing make-channel permission", None);
                return;
            }
            let Some(name) = req.name.clone() else {
                send_permission_denied(session, mumble::permission_denied::DenyType::ChannelName, "new channel needs a name", None);
                return;
            };

            match state
                .hub
                .call(EdgeMethod::CreateChannel {
                    parent,
                    name,
                    temporary,
                    position: req.position.unwrap_or(0),
                    max_users: req.max_users,
                    actor_session_id: session.session_id,
                })
                .await
            {
                Ok(HubResult::ChannelCreated { channel }) => {
                    state.mirror.save_channel(channel.clone());
                    broadcast_channel_state_locally(state, &channel);
                }
                Ok(other) => tracing::warn!(?other, "unexpected hub response to createChannel"),
                Err(e) => tracing::warn!(error = %e, "failed to create channel"),
            }
        }
        Some(channel_id) => {
            let Some(mut channel) = state.mirror.channel(channel_id) else {
                send_permission_denied(session, mumble::permission_denied::DenyType::ChannelName, "no such channel", None);
                return;
            };
            if !acl::has(&state.mirror, channel_id, actor_user_id, permissions::WRITE) {
                send_permission_denied(session, mumble::permission_denied::DenyType::Permission, "missing write permission", None);
                return;
            }

            if let Some(name) = req.name.clone() {
                channel.name = name;
            }
            if let Some(description) = req.description.clone() {
                channel.description = Some(description);
            }
            if let Some(position) = req.position {
                channel.position = position;
            }
            if let Some(max_users) = req.max_users {
                channel.max_users = Some(max_users);
            }
            for id in &req.links_add {
                if !channel.links.contains(id) {
                    channel.links.push(*id);
                }
            }
            for id in &req.links_remove {
                channel.links.retain(|l| l != id);
            }

            match state
                .hub
                .call(EdgeMethod::SaveChannel { channel: channel.clone(), actor_session_id: session.session_id })
                .await
            {
                Ok(HubResult::Ok) => {
                    state.mirror.save_channel(channel.clone());
                    broadcast_channel_state_locally(state, &channel);
                }
                Ok(other) => tracing::warn!(?other, "unexpected hub response to saveChannel"),
                Err(e) => tracing::warn!(error = %e, "failed to save channel"),
            }
        }
    }
}

async fn handle_channel_remove(state: &Arc<EdgeState>, session: &Arc<Session>, req: mumble::ChannelRemove) {
    let channel_id = req.channel_id;
    if channel_id == 0 {
        send_permission_denied(session, mumble::permission_denied::DenyType::Permission, "cannot remove the root channel", None);
        return;
    }
    if !acl::has(&state.mirror, channel_id, session.user_id().unwrap_or(0), permissions::WRITE) {
        send_permission_denied(session, mumble::permission_denied::DenyType::Permission, "missing write permission", None);
        return;
    }

    match state
        .hub
        .call(EdgeMethod::RemoveChannel { channel_id, actor_session_id: session.session_id })
        .await
    {
        Ok(HubResult::Ok) => {
            state.mirror.remove_channel(channel_id);
            let msg = mumble::ChannelRemove { channel_id };
            for s in state.sessions.all() {
                s.send(msg.clone());
            }
        }
        Ok(other) => tracing::warn!(?other, "unexpected hub response to removeChannel"),
        Err(e) => tracing::warn!(error = %e, "failed to remove channel"),
    }
}

async fn handle_user_remove(state: &Arc<EdgeState>, session: &Arc<Session>, req: mumble::UserRemove) {
    let target_id = req.session;
    if target_id == session.session_id {
        return;
    }
    let ban = req.ban.unwrap_or(false);
    let required = if ban { permissions::BAN } else { permissions::KICK };
    let target_channel = state
        .mirror
        .all_users()
        .into_iter()
        .find(|u| u.session_id == target_id)
        .map_or(0, |u| u.channel_id);

    if !acl::has(&state.mirror, target_channel, session.user_id().unwrap_or(0), required) {
        send_permission_denied(session, mumble::permission_denied::DenyType::Permission, "missing kick/ban permission", Some(target_id));
        return;
    }

    if ban {
        if let Some(target) = state.sessions.get(target_id) {
            if let Some(fp) = target.fingerprint.clone() {
                let address = match target.peer_addr.ip() {
                    std::net::IpAddr::V4(v4) => v4.octets().to_vec(),
                    std::net::IpAddr::V6(v6) => v6.octets().to_vec(),
                };
                let ban_entry = BanEntry {
                    address,
                    mask: 32,
                    name: Some(target.name()),
                    hash: Some(fp),
                    reason: req.reason.clone(),
                    start: None,
                    duration_secs: None,
                };
                let _ = state
                    .hub
                    .call(EdgeMethod::SaveBan { ban: ban_entry.clone(), actor_session_id: session.session_id })
                    .await;
                state.mirror.bans.write().push(ban_entry);
            }
        }
    }

    match state.hub.call(EdgeMethod::ReportSessionLeft { session_id: target_id }).await {
        Ok(HubResult::Ok) => {
            state.mirror.remove_user(target_id);
            let msg = mumble::UserRemove {
                session: target_id,
                actor: Some(session.session_id),
                reason: req.reason.clone(),
                ban: req.ban,
            };
            for s in state.sessions.all() {
                s.send(msg.clone());
            }
            state.sessions.remove(target_id);
        }
        Ok(other) => tracing::warn!(?other, "unexpected hub response to reportSessionLeft"),
        Err(e) => tracing::warn!(error = %e, "failed to report session left"),
    }
}

fn channel_and_descendants(mirror: &Mirror, root: u32) -> Vec<u32> {
    mirror
        .all_channels()
        .into_iter()
        .filter(|c| mirror.chain_to_root(c.id).contains(&root))
        .map(|c| c.id)
        .collect()
}

fn deliver_text_message_locally(state: &EdgeState, msg: &mumble::TextMessage) {
    let mut targets: HashSet<u32> = msg.session.iter().copied().collect();
    for channel_id in &msg.channel_id {
        for s in state.sessions.in_channel(*channel_id) {
            targets.insert(s.session_id);
        }
    }
    for tree_id in &msg.tree_id {
        for channel_id in channel_and_descendants(&state.mirror, *tree_id) {
            for s in state.sessions.in_channel(channel_id) {
                targets.insert(s.session_id);
            }
        }
    }
    for session_id in targets {
        if let Some(s) = state.sessions.get(session_id) {
            s.send(msg.clone());
        }
    }
}

async fn handle_text_message(state: &Arc<EdgeState>, session: &Arc<Session>, req: mumble::TextMessage) {
    let actor_user_id = session.user_id().unwrap_or(0);
    for channel_id in &req.channel_id {
        if !acl::has(&state.mirror, *channel_id, actor_user_id, permissions::TEXT_MESSAGE) {
            send_permission_denied(session, mumble::permission_denied::DenyType::Permission, "missing text permission", None);
            return;
        }
    }
    let message = req.message.clone().unwrap_or_default();
    if message.len() > state.config.text_message_length as usize {
        send_permission_denied(session, mumble::permission_denied::DenyType::TextTooLong, "message too long", None);
        return;
    }

    let out = mumble::TextMessage {
        actor: Some(session.session_id),
        session: req.session.clone(),
        channel_id: req.channel_id.clone(),
        tree_id: req.tree_id.clone(),
        message: Some(message.clone()),
    };
    deliver_text_message_locally(state, &out);

    let _ = state
        .hub
        .call(EdgeMethod::RelayTextMessage {
            actor: session.session_id,
            sessions: req.session,
            channel_ids: req.channel_id,
            tree_ids: req.tree_id,
            message,
        })
        .await;
}

fn acl_entries_from_message(req: &mumble::Acl) -> (Vec<AclEntry>, Vec<Group>) {
    let acls = req
        .acls
        .iter()
        .map(|a| AclEntry {
            apply_here: a.apply_here.unwrap_or(true),
            apply_subs: a.apply_subs.unwrap_or(true),
            user_id: a.user_id,
            group: a.group.clone(),
            grant: a.grant.unwrap_or(0),
            deny: a.deny.unwrap_or(0),
        })
        .collect();
    let groups = req
        .groups
        .iter()
        .map(|g| Group {
            name: g.name.clone(),
            inherit: g.inherit.unwrap_or(true),
            inheritable: g.inheritable.unwrap_or(true),
            add: g.add.clone(),
            remove: g.remove.clone(),
        })
        .collect();
    (acls, groups)
}

fn acl_message_from(channel_id: u32, acls: &[AclEntry], groups: &[Group], inherit_acls: bool) -> mumble::Acl {
    mumble::Acl {
        channel_id,
        inherit_acls: Some(inherit_acls),
        groups: groups
            .iter()
            .map(|g| mumble::acl::ChanGroup {
                name: g.name.clone(),
                inherited: Some(false),
                inherit: Some(g.inherit),
                inheritable: Some(g.inheritable),
                add: g.add.clone(),
                remove: g.remove.clone(),
                inherited_members: Vec::new(),
            })
            .collect(),
        acls: acls
            .iter()
            .map(|a| mumble::acl::ChanAcl {
                apply_here: Some(a.apply_here),
                apply_subs: Some(a.apply_subs),
                inherited: Some(false),
                user_id: a.user_id,
                group: a.group.clone(),
                grant: Some(a.grant),
                deny: Some(a.deny),
            })
            .collect(),
        query: Some(false),
    }
}

async fn handle_acl(state: &Arc<EdgeState>, session: &Arc<Session>, req: mumble::Acl) {
    let channel_id = req.channel_id;

    if req.query.unwrap_or(false) {
        match state.hub.call(EdgeMethod::GetAcls { channel_id }).await {
            Ok(HubResult::Acls { acls, groups, inherit_acls }) => {
                session.send(acl_message_from(channel_id, &acls, &groups, inherit_acls));
            }
            Ok(other) => tracing::warn!(?other, "unexpected hub response to getAcls"),
            Err(e) => tracing::warn!(error = %e, "failed to query acls"),
        }
        return;
    }

    if !acl::has(&state.mirror, channel_id, session.user_id().unwrap_or(0), permissions::WRITE) {
        send_permission_denied(session, mumble::permission_denied::DenyType::Permission, "missing write permission", None);
        return;
    }

    let (acls, groups) = acl_entries_from_message(&req);
    let inherit_acls = req.inherit_acls.unwrap_or(true);
    match state
        .hub
        .call(EdgeMethod::SaveAcl {
            channel_id,
            acls: acls.clone(),
            groups: groups.clone(),
            inherit_acls,
            actor_session_id: session.session_id,
        })
        .await
    {
        Ok(HubResult::Ok) => state.mirror.hydrate_acls(channel_id, acls, groups, inherit_acls),
        Ok(other) => tracing::warn!(?other, "unexpected hub response to saveAcl"),
        Err(e) => tracing::warn!(error = %e, "failed to save acls"),
    }
}

fn ban_list_message(bans: &[BanEntry], query: bool) -> mumble::BanList {
    mumble::BanList {
        bans: bans
            .iter()
            .map(|b| mumble::ban_list::BanEntry {
                address: b.address.clone(),
                mask: b.mask,
                name: b.name.clone(),
                hash: b.hash.clone(),
                reason: b.reason.clone(),
                start: b.start.clone(),
                duration: b.duration_secs,
            })
            .collect(),
        query: Some(query),
    }
}

async fn handle_ban_list(state: &Arc<EdgeState>, session: &Arc<Session>, req: mumble::BanList) {
    if req.query.unwrap_or(false) {
        let bans = state.mirror.bans.read().clone();
        session.send(ban_list_message(&bans, false));
        return;
    }

    if !acl::has(&state.mirror, 0, session.user_id().unwrap_or(0), permissions::BAN) {
        send_permission_denied(session, mumble::permission_denied::DenyType::Permission, "missing ban permission", None);
        return;
    }

    for wire_ban in &req.bans {
        let ban_entry = BanEntry {
            address: wire_ban.address.clone(),
            mask: wire_ban.mask,
            name: wire_ban.name.clone(),
            hash: wire_ban.hash.clone(),
            reason: wire_ban.reason.clone(),
            start: wire_ban.start.clone(),
            duration_secs: wire_ban.duration,
        };
        let _ = state
            .hub
            .call(EdgeMethod::SaveBan { ban: ban_entry.clone(), actor_session_id: session.session_id })
            .await;
        state.mirror.bans.write().push(ban_entry);
    }
}

fn handle_voice_target(session: &Session, req: mumble::VoiceTarget) {
    let Some(id) = req.id else { return };
    if !(1..=30).contains(&id) {
        return;
    }
    let slot = VoiceTargetSlot {
        rules: req
            .targets
            .iter()
            .map(|t| VoiceTargetRule {
                sessions: t.session.clone(),
                channel_id: t.channel_id,
                group: t.group.clone(),
                links: t.links.unwrap_or(false),
                children: t.children.unwrap_or(false),
            })
            .collect(),
    };
    session.voice_targets.write()[id as usize] = slot;
}

fn handle_permission_query(state: &EdgeState, session: &Session, req: &mumble::PermissionQuery) {
    let channel_id = req.channel_id.unwrap_or_else(|| session.channel_id());
    let perms = acl::effective(&state.mirror, channel_id, session.user_id().unwrap_or(0));
    session.send(mumble::PermissionQuery {
        channel_id: Some(channel_id),
        permissions: Some(perms as u32),
        flush: Some(false),
    });
}

fn handle_query_users(state: &EdgeState, session: &Session, req: &mumble::QueryUsers) {
    let users = state.mirror.all_users();
    let mut ids = Vec::new();
    let mut names = Vec::new();

    for id in &req.ids {
        if let Some(u) = users.iter().find(|u| u.user_id == Some(*id)) {
            ids.push(*id);
            names.push(u.name.clone());
        }
    }
    for name in &req.names {
        if let Some(u) = users.iter().find(|u| &u.name == name) {
            if let Some(uid) = u.user_id {
                ids.push(uid);
                names.push(u.name.clone());
            }
        }
    }

    session.send(mumble::QueryUsers { ids, names });
}

/// Textures aren't modeled as a separate blob store (no avatar storage);
/// comments and channel descriptions are, so those can be resent in full.
fn handle_request_blob(state: &EdgeState, session: &Session, req: &mumble::RequestBlob) {
    let users = state.mirror.all_users();
    for session_id in &req.session_comment {
        if let Some(u) = users.iter().find(|u| u.session_id == *session_id) {
            session.send(user_state_from_record(u));
        }
    }
    for channel_id in &req.channel_description {
        if let Some(c) = state.mirror.channel(*channel_id) {
            session.send(mumble::ChannelState {
                channel_id: Some(c.id),
                description: c.description,
                ..Default::default()
            });
        }
    }
}

/// Apply a `HubBroadcast::UserStateChanged` that originated on another Edge
/// (or on this one, for every local session except the one the mutation
/// actually came through — see the module doc comment). A not-yet-admitted
/// local session gets the change buffered instead of applied, per
/// `PreConnectPatch`'s contract.
fn apply_remote_user_state(state: &Arc<EdgeState>, record: UserRecord) {
    let previous_channel = state
        .mirror
        .all_users()
        .into_iter()
        .find(|u| u.session_id == record.session_id)
        .map(|u| u.channel_id);
    state.mirror.upsert_user(record.clone());

    if let Some(local) = state.sessions.get(record.session_id) {
        if !local.admitted.load(Ordering::Acquire) {
            let mut pending = local.pre_connect.lock();
            pending.push(PreConnectPatch::Moved { channel_id: record.channel_id });
            pending.push(PreConnectPatch::MuteDeaf { mute: record.mute, deaf: record.deaf });
            return;
        }
        local.channel_id.store(record.channel_id, Ordering::Relaxed);
        local.mute.store(record.mute, Ordering::Relaxed);
        local.deaf.store(record.deaf, Ordering::Relaxed);
    }

    broadcast_user_state_locally(state, &record, previous_channel);
}

/// Drains `HubBroadcast`s pushed by the Hub and keeps this Edge's mirror
/// (and whatever it's locally terminating) converged on the cluster's
/// authoritative state.
pub async fn run_broadcast_consumer(state: Arc<EdgeState>, mut rx: mpsc::Receiver<HubBroadcast>) {
    while let Some(event) = rx.recv().await {
        match event {
            HubBroadcast::ChannelSaved { channel } => {
                state.mirror.save_channel(channel.clone());
                broadcast_channel_state_locally(&state, &channel);
            }
            HubBroadcast::ChannelRemoved { channel_id } => {
                state.mirror.remove_channel(channel_id);
                let msg = mumble::ChannelRemove { channel_id };
                for s in state.sessions.all() {
                    s.send(msg.clone());
                }
            }
            HubBroadcast::AclSaved { channel_id, acls, groups, inherit_acls } => {
                state.mirror.hydrate_acls(channel_id, acls, groups, inherit_acls);
            }
            HubBroadcast::BanSaved { ban } => {
                state.mirror.bans.write().push(ban);
            }
            HubBroadcast::UserStateChanged { session: record } => {
                apply_remote_user_state(&state, record);
            }
            HubBroadcast::UserLeft { session_id, reason, banned } => {
                state.mirror.remove_user(session_id);
                let msg = mumble::UserRemove {
                    session: session_id,
                    actor: None,
                    reason,
                    ban: Some(banned),
                };
                for s in state.sessions.all() {
                    s.send(msg.clone());
                }
                state.sessions.remove(session_id);
            }
            HubBroadcast::TextMessage { actor, sessions, channel_ids, tree_ids, message } => {
                let msg = mumble::TextMessage {
                    actor: Some(actor),
                    session: sessions,
                    channel_id: channel_ids,
                    tree_id: tree_ids,
                    message: Some(message),
                };
                deliver_text_message_locally(&state, &msg);
            }
            HubBroadcast::PeerJoined { edge_id, public_addr, voice_addr } => {
                state.mirror.upsert_peer(PeerInfo { edge_id, public_addr, voice_addr });
            }
            HubBroadcast::PeerLeft { edge_id } => {
                state.mirror.remove_peer(&edge_id);
            }
        }
    }
    tracing::error!("hub broadcast channel closed — this edge is no longer receiving cluster updates");
}

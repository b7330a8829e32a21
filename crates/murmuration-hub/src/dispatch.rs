use std::sync::Arc;

use murmuration_protocol::cluster::{AuthReject, EdgeMethod, HubBroadcast, HubResult};
use murmuration_protocol::model::{permissions, AclEntry, Channel, Group};

use crate::acl;
use crate::password;
use crate::state::HubState;

fn permission_denied(reason: &str) -> HubResult {
    HubResult::Error {
        message: format!("permission denied: {reason}"),
    }
}

/// Apply one Edge request against the Hub's authoritative state, persist
/// whatever changed, and fan the resulting mutation out to every other
/// connected Edge. The Hub is the only writer of record — an Edge that
/// issued the request applies the same mutation to its own mirror
/// optimistically rather than waiting on this round trip, so this handler
/// excludes the requesting Edge from the broadcast it triggers.
pub async fn handle(state: &Arc<HubState>, edge_id: &str, method: EdgeMethod) -> HubResult {
    match method {
        // Join handshake is handled by the listener before the connection
        // is admitted into the normal request loop; seeing either here
        // means an Edge is misbehaving.
        EdgeMethod::RequestJoin { .. } | EdgeMethod::ConfirmJoin { .. } => HubResult::Error {
            message: "join handshake already completed for this connection".to_string(),
        },
        EdgeMethod::Heartbeat { .. } => HubResult::Ok,

        EdgeMethod::AllocateSessionId => HubResult::SessionId {
            session_id: state.allocate_session_id(),
        },

        EdgeMethod::FullSync => {
            let channels = state.channels.read().values().cloned().collect();
            let groups = state
                .groups
                .read()
                .iter()
                .flat_map(|(channel_id, groups)| groups.iter().map(move |g| (*channel_id, g.clone())))
                .collect();
            let acls = state
                .acls
                .read()
                .iter()
                .flat_map(|(channel_id, acls)| acls.iter().map(move |a| (*channel_id, a.clone())))
                .collect();
            let bans = state.bans.read().clone();
            let users = state.users.read().values().cloned().collect();
            HubResult::FullSync {
                channels,
                groups,
                acls,
                bans,
                users,
            }
        }

        EdgeMethod::GetChannels => HubResult::Channels {
            channels: state.channels.read().values().cloned().collect(),
        },

        EdgeMethod::GetAcls { channel_id } => {
            let acls = state
                .acls
                .read()
                .get(&channel_id)
                .cloned()
                .unwrap_or_default();
            let groups = state
                .groups
                .read()
                .get(&channel_id)
                .cloned()
                .unwrap_or_default();
            let inherit_acls = state
                .channels
                .read()
                .get(&channel_id)
                .map(|c| c.inherit_acls)
                .unwrap_or(true);
            HubResult::Acls {
                acls,
                groups,
                inherit_acls,
            }
        }

        EdgeMethod::SaveChannel { channel, actor_session_id } => {
            let actor_user_id = acl::user_id_for_session(state, actor_session_id);
            if !acl::has(state, channel.id, actor_user_id, permissions::WRITE) {
                return permission_denied("missing write permission");
            }
            save_channel(state, &channel);
            state.broadcast(HubBroadcast::ChannelSaved { channel }, Some(edge_id));
            HubResult::Ok
        }

        EdgeMethod::CreateChannel {
            parent,
            name,
            temporary,
            position,
            max_users,
            actor_session_id,
        } => {
            let actor_user_id = acl::user_id_for_session(state, actor_session_id);
            let required = if temporary { permissions::MAKE_TEMP_CHANNEL } else { permissions::MAKE_CHANNEL };
            if !acl::has(state, parent, actor_user_id, required) {
                return permission_denied("missing make-channel permission");
            }
            let channel = Channel {
                id: state.allocate_channel_id(),
                parent: Some(parent),
                name,
                description: None,
                position,
                temporary,
                max_users,
                links: Vec::new(),
                inherit_acls: true,
            };
            save_channel(state, &channel);
            state.broadcast(HubBroadcast::ChannelSaved { channel: channel.clone() }, Some(edge_id));
            HubResult::ChannelCreated { channel }
        }

        EdgeMethod::RemoveChannel { channel_id, actor_session_id } => {
            if channel_id == 0 {
                return permission_denied("cannot remove the root channel");
            }
            let actor_user_id = acl::user_id_for_session(state, actor_session_id);
            if !acl::has(state, channel_id, actor_user_id, permissions::WRITE) {
                return permission_denied("missing write permission");
            }
            remove_channel(state, channel_id);
            state.broadcast(HubBroadcast::ChannelRemoved { channel_id }, Some(edge_id));
            HubResult::Ok
        }

        EdgeMethod::SaveAcl {
            channel_id,
            acls,
            groups,
            inherit_acls,
            actor_session_id,
        } => {
            let actor_user_id = acl::user_id_for_session(state, actor_session_id);
            if !acl::has(state, channel_id, actor_user_id, permissions::WRITE) {
                return permission_denied("missing write permission");
            }
            save_acl(state, channel_id, acls.clone(), groups.clone(), inherit_acls);
            state.broadcast(
                HubBroadcast::AclSaved {
                    channel_id,
                    acls,
                    groups,
                    inherit_acls,
                },
                Some(edge_id),
            );
            HubResult::Ok
        }

        EdgeMethod::SaveBan { ban, actor_session_id } => {
            let actor_user_id = acl::user_id_for_session(state, actor_session_id);
            if !acl::has(state, 0, actor_user_id, permissions::BAN) {
                return permission_denied("missing ban permission");
            }
            state.bans.write().push(ban.clone());
            state.broadcast(HubBroadcast::BanSaved { ban }, Some(edge_id));
            HubResult::Ok
        }

        EdgeMethod::ReportSessionJoined { session } => {
            state.users.write().insert(session.session_id, session.clone());
            state.broadcast(HubBroadcast::UserStateChanged { session }, Some(edge_id));
            HubResult::Ok
        }

        EdgeMethod::ReportSessionLeft { session_id } => {
            state.users.write().remove(&session_id);
            state.broadcast(
                HubBroadcast::UserLeft {
                    session_id,
                    reason: None,
                    banned: false,
                },
                Some(edge_id),
            );
            HubResult::Ok
        }

        EdgeMethod::UpdateUserState { session, actor_session_id } => {
            let previous_channel = state.users.read().get(&session.session_id).map(|u| u.channel_id);
            let acting_on_self = actor_session_id == session.session_id;
            let moved = previous_channel.is_some_and(|prev| prev != session.channel_id);

            if moved {
                let target_user_id = session.user_id.unwrap_or(0);
                if !acl::has(state, session.channel_id, target_user_id, permissions::ENTER) {
                    return permission_denied("no enter permission");
                }
            }
            if !acting_on_self {
                let actor_user_id = acl::user_id_for_session(state, actor_session_id);
                let check_channel = previous_channel.unwrap_or(session.channel_id);
                let required = if moved { permissions::MOVE } else { permissions::MUTE_DEAFEN };
                if !acl::has(state, check_channel, actor_user_id, required) {
                    return permission_denied("missing permission");
                }
            }

            state.users.write().insert(session.session_id, session.clone());
            state.broadcast(HubBroadcast::UserStateChanged { session }, Some(edge_id));
            HubResult::Ok
        }

        EdgeMethod::Authenticate {
            username,
            password,
            certificate_hash,
        } => handle_authenticate(state, &username, password.as_deref(), certificate_hash.as_deref()),

        EdgeMethod::RelayTextMessage {
            actor,
            sessions,
            channel_ids,
            tree_ids,
            message,
        } => {
            let actor_user_id = acl::user_id_for_session(state, actor);
            for channel_id in &channel_ids {
                if !acl::has(state, *channel_id, actor_user_id, permissions::TEXT_MESSAGE) {
                    return permission_denied("missing text permission");
                }
            }
            state.broadcast(
                HubBroadcast::TextMessage {
                    actor,
                    sessions,
                    channel_ids,
                    tree_ids,
                    message,
                },
                Some(edge_id),
            );
            HubResult::Ok
        }
    }
}

struct RegisteredUser {
    id: u32,
    name: String,
    password_hash: Option<String>,
}

/// A certificate-hash match logs the caller in as that registered identity
/// outright; otherwise fall back to username/password, and finally to an
/// unregistered guest login under the presented name if nothing in
/// `registered_users` claims it.
fn handle_authenticate(
    state: &Arc<HubState>,
    username: &str,
    password_attempt: Option<&str>,
    certificate_hash: Option<&str>,
) -> HubResult {
    let already_online = state.users.read().values().any(|u| u.name == username);

    let db = state.db.lock().unwrap();

    if let Some(hash) = certificate_hash {
        let found = db
            .query_row(
                "SELECT id, name, password_hash FROM registered_users WHERE certificate_hash = ?1",
                [hash],
                |row| {
                    Ok(RegisteredUser {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        password_hash: row.get(2)?,
                    })
                },
            )
            .ok();
        if let Some(user) = found {
            if user.name != username && state.users.read().values().any(|u| u.name == user.name) {
                return HubResult::AuthRejected {
                    reason: AuthReject::UsernameInUse,
                };
            }
            return HubResult::AuthAccepted {
                user_id: Some(user.id),
                name: user.name,
            };
        }
    }

    let registered = db
        .query_row(
            "SELECT id, name, password_hash FROM registered_users WHERE name = ?1",
            [username],
            |row| {
                Ok(RegisteredUser {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    password_hash: row.get(2)?,
                })
            },
        )
        .ok();

    match registered {
        Some(user) => {
            let ok = match (&user.password_hash, password_attempt) {
                (Some(stored), Some(attempt)) => password::verify_password(attempt, stored),
                (Some(_), None) => false,
                (None, _) => true,
            };
            if !ok {
                return HubResult::AuthRejected {
                    reason: AuthReject::WrongUserPw,
                };
            }
            HubResult::AuthAccepted {
                user_id: Some(user.id),
                name: user.name,
            }
        }
        None if already_online => HubResult::AuthRejected {
            reason: AuthReject::UsernameInUse,
        },
        None => HubResult::AuthAccepted {
            user_id: None,
            name: username.to_string(),
        },
    }
}

fn save_channel(state: &Arc<HubState>, channel: &Channel) {
    state.channels.write().insert(channel.id, channel.clone());

    let db = state.db.lock().unwrap();
    let _ = db.execute(
        "INSERT INTO channels (id, parent, name, description, position, temporary, max_users, inherit_acls)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
            parent = excluded.parent,
            name = excluded.name,
            description = excluded.description,
            position = excluded.position,
            temporary = excluded.temporary,
            max_users = excluded.max_users,
            inherit_acls = excluded.inherit_acls",
        rusqlite::params![
            channel.id,
            channel.parent,
            channel.name,
            channel.description,
            channel.position,
            channel.temporary,
            channel.max_users,
            channel.inherit_acls,
        ],
    );
}

fn remove_channel(state: &Arc<HubState>, channel_id: u32) {
    state.channels.write().remove(&channel_id);
    state.acls.write().remove(&channel_id);
    state.groups.write().remove(&channel_id);

    let db = state.db.lock().unwrap();
    let _ = db.execute("DELETE FROM channels WHERE id = ?1", [channel_id]);
}

fn save_acl(
    state: &Arc<HubState>,
    channel_id: u32,
    acls: Vec<AclEntry>,
    groups: Vec<Group>,
    inherit_acls: bool,
) {
    if let Some(channel) = state.channels.write().get_mut(&channel_id) {
        channel.inherit_acls = inherit_acls;
    }
    state.acls.write().insert(channel_id, acls.clone());
    state.groups.write().insert(channel_id, groups.clone());

    let db = state.db.lock().unwrap();
    let _ = db.execute(
        "UPDATE channels SET inherit_acls = ?2 WHERE id = ?1",
        rusqlite::params![channel_id, inherit_acls],
    );
    let _ = db.execute("DELETE FROM acl_entries WHERE channel_id = ?1", [channel_id]);
    for (order, acl) in acls.iter().enumerate() {
        let _ = db.execute(
            "INSERT INTO acl_entries (channel_id, apply_here, apply_subs, user_id, group_name, grant_mask, deny_mask, sort_order)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                channel_id,
                acl.apply_here,
                acl.apply_subs,
                acl.user_id,
                acl.group,
                acl.grant,
                acl.deny,
                order as i64,
            ],
        );
    }
}

//! The client's own read-mostly copy of channel/user state — the same
//! mirror-vs-authority split the edge keeps against the hub, one hop further
//! out. Every field here is populated purely by applying `ChannelState`,
//! `ChannelRemove`, `UserState`, and `UserRemove` frames as they arrive; the
//! client never has an authoritative opinion of its own.

use std::collections::HashMap;

use parking_lot::RwLock;

use murmuration_protocol::mumble;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: u32,
    pub parent: Option<u32>,
    pub name: String,
    pub description: Option<String>,
    pub links: Vec<u32>,
    pub temporary: bool,
    pub position: i32,
    pub max_users: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserInfo {
    pub session_id: u32,
    pub user_id: Option<u32>,
    pub name: String,
    pub channel_id: u32,
    pub mute: bool,
    pub deaf: bool,
    pub self_mute: bool,
    pub self_deaf: bool,
    pub suppress: bool,
    pub priority_speaker: bool,
    pub recording: bool,
    pub comment: Option<String>,
}

#[derive(Default)]
pub struct Mirror {
    channels: RwLock<HashMap<u32, ChannelInfo>>,
    users: RwLock<HashMap<u32, UserInfo>>,
}

impl Mirror {
    pub fn channel(&self, id: u32) -> Option<ChannelInfo> {
        self.channels.read().get(&id).cloned()
    }

    pub fn all_channels(&self) -> Vec<ChannelInfo> {
        self.channels.read().values().cloned().collect()
    }

    pub fn user(&self, session_id: u32) -> Option<UserInfo> {
        self.users.read().get(&session_id).cloned()
    }

    pub fn all_users(&self) -> Vec<UserInfo> {
        self.users.read().values().cloned().collect()
    }

    /// `ChannelState` is a patch: only fields the sender actually set should
    /// overwrite the current record. `links` is the exception — when
    /// non-empty it's always a full replacement (how the initial channel
    /// tree dump and channel-move operations send it); `links_add` /
    /// `links_remove` are the incremental form used for link-only edits.
    pub(crate) fn apply_channel_state(&self, cs: &mumble::ChannelState) {
        let Some(id) = cs.channel_id else { return };
        let mut channels = self.channels.write();
        let entry = channels.entry(id).or_insert_with(|| ChannelInfo {
            id,
            ..Default::default()
        });

        if let Some(parent) = cs.parent {
            entry.parent = Some(parent);
        }
        if let Some(name) = &cs.name {
            entry.name = name.clone();
        }
        if let Some(description) = &cs.description {
            entry.description = Some(description.clone());
        }
        if !cs.links.is_empty() {
            entry.links = cs.links.clone();
        }
        for link in &cs.links_add {
            if !entry.links.contains(link) {
                entry.links.push(*link);
            }
        }
        entry.links.retain(|l| !cs.links_remove.contains(l));
        if let Some(temporary) = cs.temporary {
            entry.temporary = temporary;
        }
        if let Some(position) = cs.position {
            entry.position = position;
        }
        if cs.max_users.is_some() {
            entry.max_users = cs.max_users;
        }
    }

    pub(crate) fn remove_channel(&self, channel_id: u32) {
        self.channels.write().remove(&channel_id);
    }

    pub(crate) fn apply_user_state(&self, us: &mumble::UserState) {
        let Some(session_id) = us.session else { return };
        let mut users = self.users.write();
        let entry = users.entry(session_id).or_insert_with(|| UserInfo {
            session_id,
            ..Default::default()
        });

        if let Some(user_id) = us.user_id {
            entry.user_id = Some(user_id);
        }
        if let Some(name) = &us.name {
            entry.name = name.clone();
        }
        if let Some(channel_id) = us.channel_id {
            entry.channel_id = channel_id;
        }
        if let Some(mute) = us.mute {
            entry.mute = mute;
        }
        if let Some(deaf) = us.deaf {
            entry.deaf = deaf;
        }
        if let Some(self_mute) = us.self_mute {
            entry.self_mute = self_mute;
        }
        if let Some(self_deaf) = us.self_deaf {
            entry.self_deaf = self_deaf;
        }
        if let Some(suppress) = us.suppress {
            entry.suppress = suppress;
        }
        if let Some(priority_speaker) = us.priority_speaker {
            entry.priority_speaker = priority_speaker;
        }
        if let Some(recording) = us.recording {
            entry.recording = recording;
        }
        if let Some(comment) = &us.comment {
            entry.comment = Some(comment.clone());
        }
    }

    pub(crate) fn remove_user(&self, session_id: u32) -> Option<UserInfo> {
        self.users.write().remove(&session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_state_patches_are_cumulative() {
        let mirror = Mirror::default();
        mirror.apply_channel_state(&mumble::ChannelState {
            channel_id: Some(1),
            parent: Some(0),
            name: Some("Lobby".into()),
            ..Default::default()
        });
        mirror.apply_channel_state(&mumble::ChannelState {
            channel_id: Some(1),
            position: Some(5),
            ..Default::default()
        });

        let channel = mirror.channel(1).unwrap();
        assert_eq!(channel.name, "Lobby");
        assert_eq!(channel.parent, Some(0));
        assert_eq!(channel.position, 5);
    }

    #[test]
    fn links_add_and_remove_adjust_incrementally() {
        let mirror = Mirror::default();
        mirror.apply_channel_state(&mumble::ChannelState {
            channel_id: Some(1),
            links: vec![2, 3],
            ..Default::default()
        });
        mirror.apply_channel_state(&mumble::ChannelState {
            channel_id: Some(1),
            links_add: vec![4],
            links_remove: vec![2],
            ..Default::default()
        });

        let mut links = mirror.channel(1).unwrap().links;
        links.sort_unstable();
        assert_eq!(links, vec![3, 4]);
    }

    #[test]
    fn full_links_replacement_discards_prior_set() {
        let mirror = Mirror::default();
        mirror.apply_channel_state(&mumble::ChannelState {
            channel_id: Some(1),
            links: vec![2, 3],
            ..Default::default()
        });
        mirror.apply_channel_state(&mumble::ChannelState {
            channel_id: Some(1),
            links: vec![9],
            ..Default::default()
        });

        assert_eq!(mirror.channel(1).unwrap().links, vec![9]);
    }

    #[test]
    fn user_state_patches_preserve_unset_fields() {
        let mirror = Mirror::default();
        mirror.apply_user_state(&mumble::UserState {
            session: Some(7),
            name: Some("admin".into()),
            channel_id: Some(0),
            ..Default::default()
        });
        mirror.apply_user_state(&mumble::UserState {
            session: Some(7),
            self_mute: Some(true),
            ..Default::default()
        });

        let user = mirror.user(7).unwrap();
        assert_eq!(user.name, "admin");
        assert_eq!(user.channel_id, 0);
        assert!(user.self_mute);
    }

    #[test]
    fn remove_drops_the_record() {
        let mirror = Mirror::default();
        mirror.apply_user_state(&mumble::UserState {
            session: Some(1),
            ..Default::default()
        });
        assert!(mirror.remove_user(1).is_some());
        assert!(mirror.user(1).is_none());

        mirror.apply_channel_state(&mumble::ChannelState {
            channel_id: Some(1),
            ..Default::default()
        });
        mirror.remove_channel(1);
        assert!(mirror.channel(1).is_none());
    }
}

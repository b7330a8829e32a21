//! "Channel ninja" mode (`channel_ninja` config): viewers who lack Enter
//! permission in a channel don't get to see who's hiding in it. The
//! visibility rule is simple — a viewer only ever learns about a user's
//! *current* `UserState` if the viewer holds Enter in that user's current
//! channel — but applying it to an already-converged client needs two
//! synthetic edits instead of just dropping updates: a user moving into a
//! hidden channel must be actively removed from a viewer who could
//! already see them, and a user moving out of one must be freshly
//! (re-)announced to a viewer who never got their original `UserState`
//! while they were hidden. Anything else about a hidden user — mute,
//! deaf, recording, comment — simply isn't forwarded.

use murmuration_protocol::model::{permissions, UserRecord};
use murmuration_protocol::mumble;

use crate::acl;
use crate::channel_tree::user_state_from_record;
use crate::mirror::Mirror;

fn can_enter(mirror: &Mirror, channel_id: u32, viewer_user_id: Option<u32>) -> bool {
    acl::has(mirror, channel_id, viewer_user_id.unwrap_or(0), permissions::ENTER)
}

/// The subset of `users` a viewer should be told about right now, honoring
/// ninja mode if enabled. Used to build the initial user list sent during
/// admission.
pub fn visible_to(mirror: &Mirror, ninja_enabled: bool, viewer_user_id: Option<u32>, users: &[UserRecord]) -> Vec<UserRecord> {
    if !ninja_enabled {
        return users.to_vec();
    }
    users
        .iter()
        .filter(|u| can_enter(mirror, u.channel_id, viewer_user_id))
        .cloned()
        .collect()
}

/// What a specific viewer should receive for a `UserState` change about
/// `record`. `previous_channel` is only set when this update is a channel
/// move; `None` means some other field changed in place.
pub enum Delivery {
    State(mumble::UserState),
    Remove(mumble::UserRemove),
    Drop,
}

pub fn deliver_for_viewer(
    mirror: &Mirror,
    ninja_enabled: bool,
    viewer_user_id: Option<u32>,
    record: &UserRecord,
    previous_channel: Option<u32>,
) -> Delivery {
    if !ninja_enabled {
        return Delivery::State(user_state_from_record(record));
    }

    let can_see_now = can_enter(mirror, record.channel_id, viewer_user_id);
    let could_see_before = previous_channel.map_or(can_see_now, |c| can_enter(mirror, c, viewer_user_id));

    match (could_see_before, can_see_now) {
        (_, true) => Delivery::State(user_state_from_record(record)),
        (true, false) => Delivery::Remove(mumble::UserRemove {
            session: record.session_id,
            actor: None,
            reason: None,
            ban: Some(false),
        }),
        (false, false) => Delivery::Drop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmuration_protocol::model::{AclEntry, Channel};

    fn chan(id: u32) -> Channel {
        Channel {
            id,
            parent: None,
            name: format!("c{id}"),
            description: None,
            position: 0,
            temporary: false,
            max_users: None,
            links: Vec::new(),
            inherit_acls: true,
        }
    }

    fn user(session_id: u32, channel_id: u32) -> UserRecord {
        UserRecord {
            session_id,
            user_id: None,
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
            edge_id: "edge-1".into(),
        }
    }

    #[test]
    fn ninja_disabled_always_shows_everyone() {
        let mirror = Mirror::default();
        mirror.save_channel(chan(0));
        let users = vec![user(1, 0)];
        assert_eq!(visible_to(&mirror, false, None, &users).len(), 1);
    }

    #[test]
    fn ninja_hides_channels_without_enter() {
        let mirror = Mirror::default();
        mirror.save_channel(chan(0));
        mirror.hydrate_acls(
            0,
            vec![AclEntry {
                apply_here: true,
                apply_subs: true,
                user_id: None,
                group: Some("nobody".into()),
                grant: permissions::ENTER,
                deny: 0,
            }],
            Vec::new(),
            true,
        );
        let users = vec![user(1, 0)];
        assert!(visible_to(&mirror, true, None, &users).is_empty());
    }

    #[test]
    fn move_into_hidden_channel_synthesizes_removal() {
        let mirror = Mirror::default();
        mirror.save_channel(chan(0));
        mirror.save_channel(chan(1));
        mirror.hydrate_acls(
            1,
            vec![AclEntry {
                apply_here: true,
                apply_subs: true,
                user_id: None,
                group: Some("nobody".into()),
                grant: permissions::ENTER,
                deny: 0,
            }],
            Vec::new(),
            true,
        );
        let record = user(5, 1);
        match deliver_for_viewer(&mirror, true, None, &record, Some(0)) {
            Delivery::Remove(r) => assert_eq!(r.session, 5),
            _ => panic!("expected a synthesized removal"),
        }
    }
}

//! Advisory ACL evaluation. The Hub is authoritative — every `SaveAcl`
//! round-trips there and comes back as an `AclSaved` broadcast — but
//! clients need instant permission feedback (greying out a mute button,
//! deciding whether to suppress a speaker) without a network round trip
//! per check, so the Edge keeps its own copy of the channel/ACL/group
//! tables and runs the same inheritance walk `murmuration-protocol::model`
//! defines.

use murmuration_protocol::model::{effective_permissions, permissions, AclNode, Channel};

use crate::mirror::Mirror;

/// Effective permission mask for `user_id` in `channel_id`, per the mirror's
/// current view of the channel/ACL/group tables.
pub fn effective(mirror: &Mirror, channel_id: u32, user_id: u32) -> i32 {
    let chain_ids = mirror.chain_to_root(channel_id);
    let channels = mirror.channels.read();
    let acls = mirror.acls.read();
    let groups = mirror.groups.read();

    let channels: Vec<&Channel> = chain_ids.iter().filter_map(|id| channels.get(id)).collect();
    if channels.len() != chain_ids.len() {
        // A channel in the chain vanished mid-walk (concurrent delete);
        // fail closed rather than risk evaluating a stale/partial chain.
        return permissions::NONE;
    }

    let empty_acls: Vec<_> = Vec::new();
    let empty_groups: Vec<_> = Vec::new();
    let nodes: Vec<AclNode<'_>> = channels
        .iter()
        .map(|channel| AclNode {
            channel,
            acls: acls.get(&channel.id).unwrap_or(&empty_acls),
            groups: groups.get(&channel.id).unwrap_or(&empty_groups),
        })
        .collect();

    effective_permissions(&nodes, user_id)
}

pub fn has(mirror: &Mirror, channel_id: u32, user_id: u32, required: i32) -> bool {
    permissions::has(effective(mirror, channel_id, user_id), required)
}

/// A session is suppressed (can be in a channel but not heard) unless it
/// holds Speak there and hasn't self-muted. Registered SuperUsers and
/// anyone who's just been granted Speak by a fresh ACL bypass the mute
/// side implicitly because `has_speak` already reflects the new mask.
pub fn should_suppress(mirror: &Mirror, channel_id: u32, user_id: u32, self_mute: bool) -> bool {
    if self_mute {
        return true;
    }
    !has(mirror, channel_id, user_id, permissions::SPEAK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmuration_protocol::model::AclEntry;

    fn chan(id: u32, parent: Option<u32>) -> Channel {
        Channel {
            id,
            parent,
            name: format!("c{id}"),
            description: None,
            position: 0,
            temporary: false,
            max_users: None,
            links: Vec::new(),
            inherit_acls: true,
        }
    }

    #[test]
    fn missing_channel_fails_closed() {
        let mirror = Mirror::default();
        mirror.save_channel(chan(0, None));
        // channel 1 doesn't exist, so chain_to_root(1) includes an id the
        // mirror has no Channel for.
        assert_eq!(effective(&mirror, 1, 42), permissions::NONE);
    }

    #[test]
    fn grants_from_root_acl_are_visible() {
        let mirror = Mirror::default();
        mirror.save_channel(chan(0, None));
        mirror.hydrate_acls(
            0,
            vec![AclEntry {
                apply_here: true,
                apply_subs: true,
                user_id: None,
                group: Some("all".into()),
                grant: permissions::SPEAK,
                deny: 0,
            }],
            Vec::new(),
            true,
        );
        assert!(has(&mirror, 0, 99, permissions::SPEAK));
        assert!(!should_suppress(&mirror, 0, 99, false));
    }

    #[test]
    fn self_mute_always_suppresses() {
        let mirror = Mirror::default();
        mirror.save_channel(chan(0, None));
        mirror.hydrate_acls(
            0,
            vec![AclEntry {
                apply_here: true,
                apply_subs: true,
                user_id: None,
                group: Some("all".into()),
                grant: permissions::SPEAK,
                deny: 0,
            }],
            Vec::new(),
            true,
        );
        assert!(should_suppress(&mirror, 0, 99, true));
    }
}

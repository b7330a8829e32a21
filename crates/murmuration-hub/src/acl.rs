//! Authoritative ACL evaluation. Every Edge keeps its own advisory copy of
//! this same walk (`murmuration-edge/src/acl.rs`) for instant local
//! feedback, but that copy is only ever a courtesy — the Hub is the one
//! place a mutation can't be let through on an Edge's say-so, since a buggy
//! or compromised Edge could otherwise call straight past its own advisory
//! gate.

use murmuration_protocol::model::{effective_permissions, permissions, AclNode, Channel};

use crate::state::HubState;

/// Walk from `channel_id` up through `parent` pointers to the root,
/// returning the chain root-first as `effective_permissions` expects.
pub fn chain_to_root(state: &HubState, channel_id: u32) -> Vec<u32> {
    let channels = state.channels.read();
    let mut chain = Vec::new();
    let mut current = Some(channel_id);
    while let Some(id) = current {
        chain.push(id);
        current = channels.get(&id).and_then(|c| c.parent);
    }
    chain.reverse();
    chain
}

/// Effective permission mask for `user_id` in `channel_id`, against the
/// canonical channel/ACL/group tables.
pub fn effective(state: &HubState, channel_id: u32, user_id: u32) -> i32 {
    let chain_ids = chain_to_root(state, channel_id);
    let channels = state.channels.read();
    let acls = state.acls.read();
    let groups = state.groups.read();

    let channels: Vec<&Channel> = chain_ids.iter().filter_map(|id| channels.get(id)).collect();
    if channels.len() != chain_ids.len() {
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

pub fn has(state: &HubState, channel_id: u32, user_id: u32, required: i32) -> bool {
    permissions::has(effective(state, channel_id, user_id), required)
}

/// Resolve a connected session back to its registered `user_id`, the way
/// every permission check keys off one. Unregistered guests (and sessions
/// the Hub has no record of, which shouldn't happen post-admission) count as
/// user_id 0 — the same convention the Edge's own advisory checks use.
pub fn user_id_for_session(state: &HubState, session_id: u32) -> u32 {
    state
        .users
        .read()
        .get(&session_id)
        .and_then(|u| u.user_id)
        .unwrap_or(0)
}

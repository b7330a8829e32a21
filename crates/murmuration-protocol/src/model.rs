//! Shared data-transfer types for the cluster: the channel tree, ACL/group
//! entries, bans, and the online-user record the Hub and every Edge agree
//! on the shape of. Also the Mumble permission bit flags and the ACL
//! inheritance/evaluation algorithm, generalized from the community's
//! simpler per-role permission bitmask into Mumble's per-channel,
//! group-aware ACL model.

use serde::{Deserialize, Serialize};

/// Permission bit flags as defined by the Mumble 1.4.x protocol. A user's
/// effective permissions in a channel are the bitwise OR/AND-NOT
/// combination of every applicable `ChanACL` entry walked up the channel's
/// parent chain (see [`effective_permissions`]).
pub mod permissions {
    pub const NONE: i32 = 0;
    pub const WRITE: i32 = 1;
    pub const TRAVERSE: i32 = 2;
    pub const ENTER: i32 = 4;
    pub const SPEAK: i32 = 8;
    pub const WHISPER: i32 = 16;
    pub const MUTE_DEAFEN: i32 = 32;
    pub const MOVE: i32 = 64;
    pub const MAKE_CHANNEL: i32 = 128;
    pub const MAKE_TEMP_CHANNEL: i32 = 256;
    pub const LINK_CHANNEL: i32 = 512;
    pub const TEXT_MESSAGE: i32 = 1024;
    pub const KICK: i32 = 2048;
    pub const BAN: i32 = 4096;
    pub const REGISTER: i32 = 8192;
    pub const SELF_REGISTER: i32 = 16384;

    /// SuperUser/root bypasses every ACL check outright.
    pub const ALL: i32 = WRITE
        | TRAVERSE
        | ENTER
        | SPEAK
        | WHISPER
        | MUTE_DEAFEN
        | MOVE
        | MAKE_CHANNEL
        | MAKE_TEMP_CHANNEL
        | LINK_CHANNEL
        | TEXT_MESSAGE
        | KICK
        | BAN
        | REGISTER
        | SELF_REGISTER;

    pub fn has(mask: i32, required: i32) -> bool {
        mask & required == required
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: u32,
    pub parent: Option<u32>,
    pub name: String,
    pub description: Option<String>,
    pub position: i32,
    pub temporary: bool,
    pub max_users: Option<u32>,
    pub links: Vec<u32>,
    pub inherit_acls: bool,
}

/// One ACL grant/deny rule attached to a channel. `group` and `user_id` are
/// mutually exclusive in practice: a rule targets either a named group or a
/// single registered user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    pub apply_here: bool,
    pub apply_subs: bool,
    pub user_id: Option<u32>,
    pub group: Option<String>,
    pub grant: i32,
    pub deny: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub inherit: bool,
    pub inheritable: bool,
    pub add: Vec<u32>,
    pub remove: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanEntry {
    pub address: Vec<u8>,
    pub mask: u32,
    pub name: Option<String>,
    pub hash: Option<String>,
    pub reason: Option<String>,
    pub start: Option<String>,
    pub duration_secs: Option<u32>,
}

/// A connected user as the Hub's authoritative table and every Edge's
/// mirror agree on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
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
    pub edge_id: String,
}

/// A node in the channel tree with its ACL entries and groups already
/// resolved, as handed to [`effective_permissions`]. The Hub (and each
/// Edge's advisory evaluator) builds this by walking `parent` pointers.
pub struct AclNode<'a> {
    pub channel: &'a Channel,
    pub acls: &'a [AclEntry],
    pub groups: &'a [Group],
}

/// Is `user_id` a member of `group_name`, as resolved for the channel at
/// `depth` in `chain`? A group need not be redefined at every channel that
/// references it: if `chain[depth]` doesn't define `group_name` itself, the
/// search continues up toward the root and uses the closest ancestor's
/// definition, provided that ancestor marked the group `inheritable`. The
/// channel's own definition (at `depth`) is always usable regardless of
/// `inheritable`, since that flag only governs visibility to *other*
/// channels.
fn in_group(chain: &[AclNode<'_>], depth: usize, group_name: &str, user_id: u32) -> bool {
    for i in (0..=depth).rev() {
        if let Some(g) = chain[i].groups.iter().find(|g| g.name == group_name) {
            if i == depth || g.inheritable {
                return g.add.contains(&user_id) && !g.remove.contains(&user_id);
            }
            // Defined at this ancestor but not marked inheritable — invisible
            // to descendants; keep walking toward the root for another match.
        }
    }
    group_name == "all"
}

/// Compute a user's effective permission mask in a channel by walking from
/// the root down to the target channel, applying each ACL entry that
/// matches the user (by `user_id` or by group membership) in channel order.
/// A channel with `inherit_acls = false` discards everything accumulated
/// from its ancestors before applying its own rules. `apply_subs` rules
/// from an ancestor apply to every descendant; `apply_here`-only rules
/// apply only at the channel that declared them.
///
/// `chain` must be ordered root-first, target-last.
pub fn effective_permissions(chain: &[AclNode<'_>], user_id: u32) -> i32 {
    let mut effective: i32 = 0;

    for (depth, node) in chain.iter().enumerate() {
        let is_target = depth == chain.len() - 1;

        if !node.channel.inherit_acls {
            effective = 0;
        }

        for acl in node.acls {
            let applies = if is_target { acl.apply_here } else { acl.apply_subs };
            if !applies {
                continue;
            }

            let matches = match (&acl.group, acl.user_id) {
                (Some(group), _) => in_group(chain, depth, group, user_id),
                (None, Some(uid)) => uid == user_id,
                (None, None) => false,
            };

            if matches {
                effective = (effective & !acl.deny) | acl.grant;
            }
        }
    }

    effective
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chan(id: u32, parent: Option<u32>, inherit_acls: bool) -> Channel {
        Channel {
            id,
            parent,
            name: format!("chan-{id}"),
            description: None,
            position: 0,
            temporary: false,
            max_users: None,
            links: Vec::new(),
            inherit_acls,
        }
    }

    #[test]
    fn inherited_grant_applies_to_child() {
        let root = chan(0, None, true);
        let child = chan(1, Some(0), true);
        let root_acls = vec![AclEntry {
            apply_here: true,
            apply_subs: true,
            user_id: None,
            group: Some("all".into()),
            grant: permissions::SPEAK | permissions::TRAVERSE,
            deny: 0,
        }];
        let chain = vec![
            AclNode {
                channel: &root,
                acls: &root_acls,
                groups: &[],
            },
            AclNode {
                channel: &child,
                acls: &[],
                groups: &[],
            },
        ];

        let perms = effective_permissions(&chain, 42);
        assert!(permissions::has(perms, permissions::SPEAK));
        assert!(permissions::has(perms, permissions::TRAVERSE));
    }

    #[test]
    fn inherit_acls_false_discards_ancestor_grants() {
        let root = chan(0, None, true);
        let mut child = chan(1, Some(0), true);
        child.inherit_acls = false;

        let root_acls = vec![AclEntry {
            apply_here: true,
            apply_subs: true,
            user_id: None,
            group: Some("all".into()),
            grant: permissions::SPEAK,
            deny: 0,
        }];
        let chain = vec![
            AclNode {
                channel: &root,
                acls: &root_acls,
                groups: &[],
            },
            AclNode {
                channel: &child,
                acls: &[],
                groups: &[],
            },
        ];

        let perms = effective_permissions(&chain, 42);
        assert!(!permissions::has(perms, permissions::SPEAK));
    }

    #[test]
    fn deny_overrides_prior_grant() {
        let root = chan(0, None, true);
        let root_acls = vec![
            AclEntry {
                apply_here: true,
                apply_subs: true,
                user_id: None,
                group: Some("all".into()),
                grant: permissions::SPEAK | permissions::WRITE,
                deny: 0,
            },
            AclEntry {
                apply_here: true,
                apply_subs: true,
                user_id: Some(7),
                group: None,
                grant: 0,
                deny: permissions::SPEAK,
            },
        ];
        let chain = vec![AclNode {
            channel: &root,
            acls: &root_acls,
            groups: &[],
        }];

        let perms = effective_permissions(&chain, 7);
        assert!(!permissions::has(perms, permissions::SPEAK));
        assert!(permissions::has(perms, permissions::WRITE));
    }

    #[test]
    fn apply_subs_false_does_not_reach_children() {
        let root = chan(0, None, true);
        let child = chan(1, Some(0), true);
        let root_acls = vec![AclEntry {
            apply_here: true,
            apply_subs: false,
            user_id: None,
            group: Some("all".into()),
            grant: permissions::SPEAK,
            deny: 0,
        }];
        let chain = vec![
            AclNode {
                channel: &root,
                acls: &root_acls,
                groups: &[],
            },
            AclNode {
                channel: &child,
                acls: &[],
                groups: &[],
            },
        ];

        assert!(!permissions::has(
            effective_permissions(&chain, 1),
            permissions::SPEAK
        ));
    }

    #[test]
    fn group_defined_at_ancestor_resolves_for_child_acl() {
        let root = chan(0, None, true);
        let child = chan(1, Some(0), true);
        let root_groups = vec![Group {
            name: "trusted".into(),
            inherit: true,
            inheritable: true,
            add: vec![7],
            remove: Vec::new(),
        }];
        let child_acls = vec![AclEntry {
            apply_here: true,
            apply_subs: true,
            user_id: None,
            group: Some("trusted".into()),
            grant: permissions::SPEAK,
            deny: 0,
        }];
        let chain = vec![
            AclNode {
                channel: &root,
                acls: &[],
                groups: &root_groups,
            },
            AclNode {
                channel: &child,
                acls: &child_acls,
                groups: &[],
            },
        ];

        assert!(permissions::has(effective_permissions(&chain, 7), permissions::SPEAK));
        assert!(!permissions::has(effective_permissions(&chain, 8), permissions::SPEAK));
    }

    #[test]
    fn non_inheritable_ancestor_group_is_invisible_to_descendants() {
        let root = chan(0, None, true);
        let child = chan(1, Some(0), true);
        let root_groups = vec![Group {
            name: "trusted".into(),
            inherit: true,
            inheritable: false,
            add: vec![7],
            remove: Vec::new(),
        }];
        let child_acls = vec![AclEntry {
            apply_here: true,
            apply_subs: true,
            user_id: None,
            group: Some("trusted".into()),
            grant: permissions::SPEAK,
            deny: 0,
        }];
        let chain = vec![
            AclNode {
                channel: &root,
                acls: &[],
                groups: &root_groups,
            },
            AclNode {
                channel: &child,
                acls: &child_acls,
                groups: &[],
            },
        ];

        assert!(!permissions::has(effective_permissions(&chain, 7), permissions::SPEAK));
    }
}

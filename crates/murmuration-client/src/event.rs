//! The event half of the command/event API: whatever the mirror can't just
//! be polled for, the embedding application needs pushed to it as it
//! happens.

use murmuration_protocol::mumble;
use murmuration_protocol::wire::ControlMessage;

use crate::mirror::{ChannelInfo, Mirror, UserInfo};

#[derive(Debug, Clone)]
pub enum Event {
    ChannelUpdated(ChannelInfo),
    ChannelRemoved(u32),
    UserUpdated(UserInfo),
    UserRemoved {
        session_id: u32,
        actor: Option<u32>,
        reason: Option<String>,
        ban: bool,
    },
    TextMessage {
        actor: Option<u32>,
        session_ids: Vec<u32>,
        channel_ids: Vec<u32>,
        message: String,
    },
    ServerConfig(mumble::ServerConfig),
    SuggestConfig(mumble::SuggestConfig),
    PermissionDenied(mumble::PermissionDenied),
    Disconnected,
}

/// Apply a frame to the mirror and translate it into an event, if it's one
/// the embedding application needs to react to rather than just poll the
/// mirror for later. Message kinds with no client-facing meaning (`Ping`,
/// `CryptSetup`, voice packets, the server's own acknowledgements) fall
/// through to `None`.
pub(crate) fn apply_and_translate(mirror: &Mirror, msg: &ControlMessage) -> Option<Event> {
    match msg {
        ControlMessage::ChannelState(cs) => {
            mirror.apply_channel_state(cs);
            mirror.channel(cs.channel_id?).map(Event::ChannelUpdated)
        }
        ControlMessage::ChannelRemove(cr) => {
            mirror.remove_channel(cr.channel_id);
            Some(Event::ChannelRemoved(cr.channel_id))
        }
        ControlMessage::UserState(us) => {
            mirror.apply_user_state(us);
            mirror.user(us.session?).map(Event::UserUpdated)
        }
        ControlMessage::UserRemove(ur) => {
            mirror.remove_user(ur.session);
            Some(Event::UserRemoved {
                session_id: ur.session,
                actor: ur.actor,
                reason: ur.reason.clone(),
                ban: ur.ban.unwrap_or(false),
            })
        }
        ControlMessage::TextMessage(tm) => Some(Event::TextMessage {
            actor: tm.actor,
            session_ids: tm.session.clone(),
            channel_ids: tm.channel_id.clone(),
            message: tm.message.clone().unwrap_or_default(),
        }),
        ControlMessage::ServerConfig(sc) => Some(Event::ServerConfig(sc.clone())),
        ControlMessage::SuggestConfig(sg) => Some(Event::SuggestConfig(sg.clone())),
        ControlMessage::PermissionDenied(pd) => Some(Event::PermissionDenied(pd.clone())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_state_translates_to_the_patched_record() {
        let mirror = Mirror::default();
        let msg = ControlMessage::ChannelState(mumble::ChannelState {
            channel_id: Some(1),
            name: Some("Lobby".into()),
            ..Default::default()
        });

        let event = apply_and_translate(&mirror, &msg).unwrap();
        match event {
            Event::ChannelUpdated(info) => assert_eq!(info.name, "Lobby"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn user_remove_clears_the_mirror_and_reports_the_reason() {
        let mirror = Mirror::default();
        mirror.apply_user_state(&mumble::UserState {
            session: Some(3),
            name: Some("alice".into()),
            ..Default::default()
        });

        let msg = ControlMessage::UserRemove(mumble::UserRemove {
            session: 3,
            actor: Some(1),
            reason: Some("kicked".into()),
            ban: Some(true),
        });
        let event = apply_and_translate(&mirror, &msg).unwrap();
        match event {
            Event::UserRemoved { session_id, reason, ban, .. } => {
                assert_eq!(session_id, 3);
                assert_eq!(reason.as_deref(), Some("kicked"));
                assert!(ban);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(mirror.user(3).is_none());
    }

    #[test]
    fn ping_has_no_client_facing_event() {
        let mirror = Mirror::default();
        let msg = ControlMessage::Ping(mumble::Ping::default());
        assert!(apply_and_translate(&mirror, &msg).is_none());
    }
}

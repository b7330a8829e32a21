//! Shared `UserState` construction for everything in the admission sequence
//! that needs to describe an online user from the mirror's `UserRecord`
//! (the initial user list, `RequestBlob` comment resends, and so on). The
//! two-pass channel tree dissemination itself lives in `auth.rs`, which
//! writes straight to the connection's framed socket rather than through a
//! `Session`'s outbox — that outbox has no writer task draining it yet
//! until admission finishes.

use murmuration_protocol::mumble;

pub fn user_state_from_record(user: &murmuration_protocol::model::UserRecord) -> mumble::UserState {
    mumble::UserState {
        session: Some(user.session_id),
        name: Some(user.name.clone()),
        user_id: user.user_id,
        channel_id: Some(user.channel_id),
        mute: Some(user.mute),
        deaf: Some(user.deaf),
        self_mute: Some(user.self_mute),
        self_deaf: Some(user.self_deaf),
        suppress: Some(user.suppress),
        priority_speaker: Some(user.priority_speaker),
        recording: Some(user.recording),
        comment: user.comment.clone(),
        ..Default::default()
    }
}

//! The connection admission sequence: fingerprint peek through `ServerSync`.
//! This owns the control connection exclusively until it either returns an
//! admitted `Session` (the caller spawns the regular writer/dispatch tasks
//! around it) or sends a `Reject` and returns `None` (the caller closes the
//! socket). Mirrors ZUMBLE's own connect-then-authenticate flow, split here
//! across the extra Edge/Hub hop a single-process server doesn't need.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use murmuration_crypto::cert;
use murmuration_crypto::ocb2::CryptState;
use murmuration_protocol::cluster::{AuthReject, EdgeMethod, HubResult};
use murmuration_protocol::frame::ControlCodec;
use murmuration_protocol::model::UserRecord;
use murmuration_protocol::mumble;
use murmuration_protocol::wire::ControlMessage;

use crate::channel_tree;
use crate::ninja;
use crate::session::{PreConnectPatch, Session};
use crate::state::EdgeState;

const SERVER_VERSION_V1: u32 = 0x01_04_02;
const SERVER_VERSION_V2: u64 = 0x01_00_04_00_02;
const SERVER_RELEASE: &str = "murmuration";

/// Drive one connection's admission sequence to completion. `io` is the
/// full-duplex framed transport (already past the TLS handshake);
/// `peer_cert_der` is the client's leaf certificate, if one was presented.
/// On success, returns the new `Session` plus the receiving half of its
/// outbox — the caller owns spawning the writer task that drains it from
/// here on.
pub async fn admit<T>(
    state: &Arc<EdgeState>,
    io: &mut Framed<T, ControlCodec>,
    peer_addr: SocketAddr,
    peer_cert_der: Option<Vec<u8>>,
) -> anyhow::Result<Option<(Arc<Session>, mpsc::Receiver<ControlMessage>)>>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let fingerprint = peer_cert_der.as_deref().map(cert::fingerprint);

    if state.mirror.is_banned(peer_addr.ip(), fingerprint.as_deref()) {
        tracing::info!(%peer_addr, "rejecting banned connection");
        send_reject(io, mumble::reject::RejectType::ServerFull, "banned").await?;
        return Ok(None);
    }

    let session_id = match state.hub.call(EdgeMethod::AllocateSessionId).await? {
        HubResult::SessionId { session_id } => session_id,
        other => anyhow::bail!("unexpected hub response to allocateSessionId: {other:?}"),
    };

    io.send(ControlMessage::Version(mumble::Version {
        version_v1: Some(SERVER_VERSION_V1),
        version_v2: Some(SERVER_VERSION_V2),
        release: Some(SERVER_RELEASE.to_string()),
        os: Some(std::env::consts::OS.to_string()),
        os_version: Some(String::new()),
    }))
    .await?;

    let mut pre_auth_user_state: Option<mumble::UserState> = None;
    let auth = loop {
        let Some(frame) = io.next().await else {
            anyhow::bail!("connection closed before authenticating");
        };
        match frame? {
            ControlMessage::Version(_) => continue,
            ControlMessage::Authenticate(a) => break a,
            // Some clients send their initial self_mute/self_deaf/comment as
            // a UserState before Authenticate rather than waiting for
            // ServerSync; hold on to it and apply it once the session
            // actually exists, instead of dropping it with every other
            // pre-auth frame below.
            ControlMessage::UserState(s) => pre_auth_user_state = Some(s),
            other => tracing::debug!(kind = ?other.kind(), "ignoring message before authentication"),
        }
    };
    let client_opus = auth.opus.unwrap_or(false);

    let username = auth.username.clone().unwrap_or_default();
    if username.is_empty() {
        send_reject(io, mumble::reject::RejectType::InvalidUsername, "empty username").await?;
        return Ok(None);
    }

    let hub_result = state
        .hub
        .call(EdgeMethod::Authenticate {
            username: username.clone(),
            password: auth.password.clone(),
            certificate_hash: fingerprint.clone(),
        })
        .await?;

    let (user_id, name) = match hub_result {
        HubResult::AuthAccepted { user_id, name } => (user_id, name),
        HubResult::AuthRejected { reason } => {
            let (reject_type, text) = map_auth_reject(reason);
            send_reject(io, reject_type, text).await?;
            return Ok(None);
        }
        other => anyhow::bail!("unexpected hub response to authenticate: {other:?}"),
    };

    tracing::info!(%session_id, %name, %peer_addr, "session authenticated");

    let crypt = CryptState::generate();
    let crypt_setup = mumble::CryptSetup {
        key: Some(crypt.key().to_vec()),
        client_nonce: Some(crypt.decrypt_iv().to_vec()),
        server_nonce: Some(crypt.encrypt_iv().to_vec()),
    };

    let (outbox_tx, outbox_rx) = mpsc::channel::<ControlMessage>(256);
    let channel_id = state.config.default_channel_id;
    let session = Arc::new(Session::new(
        session_id,
        user_id,
        name.clone(),
        fingerprint,
        peer_addr,
        channel_id,
        crypt,
        outbox_tx,
    ));
    session.opus.store(client_opus, Ordering::Relaxed);
    if let Some(initial) = pre_auth_user_state {
        apply_pre_auth_user_state(&session, initial);
    }
    state.sessions.insert(Arc::clone(&session));

    io.send(ControlMessage::CryptSetup(crypt_setup)).await?;
    io.send(ControlMessage::CodecVersion(mumble::CodecVersion {
        alpha: -2_147_483_632,
        beta: 0,
        prefer_alpha: true,
        opus: Some(true),
    }))
    .await?;

    send_channel_tree_and_users(state, io, &session).await?;

    session.admitted.store(true, Ordering::Release);
    for patch in session.pre_connect.lock().drain(..).collect::<Vec<_>>() {
        apply_pre_connect_patch(&session, patch);
    }

    let record = UserRecord {
        session_id,
        user_id,
        name: name.clone(),
        channel_id: session.channel_id(),
        mute: session.mute.load(Ordering::Relaxed),
        deaf: session.deaf.load(Ordering::Relaxed),
        self_mute: session.self_mute.load(Ordering::Relaxed),
        self_deaf: session.self_deaf.load(Ordering::Relaxed),
        suppress: false,
        priority_speaker: false,
        recording: false,
        comment: session.comment.read().clone(),
        edge_id: state.config.edge_id.clone(),
    };
    state.mirror.upsert_user(record.clone());
    state
        .hub
        .call(EdgeMethod::ReportSessionJoined { session: record.clone() })
        .await?;

    io.send(ControlMessage::ServerSync(mumble::ServerSync {
        session: Some(session_id),
        max_bandwidth: Some(state.config.bandwidth as i32),
        welcome_text: Some(String::new()),
        permissions: Some(i64::from(permissions_for(state, &session))),
    }))
    .await?;

    io.send(ControlMessage::ServerConfig(mumble::ServerConfig {
        max_bandwidth: Some(state.config.bandwidth),
        welcome_text: Some(String::new()),
        allow_html: Some(state.config.allow_html),
        message_length: Some(state.config.text_message_length),
        image_message_length: Some(state.config.image_message_length),
        max_users: Some(state.config.max_users),
        recording_allowed: Some(true),
    }))
    .await?;

    if let Some(suggest) = suggest_config(state) {
        io.send(ControlMessage::SuggestConfig(suggest)).await?;
    }

    let self_state = channel_tree::user_state_from_record(&record);
    io.send(ControlMessage::UserState(self_state.clone())).await?;
    broadcast_new_user_to_locals(state, session_id, &record);

    Ok(Some((session, outbox_rx)))
}

fn permissions_for(state: &EdgeState, session: &Session) -> i32 {
    crate::acl::effective(&state.mirror, session.channel_id(), session.user_id().unwrap_or(0))
}

fn suggest_config(state: &EdgeState) -> Option<mumble::SuggestConfig> {
    let s = &state.config.suggest;
    if s.version.is_none() && s.positional.is_none() && s.push_to_talk.is_none() {
        return None;
    }
    Some(mumble::SuggestConfig {
        version: s.version,
        positional: s.positional,
        push_to_talk: s.push_to_talk,
    })
}

async fn send_channel_tree_and_users<T>(
    state: &Arc<EdgeState>,
    io: &mut Framed<T, ControlCodec>,
    session: &Session,
) -> anyhow::Result<()>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let channels = state.mirror.all_channels();

    for channel in &channels {
        io.send(ControlMessage::ChannelState(mumble::ChannelState {
            channel_id: Some(channel.id),
            parent: if channel.id == 0 { None } else { Some(0) },
            name: Some(channel.name.clone()),
            description: channel.description.clone(),
            temporary: Some(channel.temporary),
            position: Some(channel.position),
            max_users: channel.max_users,
            ..Default::default()
        }))
        .await?;
    }
    for channel in &channels {
        let Some(parent) = channel.parent else { continue };
        io.send(ControlMessage::ChannelState(mumble::ChannelState {
            channel_id: Some(channel.id),
            parent: Some(parent),
            ..Default::default()
        }))
        .await?;
    }
    for channel in &channels {
        if !channel.links.is_empty() {
            io.send(ControlMessage::ChannelState(mumble::ChannelState {
                channel_id: Some(channel.id),
                links: channel.links.clone(),
                ..Default::default()
            }))
            .await?;
        }
    }

    let visible = ninja::visible_to(
        &state.mirror,
        state.config.channel_ninja,
        session.user_id(),
        &state.mirror.all_users(),
    );
    for user in visible {
        io.send(ControlMessage::UserState(channel_tree::user_state_from_record(&user))).await?;
    }

    Ok(())
}

/// Apply the subset of a client's own pre-auth `UserState` that `Session`
/// has a slot for. Channel moves and anything targeting another session are
/// ignored here — a connecting client can only ever be describing itself at
/// this point, and a channel id this early would race the join coordinator.
fn apply_pre_auth_user_state(session: &Session, req: mumble::UserState) {
    if let Some(self_mute) = req.self_mute {
        session.self_mute.store(self_mute, Ordering::Relaxed);
    }
    if let Some(self_deaf) = req.self_deaf {
        session.self_deaf.store(self_deaf, Ordering::Relaxed);
    }
    if let Some(comment) = req.comment {
        *session.comment.write() = Some(comment);
    }
}

fn apply_pre_connect_patch(session: &Session, patch: PreConnectPatch) {
    match patch {
        PreConnectPatch::Moved { channel_id } => {
            session.channel_id.store(channel_id, Ordering::Relaxed);
        }
        PreConnectPatch::MuteDeaf { mute, deaf } => {
            session.mute.store(mute, Ordering::Relaxed);
            session.deaf.store(deaf, Ordering::Relaxed);
        }
        PreConnectPatch::Removed { .. } => {
            // The kick/ban landed before this session ever reached
            // ServerSync; the dispatch loop's first pass will see
            // `admitted == true` but find the session already gone from
            // the Hub's table and tear the connection down itself.
        }
    }
}

fn broadcast_new_user_to_locals(state: &Arc<EdgeState>, new_session_id: u32, record: &UserRecord) {
    for other in state.sessions.all() {
        if other.session_id == new_session_id {
            continue;
        }
        if let ninja::Delivery::State(s) =
            ninja::deliver_for_viewer(&state.mirror, state.config.channel_ninja, other.user_id(), record, None)
        {
            other.send(s);
        }
    }
}

fn map_auth_reject(reason: AuthReject) -> (mumble::reject::RejectType, &'static str) {
    match reason {
        AuthReject::InvalidUsername => (mumble::reject::RejectType::InvalidUsername, "invalid username"),
        AuthReject::WrongUserPw => (mumble::reject::RejectType::WrongUserPw, "wrong password"),
        AuthReject::UsernameInUse => (mumble::reject::RejectType::UsernameInUse, "username already in use"),
        AuthReject::NoCertificate => (mumble::reject::RejectType::NoCertificate, "certificate required"),
        AuthReject::AuthenticatorFail => (mumble::reject::RejectType::AuthenticatorFail, "authenticator failure"),
    }
}

async fn send_reject<T>(
    io: &mut Framed<T, ControlCodec>,
    reject_type: mumble::reject::RejectType,
    reason: &str,
) -> anyhow::Result<()>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    io.send(ControlMessage::Reject(mumble::Reject {
        r#type: Some(reject_type as i32),
        reason: Some(reason.to_string()),
    }))
    .await?;
    Ok(())
}

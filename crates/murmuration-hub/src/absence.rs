use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use murmuration_protocol::cluster::HubBroadcast;

use crate::state::HubState;

/// Periodically sweep connected Edges for missed heartbeats. An Edge that's
/// gone quiet for longer than `absence_timeout_secs` is declared dead: its
/// entry is dropped from the registry, every session it was hosting is
/// dropped from the authoritative user table (that Edge can't still be
/// serving them if the Hub can't reach it), and every other Edge is told
/// both facts so they can stop routing cross-cluster voice to it, evict its
/// cached broadcasts, and remove its users from their own mirrors.
pub async fn run(state: Arc<HubState>) {
    let timeout = state.config.absence_timeout_secs;
    let mut interval = tokio::time::interval(Duration::from_secs(5));

    loop {
        interval.tick().await;
        let now = now_secs();

        let dead: Vec<String> = state
            .edges
            .read()
            .iter()
            .filter(|(_, handle)| now.saturating_sub(handle.last_heartbeat.load(Ordering::Relaxed)) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for edge_id in dead {
            tracing::warn!(edge_id, "edge absence timeout — dropping from cluster registry");
            state.edges.write().remove(&edge_id);

            let orphaned: Vec<u32> = state
                .users
                .read()
                .values()
                .filter(|u| u.edge_id == edge_id)
                .map(|u| u.session_id)
                .collect();
            if !orphaned.is_empty() {
                let mut users = state.users.write();
                for session_id in &orphaned {
                    users.remove(session_id);
                }
            }
            for session_id in orphaned {
                state.broadcast(
                    HubBroadcast::UserLeft {
                        session_id,
                        reason: Some("edge connection lost".to_string()),
                        banned: false,
                    },
                    None,
                );
            }

            state.broadcast(HubBroadcast::PeerLeft { edge_id }, None);
        }
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

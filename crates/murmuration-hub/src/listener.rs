use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use murmuration_protocol::cluster::{
    ClusterEnvelope, EdgeMethod, HubBroadcast, HubResponse, HubResult,
};

use crate::dispatch;
use crate::join::{self, JoinError};
use crate::state::{EdgeHandle, HubState};

/// Accept Edge<->Hub control connections and run one read/dispatch/write
/// loop per connection. Requests arrive as newline-delimited JSON; each
/// gets a response on the same connection, and the Hub separately pushes
/// unsolicited broadcasts down the same socket as mutations land from
/// other Edges — both are written from a single task via `select!` so
/// there's only ever one writer per connection.
pub async fn run(listen_addr: &str, state: Arc<HubState>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!(addr = %listen_addr, "hub cluster listener started");

    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "cluster accept error");
                continue;
            }
        };
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, state).await {
                tracing::warn!(peer = %peer, error = %e, "edge connection ended");
            }
        });
    }
}

async fn handle_connection(socket: tokio::net::TcpStream, state: Arc<HubState>) -> anyhow::Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    let Some((edge_id, public_addr, voice_addr)) = join_handshake(&mut lines, &mut writer, &state).await? else {
        return Ok(());
    };

    let (tx, mut rx) = mpsc::channel::<HubBroadcast>(1024);
    let handle = Arc::new(EdgeHandle {
        edge_id: edge_id.clone(),
        public_addr: public_addr.clone(),
        voice_addr: voice_addr.clone(),
        tx,
        last_heartbeat: std::sync::atomic::AtomicU64::new(now_secs()),
    });
    state.edges.write().insert(edge_id.clone(), handle);

    for broadcast in state.cache.drain(&edge_id) {
        write_line(&mut writer, &ClusterEnvelope::Broadcast(broadcast)).await?;
    }

    state.broadcast(
        HubBroadcast::PeerJoined {
            edge_id: edge_id.clone(),
            public_addr,
            voice_addr,
        },
        Some(&edge_id),
    );

    let result = drive(&mut lines, &mut writer, &mut rx, &edge_id, &state).await;

    state.edges.write().remove(&edge_id);
    state.broadcast(HubBroadcast::PeerLeft { edge_id: edge_id.clone() }, None);

    result
}

type Lines = tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>;
type Writer = tokio::net::tcp::OwnedWriteHalf;

/// Run the `requestJoin` / `confirmJoin` handshake that opens every
/// Edge<->Hub connection. Serializes against every other connection's join
/// through `state.join`, so at most one Edge is mid-join at a time. Returns
/// the admitted Edge's identity once `confirmJoin` succeeds, or `None` if
/// the connection should simply be closed (queue timeout, malformed
/// handshake, missing peers).
async fn join_handshake(
    lines: &mut Lines,
    writer: &mut Writer,
    state: &Arc<HubState>,
) -> anyhow::Result<Option<(String, String, String)>> {
    let Some(line) = lines.next_line().await? else {
        return Ok(None);
    };
    let ClusterEnvelope::Request(req) = serde_json::from_str(&line)? else {
        anyhow::bail!("first message on a new connection must be a request");
    };
    let EdgeMethod::RequestJoin {
        edge_id,
        public_addr,
        voice_addr,
    } = req.method
    else {
        anyhow::bail!("first request on a new connection must be RequestJoin");
    };

    let token = match state.join.acquire().await {
        Ok(token) => token,
        Err(JoinError::QueueTimedOut) => {
            let resp = HubResponse {
                id: req.id,
                result: HubResult::Error {
                    message: "timed out waiting for the join queue".to_string(),
                },
            };
            write_line(writer, &ClusterEnvelope::Response(resp)).await?;
            return Ok(None);
        }
    };

    let peers = state.peers();
    let grant = HubResponse {
        id: req.id,
        result: HubResult::JoinGranted {
            token,
            peers: peers.clone(),
        },
    };
    write_line(writer, &ClusterEnvelope::Response(grant)).await?;

    let watchdog_state = Arc::clone(state);
    tokio::spawn(async move {
        tokio::time::sleep(join::JOIN_TIMEOUT).await;
        watchdog_state.join.release(token).await;
    });

    let Some(confirm_line) = lines.next_line().await? else {
        state.join.release(token).await;
        return Ok(None);
    };
    let ClusterEnvelope::Request(confirm_req) = serde_json::from_str(&confirm_line)? else {
        state.join.release(token).await;
        anyhow::bail!("expected confirmJoin after a join grant");
    };
    let EdgeMethod::ConfirmJoin {
        token: confirmed_token,
        connected_peers,
    } = confirm_req.method
    else {
        state.join.release(token).await;
        anyhow::bail!("expected confirmJoin after a join grant");
    };

    if confirmed_token != token {
        state.join.release(token).await;
        anyhow::bail!("confirmJoin presented a stale or unknown token");
    }

    let missing: Vec<&str> = peers
        .iter()
        .map(|p| p.edge_id.as_str())
        .filter(|id| !connected_peers.iter().any(|c| c == id))
        .collect();
    if !missing.is_empty() {
        state.join.release(token).await;
        let resp = HubResponse {
            id: confirm_req.id,
            result: HubResult::Error {
                message: format!("confirmJoin missing peers: {missing:?}"),
            },
        };
        write_line(writer, &ClusterEnvelope::Response(resp)).await?;
        return Ok(None);
    }

    state.join.release(token).await;

    let ack = HubResponse {
        id: confirm_req.id,
        result: HubResult::Ok,
    };
    write_line(writer, &ClusterEnvelope::Response(ack)).await?;

    Ok(Some((edge_id, public_addr, voice_addr)))
}

async fn drive(
    lines: &mut Lines,
    writer: &mut Writer,
    rx: &mut mpsc::Receiver<HubBroadcast>,
    edge_id: &str,
    state: &Arc<HubState>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                handle_request_line(&line, writer, edge_id, state).await?;
            }
            broadcast = rx.recv() => {
                let Some(broadcast) = broadcast else { continue };
                write_line(writer, &ClusterEnvelope::Broadcast(broadcast)).await?;
            }
        }
    }
    Ok(())
}

async fn handle_request_line(
    line: &str,
    writer: &mut Writer,
    edge_id: &str,
    state: &Arc<HubState>,
) -> anyhow::Result<()> {
    let envelope: ClusterEnvelope = match serde_json::from_str(line) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!(edge_id, error = %e, "malformed cluster envelope");
            return Ok(());
        }
    };

    let ClusterEnvelope::Request(req) = envelope else {
        return Ok(());
    };

    if matches!(req.method, EdgeMethod::Heartbeat { .. }) {
        if let Some(handle) = state.edges.read().get(edge_id) {
            handle
                .last_heartbeat
                .store(now_secs(), std::sync::atomic::Ordering::Relaxed);
        }
    }

    let result = dispatch::handle(state, edge_id, req.method).await;
    let response = HubResponse { id: req.id, result };
    write_line(writer, &ClusterEnvelope::Response(response)).await
}

async fn write_line(writer: &mut Writer, envelope: &ClusterEnvelope) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(envelope)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    Ok(())
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

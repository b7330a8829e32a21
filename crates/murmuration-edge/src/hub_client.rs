//! The Edge's side of the cluster control connection: the `requestJoin` /
//! `confirmJoin` handshake that admits this Edge into the cluster, and the
//! ongoing request/response + broadcast multiplexing once admitted.
//!
//! Grounded on the teacher's own IPC client (`ipc_client.rs`) — a
//! synchronous request-then-read-one-line client talking newline-delimited
//! JSON to a local daemon — generalized to async and to a connection that
//! also carries unsolicited broadcasts interleaved with request/response
//! traffic, which the teacher's single-shot client never needed to handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};

use murmuration_protocol::cluster::{
    ClusterEnvelope, EdgeMethod, EdgeRequest, HubBroadcast, HubResponse, HubResult,
};

use crate::config::EdgeConfig;
use crate::mirror::Mirror;

pub struct HubClient {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<HubResult>>>,
    requests_tx: mpsc::Sender<EdgeRequest>,
}

impl HubClient {
    pub async fn call(&self, method: EdgeMethod) -> anyhow::Result<HubResult> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.requests_tx.send(EdgeRequest { id, method }).await.is_err() {
            self.pending.lock().await.remove(&id);
            anyhow::bail!("hub control connection is closed");
        }

        rx.await
            .map_err(|_| anyhow::anyhow!("hub control connection closed before id {id} answered"))
    }
}

/// Connect to the Hub, complete the join handshake, and spin up the
/// background task that multiplexes further requests and broadcasts over
/// the one connection. Returns the request client plus a channel the
/// caller drains to react to `HubBroadcast`s as they arrive.
pub async fn connect(
    config: &EdgeConfig,
    mirror: &Mirror,
) -> anyhow::Result<(Arc<HubClient>, mpsc::Receiver<HubBroadcast>)> {
    let stream = TcpStream::connect(&config.hub_addr).await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    write_line(
        &mut write_half,
        &ClusterEnvelope::Request(EdgeRequest {
            id: 0,
            method: EdgeMethod::RequestJoin {
                edge_id: config.edge_id.clone(),
                public_addr: config.public_addr.clone(),
                voice_addr: config.public_voice_addr.clone(),
            },
        }),
    )
    .await?;

    let Some(line) = lines.next_line().await? else {
        anyhow::bail!("hub closed the connection before granting a join");
    };
    let ClusterEnvelope::Response(HubResponse {
        result: HubResult::JoinGranted { token, peers },
        ..
    }) = serde_json::from_str(&line)?
    else {
        anyhow::bail!("hub did not grant a join: {line}");
    };

    let connected_peers: Vec<String> = peers.iter().map(|p| p.edge_id.clone()).collect();
    for peer in peers {
        mirror.upsert_peer(peer);
    }

    write_line(
        &mut write_half,
        &ClusterEnvelope::Request(EdgeRequest {
            id: 1,
            method: EdgeMethod::ConfirmJoin {
                token,
                connected_peers,
            },
        }),
    )
    .await?;

    let Some(line) = lines.next_line().await? else {
        anyhow::bail!("hub closed the connection before confirming the join");
    };
    let ClusterEnvelope::Response(HubResponse {
        result: HubResult::Ok,
        ..
    }) = serde_json::from_str(&line)?
    else {
        anyhow::bail!("hub rejected confirmJoin: {line}");
    };

    tracing::info!(edge_id = %config.edge_id, "joined cluster");

    let (requests_tx, mut requests_rx) = mpsc::channel::<EdgeRequest>(1024);
    let (broadcast_tx, broadcast_rx) = mpsc::channel::<HubBroadcast>(1024);

    let client = Arc::new(HubClient {
        next_id: AtomicU64::new(2),
        pending: Mutex::new(HashMap::new()),
        requests_tx,
    });

    let pending = Arc::clone(&client);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Ok(Some(line)) = line else {
                        tracing::error!("hub control connection dropped");
                        break;
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let envelope: ClusterEnvelope = match serde_json::from_str(&line) {
                        Ok(e) => e,
                        Err(e) => {
                            tracing::warn!(error = %e, "malformed envelope from hub");
                            continue;
                        }
                    };
                    match envelope {
                        ClusterEnvelope::Response(resp) => {
                            if let Some(tx) = pending.pending.lock().await.remove(&resp.id) {
                                let _ = tx.send(resp.result);
                            }
                        }
                        ClusterEnvelope::Broadcast(b) => {
                            if broadcast_tx.send(b).await.is_err() {
                                break;
                            }
                        }
                        ClusterEnvelope::Request(_) => {
                            tracing::warn!("hub sent a request on an edge-owned connection");
                        }
                    }
                }
                req = requests_rx.recv() => {
                    let Some(req) = req else { break };
                    if write_line(&mut write_half, &ClusterEnvelope::Request(req)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let heartbeat_client = Arc::clone(&client);
    let heartbeat_edge_id = config.edge_id.clone();
    let heartbeat_interval = Duration::from_secs(config.heartbeat_interval_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(heartbeat_interval);
        loop {
            interval.tick().await;
            if heartbeat_client
                .call(EdgeMethod::Heartbeat {
                    edge_id: heartbeat_edge_id.clone(),
                })
                .await
                .is_err()
            {
                tracing::warn!("heartbeat failed — hub connection likely gone");
                break;
            }
        }
    });

    Ok((client, broadcast_rx))
}

async fn write_line(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    envelope: &ClusterEnvelope,
) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(envelope)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    Ok(())
}

mod acl;
mod auth;
mod channel_tree;
mod config;
mod dispatch;
mod hub_client;
mod listener;
mod mirror;
mod ninja;
mod session;
mod state;
mod voice;

use std::sync::Arc;

use tokio::net::UdpSocket;

use config::EdgeConfig;
use mirror::Mirror;
use murmuration_protocol::cluster::EdgeMethod;
use state::EdgeState;

struct Args {
    config_path: String,
}

fn parse_args() -> Args {
    let mut args = std::env::args().skip(1);
    let mut config_path = "murmuration-edge.toml".to_string();

    while let Some(arg) = args.next() {
        if arg == "--config" {
            config_path = args.next().unwrap_or(config_path);
        }
    }

    Args { config_path }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    tracing::info!("murmuration-edged starting");

    let args = parse_args();
    let config = EdgeConfig::load(&args.config_path)?;

    let mirror = Mirror::default();
    let (hub, broadcast_rx) = hub_client::connect(&config, &mirror).await?;

    let full_sync = hub.call(EdgeMethod::FullSync).await?;
    mirror.hydrate_from_full_sync(full_sync);

    let voice_socket = Arc::new(UdpSocket::bind(&config.voice_addr).await?);
    let cluster_voice_socket = Arc::new(UdpSocket::bind(&config.cluster_voice_addr).await?);

    let listen_addr = config.listen_addr.clone();
    let state = Arc::new(EdgeState::new(config, mirror, hub, voice_socket, cluster_voice_socket));

    tokio::spawn(dispatch::run_broadcast_consumer(Arc::clone(&state), broadcast_rx));
    tokio::spawn(voice::run_client_voice(Arc::clone(&state)));
    tokio::spawn(voice::run_cluster_voice(Arc::clone(&state)));

    tracing::info!(addr = %listen_addr, "murmuration-edged ready");
    listener::run(state).await?;

    Ok(())
}

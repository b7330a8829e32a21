mod absence;
mod acl;
mod cache;
mod config;
mod db;
mod dispatch;
mod join;
mod listener;
mod password;
mod state;

use std::sync::Arc;

use config::HubConfig;
use state::HubState;

struct Args {
    config_path: String,
}

fn parse_args() -> Args {
    let mut args = std::env::args().skip(1);
    let mut config_path = "murmuration-hub.toml".to_string();

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
    tracing::info!("murmuration-hubd starting");

    let args = parse_args();
    let config = HubConfig::load(&args.config_path)?;

    if let Some(parent) = std::path::Path::new(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = db::open_hub_db(&config.db_path).map_err(anyhow::Error::msg)?;

    let listen_addr = config.listen_addr.clone();
    let state = Arc::new(HubState::new(config, db.clone()));

    load_persisted_state(&state)?;

    let absence_state = Arc::clone(&state);
    tokio::spawn(absence::run(absence_state));

    tracing::info!(addr = %listen_addr, "murmuration-hubd ready");
    listener::run(&listen_addr, state).await?;

    Ok(())
}

fn load_persisted_state(state: &Arc<HubState>) -> anyhow::Result<()> {
    let persisted = db::load_persisted_state(&state.db).map_err(anyhow::Error::msg)?;

    let mut channels = state.channels.write();
    for channel in persisted.channels {
        channels.insert(channel.id, channel);
    }
    drop(channels);

    let mut groups = state.groups.write();
    for (channel_id, group) in persisted.groups {
        groups.entry(channel_id).or_default().push(group);
    }
    drop(groups);

    let mut acls = state.acls.write();
    for (channel_id, acl) in persisted.acls {
        acls.entry(channel_id).or_default().push(acl);
    }
    drop(acls);

    *state.bans.write() = persisted.bans;

    if state.channels.read().is_empty() {
        tracing::info!("no persisted channels found — creating root channel");
        let root = murmuration_protocol::model::Channel {
            id: 0,
            parent: None,
            name: "Root".to_string(),
            description: None,
            position: 0,
            temporary: false,
            max_users: None,
            links: Vec::new(),
            inherit_acls: true,
        };
        state.channels.write().insert(0, root);
    }

    Ok(())
}

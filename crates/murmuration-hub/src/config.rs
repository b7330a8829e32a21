use serde::Deserialize;

/// Hub daemon configuration, loaded from a TOML file (`--config`) and
/// falling back to these defaults for anything unset.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Address the cluster control listener binds to; Edges dial this.
    pub listen_addr: String,
    pub db_path: String,
    /// How long an Edge can go without a heartbeat before it's declared
    /// dead and its sessions are treated as disconnected. Edges heartbeat
    /// roughly every 30s, so this wants to be a few periods, not one.
    pub absence_timeout_secs: u64,
    /// How long a buffered broadcast is kept for an Edge that's briefly
    /// unreachable before it's dropped from the per-edge replay cache.
    pub message_cache_ttl_secs: u64,
    /// Cap on buffered broadcasts per offline Edge.
    pub message_cache_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:0".to_string(),
            db_path: default_db_path(),
            absence_timeout_secs: 90,
            message_cache_ttl_secs: 120,
            message_cache_capacity: 4096,
        }
    }
}

impl HubConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(toml::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path, "no hub config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn default_db_path() -> String {
    let base = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    format!("{base}/.local/share/murmuration-hub/hub.db")
}

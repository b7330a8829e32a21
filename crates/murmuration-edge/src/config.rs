use serde::Deserialize;

/// Edge daemon configuration, loaded from a TOML file (`--config`) and
/// falling back to these defaults for anything unset. Names follow the
/// cluster's own option surface so the same key means the same thing
/// whether it's read from here or handed out by the Hub.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    /// Identity this Edge registers under with the Hub and its peers.
    pub edge_id: String,
    /// Address the TLS control listener binds to; Mumble clients dial this.
    pub listen_addr: String,
    /// Address the client-facing UDP voice socket binds to. Real Mumble
    /// clients expect this to share the control port's number.
    pub voice_addr: String,
    /// Address the cluster-internal voice relay binds to; only other Edges
    /// in this cluster ever send here.
    pub cluster_voice_addr: String,
    /// Address this Edge advertises to the Hub and its peers for inbound
    /// cluster voice traffic — usually `cluster_voice_addr` rewritten with
    /// the host's externally reachable IP.
    pub public_voice_addr: String,
    /// Address this Edge advertises as its own public control endpoint.
    pub public_addr: String,
    /// Address of the Hub's cluster control listener.
    pub hub_addr: String,

    pub tls: TlsConfig,

    /// Deadline for a connection to complete the auth handshake (spec'd
    /// admission sequence, Version through ServerSync) before it's dropped.
    pub auth_timeout_secs: u64,
    /// How often this Edge sends a heartbeat to the Hub.
    pub heartbeat_interval_secs: u64,

    pub max_users: u32,
    pub max_users_per_channel: u32,
    pub channel_nesting_limit: u32,

    pub bandwidth: u32,
    pub text_message_length: u32,
    pub image_message_length: u32,

    pub allow_html: bool,
    pub default_channel_id: u32,
    pub remember_channel: bool,

    pub listeners_per_channel: u32,
    pub listeners_per_user: u32,

    pub username_regex: String,
    pub channel_name_regex: String,

    pub auto_ban: AutoBanConfig,
    pub suggest: SuggestConfig,

    /// Whether a user lacking Enter permission in a channel should see a
    /// synthetic `UserRemove`/fresh `UserState` pair instead of the other
    /// occupant's real mute/deaf/recording state changes while hidden.
    pub channel_ninja: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
    pub ca_path: Option<String>,
    pub require_client_cert: bool,
    pub reject_unauthorized: bool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct AutoBanConfig {
    pub attempts: u32,
    pub timeframe_secs: u32,
    pub duration_secs: u32,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SuggestConfig {
    pub version: Option<u32>,
    pub positional: Option<bool>,
    pub push_to_talk: Option<bool>,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            edge_id: "edge-1".to_string(),
            listen_addr: "0.0.0.0:64738".to_string(),
            voice_addr: "0.0.0.0:64738".to_string(),
            cluster_voice_addr: "0.0.0.0:64739".to_string(),
            public_voice_addr: "127.0.0.1:64739".to_string(),
            public_addr: "127.0.0.1:64738".to_string(),
            hub_addr: "127.0.0.1:64730".to_string(),
            tls: TlsConfig::default(),
            auth_timeout_secs: 30,
            heartbeat_interval_secs: 30,
            max_users: 1000,
            max_users_per_channel: 0,
            channel_nesting_limit: 10,
            bandwidth: 72_000,
            text_message_length: 5000,
            image_message_length: 131_072,
            allow_html: true,
            default_channel_id: 0,
            remember_channel: true,
            listeners_per_channel: 0,
            listeners_per_user: 0,
            username_regex: r"[-=\w\[\]{}()+<>!@$%^&*.,? ]+".to_string(),
            channel_name_regex: r"[-=\w\[\]{}()+<>!@$%^&*.,? ]+".to_string(),
            auto_ban: AutoBanConfig::default(),
            suggest: SuggestConfig::default(),
            channel_ninja: false,
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: "murmuration-edge-cert.pem".to_string(),
            key_path: "murmuration-edge-key.pem".to_string(),
            ca_path: None,
            require_client_cert: false,
            reject_unauthorized: false,
        }
    }
}

impl Default for AutoBanConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            timeframe_secs: 120,
            duration_secs: 300,
        }
    }
}

impl Default for SuggestConfig {
    fn default() -> Self {
        Self {
            version: None,
            positional: None,
            push_to_talk: None,
        }
    }
}

impl EdgeConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(toml::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path, "no edge config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}

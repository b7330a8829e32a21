/// Everything [`crate::Client::connect`] needs to reach and authenticate
/// against an edge. Unlike the Hub/Edge daemons this is a library entry
/// point, not a process with its own `--config` file — the embedding
/// application builds one of these directly.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the edge's TLS control listener.
    pub server_addr: String,
    /// Hostname used for the TLS `ServerName` (SNI); independent of
    /// `server_addr` so an IP-addressed connection can still present a
    /// real hostname.
    pub server_name: String,
    pub username: String,
    pub password: Option<String>,
    pub tokens: Vec<String>,
    /// Mirrors the edge's own trust model: a client certificate is an
    /// identity token the hub checks by fingerprint, not a CA chain either
    /// side validates, so by default this client accepts whatever
    /// certificate the edge presents rather than checking it against a
    /// root store.
    pub accept_any_server_cert: bool,
    /// PEM-encoded CA bundle to validate the edge's certificate against,
    /// required when `accept_any_server_cert` is false.
    pub server_ca_pem: Option<Vec<u8>>,
    /// PEM-encoded client certificate and key, if this connection should
    /// authenticate as a registered user by certificate rather than (or in
    /// addition to) a password.
    pub client_cert: Option<(Vec<u8>, Vec<u8>)>,
    pub opus: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:64738".to_string(),
            server_name: "localhost".to_string(),
            username: String::new(),
            password: None,
            tokens: Vec::new(),
            accept_any_server_cert: true,
            server_ca_pem: None,
            client_cert: None,
            opus: true,
        }
    }
}

//! Connect, authenticate, and hand back a live [`Client`] plus an event
//! stream. Grounded on the same connect-then-authenticate-then-drain-until-
//! `ServerSync` shape every real Mumble client library follows: send
//! `Version` and `Authenticate` up front, then read frames until
//! `ServerSync` lands, feeding `ChannelState`/`UserState` into the mirror as
//! they arrive so the tree and roster are already populated the moment the
//! handshake completes.

use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::{rustls, TlsConnector};
use tokio_util::codec::Framed;

use murmuration_protocol::frame::ControlCodec;
use murmuration_protocol::mumble;
use murmuration_protocol::wire::ControlMessage;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::event::{self, Event};
use crate::mirror::Mirror;

const CLIENT_VERSION_V1: u32 = 0x01_04_02;
const CLIENT_VERSION_V2: u64 = 0x01_00_04_00_02;
const CLIENT_RELEASE: &str = "murmuration-client";
const PING_INTERVAL_SECS: u64 = 15;
const OUTBOX_CAPACITY: usize = 256;
const EVENTS_CAPACITY: usize = 256;

/// A connected, authenticated session. Cloning is cheap — every clone shares
/// the same outbound channel and mirror, so a handle can be passed around
/// freely once `connect` returns it.
#[derive(Clone)]
pub struct Client {
    outbound: mpsc::Sender<ControlMessage>,
    mirror: Arc<Mirror>,
    session_id: u32,
}

impl Client {
    /// Open a TCP connection to `config.server_addr`, wrap it in TLS, run
    /// the admission sequence to completion, and spawn the background
    /// reader/writer/heartbeat tasks. Returns once `ServerSync` has been
    /// seen — by then the mirror already holds the full channel tree and
    /// user list per the server's own send order.
    pub async fn connect(config: ClientConfig) -> Result<(Self, mpsc::Receiver<Event>), ClientError> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let tls_config = build_tls_config(&config)?;
        let connector = TlsConnector::from(Arc::new(tls_config));

        let tcp = TcpStream::connect(&config.server_addr).await?;

        let server_name = ServerName::try_from(config.server_name.clone())
            .map_err(|_| ClientError::Tls(rustls::Error::General("invalid server name".to_string())))?;
        let tls_stream = connector.connect(server_name, tcp).await?;

        let mut framed = Framed::new(tls_stream, ControlCodec);

        framed
            .send(ControlMessage::Version(mumble::Version {
                version_v1: Some(CLIENT_VERSION_V1),
                version_v2: Some(CLIENT_VERSION_V2),
                release: Some(CLIENT_RELEASE.to_string()),
                os: Some(std::env::consts::OS.to_string()),
                os_version: Some(String::new()),
            }))
            .await?;

        framed
            .send(ControlMessage::Authenticate(mumble::Authenticate {
                username: Some(config.username.clone()),
                password: config.password.clone(),
                tokens: config.tokens.clone(),
                opus: Some(config.opus),
                ..Default::default()
            }))
            .await?;

        let mirror = Arc::new(Mirror::default());
        let session_id = run_handshake(&mut framed, &mirror).await?;

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENTS_CAPACITY);
        let (sink, stream) = framed.split();

        spawn_reader(stream, Arc::clone(&mirror), event_tx);
        spawn_writer(sink, outbound_rx);
        spawn_heartbeat(outbound_tx.clone());

        Ok((
            Self {
                outbound: outbound_tx,
                mirror,
                session_id,
            },
            event_rx,
        ))
    }

    pub fn mirror(&self) -> &Arc<Mirror> {
        &self.mirror
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Escape hatch for any message the typed helpers below don't cover.
    pub async fn send(&self, msg: impl Into<ControlMessage>) -> Result<(), ClientError> {
        self.outbound.send(msg.into()).await.map_err(|_| ClientError::NotConnected)
    }

    pub async fn text_message(&self, channel_ids: Vec<u32>, message: impl Into<String>) -> Result<(), ClientError> {
        self.send(mumble::TextMessage {
            actor: Some(self.session_id),
            session: Vec::new(),
            channel_id: channel_ids,
            tree_id: Vec::new(),
            message: Some(message.into()),
        })
        .await
    }

    pub async fn move_to_channel(&self, channel_id: u32) -> Result<(), ClientError> {
        self.send(mumble::UserState {
            session: Some(self.session_id),
            channel_id: Some(channel_id),
            ..Default::default()
        })
        .await
    }

    pub async fn set_self_mute_deaf(&self, self_mute: bool, self_deaf: bool) -> Result<(), ClientError> {
        self.send(mumble::UserState {
            session: Some(self.session_id),
            self_mute: Some(self_mute),
            self_deaf: Some(self_deaf),
            ..Default::default()
        })
        .await
    }

    pub async fn set_comment(&self, comment: impl Into<String>) -> Result<(), ClientError> {
        self.send(mumble::UserState {
            session: Some(self.session_id),
            comment: Some(comment.into()),
            ..Default::default()
        })
        .await
    }
}

/// Drain frames until `ServerSync`, applying every `ChannelState`/
/// `UserState` patch to the mirror along the way. A `Reject` ends the
/// handshake with an error instead of a session id.
async fn run_handshake<T>(framed: &mut Framed<T, ControlCodec>, mirror: &Mirror) -> Result<u32, ClientError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        let Some(frame) = framed.next().await else {
            return Err(ClientError::HandshakeClosed);
        };
        match frame? {
            ControlMessage::Version(_) | ControlMessage::CryptSetup(_) | ControlMessage::CodecVersion(_) => continue,
            ControlMessage::ChannelState(cs) => mirror.apply_channel_state(&cs),
            ControlMessage::UserState(us) => mirror.apply_user_state(&us),
            ControlMessage::Reject(r) => {
                return Err(ClientError::Rejected {
                    reason: r.reason.unwrap_or_default(),
                })
            }
            ControlMessage::ServerSync(sync) => {
                return sync.session.ok_or(ClientError::HandshakeClosed);
            }
            other => tracing::debug!(kind = ?other.kind(), "ignoring message during handshake"),
        }
    }
}

fn spawn_reader<T>(
    mut stream: futures::stream::SplitStream<Framed<T, ControlCodec>>,
    mirror: Arc<Mirror>,
    events: mpsc::Sender<Event>,
) where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(msg) => {
                    if let Some(ev) = event::apply_and_translate(&mirror, &msg) {
                        if events.send(ev).await.is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "connection decode error, closing");
                    break;
                }
            }
        }
        let _ = events.send(Event::Disconnected).await;
    });
}

fn spawn_writer<T>(mut sink: futures::stream::SplitSink<Framed<T, ControlCodec>, ControlMessage>, mut outbound_rx: mpsc::Receiver<ControlMessage>)
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });
}

fn spawn_heartbeat(outbound_tx: mpsc::Sender<ControlMessage>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let timestamp = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0);
            let ping = mumble::Ping {
                timestamp: Some(timestamp),
                ..Default::default()
            };
            if outbound_tx.send(ping.into()).await.is_err() {
                tracing::debug!("heartbeat stopped — connection closed");
                break;
            }
        }
    });
}

/// Mirrors the edge's own `AcceptAnyClientCert`: this protocol checks
/// identity by certificate fingerprint/registration, not CA trust, so by
/// default the client doesn't validate the edge's certificate against a
/// root store either.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn build_tls_config(config: &ClientConfig) -> Result<rustls::ClientConfig, ClientError> {
    let builder = rustls::ClientConfig::builder();

    let builder = if config.accept_any_server_cert {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(Arc::new(rustls::crypto::ring::default_provider()))))
    } else {
        let pem = config.server_ca_pem.as_ref().ok_or_else(|| {
            ClientError::Tls(rustls::Error::General(
                "accept_any_server_cert is false but no server_ca_pem was configured".to_string(),
            ))
        })?;
        let mut roots = rustls::RootCertStore::empty();
        for cert in load_certs(pem)? {
            roots.add(cert).map_err(ClientError::Tls)?;
        }
        builder.with_root_certificates(roots)
    };

    let tls_config = match &config.client_cert {
        Some((cert_pem, key_pem)) => {
            let certs = load_certs(cert_pem)?;
            let key = load_key(key_pem)?;
            builder.with_client_auth_cert(certs, key).map_err(ClientError::Tls)?
        }
        None => builder.with_no_client_auth(),
    };

    Ok(tls_config)
}

fn load_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, ClientError> {
    let mut reader = Cursor::new(pem);
    Ok(rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?)
}

fn load_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, ClientError> {
    let mut reader = Cursor::new(pem);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| ClientError::Tls(rustls::Error::General("no private key found".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_accepts_any_server_cert() {
        let config = ClientConfig::default();
        assert!(build_tls_config(&config).is_ok());
    }

    #[test]
    fn rejecting_server_certs_without_a_ca_is_an_error() {
        let config = ClientConfig {
            accept_any_server_cert: false,
            ..Default::default()
        };
        assert!(build_tls_config(&config).is_err());
    }
}

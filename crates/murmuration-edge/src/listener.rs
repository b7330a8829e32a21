//! The TLS control listener: one task per accepted connection running
//! `auth::admit` to completion, then handing off to a writer task (drains
//! the session's outbox) and this task's own read loop (feeds frames into
//! `dispatch::handle_client_message`) until the client disconnects.
//!
//! Grounded on the Hub's own `listener.rs` accept-loop shape
//! (`TcpListener::accept` in a spawn-per-connection loop); the TLS handshake
//! and the writer/reader split are new since the Hub's cluster link is a
//! plain TCP JSON stream with no client-facing transport security to set up.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::{rustls, TlsAcceptor};
use tokio_util::codec::Framed;

use murmuration_protocol::cluster::EdgeMethod;
use murmuration_protocol::frame::ControlCodec;
use murmuration_protocol::mumble;
use murmuration_protocol::wire::ControlMessage;

use crate::auth;
use crate::config::TlsConfig;
use crate::dispatch;
use crate::session::Session;
use crate::state::EdgeState;
use crate::voice;

pub async fn run(state: Arc<EdgeState>) -> anyhow::Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let tls_config = load_or_generate_tls(&state.config.tls)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let listener = TcpListener::bind(&state.config.listen_addr).await?;
    tracing::info!(addr = %state.config.listen_addr, "edge control listener started");

    loop {
        let (socket, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "control accept error");
                continue;
            }
        };
        let state = Arc::clone(&state);
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, peer_addr, acceptor, state).await {
                tracing::debug!(%peer_addr, error = %e, "connection ended");
            }
        });
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer_addr: SocketAddr,
    acceptor: TlsAcceptor,
    state: Arc<EdgeState>,
) -> anyhow::Result<()> {
    let tls_stream = acceptor.accept(socket).await?;
    let peer_cert_der = tls_stream
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|c| c.to_vec());

    let mut framed = Framed::new(tls_stream, ControlCodec);

    let admitted = tokio::time::timeout(
        Duration::from_secs(state.config.auth_timeout_secs),
        auth::admit(&state, &mut framed, peer_addr, peer_cert_der),
    )
    .await;

    let Ok(admitted) = admitted else {
        tracing::info!(%peer_addr, "admission timed out");
        return Ok(());
    };
    let Some((session, mut outbox_rx)) = admitted? else {
        return Ok(());
    };

    let session_id = session.session_id;
    let (mut sink, mut stream) = framed.split();

    let writer = tokio::spawn(async move {
        while let Some(msg) = outbox_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(msg) => dispatch_or_route_voice(&state, &session, msg).await,
            Err(e) => {
                tracing::debug!(session = session_id, error = %e, "frame decode error, closing connection");
                break;
            }
        }
    }

    writer.abort();
    teardown_session(&state, session_id).await;
    Ok(())
}

/// A `UDPTunnel` frame carries a plaintext voice packet riding the
/// already-TLS-protected control stream (the TCP fallback for clients that
/// can't or won't open a UDP socket) — it goes to the voice router, not the
/// ordinary message dispatcher.
async fn dispatch_or_route_voice(state: &Arc<EdgeState>, session: &Arc<Session>, msg: ControlMessage) {
    match msg {
        ControlMessage::UdpTunnel(tunnel) => {
            if let Some(packet) = tunnel.packet {
                voice::route_voice(state, session, packet).await;
            }
        }
        other => dispatch::handle_client_message(state, session, other).await,
    }
}

/// Reached both on a clean client disconnect and on a decode error tearing
/// the loop down early; either way the session needs to leave the table,
/// the Hub's authoritative roster, and every other local client's view.
async fn teardown_session(state: &Arc<EdgeState>, session_id: u32) {
    if state.sessions.remove(session_id).is_none() {
        return;
    }
    state.mirror.remove_user(session_id);
    let _ = state.hub.call(EdgeMethod::ReportSessionLeft { session_id }).await;

    let msg = mumble::UserRemove {
        session: session_id,
        actor: None,
        reason: None,
        ban: Some(false),
    };
    for s in state.sessions.all() {
        s.send(msg.clone());
    }
}

/// A client cert verifier that accepts anything presented. Matches the
/// protocol's own trust model: a certificate is an identity token checked by
/// fingerprint/registration, not a chain this layer is meant to validate.
#[derive(Debug)]
struct AcceptAnyClientCert(Arc<rustls::crypto::CryptoProvider>);

impl rustls::server::danger::ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        Ok(rustls::server::danger::ClientCertVerified::assertion())
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

fn load_or_generate_tls(tls: &TlsConfig) -> anyhow::Result<rustls::ServerConfig> {
    if !std::path::Path::new(&tls.cert_path).exists() || !std::path::Path::new(&tls.key_path).exists() {
        generate_self_signed(tls)?;
    }

    let certs = load_certs(&tls.cert_path)?;
    let key = load_key(&tls.key_path)?;
    let builder = rustls::ServerConfig::builder();

    let config = if !tls.require_client_cert {
        builder.with_no_client_auth().with_single_cert(certs, key)?
    } else if tls.reject_unauthorized {
        let roots = load_client_roots(tls)?;
        let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| anyhow::anyhow!("building client cert verifier: {e}"))?;
        builder.with_client_cert_verifier(verifier).with_single_cert(certs, key)?
    } else {
        // Client certs are required but not chain-validated — this
        // protocol checks identity by fingerprint/registration, not CA
        // trust, so ordinary self-signed client certs must still work.
        let verifier = Arc::new(AcceptAnyClientCert(Arc::new(rustls::crypto::ring::default_provider())));
        builder.with_client_cert_verifier(verifier).with_single_cert(certs, key)?
    };
    Ok(config)
}

fn load_client_roots(tls: &TlsConfig) -> anyhow::Result<rustls::RootCertStore> {
    let path = tls
        .ca_path
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("requireClientCert + rejectUnauthorized needs tls.ca configured"))?;
    let mut store = rustls::RootCertStore::empty();
    for cert in load_certs(path)? {
        store.add(cert)?;
    }
    Ok(store)
}

/// Self-signed fallback for a fresh deployment that hasn't provisioned a
/// certificate yet — mirrors how a standalone Mumble server bootstraps
/// itself on first run rather than refusing to start.
fn generate_self_signed(tls: &TlsConfig) -> anyhow::Result<()> {
    tracing::warn!(cert = %tls.cert_path, key = %tls.key_path, "generating a self-signed TLS certificate");
    let rcgen::CertifiedKey { cert, signing_key } = rcgen::generate_simple_self_signed(vec!["murmuration-edge".to_string()])?;
    std::fs::write(&tls.cert_path, cert.pem())?;
    std::fs::write(&tls.key_path, signing_key.serialize_pem())?;
    Ok(())
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    Ok(rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?)
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| anyhow::anyhow!("no private key found in {path}"))
}

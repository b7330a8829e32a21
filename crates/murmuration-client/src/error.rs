use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] murmuration_protocol::ProtocolError),

    #[error("server closed the connection before completing the handshake")]
    HandshakeClosed,

    #[error("server rejected authentication: {reason}")]
    Rejected { reason: String },

    #[error("not connected")]
    NotConnected,
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame exceeds 10 MiB hard cap: {0} bytes")]
    FrameTooLarge(usize),

    #[error("unknown message type {0}")]
    UnknownMessageType(u16),

    #[error("protobuf decode failed: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("protobuf encode failed: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("malformed voice packet: {0}")]
    MalformedVoicePacket(String),

    #[error("varint truncated")]
    TruncatedVarint,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cluster envelope error: {0}")]
    Cluster(String),
}

//! `tokio_util::codec` framing for the control channel: `(u16 type, u32
//! length, bytes payload)`. A frame whose declared length exceeds the 10 MiB
//! hard cap is treated as fatal for the connection (`FrameTooLarge` bubbles
//! up and the caller is expected to close the socket); a frame that decodes
//! to an unknown type or malformed protobuf is the caller's concern to treat
//! as connection-local, not fatal to the listener.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::wire::{ControlMessage, MessageKind};

/// Header is `u16` type + `u32` length, both big-endian, per Mumble's wire
/// format.
const HEADER_LEN: usize = 6;

/// Hard cap on a single control frame's payload. Mumble servers enforce the
/// same limit; anything larger is almost certainly a hostile or broken peer.
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct ControlCodec;

impl Decoder for ControlCodec {
    type Item = ControlMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let kind_raw = u16::from_be_bytes([src[0], src[1]]);
        let len = u32::from_be_bytes([src[2], src[3], src[4], src[5]]) as usize;

        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(len));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len);

        let kind = MessageKind::from_u16(kind_raw)?;
        let message = ControlMessage::decode(kind, &payload)?;
        Ok(Some(message))
    }
}

impl Encoder<ControlMessage> for ControlCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.encode_payload();
        if payload.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(payload.len()));
        }

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u16(item.kind() as u16);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mumble;

    #[test]
    fn roundtrips_through_the_codec() {
        let mut codec = ControlCodec;
        let mut buf = BytesMut::new();

        let msg: ControlMessage = mumble::Ping {
            timestamp: Some(42),
            ..Default::default()
        }
        .into();

        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_a_full_frame() {
        let mut codec = ControlCodec;
        let msg: ControlMessage = mumble::Ping {
            timestamp: Some(1),
            ..Default::default()
        }
        .into();

        let mut full = BytesMut::new();
        codec.encode(msg, &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn oversize_declared_length_is_fatal() {
        let mut codec = ControlCodec;
        let mut buf = BytesMut::new();
        buf.put_u16(MessageKind::Ping as u16);
        buf.put_u32((MAX_FRAME_LEN + 1) as u32);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }
}

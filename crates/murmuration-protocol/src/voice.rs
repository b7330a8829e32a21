//! Mumble's voice data format: a 1-byte header (`codec:3 | target:5`)
//! followed by a tagged-prefix varint session id, a tagged-prefix varint
//! sequence number, and codec payload. This is carried either inline inside
//! a `UDPTunnel` control message (TCP fallback) or as the plaintext of an
//! OCB2-AES128-encrypted UDP datagram (see `murmuration-crypto`).
//!
//! The varint encoding is Mumble's own (not LEB128): small values fit in one
//! byte, larger values use a tagged-prefix scheme topping out at a literal
//! 8-byte big-endian integer, and negative values recurse through a
//! dedicated prefix rather than using zigzag encoding.

use crate::error::ProtocolError;

/// Audio codec (or, for `Ping`, a UDP reachability probe riding the same
/// header) carried in a voice packet header's top 3 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceCodec {
    CeltAlpha,
    Ping,
    Speex,
    CeltBeta,
    Opus,
}

impl VoiceCodec {
    fn from_bits(bits: u8) -> Result<Self, ProtocolError> {
        Ok(match bits {
            0 => Self::CeltAlpha,
            1 => Self::Ping,
            2 => Self::Speex,
            3 => Self::CeltBeta,
            4 => Self::Opus,
            other => {
                return Err(ProtocolError::MalformedVoicePacket(format!(
                    "unknown codec bits {other:#05b}"
                )))
            }
        })
    }

    fn to_bits(self) -> u8 {
        match self {
            Self::CeltAlpha => 0,
            Self::Ping => 1,
            Self::Speex => 2,
            Self::CeltBeta => 3,
            Self::Opus => 4,
        }
    }
}

/// Voice routing target: 0 is normal speech, 1-30 are registered whisper
/// targets (see `VoiceTarget`), 31 is server loopback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceTarget(pub u8);

impl VoiceTarget {
    pub const NORMAL: VoiceTarget = VoiceTarget(0);
    pub const LOOPBACK: VoiceTarget = VoiceTarget(31);
}

/// The header bits of a voice packet: which codec encoded the payload, and
/// which target it should be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceHeader {
    pub codec: VoiceCodec,
    pub target: VoiceTarget,
}

impl VoiceHeader {
    pub fn decode(byte: u8) -> Result<Self, ProtocolError> {
        let codec = VoiceCodec::from_bits(byte >> 5)?;
        let target = VoiceTarget(byte & 0x1F);
        Ok(Self { codec, target })
    }

    pub fn encode(self) -> u8 {
        (self.codec.to_bits() << 5) | (self.target.0 & 0x1F)
    }
}

/// A decoded voice packet: header, session id (absent on client->server
/// packets, which identify the speaker implicitly by connection), sequence
/// number, and opaque codec payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoicePacket {
    pub header: VoiceHeader,
    pub session: Option<u64>,
    pub sequence: u64,
    pub payload: Vec<u8>,
}

impl VoicePacket {
    /// Encode a server->client voice packet, which carries the speaker's
    /// session id. Client->server packets omit it; use
    /// [`encode_without_session`](Self::encode_without_session) for those.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.header.encode()];
        if let Some(session) = self.session {
            write_varint(&mut out, session as i64);
        }
        write_varint(&mut out, self.sequence as i64);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode_with_session(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::decode(bytes, true)
    }

    pub fn decode_without_session(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::decode(bytes, false)
    }

    fn decode(bytes: &[u8], expect_session: bool) -> Result<Self, ProtocolError> {
        if bytes.is_empty() {
            return Err(ProtocolError::MalformedVoicePacket("empty packet".into()));
        }
        let header = VoiceHeader::decode(bytes[0])?;
        let mut cursor = &bytes[1..];

        let session = if expect_session {
            Some(read_varint(&mut cursor)? as u64)
        } else {
            None
        };
        let sequence = read_varint(&mut cursor)? as u64;

        Ok(Self {
            header,
            session,
            sequence,
            payload: cursor.to_vec(),
        })
    }
}

/// Append `value` to `out` using Mumble's tagged-prefix varint encoding.
pub fn write_varint(out: &mut Vec<u8>, value: i64) {
    if value < 0 {
        if value >= -4 {
            out.push(0xFC | ((-value - 1) as u8));
            return;
        }
        out.push(0xF8);
        write_varint(out, -value);
        return;
    }

    let v = value as u64;
    if v < 0x80 {
        out.push(v as u8);
    } else if v < 0x4000 {
        out.push(0x80 | (v >> 8) as u8);
        out.push((v & 0xFF) as u8);
    } else if v < 0x20_0000 {
        out.push(0xC0 | (v >> 16) as u8);
        out.push(((v >> 8) & 0xFF) as u8);
        out.push((v & 0xFF) as u8);
    } else if v < 0x1000_0000 {
        out.push(0xE0 | (v >> 24) as u8);
        out.push(((v >> 16) & 0xFF) as u8);
        out.push(((v >> 8) & 0xFF) as u8);
        out.push((v & 0xFF) as u8);
    } else if v < 0x1_0000_0000 {
        out.push(0xF0);
        out.extend_from_slice(&(v as u32).to_be_bytes());
    } else {
        out.push(0xF4);
        out.extend_from_slice(&v.to_be_bytes());
    }
}

/// Read one varint off the front of `bytes`, advancing the slice past it.
pub fn read_varint(bytes: &mut &[u8]) -> Result<i64, ProtocolError> {
    let take = |bytes: &mut &[u8], n: usize| -> Result<&[u8], ProtocolError> {
        if bytes.len() < n {
            return Err(ProtocolError::TruncatedVarint);
        }
        let (head, tail) = bytes.split_at(n);
        *bytes = tail;
        Ok(head)
    };

    let first = *take(bytes, 1)?.first().unwrap();

    if first & 0x80 == 0x00 {
        return Ok((first & 0x7F) as i64);
    }
    if first & 0xC0 == 0x80 {
        let rest = take(bytes, 1)?;
        return Ok((((first & 0x3F) as i64) << 8) | rest[0] as i64);
    }
    if first & 0xF0 == 0xF0 {
        return match first & 0xFC {
            0xF0 => {
                let rest = take(bytes, 4)?;
                Ok(u32::from_be_bytes(rest.try_into().unwrap()) as i64)
            }
            0xF4 => {
                let rest = take(bytes, 8)?;
                Ok(u64::from_be_bytes(rest.try_into().unwrap()) as i64)
            }
            0xF8 => Ok(-read_varint(bytes)?),
            0xFC => Ok(-((first & 0x03) as i64)),
            _ => Err(ProtocolError::MalformedVoicePacket(
                "reserved varint prefix".into(),
            )),
        };
    }
    if first & 0xE0 == 0xC0 {
        let rest = take(bytes, 2)?;
        return Ok((((first & 0x1F) as i64) << 16)
            | ((rest[0] as i64) << 8)
            | rest[1] as i64);
    }
    if first & 0xF0 == 0xE0 {
        let rest = take(bytes, 3)?;
        return Ok((((first & 0x0F) as i64) << 24)
            | ((rest[0] as i64) << 16)
            | ((rest[1] as i64) << 8)
            | rest[2] as i64);
    }
    Err(ProtocolError::MalformedVoicePacket(
        "unreachable varint prefix".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: i64) {
        let mut buf = Vec::new();
        write_varint(&mut buf, value);
        let mut cursor = buf.as_slice();
        let decoded = read_varint(&mut cursor).unwrap();
        assert_eq!(decoded, value, "roundtrip failed for {value}");
        assert!(cursor.is_empty());
    }

    #[test]
    fn varint_roundtrips_across_all_size_classes() {
        for v in [
            0,
            1,
            0x7F,
            0x80,
            0x3FFF,
            0x4000,
            0x1F_FFFF,
            0x20_0000,
            0x0FFF_FFFF,
            0x1000_0000,
            0xFFFF_FFFF,
            0x1_0000_0000,
            i64::MAX,
            -1,
            -4,
            -5,
            -1000,
            i64::MIN + 1,
        ] {
            roundtrip(v);
        }
    }

    #[test]
    fn voice_header_roundtrips() {
        let header = VoiceHeader {
            codec: VoiceCodec::Opus,
            target: VoiceTarget(3),
        };
        let byte = header.encode();
        assert_eq!(VoiceHeader::decode(byte).unwrap(), header);
    }

    #[test]
    fn voice_packet_with_session_roundtrips() {
        let packet = VoicePacket {
            header: VoiceHeader {
                codec: VoiceCodec::Opus,
                target: VoiceTarget::NORMAL,
            },
            session: Some(1234),
            sequence: 99,
            payload: vec![1, 2, 3, 4],
        };

        let bytes = packet.encode();
        let decoded = VoicePacket::decode_with_session(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn voice_packet_without_session_roundtrips() {
        let packet = VoicePacket {
            header: VoiceHeader {
                codec: VoiceCodec::Opus,
                target: VoiceTarget::NORMAL,
            },
            session: None,
            sequence: 7,
            payload: vec![0xAA; 16],
        };

        let bytes = packet.encode();
        let decoded = VoicePacket::decode_without_session(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn empty_packet_is_malformed() {
        assert!(matches!(
            VoicePacket::decode_with_session(&[]),
            Err(ProtocolError::MalformedVoicePacket(_))
        ));
    }
}

//! The Mumble 1.4.x control message set: `(u16 type, u32 length, bytes)`
//! framing around a protobuf payload (see `crate::mumble` for the generated
//! message types, and `crate::frame` for the raw length-prefixed codec this
//! module sits on top of).

use crate::error::ProtocolError;
use crate::mumble;
use prost::Message as _;

/// The 26 message kinds of the Mumble 1.4.x control protocol, in wire order.
/// The discriminant of each variant IS the on-wire `u16 type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    Version = 0,
    UdpTunnel = 1,
    Authenticate = 2,
    Ping = 3,
    Reject = 4,
    ServerSync = 5,
    ChannelRemove = 6,
    ChannelState = 7,
    UserRemove = 8,
    UserState = 9,
    BanList = 10,
    TextMessage = 11,
    PermissionDenied = 12,
    Acl = 13,
    QueryUsers = 14,
    CryptSetup = 15,
    ContextActionModify = 16,
    ContextAction = 17,
    UserList = 18,
    VoiceTarget = 19,
    PermissionQuery = 20,
    CodecVersion = 21,
    UserStats = 22,
    RequestBlob = 23,
    ServerConfig = 24,
    SuggestConfig = 25,
}

impl MessageKind {
    pub fn from_u16(v: u16) -> Result<Self, ProtocolError> {
        Ok(match v {
            0 => Self::Version,
            1 => Self::UdpTunnel,
            2 => Self::Authenticate,
            3 => Self::Ping,
            4 => Self::Reject,
            5 => Self::ServerSync,
            6 => Self::ChannelRemove,
            7 => Self::ChannelState,
            8 => Self::UserRemove,
            9 => Self::UserState,
            10 => Self::BanList,
            11 => Self::TextMessage,
            12 => Self::PermissionDenied,
            13 => Self::Acl,
            14 => Self::QueryUsers,
            15 => Self::CryptSetup,
            16 => Self::ContextActionModify,
            17 => Self::ContextAction,
            18 => Self::UserList,
            19 => Self::VoiceTarget,
            20 => Self::PermissionQuery,
            21 => Self::CodecVersion,
            22 => Self::UserStats,
            23 => Self::RequestBlob,
            24 => Self::ServerConfig,
            25 => Self::SuggestConfig,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }
}

/// A decoded control message, tagged by kind. Each variant owns the
/// `prost`-generated struct for that message so callers match on the enum
/// instead of re-parsing a `(kind, bytes)` pair themselves.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Version(mumble::Version),
    UdpTunnel(mumble::UdpTunnel),
    Authenticate(mumble::Authenticate),
    Ping(mumble::Ping),
    Reject(mumble::Reject),
    ServerSync(mumble::ServerSync),
    ChannelRemove(mumble::ChannelRemove),
    ChannelState(mumble::ChannelState),
    UserRemove(mumble::UserRemove),
    UserState(mumble::UserState),
    BanList(mumble::BanList),
    TextMessage(mumble::TextMessage),
    PermissionDenied(mumble::PermissionDenied),
    Acl(mumble::Acl),
    QueryUsers(mumble::QueryUsers),
    CryptSetup(mumble::CryptSetup),
    ContextActionModify(mumble::ContextActionModify),
    ContextAction(mumble::ContextAction),
    UserList(mumble::UserList),
    VoiceTarget(mumble::VoiceTarget),
    PermissionQuery(mumble::PermissionQuery),
    CodecVersion(mumble::CodecVersion),
    UserStats(mumble::UserStats),
    RequestBlob(mumble::RequestBlob),
    ServerConfig(mumble::ServerConfig),
    SuggestConfig(mumble::SuggestConfig),
}

impl ControlMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Version(_) => MessageKind::Version,
            Self::UdpTunnel(_) => MessageKind::UdpTunnel,
            Self::Authenticate(_) => MessageKind::Authenticate,
            Self::Ping(_) => MessageKind::Ping,
            Self::Reject(_) => MessageKind::Reject,
            Self::ServerSync(_) => MessageKind::ServerSync,
            Self::ChannelRemove(_) => MessageKind::ChannelRemove,
            Self::ChannelState(_) => MessageKind::ChannelState,
            Self::UserRemove(_) => MessageKind::UserRemove,
            Self::UserState(_) => MessageKind::UserState,
            Self::BanList(_) => MessageKind::BanList,
            Self::TextMessage(_) => MessageKind::TextMessage,
            Self::PermissionDenied(_) => MessageKind::PermissionDenied,
            Self::Acl(_) => MessageKind::Acl,
            Self::QueryUsers(_) => MessageKind::QueryUsers,
            Self::CryptSetup(_) => MessageKind::CryptSetup,
            Self::ContextActionModify(_) => MessageKind::ContextActionModify,
            Self::ContextAction(_) => MessageKind::ContextAction,
            Self::UserList(_) => MessageKind::UserList,
            Self::VoiceTarget(_) => MessageKind::VoiceTarget,
            Self::PermissionQuery(_) => MessageKind::PermissionQuery,
            Self::CodecVersion(_) => MessageKind::CodecVersion,
            Self::UserStats(_) => MessageKind::UserStats,
            Self::RequestBlob(_) => MessageKind::RequestBlob,
            Self::ServerConfig(_) => MessageKind::ServerConfig,
            Self::SuggestConfig(_) => MessageKind::SuggestConfig,
        }
    }

    /// Encode the payload bytes (without the `(type, length)` header —
    /// `crate::frame` owns that).
    pub fn encode_payload(&self) -> Vec<u8> {
        macro_rules! enc {
            ($m:expr) => {{
                let mut buf = Vec::with_capacity($m.encoded_len());
                $m.encode(&mut buf).expect("Vec<u8> writer is infallible");
                buf
            }};
        }
        match self {
            Self::Version(m) => enc!(m),
            Self::UdpTunnel(m) => enc!(m),
            Self::Authenticate(m) => enc!(m),
            Self::Ping(m) => enc!(m),
            Self::Reject(m) => enc!(m),
            Self::ServerSync(m) => enc!(m),
            Self::ChannelRemove(m) => enc!(m),
            Self::ChannelState(m) => enc!(m),
            Self::UserRemove(m) => enc!(m),
            Self::UserState(m) => enc!(m),
            Self::BanList(m) => enc!(m),
            Self::TextMessage(m) => enc!(m),
            Self::PermissionDenied(m) => enc!(m),
            Self::Acl(m) => enc!(m),
            Self::QueryUsers(m) => enc!(m),
            Self::CryptSetup(m) => enc!(m),
            Self::ContextActionModify(m) => enc!(m),
            Self::ContextAction(m) => enc!(m),
            Self::UserList(m) => enc!(m),
            Self::VoiceTarget(m) => enc!(m),
            Self::PermissionQuery(m) => enc!(m),
            Self::CodecVersion(m) => enc!(m),
            Self::UserStats(m) => enc!(m),
            Self::RequestBlob(m) => enc!(m),
            Self::ServerConfig(m) => enc!(m),
            Self::SuggestConfig(m) => enc!(m),
        }
    }

    pub fn decode(kind: MessageKind, payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(match kind {
            MessageKind::Version => Self::Version(mumble::Version::decode(payload)?),
            MessageKind::UdpTunnel => Self::UdpTunnel(mumble::UdpTunnel::decode(payload)?),
            MessageKind::Authenticate => Self::Authenticate(mumble::Authenticate::decode(payload)?),
            MessageKind::Ping => Self::Ping(mumble::Ping::decode(payload)?),
            MessageKind::Reject => Self::Reject(mumble::Reject::decode(payload)?),
            MessageKind::ServerSync => Self::ServerSync(mumble::ServerSync::decode(payload)?),
            MessageKind::ChannelRemove => {
                Self::ChannelRemove(mumble::ChannelRemove::decode(payload)?)
            }
            MessageKind::ChannelState => Self::ChannelState(mumble::ChannelState::decode(payload)?),
            MessageKind::UserRemove => Self::UserRemove(mumble::UserRemove::decode(payload)?),
            MessageKind::UserState => Self::UserState(mumble::UserState::decode(payload)?),
            MessageKind::BanList => Self::BanList(mumble::BanList::decode(payload)?),
            MessageKind::TextMessage => Self::TextMessage(mumble::TextMessage::decode(payload)?),
            MessageKind::PermissionDenied => {
                Self::PermissionDenied(mumble::PermissionDenied::decode(payload)?)
            }
            MessageKind::Acl => Self::Acl(mumble::Acl::decode(payload)?),
            MessageKind::QueryUsers => Self::QueryUsers(mumble::QueryUsers::decode(payload)?),
            MessageKind::CryptSetup => Self::CryptSetup(mumble::CryptSetup::decode(payload)?),
            MessageKind::ContextActionModify => {
                Self::ContextActionModify(mumble::ContextActionModify::decode(payload)?)
            }
            MessageKind::ContextAction => Self::ContextAction(mumble::ContextAction::decode(payload)?),
            MessageKind::UserList => Self::UserList(mumble::UserList::decode(payload)?),
            MessageKind::VoiceTarget => Self::VoiceTarget(mumble::VoiceTarget::decode(payload)?),
            MessageKind::PermissionQuery => {
                Self::PermissionQuery(mumble::PermissionQuery::decode(payload)?)
            }
            MessageKind::CodecVersion => Self::CodecVersion(mumble::CodecVersion::decode(payload)?),
            MessageKind::UserStats => Self::UserStats(mumble::UserStats::decode(payload)?),
            MessageKind::RequestBlob => Self::RequestBlob(mumble::RequestBlob::decode(payload)?),
            MessageKind::ServerConfig => Self::ServerConfig(mumble::ServerConfig::decode(payload)?),
            MessageKind::SuggestConfig => Self::SuggestConfig(mumble::SuggestConfig::decode(payload)?),
        })
    }
}

macro_rules! from_inner {
    ($variant:ident, $ty:ty) => {
        impl From<$ty> for ControlMessage {
            fn from(m: $ty) -> Self {
                Self::$variant(m)
            }
        }
    };
}

from_inner!(Version, mumble::Version);
from_inner!(UdpTunnel, mumble::UdpTunnel);
from_inner!(Authenticate, mumble::Authenticate);
from_inner!(Ping, mumble::Ping);
from_inner!(Reject, mumble::Reject);
from_inner!(ServerSync, mumble::ServerSync);
from_inner!(ChannelRemove, mumble::ChannelRemove);
from_inner!(ChannelState, mumble::ChannelState);
from_inner!(UserRemove, mumble::UserRemove);
from_inner!(UserState, mumble::UserState);
from_inner!(BanList, mumble::BanList);
from_inner!(TextMessage, mumble::TextMessage);
from_inner!(PermissionDenied, mumble::PermissionDenied);
from_inner!(Acl, mumble::Acl);
from_inner!(QueryUsers, mumble::QueryUsers);
from_inner!(CryptSetup, mumble::CryptSetup);
from_inner!(ContextActionModify, mumble::ContextActionModify);
from_inner!(ContextAction, mumble::ContextAction);
from_inner!(UserList, mumble::UserList);
from_inner!(VoiceTarget, mumble::VoiceTarget);
from_inner!(PermissionQuery, mumble::PermissionQuery);
from_inner!(CodecVersion, mumble::CodecVersion);
from_inner!(UserStats, mumble::UserStats);
from_inner!(RequestBlob, mumble::RequestBlob);
from_inner!(ServerConfig, mumble::ServerConfig);
from_inner!(SuggestConfig, mumble::SuggestConfig);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_every_message_kind() {
        let samples: Vec<ControlMessage> = vec![
            mumble::Version {
                version_v1: Some(0x01_04_02),
                version_v2: Some(0x01_00_04_00_02),
                release: Some("murmuration".into()),
                os: Some("linux".into()),
                os_version: Some("test".into()),
            }
            .into(),
            mumble::Authenticate {
                username: Some("admin".into()),
                password: Some("admin123".into()),
                opus: Some(true),
                ..Default::default()
            }
            .into(),
            mumble::ServerSync {
                session: Some(7),
                max_bandwidth: Some(72000),
                welcome_text: Some("hi".into()),
                permissions: Some(0xFFFF),
            }
            .into(),
            mumble::ChannelState {
                channel_id: Some(1),
                parent: Some(0),
                name: Some("Lobby".into()),
                ..Default::default()
            }
            .into(),
            mumble::UserState {
                session: Some(1),
                channel_id: Some(0),
                name: Some("admin".into()),
                ..Default::default()
            }
            .into(),
        ];

        for msg in samples {
            let kind = msg.kind();
            let payload = msg.encode_payload();
            let decoded = ControlMessage::decode(kind, &payload).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(matches!(
            MessageKind::from_u16(9999),
            Err(ProtocolError::UnknownMessageType(9999))
        ));
    }
}

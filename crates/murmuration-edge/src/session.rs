//! The per-connection client handle: one per locally-terminated TLS
//! connection, holding everything the reader/writer/voice tasks for that
//! connection need to share. Grounded directly on ZUMBLE's own `Client`
//! struct (`other_examples/9e142fb1_iLLeniumStudios-ZUMBLE__src-client.rs.rs`)
//! — an owned outbound queue plus atomics for the fast-changing scalar
//! fields, rather than one big lock around the whole struct.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use murmuration_crypto::ocb2::CryptState;
use murmuration_protocol::wire::ControlMessage;

/// One rule within a registered `VoiceTarget` slot (1-30): a set of named
/// sessions, or a channel (optionally including sub-channels and linked
/// channels, optionally filtered to a group).
#[derive(Debug, Clone, Default)]
pub struct VoiceTargetRule {
    pub sessions: Vec<u32>,
    pub channel_id: Option<u32>,
    pub group: Option<String>,
    pub links: bool,
    pub children: bool,
}

#[derive(Debug, Clone, Default)]
pub struct VoiceTargetSlot {
    pub rules: Vec<VoiceTargetRule>,
}

pub struct Session {
    pub session_id: u32,
    /// Unset until a registered-user authentication comes back from the
    /// Hub; a session created ahead of that (see `admitted`) starts as a
    /// guest and is upgraded in place rather than rebuilt.
    pub user_id: Mutex<Option<u32>>,
    pub fingerprint: Option<String>,
    pub peer_addr: SocketAddr,

    pub name: RwLock<String>,
    pub channel_id: AtomicU32,
    pub mute: AtomicBool,
    pub deaf: AtomicBool,
    pub self_mute: AtomicBool,
    pub self_deaf: AtomicBool,
    pub suppress: AtomicBool,
    pub priority_speaker: AtomicBool,
    pub recording: AtomicBool,
    pub opus: AtomicBool,
    pub comment: RwLock<Option<String>>,
    pub listening_channels: RwLock<Vec<u32>>,

    /// Registered whisper targets, indexed 1-30 (index 0 and 31 are never
    /// populated — those are the reserved normal-speech and loopback ids).
    pub voice_targets: RwLock<[VoiceTargetSlot; 32]>,

    /// This side's half of the OCB2 session: key plus independent
    /// encrypt/decrypt IVs, handed out via `CryptSetup` at admission.
    pub crypt: Mutex<CryptState>,
    /// The client's UDP source address, once discovered by matching a
    /// decryptable voice datagram back to this session (spec's
    /// brute-force-bounded-to-same-source-IP address discovery).
    pub udp_addr: Mutex<Option<SocketAddr>>,

    /// Set once this session has reached `ServerSync`. A mutation for this
    /// session_id that lands while it's still false (another edge racing
    /// a ban/kick/move against a session_id the Hub only just allocated)
    /// is buffered here instead of applied, then replayed or dropped when
    /// admission finishes rather than being silently lost.
    pub admitted: AtomicBool,
    pub pre_connect: Mutex<Vec<PreConnectPatch>>,

    outbox: mpsc::Sender<ControlMessage>,
}

/// A mutation that arrived for a session before it finished admission.
#[derive(Debug, Clone)]
pub enum PreConnectPatch {
    Moved { channel_id: u32 },
    MuteDeaf { mute: bool, deaf: bool },
    Removed { reason: Option<String> },
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: u32,
        user_id: Option<u32>,
        name: String,
        fingerprint: Option<String>,
        peer_addr: SocketAddr,
        channel_id: u32,
        crypt: CryptState,
        outbox: mpsc::Sender<ControlMessage>,
    ) -> Self {
        Self {
            session_id,
            user_id: Mutex::new(user_id),
            fingerprint,
            peer_addr,
            name: RwLock::new(name),
            channel_id: AtomicU32::new(channel_id),
            mute: AtomicBool::new(false),
            deaf: AtomicBool::new(false),
            self_mute: AtomicBool::new(false),
            self_deaf: AtomicBool::new(false),
            suppress: AtomicBool::new(false),
            priority_speaker: AtomicBool::new(false),
            recording: AtomicBool::new(false),
            opus: AtomicBool::new(false),
            comment: RwLock::new(None),
            listening_channels: RwLock::new(Vec::new()),
            voice_targets: RwLock::new(std::array::from_fn(|_| VoiceTargetSlot::default())),
            crypt: Mutex::new(crypt),
            udp_addr: Mutex::new(None),
            admitted: AtomicBool::new(false),
            pre_connect: Mutex::new(Vec::new()),
            outbox,
        }
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn user_id(&self) -> Option<u32> {
        *self.user_id.lock()
    }

    /// Fill in the identity this session authenticated as, once the Hub's
    /// answer comes back. Everything before this point used a placeholder
    /// name so the session could be inserted into the table (and start
    /// absorbing `pre_connect` patches) ahead of authentication finishing.
    pub fn set_identity(&self, name: String, user_id: Option<u32>) {
        *self.name.write() = name;
        *self.user_id.lock() = user_id;
    }

    /// Queue a control message for this session's dedicated writer task.
    /// Best-effort: a full outbox means the connection is far enough
    /// behind that the reader/voice-router side should be the one to
    /// notice and tear the connection down, not the caller.
    pub fn send(&self, message: impl Into<ControlMessage>) {
        if self.outbox.try_send(message.into()).is_err() {
            tracing::warn!(session = self.session_id, "outbox full, dropping control message");
        }
    }

    /// Can `speaker` (suppression/mute state already checked by the
    /// caller) reach this session's set of voice-target rules under slot
    /// `target`? Used by the voice router to resolve whisper recipients.
    pub fn matches_voice_target(slot: &VoiceTargetSlot, session_id: u32) -> bool {
        slot.rules.iter().any(|rule| rule.sessions.contains(&session_id))
    }
}

/// Every session currently terminated on this Edge, keyed by cluster-wide
/// session id.
#[derive(Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<u32, Arc<Session>>>,
}

impl SessionTable {
    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.write().insert(session.session_id, session);
    }

    pub fn remove(&self, session_id: u32) -> Option<Arc<Session>> {
        self.sessions.write().remove(&session_id)
    }

    pub fn get(&self, session_id: u32) -> Option<Arc<Session>> {
        self.sessions.read().get(&session_id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn in_channel(&self, channel_id: u32) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.channel_id() == channel_id)
            .cloned()
            .collect()
    }

    pub fn same_source_ip(&self, ip: std::net::IpAddr) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.peer_addr.ip() == ip)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

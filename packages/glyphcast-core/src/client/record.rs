//! Per-client state: capabilities, streaming flags, ingress/egress buffers,
//! crypto state, and codec handles.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::buffers::{FrameBuffer, PacketQueue, SampleRing};
use crate::codec::{AudioDecoder, AudioEncoder};
use crate::config::HostConfig;
use crate::crypto::DirectionCipher;
use crate::protocol::control::{ClientCapabilities, ColorLevel, RenderMode};
use crate::render::Palette;
use crate::stats::ClientStats;
use crate::transport::TransportSlot;

/// Stable client identifier, monotonically assigned, never reused within a
/// process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u32);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Capability fields guarded by the record's state mutex.
#[derive(Debug, Clone)]
pub struct ClientProfile {
    pub display_name: String,
    pub can_send_video: bool,
    pub can_send_audio: bool,
    pub wants_stretch: bool,
    pub terminal_width: u16,
    pub terminal_height: u16,
    pub color_level: ColorLevel,
    pub render_mode: RenderMode,
    pub palette_selector: u8,
    pub palette_custom: String,
    /// Cached glyph ramp, rebuilt whenever the palette fields change.
    pub palette: Palette,
    pub desired_fps: u8,
}

impl Default for ClientProfile {
    fn default() -> Self {
        Self {
            display_name: String::new(),
            can_send_video: false,
            can_send_audio: false,
            wants_stretch: false,
            terminal_width: 80,
            terminal_height: 24,
            color_level: ColorLevel::default(),
            render_mode: RenderMode::default(),
            palette_selector: 0,
            palette_custom: String::new(),
            palette: Palette::default(),
            desired_fps: 60,
        }
    }
}

impl ClientProfile {
    /// Applies a `CLIENT_CAPABILITIES` update and rebuilds the palette cache.
    pub fn apply_capabilities(&mut self, caps: &ClientCapabilities) {
        self.terminal_width = caps.width;
        self.terminal_height = caps.height;
        self.color_level = caps.color_level;
        self.render_mode = caps.render_mode;
        self.palette_selector = caps.palette;
        self.palette_custom = caps.custom_palette.clone();
        self.palette = Palette::build(caps.palette, &caps.custom_palette);
        if caps.desired_fps > 0 {
            self.desired_fps = caps.desired_fps;
        }
    }
}

/// How this peer is attached to the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    /// A socket peer with receive/send workers.
    Network,
    /// An in-process peer fed by direct injection; no transport, no receive
    /// or send worker.
    Memory,
}

/// Everything the hub knows about one connected peer.
///
/// # Concurrency design
///
/// - `profile` is the record's state mutex: capability/string fields only,
///   never held across I/O or codec calls.
/// - Streaming and lifecycle fields are atomics; once `active` flips false
///   every worker observes it on its next loop and exits.
/// - Buffer contents synchronize through the buffers' own internals.
/// - The allowed lock order is registry read lock → `profile`; the reverse
///   never happens.
pub struct ClientRecord {
    pub id: ClientId,
    pub remote_addr: Option<SocketAddr>,
    pub attachment: Attachment,

    pub profile: Mutex<ClientProfile>,

    // Streaming state
    pub is_sending_video: AtomicBool,
    pub is_sending_audio: AtomicBool,
    pub frames_received: AtomicU64,
    pub last_ping_us: AtomicU64,

    // Lifecycle
    pub active: AtomicBool,
    pub shutting_down: AtomicBool,
    pub protocol_disconnect_requested: AtomicBool,
    pub session_ready: AtomicBool,

    /// Source count of the most recently rendered grid; the send worker
    /// emits the clear-screen barrier when this departs from what it last
    /// sent.
    pub last_rendered_grid_sources: AtomicUsize,

    // Ingress
    pub ingress_video: FrameBuffer,
    pub ingress_audio: SampleRing,

    // Egress
    pub egress_video: FrameBuffer,
    pub egress_audio: PacketQueue,

    // Crypto: per-direction ciphers, present once the session is READY
    // (absent in no-encrypt mode). tx is server→client.
    pub tx_cipher: Mutex<Option<DirectionCipher>>,
    pub rx_cipher: Mutex<Option<DirectionCipher>>,

    // Codec handles, created lazily and destroyed with the record.
    pub opus_encoder: Mutex<Option<AudioEncoder>>,
    pub opus_decoder: Mutex<Option<AudioDecoder>>,

    pub transport: TransportSlot,
    pub stats: ClientStats,
}

impl ClientRecord {
    pub fn new(
        id: ClientId,
        remote_addr: Option<SocketAddr>,
        attachment: Attachment,
        transport: TransportSlot,
        config: &HostConfig,
    ) -> Self {
        let max_frame_bytes = config.limits.max_payload_bytes as usize;
        Self {
            id,
            remote_addr,
            attachment,
            profile: Mutex::new(ClientProfile::default()),
            is_sending_video: AtomicBool::new(false),
            is_sending_audio: AtomicBool::new(false),
            frames_received: AtomicU64::new(0),
            last_ping_us: AtomicU64::new(0),
            active: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
            protocol_disconnect_requested: AtomicBool::new(false),
            session_ready: AtomicBool::new(false),
            last_rendered_grid_sources: AtomicUsize::new(0),
            ingress_video: FrameBuffer::new(max_frame_bytes),
            ingress_audio: SampleRing::new(config.limits.audio_ring_samples),
            egress_video: FrameBuffer::new(max_frame_bytes),
            egress_audio: PacketQueue::new(config.limits.egress_queue_capacity),
            tx_cipher: Mutex::new(None),
            rx_cipher: Mutex::new(None),
            opus_encoder: Mutex::new(None),
            opus_decoder: Mutex::new(None),
            transport,
            stats: ClientStats::new(),
        }
    }

    /// True while the client participates in rendering and mixing.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Flags the record for teardown and shuts its egress queue. Idempotent;
    /// workers observe the flags on their next loop.
    pub fn begin_shutdown(&self) {
        self.active.store(false, Ordering::Release);
        self.shutting_down.store(true, Ordering::Release);
        self.egress_audio.shutdown();
    }

    /// Snapshot of the fields the render workers need, taken under the state
    /// mutex and released before any conversion work happens.
    pub fn render_snapshot(&self) -> RenderSnapshot {
        let profile = self.profile.lock();
        RenderSnapshot {
            terminal_width: profile.terminal_width,
            terminal_height: profile.terminal_height,
            color_level: profile.color_level,
            render_mode: profile.render_mode,
            wants_stretch: profile.wants_stretch,
            desired_fps: profile.desired_fps,
            palette: profile.palette.clone(),
        }
    }

    pub fn display_name(&self) -> String {
        self.profile.lock().display_name.clone()
    }
}

/// Stack-local copy of render-relevant capability state.
#[derive(Debug, Clone)]
pub struct RenderSnapshot {
    pub terminal_width: u16,
    pub terminal_height: u16,
    pub color_level: ColorLevel,
    pub render_mode: RenderMode,
    pub wants_stretch: bool,
    pub desired_fps: u8,
    pub palette: Palette,
}

/// Read-only client info exposed through the host façade.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: ClientId,
    pub display_name: String,
    pub remote_addr: Option<SocketAddr>,
    pub attachment: Attachment,
    pub is_sending_video: bool,
    pub is_sending_audio: bool,
    pub terminal_width: u16,
    pub terminal_height: u16,
    pub frames_received: u64,
    /// Unix micros of the last `PING` from this client (0 = never).
    pub last_ping_us: u64,
}

impl ClientRecord {
    pub fn info(&self) -> ClientInfo {
        let profile = self.profile.lock();
        ClientInfo {
            id: self.id,
            display_name: profile.display_name.clone(),
            remote_addr: self.remote_addr,
            attachment: self.attachment,
            is_sending_video: self.is_sending_video.load(Ordering::Relaxed),
            is_sending_audio: self.is_sending_audio.load(Ordering::Relaxed),
            terminal_width: profile.terminal_width,
            terminal_height: profile.terminal_height,
            frames_received: self.frames_received.load(Ordering::Relaxed),
            last_ping_us: self.last_ping_us.load(Ordering::Relaxed),
        }
    }
}

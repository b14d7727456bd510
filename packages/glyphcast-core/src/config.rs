//! Hub configuration types.
//!
//! [`HostConfig`] covers the public options of the host façade; the nested
//! [`TimingConfig`] and [`LimitsConfig`] group the rate and capacity knobs
//! that most embedders leave at their defaults.

use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default TCP port for the hub.
pub const DEFAULT_PORT: u16 = 27224;

/// Rate and pacing parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Upper clamp for a client's requested video frame rate.
    pub max_fps: u8,

    /// Audio mixer tick interval in milliseconds (one Opus frame spans two).
    pub audio_tick_ms: u64,

    /// Per-handshake-step deadline in seconds.
    pub handshake_step_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            max_fps: 60,
            audio_tick_ms: 10,
            handshake_step_secs: 10,
        }
    }
}

/// Capacity and bound parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum simultaneously connected clients.
    pub max_clients: usize,

    /// Per-client egress packet queue capacity.
    pub egress_queue_capacity: usize,

    /// Audio render back-pressure threshold: above this many queued packets
    /// the audio render worker drops frames instead of enqueueing.
    /// 50 packets of 20ms audio ≈ 1 second.
    pub audio_backlog_drop_threshold: usize,

    /// Ingress audio ring capacity in samples. Must be a power of two.
    /// 16384 samples ≈ 340ms at 48kHz, comfortably above the ~200ms target.
    pub audio_ring_samples: usize,

    /// Maximum accepted video frame dimension (either axis).
    pub max_frame_dimension: u32,

    /// Ceiling on a single packet payload, compressed or raw.
    pub max_payload_bytes: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_clients: 32,
            egress_queue_capacity: 256,
            audio_backlog_drop_threshold: 50,
            audio_ring_samples: 16384,
            max_frame_dimension: 4096,
            max_payload_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Configuration for one hub instance.
///
/// All fields have workable defaults; `encryption_enabled = false` is honored
/// only when [`HostConfig::allow_plaintext`] is also set, keeping the
/// no-encrypt mode an explicit double opt-in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// TCP port to listen on.
    pub port: u16,

    /// IPv4 bind address. `None` disables the IPv4 listener.
    pub ipv4_bind: Option<IpAddr>,

    /// IPv6 bind address. `None` disables the IPv6 listener.
    pub ipv6_bind: Option<IpAddr>,

    /// Whether sessions negotiate encryption. Disabling requires
    /// `allow_plaintext` as well.
    pub encryption_enabled: bool,

    /// Explicit opt-in for running without encryption.
    pub allow_plaintext: bool,

    /// Path to the server's Ed25519 identity key. `None` skips the
    /// server-authentication handshake phase.
    pub identity_key_path: Option<PathBuf>,

    /// Optional session password, mixed into the key schedule via Argon2id.
    pub password: Option<String>,

    /// Optional allow-list of client Ed25519 public keys (32 bytes each).
    /// When present, clients outside the list fail the handshake.
    pub client_allowlist: Option<Vec<[u8; 32]>>,

    /// Use the Opus AUDIO profile instead of VOIP.
    pub opus_audio_profile: bool,

    /// Opus encoder bitrate in bits per second.
    pub opus_bitrate: i32,

    /// Route mixed audio through the ducking/compression mixer stage.
    /// When false the mix is a plain sum, unclamped.
    pub mixer_enabled: bool,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub limits: LimitsConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            ipv4_bind: Some(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)),
            ipv6_bind: None,
            encryption_enabled: true,
            allow_plaintext: false,
            identity_key_path: None,
            password: None,
            client_allowlist: None,
            opus_audio_profile: false,
            opus_bitrate: 128_000,
            mixer_enabled: true,
            timing: TimingConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl HostConfig {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.ipv4_bind.is_none() && self.ipv6_bind.is_none() {
            return Err("at least one of ipv4_bind/ipv6_bind must be set".to_string());
        }
        if !self.encryption_enabled && !self.allow_plaintext {
            return Err(
                "encryption_enabled=false requires allow_plaintext=true (explicit no-encrypt mode)"
                    .to_string(),
            );
        }
        if self.timing.max_fps == 0 {
            return Err("max_fps must be >= 1".to_string());
        }
        if self.timing.audio_tick_ms == 0 {
            return Err("audio_tick_ms must be >= 1".to_string());
        }
        if self.limits.max_clients == 0 {
            return Err("max_clients must be >= 1".to_string());
        }
        if self.limits.egress_queue_capacity == 0 {
            return Err("egress_queue_capacity must be >= 1".to_string());
        }
        if !self.limits.audio_ring_samples.is_power_of_two() {
            return Err("audio_ring_samples must be a power of two".to_string());
        }
        if self.limits.max_frame_dimension == 0 {
            return Err("max_frame_dimension must be >= 1".to_string());
        }
        if self.opus_bitrate <= 0 {
            return Err("opus_bitrate must be positive".to_string());
        }
        Ok(())
    }
}

//! Session and control payload layouts.
//!
//! Every field is network byte order. Decoders are total: any length or value
//! mismatch is a [`ControlError`], which the receive worker treats as a
//! protocol violation.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Protocol revision spoken by this implementation.
pub const PROTOCOL_MAJOR: u16 = 2;
pub const PROTOCOL_MINOR: u16 = 0;

/// Longest accepted display name, bytes of UTF-8.
pub const MAX_DISPLAY_NAME: usize = 64;

/// Longest accepted custom palette, bytes of UTF-8.
pub const MAX_CUSTOM_PALETTE: usize = 256;

/// Longest accepted remote log message; longer messages arrive truncated with
/// the flag set.
pub const MAX_REMOTE_LOG: usize = 512;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("payload too short: need {need} bytes, have {have}")]
    Short { need: usize, have: usize },
    #[error("field out of range: {0}")]
    Range(&'static str),
    #[error("invalid UTF-8 in {0}")]
    Utf8(&'static str),
}

fn need(payload: &[u8], bytes: usize) -> Result<(), ControlError> {
    if payload.len() < bytes {
        return Err(ControlError::Short {
            need: bytes,
            have: payload.len(),
        });
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Version & crypto negotiation
// ─────────────────────────────────────────────────────────────────────────────

/// `PROTOCOL_VERSION` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
    pub supports_encryption: bool,
    pub compression_mask: u32,
    pub feature_flags: u32,
}

impl ProtocolVersion {
    pub fn local(supports_encryption: bool) -> Self {
        Self {
            major: PROTOCOL_MAJOR,
            minor: PROTOCOL_MINOR,
            supports_encryption,
            // zlib is the only compression scheme spoken today
            compression_mask: 0x1,
            feature_flags: 0,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(14);
        buf.put_u16(self.major);
        buf.put_u16(self.minor);
        buf.put_u8(self.supports_encryption as u8);
        buf.put_u8(0); // reserved
        buf.put_u32(self.compression_mask);
        buf.put_u32(self.feature_flags);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, ControlError> {
        need(payload, 14)?;
        let major = payload.get_u16();
        let minor = payload.get_u16();
        let supports_encryption = payload.get_u8() != 0;
        let _reserved = payload.get_u8();
        let compression_mask = payload.get_u32();
        let feature_flags = payload.get_u32();
        Ok(Self {
            major,
            minor,
            supports_encryption,
            compression_mask,
            feature_flags,
        })
    }
}

/// `CRYPTO_CAPABILITIES` payload: algorithm bitmasks offered by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoCapabilities {
    pub kex_mask: u32,
    pub sig_mask: u32,
    pub cipher_mask: u32,
}

/// Algorithm bit assignments.
pub const KEX_X25519: u32 = 1 << 0;
pub const SIG_ED25519: u32 = 1 << 0;
pub const CIPHER_XSALSA20_POLY1305: u32 = 1 << 0;

impl CryptoCapabilities {
    pub fn local() -> Self {
        Self {
            kex_mask: KEX_X25519,
            sig_mask: SIG_ED25519,
            cipher_mask: CIPHER_XSALSA20_POLY1305,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u32(self.kex_mask);
        buf.put_u32(self.sig_mask);
        buf.put_u32(self.cipher_mask);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, ControlError> {
        need(payload, 12)?;
        Ok(Self {
            kex_mask: payload.get_u32(),
            sig_mask: payload.get_u32(),
            cipher_mask: payload.get_u32(),
        })
    }
}

/// `CRYPTO_PARAMETERS` payload: the server's algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoParameters {
    pub kex: u8,
    pub sig: u8,
    pub cipher: u8,
    pub password_mode: bool,
    pub server_identity: bool,
    /// An `AUTH_CHALLENGE`/`AUTH_RESPONSE` round follows key exchange
    /// (server identity proof and/or allow-list check).
    pub auth_required: bool,
    pub key_len: u16,
    pub nonce_len: u16,
    pub mac_len: u16,
    /// Argon2id salt; all-zero when password mode is off.
    pub argon_salt: [u8; 16],
}

impl CryptoParameters {
    const FLAG_PASSWORD: u8 = 1 << 0;
    const FLAG_IDENTITY: u8 = 1 << 1;
    const FLAG_AUTH: u8 = 1 << 2;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(26);
        buf.put_u8(self.kex);
        buf.put_u8(self.sig);
        buf.put_u8(self.cipher);
        let mut flags = 0u8;
        if self.password_mode {
            flags |= Self::FLAG_PASSWORD;
        }
        if self.server_identity {
            flags |= Self::FLAG_IDENTITY;
        }
        if self.auth_required {
            flags |= Self::FLAG_AUTH;
        }
        buf.put_u8(flags);
        buf.put_u16(self.key_len);
        buf.put_u16(self.nonce_len);
        buf.put_u16(self.mac_len);
        buf.put_slice(&self.argon_salt);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, ControlError> {
        need(payload, 26)?;
        let kex = payload.get_u8();
        let sig = payload.get_u8();
        let cipher = payload.get_u8();
        let flags = payload.get_u8();
        let key_len = payload.get_u16();
        let nonce_len = payload.get_u16();
        let mac_len = payload.get_u16();
        let mut argon_salt = [0u8; 16];
        payload.copy_to_slice(&mut argon_salt);
        Ok(Self {
            kex,
            sig,
            cipher,
            password_mode: flags & Self::FLAG_PASSWORD != 0,
            server_identity: flags & Self::FLAG_IDENTITY != 0,
            auth_required: flags & Self::FLAG_AUTH != 0,
            key_len,
            nonce_len,
            mac_len,
            argon_salt,
        })
    }
}

/// `KEY_EXCHANGE_INIT` payload: one X25519 public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyExchange {
    pub public_key: [u8; 32],
}

impl KeyExchange {
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.public_key)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ControlError> {
        need(payload, 32)?;
        if payload.len() != 32 {
            return Err(ControlError::Range("key exchange payload length"));
        }
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(payload);
        Ok(Self { public_key })
    }
}

/// `AUTH_CHALLENGE` payload: server identity proof over the transcript.
#[derive(Debug, Clone, Copy)]
pub struct AuthChallenge {
    pub challenge: [u8; 32],
    pub server_sign_pub: [u8; 32],
    pub signature: [u8; 64],
}

impl AuthChallenge {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_slice(&self.challenge);
        buf.put_slice(&self.server_sign_pub);
        buf.put_slice(&self.signature);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, ControlError> {
        need(payload, 128)?;
        let mut challenge = [0u8; 32];
        let mut server_sign_pub = [0u8; 32];
        let mut signature = [0u8; 64];
        payload.copy_to_slice(&mut challenge);
        payload.copy_to_slice(&mut server_sign_pub);
        payload.copy_to_slice(&mut signature);
        Ok(Self {
            challenge,
            server_sign_pub,
            signature,
        })
    }
}

/// `AUTH_RESPONSE` payload: client identity proof.
#[derive(Debug, Clone, Copy)]
pub struct AuthResponse {
    pub client_sign_pub: [u8; 32],
    pub signature: [u8; 64],
}

impl AuthResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(96);
        buf.put_slice(&self.client_sign_pub);
        buf.put_slice(&self.signature);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, ControlError> {
        need(payload, 96)?;
        let mut client_sign_pub = [0u8; 32];
        let mut signature = [0u8; 64];
        payload.copy_to_slice(&mut client_sign_pub);
        payload.copy_to_slice(&mut signature);
        Ok(Self {
            client_sign_pub,
            signature,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Membership & capabilities
// ─────────────────────────────────────────────────────────────────────────────

/// Terminal color depth a client can render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ColorLevel {
    Mono = 0,
    Ansi16 = 1,
    Ansi256 = 2,
    #[default]
    TrueColor = 3,
}

impl ColorLevel {
    pub fn from_wire(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Mono,
            1 => Self::Ansi16,
            2 => Self::Ansi256,
            3 => Self::TrueColor,
            _ => return None,
        })
    }
}

/// How glyph cells are painted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RenderMode {
    #[default]
    Foreground = 0,
    Background = 1,
    HalfBlock = 2,
}

impl RenderMode {
    pub fn from_wire(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Foreground,
            1 => Self::Background,
            2 => Self::HalfBlock,
            _ => return None,
        })
    }
}

/// `CLIENT_JOIN` capability bits.
pub const CAP_SEND_VIDEO: u32 = 1 << 0;
pub const CAP_SEND_AUDIO: u32 = 1 << 1;
pub const CAP_WANTS_STRETCH: u32 = 1 << 2;

/// `CLIENT_JOIN` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientJoin {
    pub caps: u32,
    pub display_name: String,
}

impl ClientJoin {
    pub fn encode(&self) -> Bytes {
        let name = self.display_name.as_bytes();
        let mut buf = BytesMut::with_capacity(6 + name.len());
        buf.put_u32(self.caps);
        buf.put_u16(name.len() as u16);
        buf.put_slice(name);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, ControlError> {
        need(payload, 6)?;
        let caps = payload.get_u32();
        let name_len = payload.get_u16() as usize;
        if name_len > MAX_DISPLAY_NAME {
            return Err(ControlError::Range("display name length"));
        }
        need(payload, name_len)?;
        let display_name = std::str::from_utf8(&payload[..name_len])
            .map_err(|_| ControlError::Utf8("display name"))?
            .to_string();
        Ok(Self { caps, display_name })
    }
}

/// `CLIENT_CAPABILITIES` payload: terminal geometry and rendering taste.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCapabilities {
    pub width: u16,
    pub height: u16,
    pub color_level: ColorLevel,
    pub render_mode: RenderMode,
    pub palette: u8,
    pub desired_fps: u8,
    pub flags: u32,
    pub custom_palette: String,
}

impl ClientCapabilities {
    pub fn encode(&self) -> Bytes {
        let custom = self.custom_palette.as_bytes();
        let mut buf = BytesMut::with_capacity(14 + custom.len());
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_u8(self.color_level as u8);
        buf.put_u8(self.render_mode as u8);
        buf.put_u8(self.palette);
        buf.put_u8(self.desired_fps);
        buf.put_u32(self.flags);
        buf.put_u16(custom.len() as u16);
        buf.put_slice(custom);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, ControlError> {
        need(payload, 14)?;
        let width = payload.get_u16();
        let height = payload.get_u16();
        if width == 0 || height == 0 {
            return Err(ControlError::Range("terminal dimensions"));
        }
        let color_level = ColorLevel::from_wire(payload.get_u8())
            .ok_or(ControlError::Range("color level"))?;
        let render_mode = RenderMode::from_wire(payload.get_u8())
            .ok_or(ControlError::Range("render mode"))?;
        let palette = payload.get_u8();
        let desired_fps = payload.get_u8();
        let flags = payload.get_u32();
        let custom_len = payload.get_u16() as usize;
        if custom_len > MAX_CUSTOM_PALETTE {
            return Err(ControlError::Range("custom palette length"));
        }
        need(payload, custom_len)?;
        let custom_palette = std::str::from_utf8(&payload[..custom_len])
            .map_err(|_| ControlError::Utf8("custom palette"))?
            .to_string();
        Ok(Self {
            width,
            height,
            color_level,
            render_mode,
            palette,
            desired_fps,
            flags,
            custom_palette,
        })
    }
}

/// `SIZE` payload: dimensions only, everything else untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeUpdate {
    pub width: u16,
    pub height: u16,
}

impl SizeUpdate {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, ControlError> {
        need(payload, 4)?;
        let width = payload.get_u16();
        let height = payload.get_u16();
        if width == 0 || height == 0 {
            return Err(ControlError::Range("terminal dimensions"));
        }
        Ok(Self { width, height })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream control & small packets
// ─────────────────────────────────────────────────────────────────────────────

pub const STREAM_VIDEO: u32 = 1 << 0;
pub const STREAM_AUDIO: u32 = 1 << 1;

/// `STREAM_START` / `STREAM_STOP` payload: which media kinds are affected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamKinds(pub u32);

impl StreamKinds {
    pub fn video(self) -> bool {
        self.0 & STREAM_VIDEO != 0
    }

    pub fn audio(self) -> bool {
        self.0 & STREAM_AUDIO != 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(self.0);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, ControlError> {
        need(payload, 4)?;
        Ok(Self(payload.get_u32()))
    }
}

/// `PING` / `PONG` payload: echoed timestamp.
pub fn encode_ping(timestamp_us: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u64(timestamp_us);
    buf.freeze()
}

pub fn decode_ping(mut payload: &[u8]) -> Result<u64, ControlError> {
    need(payload, 8)?;
    Ok(payload.get_u64())
}

/// `SERVER_STATE` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerState {
    pub client_count: u32,
    pub flags: u32,
}

impl ServerState {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u32(self.client_count);
        buf.put_u32(self.flags);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, ControlError> {
        need(payload, 8)?;
        Ok(Self {
            client_count: payload.get_u32(),
            flags: payload.get_u32(),
        })
    }
}

/// `REMOTE_LOG` payload: peer-originated log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLog {
    pub level: u8,
    pub truncated: bool,
    pub message: String,
}

impl RemoteLog {
    /// Builds a remote log line, truncating to [`MAX_REMOTE_LOG`] bytes on a
    /// character boundary.
    pub fn new(level: u8, message: &str) -> Self {
        let mut end = message.len().min(MAX_REMOTE_LOG);
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        Self {
            level,
            truncated: end < message.len(),
            message: message[..end].to_string(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let text = self.message.as_bytes();
        let mut buf = BytesMut::with_capacity(4 + text.len());
        buf.put_u8(self.level);
        buf.put_u8(self.truncated as u8);
        buf.put_u16(text.len() as u16);
        buf.put_slice(text);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, ControlError> {
        need(payload, 4)?;
        let level = payload.get_u8();
        let truncated = payload.get_u8() != 0;
        let len = payload.get_u16() as usize;
        if len > MAX_REMOTE_LOG {
            return Err(ControlError::Range("remote log length"));
        }
        need(payload, len)?;
        let message = std::str::from_utf8(&payload[..len])
            .map_err(|_| ControlError::Utf8("remote log message"))?
            .to_string();
        Ok(Self {
            level,
            truncated,
            message,
        })
    }
}

/// `ERROR` payload: numeric code plus UTF-8 reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPacket {
    pub code: u32,
    pub reason: String,
}

impl ErrorPacket {
    pub fn encode(&self) -> Bytes {
        let reason = self.reason.as_bytes();
        let mut buf = BytesMut::with_capacity(4 + reason.len());
        buf.put_u32(self.code);
        buf.put_slice(reason);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, ControlError> {
        need(payload, 4)?;
        let code = payload.get_u32();
        let reason = String::from_utf8_lossy(payload).into_owned();
        Ok(Self { code, reason })
    }
}

//! Wire protocol: packet catalog, header framing, payload codecs.
//!
//! The 18-byte header is little-endian; every payload field is network byte
//! order (big-endian). See [`wire`] for the framing contract and [`control`] /
//! [`media`] for the payload layouts.

pub mod control;
pub mod media;
pub mod wire;

pub use wire::{WireError, WireHeader, HEADER_LEN, MAGIC};

/// Packet type catalog. Stable numeric wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketType {
    // Session
    ProtocolVersion = 1,
    CryptoCapabilities = 2,
    CryptoParameters = 3,
    KeyExchangeInit = 4,
    AuthChallenge = 5,
    AuthResponse = 6,
    ClientJoin = 7,
    ClientLeave = 8,
    ClientCapabilities = 9,
    Size = 10,
    Ping = 11,
    Pong = 12,
    ServerState = 13,
    ClearConsole = 14,
    RemoteLog = 15,
    Error = 16,

    // Stream control
    StreamStart = 20,
    StreamStop = 21,

    // Media ingress (client → server)
    ImageFrame = 30,
    /// Legacy raw-PCM audio. Recognized, never produced.
    Audio = 31,
    AudioBatch = 32,
    AudioOpus = 33,
    AudioOpusBatch = 34,

    // Media egress (server → client)
    AsciiFrame = 40,
}

impl PacketType {
    /// Decodes a wire value; unknown values are a protocol violation at the
    /// caller.
    pub fn from_wire(value: u16) -> Option<Self> {
        Some(match value {
            1 => Self::ProtocolVersion,
            2 => Self::CryptoCapabilities,
            3 => Self::CryptoParameters,
            4 => Self::KeyExchangeInit,
            5 => Self::AuthChallenge,
            6 => Self::AuthResponse,
            7 => Self::ClientJoin,
            8 => Self::ClientLeave,
            9 => Self::ClientCapabilities,
            10 => Self::Size,
            11 => Self::Ping,
            12 => Self::Pong,
            13 => Self::ServerState,
            14 => Self::ClearConsole,
            15 => Self::RemoteLog,
            16 => Self::Error,
            20 => Self::StreamStart,
            21 => Self::StreamStop,
            30 => Self::ImageFrame,
            31 => Self::Audio,
            32 => Self::AudioBatch,
            33 => Self::AudioOpus,
            34 => Self::AudioOpusBatch,
            40 => Self::AsciiFrame,
            _ => return None,
        })
    }

    /// Handshake packets travel in plaintext; everything else is wrapped in
    /// the AEAD envelope once the session is ready.
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            Self::ProtocolVersion
                | Self::CryptoCapabilities
                | Self::CryptoParameters
                | Self::KeyExchangeInit
                | Self::AuthChallenge
                | Self::AuthResponse
        )
    }
}

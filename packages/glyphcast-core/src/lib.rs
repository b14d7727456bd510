//! Glyphcast Core - the terminal video conferencing hub.
//!
//! Clients send webcam video and microphone audio to the hub; the hub sends
//! each client back a personalized ASCII-art composite of all *other*
//! participants and a mixed Opus audio stream that excludes the client's own
//! voice. This crate is the hub itself, consumed by the headless server
//! binary and by in-process (mirror) embeddings.
//!
//! # Architecture
//!
//! - [`buffers`]: the three data-plane primitives (SPSC sample ring,
//!   latest-only frame double buffer, bounded priority packet queue)
//! - [`protocol`]: the wire format (header, CRC, control and media payloads)
//! - [`crypto`]: handshake state machines and per-direction AEAD ciphers
//! - [`client`]: per-peer records and the reader-writer-locked registry
//! - [`mixer`]: combine-with-exclusion PCM mixing
//! - [`render`]: pure ASCII conversion, palettes, and grid composition
//! - [`workers`]: the per-client worker threads (receive, video render,
//!   audio render, send)
//! - [`hub`]: the host façade and accept loop
//! - [`events`]: callbacks delivered to the embedding mode
//!
//! # Threading model
//!
//! Plain OS threads: one accept loop plus, per client, receive / video
//! render / audio render / send workers. There is no central scheduler;
//! threads synchronize through the per-client primitives, atomics for
//! lifecycle flags, and one reader-writer lock over the registry. Every
//! blocking wait is bounded so shutdown joins need no timeouts.

#![warn(clippy::all)]

pub mod buffers;
pub mod client;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod hub;
pub mod mixer;
pub mod protocol;
pub mod render;
pub mod stats;
pub mod transport;
pub mod workers;

// Re-export commonly used types at the crate root
pub use client::{Attachment, ClientId, ClientInfo, ClientRecord, ClientRegistry};
pub use config::{HostConfig, LimitsConfig, TimingConfig, DEFAULT_PORT};
pub use error::{ErrorCode, HubError};
pub use events::{HubEvents, LoggingHubEvents, NoopHubEvents};
pub use hub::{Hub, HubShared};
pub use transport::{ClientTransport, TransportSlot};

// Re-export protocol types embedders commonly touch
pub use protocol::control::{ColorLevel, RenderMode};
pub use protocol::PacketType;

// Re-export crypto entry points for client-side embeddings (mirror, tests)
pub use crypto::{
    ClientHandshake, ClientHandshakeConfig, HandshakePhase, ServerHandshake,
    ServerHandshakeConfig,
};

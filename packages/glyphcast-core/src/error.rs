//! Error taxonomy for the hub.
//!
//! Per-client failures (protocol, crypto, transport) disconnect the offending
//! client only; [`HubError::Startup`] is the sole class that may abort the
//! process, and only before any client is served.

/// Numeric error codes carried in `ERROR` packets.
///
/// Stable wire values; a client maps these back to a user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    ProtocolViolation = 1,
    CryptoFailure = 2,
    ServerFull = 3,
    Internal = 4,
}

/// Errors surfaced by the hub and its workers.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// The peer sent data that violates the wire protocol or the current
    /// session state. Always scoped to a single client.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Handshake negotiation, authentication, or AEAD failure.
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// A bounded resource was exhausted (max clients, queue capacity).
    #[error("resource exhausted: {0}")]
    Resource(String),

    /// The client transport failed or closed unexpectedly.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A public façade function was called with invalid arguments or against
    /// an impossible state. Defensive, never fatal.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Startup-time impossibility (bind failure, identity key unreadable).
    /// The only error class that terminates the process.
    #[error("startup failure: {0}")]
    Startup(String),
}

impl HubError {
    /// Wire error code for `ERROR` packets sent before disconnecting a peer.
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            HubError::Protocol(_) => ErrorCode::ProtocolViolation,
            HubError::Crypto(_) => ErrorCode::CryptoFailure,
            HubError::Resource(_) => ErrorCode::ServerFull,
            _ => ErrorCode::Internal,
        }
    }
}

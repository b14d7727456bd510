//! Cryptographic session establishment and per-direction AEAD state.
//!
//! The handshake never hands a compromised session to the data plane: any
//! negotiation, authentication, or decryption failure is terminal for the
//! session and disconnects the client.

pub mod identity;
pub mod session;

pub use identity::{load_or_generate_identity, AllowList};
pub use session::{
    ClientHandshake, ClientHandshakeConfig, DirectionCipher, HandshakePhase, ServerHandshake,
    ServerHandshakeConfig, SessionKeys, KEY_LEN, MAC_LEN, NONCE_LEN,
};

use crate::protocol::control::ControlError;

/// Failures of the crypto session layer. All of them tear the session down.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("unexpected packet type {packet_type} in phase {phase}")]
    UnexpectedPacket { phase: String, packet_type: u16 },

    #[error("peer does not support encryption and no-encrypt mode is off")]
    EncryptionRequired,

    #[error("server requires a session password")]
    PasswordRequired,

    #[error("signature verification failed")]
    BadSignature,

    #[error("client public key is not on the allow-list")]
    NotAllowed,

    #[error("encryption failed")]
    EncryptFailed,

    #[error("decryption failed")]
    DecryptFailed,

    #[error("nonce counter mismatch (replay or reorder)")]
    NonceMismatch,

    #[error("nonce counter exhausted")]
    NonceExhausted,

    #[error("malformed handshake payload: {0}")]
    Malformed(#[from] ControlError),

    #[error("identity key error: {0}")]
    Identity(String),
}

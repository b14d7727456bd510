//! Handshake state machines and the per-direction AEAD ciphers.
//!
//! Both ends of the handshake live here: the hub drives [`ServerHandshake`]
//! from the receive worker, and [`ClientHandshake`] serves the in-process
//! mirror embedding and the test suite. All handshake packets travel in
//! plaintext; once a session is READY every non-handshake payload is wrapped
//! in the envelope `nonce[24] || ciphertext || mac[16]`.
//!
//! Key schedule: X25519 shared secret (optionally concatenated with an
//! Argon2id password prekey) fed through HKDF-SHA256 salted with the
//! handshake transcript hash, expanded per direction. Nonces are the
//! per-direction message counter in the trailing 8 bytes, big-endian; the
//! receiver enforces exact counter match, so replay and reorder both surface
//! as decryption failures.

use bytes::{Bytes, BytesMut};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use xsalsa20poly1305::aead::{Aead, KeyInit};
use xsalsa20poly1305::{Key, Nonce, XSalsa20Poly1305};

use crate::protocol::control::{
    AuthChallenge, AuthResponse, CryptoCapabilities, CryptoParameters, KeyExchange,
    ProtocolVersion, CIPHER_XSALSA20_POLY1305, KEX_X25519, SIG_ED25519,
};
use crate::protocol::PacketType;

use super::identity::AllowList;
use super::CryptoError;

/// Negotiated sizes for XSalsa20-Poly1305.
pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const MAC_LEN: usize = 16;

/// Handshake state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    Init,
    VersionExchanged,
    ParametersNegotiated,
    KeyExchanged,
    AuthChallenged,
    Ready,
    Failed,
}

/// One direction of an established session: cipher plus nonce counter.
pub struct DirectionCipher {
    cipher: XSalsa20Poly1305,
    counter: u64,
}

impl DirectionCipher {
    fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: XSalsa20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    fn nonce_bytes(counter: u64) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[NONCE_LEN - 8..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }

    /// Encrypts `plaintext` into the wire envelope and advances the counter.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Bytes, CryptoError> {
        let nonce = Self::nonce_bytes(self.counter);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptFailed)?;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(CryptoError::NonceExhausted)?;

        let mut envelope = BytesMut::with_capacity(NONCE_LEN + ciphertext.len());
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);
        Ok(envelope.freeze())
    }

    /// Opens a wire envelope, enforcing the exact expected nonce counter.
    pub fn open(&mut self, envelope: &[u8]) -> Result<Bytes, CryptoError> {
        if envelope.len() < NONCE_LEN + MAC_LEN {
            return Err(CryptoError::DecryptFailed);
        }
        let (nonce, ciphertext) = envelope.split_at(NONCE_LEN);
        if nonce != Self::nonce_bytes(self.counter) {
            return Err(CryptoError::NonceMismatch);
        }
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)?;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(CryptoError::NonceExhausted)?;
        Ok(Bytes::from(plaintext))
    }
}

/// The two directional ciphers handed to the data plane at READY.
/// `None` fields mean the session runs in the explicit no-encrypt mode.
pub struct SessionKeys {
    pub tx: Option<DirectionCipher>,
    pub rx: Option<DirectionCipher>,
}

/// Derives the per-direction keys.
///
/// Returns `(c2s, s2c)`. The transcript hash salts the extraction so a
/// transcript-substitution attack changes both keys.
fn derive_session_keys(
    shared: &[u8; 32],
    prekey: Option<&[u8; 32]>,
    transcript_hash: &[u8; 32],
) -> Result<([u8; KEY_LEN], [u8; KEY_LEN]), CryptoError> {
    let mut ikm = Vec::with_capacity(64);
    ikm.extend_from_slice(shared);
    if let Some(prekey) = prekey {
        ikm.extend_from_slice(prekey);
    }
    let hk = Hkdf::<Sha256>::new(Some(transcript_hash.as_slice()), &ikm);
    let mut c2s = [0u8; KEY_LEN];
    let mut s2c = [0u8; KEY_LEN];
    hk.expand(b"glyphcast v1 c2s", &mut c2s)
        .map_err(|_| CryptoError::Negotiation("HKDF expand failed".into()))?;
    hk.expand(b"glyphcast v1 s2c", &mut s2c)
        .map_err(|_| CryptoError::Negotiation("HKDF expand failed".into()))?;
    Ok((c2s, s2c))
}

/// Argon2id prekey from the session password and the server-chosen salt.
fn password_prekey(password: &str, salt: &[u8; 16]) -> Result<[u8; 32], CryptoError> {
    let mut prekey = [0u8; 32];
    argon2::Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut prekey)
        .map_err(|e| CryptoError::Negotiation(format!("argon2: {e}")))?;
    Ok(prekey)
}

fn sign_transcript(key: &SigningKey, challenge: &[u8; 32], transcript_hash: &[u8; 32]) -> Signature {
    let mut message = [0u8; 64];
    message[..32].copy_from_slice(challenge);
    message[32..].copy_from_slice(transcript_hash);
    key.sign(&message)
}

fn verify_transcript(
    public_key: &[u8; 32],
    challenge: &[u8; 32],
    transcript_hash: &[u8; 32],
    signature: &[u8; 64],
) -> Result<(), CryptoError> {
    let key = VerifyingKey::from_bytes(public_key).map_err(|_| CryptoError::BadSignature)?;
    let mut message = [0u8; 64];
    message[..32].copy_from_slice(challenge);
    message[32..].copy_from_slice(transcript_hash);
    key.verify(&message, &Signature::from_bytes(signature))
        .map_err(|_| CryptoError::BadSignature)
}

/// A packet to emit in response to a handshake input.
pub type Reply = (PacketType, Bytes);

// ─────────────────────────────────────────────────────────────────────────────
// Server side
// ─────────────────────────────────────────────────────────────────────────────

/// Server-side handshake policy, fixed at accept time.
pub struct ServerHandshakeConfig {
    pub encryption_enabled: bool,
    pub password: Option<String>,
    pub identity: Option<SigningKey>,
    pub allowlist: Option<AllowList>,
}

/// Server side of the multi-phase handshake. The receive worker feeds it one
/// packet at a time and writes out whatever replies it produces.
pub struct ServerHandshake {
    config: ServerHandshakeConfig,
    phase: HandshakePhase,
    transcript: Sha256,
    ephemeral: Option<StaticSecret>,
    argon_salt: [u8; 16],
    challenge: [u8; 32],
    pending_keys: Option<([u8; KEY_LEN], [u8; KEY_LEN])>,
    client_sign_pub: Option<[u8; 32]>,
    transcript_hash: [u8; 32],
}

impl ServerHandshake {
    pub fn new(config: ServerHandshakeConfig) -> Self {
        Self {
            config,
            phase: HandshakePhase::Init,
            transcript: Sha256::new(),
            ephemeral: None,
            argon_salt: [0u8; 16],
            challenge: [0u8; 32],
            pending_keys: None,
            client_sign_pub: None,
            transcript_hash: [0u8; 32],
        }
    }

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    fn auth_required(&self) -> bool {
        self.config.identity.is_some() || self.config.allowlist.is_some()
    }

    fn fail<T>(&mut self, error: CryptoError) -> Result<T, CryptoError> {
        self.phase = HandshakePhase::Failed;
        Err(error)
    }

    /// Consumes one handshake packet, returning the replies to send.
    ///
    /// On `Err` the machine is in the terminal `Failed` phase and the caller
    /// must disconnect the peer. After `Ok`, the caller checks
    /// [`ServerHandshake::phase`] and collects [`ServerHandshake::take_keys`]
    /// once READY.
    pub fn handle_packet(
        &mut self,
        packet_type: PacketType,
        payload: &[u8],
    ) -> Result<Vec<Reply>, CryptoError> {
        match (self.phase, packet_type) {
            (HandshakePhase::Init, PacketType::ProtocolVersion) => {
                let theirs = match ProtocolVersion::decode(payload) {
                    Ok(theirs) => theirs,
                    Err(e) => return self.fail(CryptoError::Malformed(e)),
                };
                let ours = ProtocolVersion::local(self.config.encryption_enabled);
                let reply = ours.encode();
                self.transcript.update(payload);
                self.transcript.update(&reply);

                if !self.config.encryption_enabled {
                    // Explicit no-encrypt mode: the session is ready as soon
                    // as versions are exchanged.
                    self.phase = HandshakePhase::Ready;
                    return Ok(vec![(PacketType::ProtocolVersion, reply)]);
                }
                if !theirs.supports_encryption {
                    return self.fail(CryptoError::EncryptionRequired);
                }
                self.phase = HandshakePhase::VersionExchanged;
                Ok(vec![(PacketType::ProtocolVersion, reply)])
            }

            (HandshakePhase::VersionExchanged, PacketType::CryptoCapabilities) => {
                let caps = match CryptoCapabilities::decode(payload) {
                    Ok(caps) => caps,
                    Err(e) => return self.fail(CryptoError::Malformed(e)),
                };
                if caps.kex_mask & KEX_X25519 == 0
                    || caps.cipher_mask & CIPHER_XSALSA20_POLY1305 == 0
                    || (self.auth_required() && caps.sig_mask & SIG_ED25519 == 0)
                {
                    return self.fail(CryptoError::Negotiation(
                        "no common algorithm set".into(),
                    ));
                }
                self.transcript.update(payload);

                let password_mode = self.config.password.is_some();
                if password_mode {
                    OsRng.fill_bytes(&mut self.argon_salt);
                }
                let params = CryptoParameters {
                    kex: 0,
                    sig: 0,
                    cipher: 0,
                    password_mode,
                    server_identity: self.config.identity.is_some(),
                    auth_required: self.auth_required(),
                    key_len: KEY_LEN as u16,
                    nonce_len: NONCE_LEN as u16,
                    mac_len: MAC_LEN as u16,
                    argon_salt: self.argon_salt,
                };
                let params_payload = params.encode();
                self.transcript.update(&params_payload);

                let ephemeral = StaticSecret::random_from_rng(OsRng);
                let kex_payload = KeyExchange {
                    public_key: *PublicKey::from(&ephemeral).as_bytes(),
                }
                .encode();
                self.transcript.update(&kex_payload);
                self.ephemeral = Some(ephemeral);

                self.phase = HandshakePhase::ParametersNegotiated;
                Ok(vec![
                    (PacketType::CryptoParameters, params_payload),
                    (PacketType::KeyExchangeInit, kex_payload),
                ])
            }

            (HandshakePhase::ParametersNegotiated, PacketType::KeyExchangeInit) => {
                let kex = match KeyExchange::decode(payload) {
                    Ok(kex) => kex,
                    Err(e) => return self.fail(CryptoError::Malformed(e)),
                };
                self.transcript.update(payload);
                self.transcript_hash = self.transcript.clone().finalize().into();

                let ephemeral = self.ephemeral.take().expect("set in previous phase");
                let shared = *ephemeral
                    .diffie_hellman(&PublicKey::from(kex.public_key))
                    .as_bytes();

                let prekey = match &self.config.password {
                    Some(password) => Some(password_prekey(password, &self.argon_salt)?),
                    None => None,
                };
                let keys =
                    derive_session_keys(&shared, prekey.as_ref(), &self.transcript_hash)?;
                self.pending_keys = Some(keys);
                self.phase = HandshakePhase::KeyExchanged;

                if !self.auth_required() {
                    self.phase = HandshakePhase::Ready;
                    return Ok(vec![]);
                }

                OsRng.fill_bytes(&mut self.challenge);
                let (server_sign_pub, signature) = match &self.config.identity {
                    Some(identity) => (
                        identity.verifying_key().to_bytes(),
                        sign_transcript(identity, &self.challenge, &self.transcript_hash)
                            .to_bytes(),
                    ),
                    None => ([0u8; 32], [0u8; 64]),
                };
                let challenge = AuthChallenge {
                    challenge: self.challenge,
                    server_sign_pub,
                    signature,
                };
                self.phase = HandshakePhase::AuthChallenged;
                Ok(vec![(PacketType::AuthChallenge, challenge.encode())])
            }

            (HandshakePhase::AuthChallenged, PacketType::AuthResponse) => {
                let response = match AuthResponse::decode(payload) {
                    Ok(response) => response,
                    Err(e) => return self.fail(CryptoError::Malformed(e)),
                };
                if verify_transcript(
                    &response.client_sign_pub,
                    &self.challenge,
                    &self.transcript_hash,
                    &response.signature,
                )
                .is_err()
                {
                    return self.fail(CryptoError::BadSignature);
                }
                if let Some(allowlist) = &self.config.allowlist {
                    if !allowlist.contains(&response.client_sign_pub) {
                        return self.fail(CryptoError::NotAllowed);
                    }
                }
                self.client_sign_pub = Some(response.client_sign_pub);
                self.phase = HandshakePhase::Ready;
                Ok(vec![])
            }

            (phase, got) => self.fail(CryptoError::UnexpectedPacket {
                phase: format!("{phase:?}"),
                packet_type: got as u16,
            }),
        }
    }

    /// Hands out the directional ciphers once READY. Server tx is the
    /// server→client direction.
    pub fn take_keys(&mut self) -> SessionKeys {
        debug_assert_eq!(self.phase, HandshakePhase::Ready);
        match self.pending_keys.take() {
            Some((c2s, s2c)) => SessionKeys {
                tx: Some(DirectionCipher::new(&s2c)),
                rx: Some(DirectionCipher::new(&c2s)),
            },
            None => SessionKeys { tx: None, rx: None },
        }
    }

    /// The authenticated client public key, when an auth phase ran.
    pub fn client_sign_pub(&self) -> Option<[u8; 32]> {
        self.client_sign_pub
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client side
// ─────────────────────────────────────────────────────────────────────────────

/// Client-side handshake policy.
pub struct ClientHandshakeConfig {
    pub supports_encryption: bool,
    pub password: Option<String>,
    /// Identity used to answer the auth challenge; a throwaway key is
    /// generated when absent.
    pub identity: Option<SigningKey>,
    /// Expected server identity key; when set, an unsigned or mismatched
    /// challenge fails the handshake.
    pub expect_server_identity: Option<[u8; 32]>,
}

/// Client side of the handshake, used by the mirror embedding and tests.
pub struct ClientHandshake {
    config: ClientHandshakeConfig,
    phase: HandshakePhase,
    transcript: Sha256,
    params: Option<CryptoParameters>,
    pending_keys: Option<([u8; KEY_LEN], [u8; KEY_LEN])>,
    transcript_hash: [u8; 32],
}

impl ClientHandshake {
    /// Creates the machine and the opening `PROTOCOL_VERSION` packet.
    pub fn start(config: ClientHandshakeConfig) -> (Self, Reply) {
        let version = ProtocolVersion::local(config.supports_encryption).encode();
        let mut machine = Self {
            config,
            phase: HandshakePhase::Init,
            transcript: Sha256::new(),
            params: None,
            pending_keys: None,
            transcript_hash: [0u8; 32],
        };
        machine.transcript.update(&version);
        (machine, (PacketType::ProtocolVersion, version))
    }

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    fn fail<T>(&mut self, error: CryptoError) -> Result<T, CryptoError> {
        self.phase = HandshakePhase::Failed;
        Err(error)
    }

    pub fn handle_packet(
        &mut self,
        packet_type: PacketType,
        payload: &[u8],
    ) -> Result<Vec<Reply>, CryptoError> {
        match (self.phase, packet_type) {
            (HandshakePhase::Init, PacketType::ProtocolVersion) => {
                let theirs = match ProtocolVersion::decode(payload) {
                    Ok(theirs) => theirs,
                    Err(e) => return self.fail(CryptoError::Malformed(e)),
                };
                self.transcript.update(payload);
                if !theirs.supports_encryption {
                    if self.config.supports_encryption {
                        return self.fail(CryptoError::EncryptionRequired);
                    }
                    self.phase = HandshakePhase::Ready;
                    return Ok(vec![]);
                }
                let caps = CryptoCapabilities::local().encode();
                self.transcript.update(&caps);
                self.phase = HandshakePhase::VersionExchanged;
                Ok(vec![(PacketType::CryptoCapabilities, caps)])
            }

            (HandshakePhase::VersionExchanged, PacketType::CryptoParameters) => {
                let params = match CryptoParameters::decode(payload) {
                    Ok(params) => params,
                    Err(e) => return self.fail(CryptoError::Malformed(e)),
                };
                if params.key_len as usize != KEY_LEN
                    || params.nonce_len as usize != NONCE_LEN
                    || params.mac_len as usize != MAC_LEN
                {
                    return self.fail(CryptoError::Negotiation(
                        "unsupported parameter sizes".into(),
                    ));
                }
                if params.password_mode && self.config.password.is_none() {
                    return self.fail(CryptoError::PasswordRequired);
                }
                self.transcript.update(payload);
                self.params = Some(params);
                self.phase = HandshakePhase::ParametersNegotiated;
                Ok(vec![])
            }

            (HandshakePhase::ParametersNegotiated, PacketType::KeyExchangeInit) => {
                let kex = match KeyExchange::decode(payload) {
                    Ok(kex) => kex,
                    Err(e) => return self.fail(CryptoError::Malformed(e)),
                };
                self.transcript.update(payload);

                let ephemeral = StaticSecret::random_from_rng(OsRng);
                let our_kex = KeyExchange {
                    public_key: *PublicKey::from(&ephemeral).as_bytes(),
                }
                .encode();
                self.transcript.update(&our_kex);
                self.transcript_hash = self.transcript.clone().finalize().into();

                let shared = *ephemeral
                    .diffie_hellman(&PublicKey::from(kex.public_key))
                    .as_bytes();
                let params = self.params.as_ref().expect("set in previous phase");
                let prekey = if params.password_mode {
                    let password = self
                        .config
                        .password
                        .as_ref()
                        .expect("checked in parameters phase");
                    Some(password_prekey(password, &params.argon_salt)?)
                } else {
                    None
                };
                self.pending_keys = Some(derive_session_keys(
                    &shared,
                    prekey.as_ref(),
                    &self.transcript_hash,
                )?);

                self.phase = if params.auth_required {
                    HandshakePhase::KeyExchanged
                } else {
                    HandshakePhase::Ready
                };
                Ok(vec![(PacketType::KeyExchangeInit, our_kex)])
            }

            (HandshakePhase::KeyExchanged, PacketType::AuthChallenge) => {
                let challenge = match AuthChallenge::decode(payload) {
                    Ok(challenge) => challenge,
                    Err(e) => return self.fail(CryptoError::Malformed(e)),
                };
                let params = self.params.as_ref().expect("set before key exchange");
                if params.server_identity {
                    if let Some(expected) = self.config.expect_server_identity {
                        if expected != challenge.server_sign_pub {
                            return self.fail(CryptoError::BadSignature);
                        }
                    }
                    if verify_transcript(
                        &challenge.server_sign_pub,
                        &challenge.challenge,
                        &self.transcript_hash,
                        &challenge.signature,
                    )
                    .is_err()
                    {
                        return self.fail(CryptoError::BadSignature);
                    }
                } else if self.config.expect_server_identity.is_some() {
                    return self.fail(CryptoError::BadSignature);
                }

                let identity = self
                    .config
                    .identity
                    .get_or_insert_with(|| SigningKey::generate(&mut OsRng));
                let response = AuthResponse {
                    client_sign_pub: identity.verifying_key().to_bytes(),
                    signature: sign_transcript(
                        identity,
                        &challenge.challenge,
                        &self.transcript_hash,
                    )
                    .to_bytes(),
                };
                self.phase = HandshakePhase::Ready;
                Ok(vec![(PacketType::AuthResponse, response.encode())])
            }

            (phase, got) => self.fail(CryptoError::UnexpectedPacket {
                phase: format!("{phase:?}"),
                packet_type: got as u16,
            }),
        }
    }

    /// Hands out the directional ciphers once READY. Client tx is the
    /// client→server direction.
    pub fn take_keys(&mut self) -> SessionKeys {
        debug_assert_eq!(self.phase, HandshakePhase::Ready);
        match self.pending_keys.take() {
            Some((c2s, s2c)) => SessionKeys {
                tx: Some(DirectionCipher::new(&c2s)),
                rx: Some(DirectionCipher::new(&s2c)),
            },
            None => SessionKeys { tx: None, rx: None },
        }
    }
}

//! Server identity key and client allow-list.

use std::collections::HashSet;
use std::path::Path;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

use super::CryptoError;

/// Loads the server's Ed25519 identity key from `path`, generating and
/// persisting a fresh one when the file does not exist.
///
/// The file holds the 32-byte raw seed. Permissions are the embedder's
/// concern; the hub only refuses malformed contents.
pub fn load_or_generate_identity(path: &Path) -> Result<SigningKey, CryptoError> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let seed: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::Identity(format!(
                    "identity key {} is {} bytes, expected 32",
                    path.display(),
                    bytes.len()
                )))?;
            Ok(SigningKey::from_bytes(&seed))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let key = SigningKey::generate(&mut OsRng);
            std::fs::write(path, key.to_bytes())
                .map_err(|e| CryptoError::Identity(format!(
                    "cannot persist identity key {}: {e}",
                    path.display()
                )))?;
            Ok(key)
        }
        Err(e) => Err(CryptoError::Identity(format!(
            "cannot read identity key {}: {e}",
            path.display()
        ))),
    }
}

/// Allow-list of client Ed25519 public keys.
///
/// Keyed by the raw 32 public-key bytes; membership is checked during the
/// authentication handshake phase.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    keys: HashSet<[u8; 32]>,
}

impl AllowList {
    pub fn new(keys: impl IntoIterator<Item = [u8; 32]>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }

    pub fn contains(&self, public_key: &[u8; 32]) -> bool {
        self.keys.contains(public_key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, Verifier};

    #[test]
    fn generates_and_reloads_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");

        let generated = load_or_generate_identity(&path).unwrap();
        let reloaded = load_or_generate_identity(&path).unwrap();
        assert_eq!(generated.to_bytes(), reloaded.to_bytes());

        // The reloaded key signs verifiably.
        let signature = reloaded.sign(b"transcript");
        generated
            .verifying_key()
            .verify(b"transcript", &signature)
            .unwrap();
    }

    #[test]
    fn rejects_malformed_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        std::fs::write(&path, b"short").unwrap();
        assert!(load_or_generate_identity(&path).is_err());
    }

    #[test]
    fn allowlist_membership() {
        let member = [1u8; 32];
        let outsider = [2u8; 32];
        let list = AllowList::new([member]);
        assert!(list.contains(&member));
        assert!(!list.contains(&outsider));
        assert_eq!(list.len(), 1);
    }
}

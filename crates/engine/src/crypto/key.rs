//! Capability payload encryption using ChaCha20-Poly1305
//!
//! Every capability is sealed with the symmetric key its holder presents in
//! the authorization set. The holder never hands the key to the store: the
//! store only keeps a digest of it (see [`super::DigestAlgorithm`]), the
//! nonce and the ciphertext.

use std::ops::Deref;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

/// Size of ChaCha20-Poly1305 nonce in bytes
pub const NONCE_SIZE: usize = 12;
/// Size of ChaCha20-Poly1305 key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Errors that can occur during sealing/opening
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key error: {0}")]
    Default(#[from] anyhow::Error),
    #[error("invalid key size, expected {KEY_SIZE}, got {0}")]
    InvalidSize(usize),
    #[error("invalid base64 key: {0}")]
    Base64(#[from] base64::DecodeError),
    /// Wrong key or tampered payload
    #[error("decryption failed")]
    DecryptionFailed,
}

/// A 256-bit symmetric key presented by a capability holder
///
/// The sealed format keeps the nonce apart from the ciphertext, since the
/// store persists them as separate columns. The tenant id is bound as
/// associated data so a sealed claim cannot be replanted into another
/// tenant.
///
/// # Examples
///
/// ```ignore
/// let key = CapabilityKey::generate();
/// let (nonce, ciphertext) = key.seal(b"{\"kind\":\"view\"}", tenant.as_uuid().as_bytes())?;
/// let claim = key.open(&nonce, &ciphertext, tenant.as_uuid().as_bytes())?;
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct CapabilityKey([u8; KEY_SIZE]);

impl std::fmt::Debug for CapabilityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CapabilityKey(..)")
    }
}

impl Deref for CapabilityKey {
    type Target = [u8; KEY_SIZE];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<[u8; KEY_SIZE]> for CapabilityKey {
    fn from(bytes: [u8; KEY_SIZE]) -> Self {
        CapabilityKey(bytes)
    }
}

impl CapabilityKey {
    /// Generate a new random key using a cryptographically secure RNG
    pub fn generate() -> Self {
        let mut buff = [0; KEY_SIZE];
        getrandom::getrandom(&mut buff).expect("failed to generate random bytes");
        Self(buff)
    }

    /// Create a key from a byte slice
    ///
    /// # Errors
    ///
    /// Returns an error if the slice length is not exactly `KEY_SIZE` bytes.
    pub fn from_slice(data: &[u8]) -> Result<Self, KeyError> {
        if data.len() != KEY_SIZE {
            return Err(KeyError::InvalidSize(data.len()));
        }
        let mut buff = [0; KEY_SIZE];
        buff.copy_from_slice(data);
        Ok(buff.into())
    }

    /// Decode a key from base64, padded or not
    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        let bytes = STANDARD
            .decode(encoded)
            .or_else(|_| STANDARD_NO_PAD.decode(encoded))?;
        Self::from_slice(&bytes)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn bytes(&self) -> &[u8] {
        self.0.as_ref()
    }

    /// Encrypt `data` under a fresh random nonce
    ///
    /// Returns `(nonce, ciphertext || auth_tag)`.
    pub fn seal(&self, data: &[u8], aad: &[u8]) -> Result<(Vec<u8>, Vec<u8>), KeyError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.bytes()));

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce_bytes)
            .map_err(|e| anyhow::anyhow!("failed to generate nonce: {}", e))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, Payload { msg: data, aad })
            .map_err(|_| anyhow::anyhow!("encrypt error"))?;

        Ok((nonce_bytes.to_vec(), ciphertext))
    }

    /// Decrypt a sealed payload
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::DecryptionFailed`] if the nonce is malformed, the
    /// key is wrong, the associated data differs, or the ciphertext was
    /// tampered with.
    pub fn open(&self, nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, KeyError> {
        if nonce.len() != NONCE_SIZE {
            return Err(KeyError::DecryptionFailed);
        }
        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.bytes()));
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| KeyError::DecryptionFailed)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = CapabilityKey::generate();
        let (nonce, sealed) = key.seal(b"{\"kind\":\"view\"}", b"tenant").unwrap();
        assert_eq!(nonce.len(), NONCE_SIZE);
        let opened = key.open(&nonce, &sealed, b"tenant").unwrap();
        assert_eq!(opened, b"{\"kind\":\"view\"}");
    }

    #[test]
    fn test_open_with_wrong_key_or_aad_fails() {
        let key = CapabilityKey::generate();
        let other = CapabilityKey::generate();
        let (nonce, sealed) = key.seal(b"claim", b"tenant-a").unwrap();

        assert!(matches!(
            other.open(&nonce, &sealed, b"tenant-a"),
            Err(KeyError::DecryptionFailed)
        ));
        assert!(matches!(
            key.open(&nonce, &sealed, b"tenant-b"),
            Err(KeyError::DecryptionFailed)
        ));
        assert!(matches!(
            key.open(&nonce[..4], &sealed, b"tenant-a"),
            Err(KeyError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = CapabilityKey::generate();
        let (nonce, mut sealed) = key.seal(b"claim payload", b"t").unwrap();
        sealed[3] ^= 0xFF;
        assert!(key.open(&nonce, &sealed, b"t").is_err());
    }

    #[test]
    fn test_base64_round_trip_and_size_validation() {
        let key = CapabilityKey::generate();
        let decoded = CapabilityKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(key, decoded);

        let unpadded = key.to_base64().trim_end_matches('=').to_string();
        assert_eq!(CapabilityKey::from_base64(&unpadded).unwrap(), key);

        let short = STANDARD.encode([1u8; 16]);
        assert!(matches!(
            CapabilityKey::from_base64(&short),
            Err(KeyError::InvalidSize(16))
        ));
        assert!(CapabilityKey::from_base64("not base64!").is_err());
    }
}

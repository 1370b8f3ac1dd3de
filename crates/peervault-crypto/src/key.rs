//! Vault key and device secret handling.
//!
//! The vault key is the single symmetric key that protects everything a
//! vault persists. It never leaves the process unencrypted: at rest it is
//! sealed under the device secret, and between paired devices it travels
//! inside the transport's authenticated channel.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::aead;
use crate::kdf::{self, KdfParams};
use crate::phrase;
use crate::random::fill_random;
use crate::CryptoError;

/// Symmetric key size in bytes
pub const KEY_SIZE: usize = 32;

/// Context string for deriving the device secret from stored key material.
const DEVICE_KEY_CONTEXT: &str = "peervault device key v1";

/// AAD binding sealed vault keys to their purpose.
const VAULT_KEY_AAD: &[u8] = b"peervault vault key";

/// Short identifier of a key, safe to display and to embed in manifests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyFingerprint(String);

impl KeyFingerprint {
    /// The fingerprint as lowercase hex (16 chars).
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for KeyFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The vault's symmetric encryption key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct VaultKey {
    bytes: [u8; KEY_SIZE],
}

impl VaultKey {
    /// Generate a fresh random key.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::RandomFailed` if the OS entropy source fails.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; KEY_SIZE];
        fill_random(&mut bytes)?;
        Ok(Self { bytes })
    }

    /// Construct a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` unless exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut out = [0u8; KEY_SIZE];
        out.copy_from_slice(bytes);
        Ok(Self { bytes: out })
    }

    /// Derive a key from a password and salt with Argon2id.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Derivation` if derivation fails.
    pub fn from_password(
        password: &[u8],
        salt: &[u8],
        params: KdfParams,
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            bytes: kdf::derive_key(password, salt, params)?,
        })
    }

    /// Import a key from a 24-word recovery phrase.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidPhrase` on a malformed phrase.
    pub fn from_recovery_phrase(phrase: &str) -> Result<Self, CryptoError> {
        Ok(Self {
            bytes: phrase::phrase_to_key_bytes(phrase)?,
        })
    }

    /// Export the key as a 24-word recovery phrase.
    ///
    /// # Errors
    ///
    /// Propagates phrase-encoding failures.
    pub fn to_recovery_phrase(&self) -> Result<String, CryptoError> {
        phrase::key_bytes_to_phrase(&self.bytes)
    }

    /// Raw key bytes. Handle with care; prefer [`VaultKey::seal`]/[`VaultKey::open`].
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Short blake3-based fingerprint for display and manifest embedding.
    #[must_use]
    pub fn fingerprint(&self) -> KeyFingerprint {
        let hash = blake3::hash(&self.bytes);
        KeyFingerprint(hex::encode(&hash.as_bytes()[..8]))
    }

    /// Encrypt `plaintext` under this key. See [`aead::seal`].
    ///
    /// # Errors
    ///
    /// Propagates AEAD failures.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        aead::seal(&self.bytes, plaintext, aad)
    }

    /// Decrypt a blob produced by [`VaultKey::seal`].
    ///
    /// # Errors
    ///
    /// Propagates AEAD failures (`TagFailed` on any tampering).
    pub fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        aead::open(&self.bytes, sealed, aad)
    }
}

impl std::fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key bytes
        write!(f, "VaultKey({})", self.fingerprint())
    }
}

/// Per-device secret derived from locally stored key material.
///
/// Used only to seal the vault key at rest; it never crosses the network.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DeviceSecret {
    bytes: [u8; KEY_SIZE],
}

impl DeviceSecret {
    /// Derive the device secret from the 32 bytes stored at
    /// `peervault-transport-key`.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` unless exactly 32 bytes.
    pub fn derive(material: &[u8]) -> Result<Self, CryptoError> {
        if material.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: material.len(),
            });
        }
        Ok(Self {
            bytes: blake3::derive_key(DEVICE_KEY_CONTEXT, material),
        })
    }

    /// Seal a vault key for persistence at `vaultkey-encrypted`.
    ///
    /// # Errors
    ///
    /// Propagates AEAD failures.
    pub fn seal_vault_key(&self, key: &VaultKey) -> Result<Vec<u8>, CryptoError> {
        aead::seal(&self.bytes, key.as_bytes(), VAULT_KEY_AAD)
    }

    /// Open a vault key previously sealed with [`DeviceSecret::seal_vault_key`].
    ///
    /// # Errors
    ///
    /// Propagates AEAD failures.
    pub fn open_vault_key(&self, sealed: &[u8]) -> Result<VaultKey, CryptoError> {
        let mut bytes = aead::open(&self.bytes, sealed, VAULT_KEY_AAD)?;
        let key = VaultKey::from_bytes(&bytes);
        bytes.zeroize();
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_distinct_keys() {
        let a = VaultKey::generate().unwrap();
        let b = VaultKey::generate().unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_stable() {
        let key = VaultKey::from_bytes(&[7u8; 32]).unwrap();
        assert_eq!(key.fingerprint(), key.fingerprint());
        assert_eq!(key.fingerprint().as_str().len(), 16);
    }

    #[test]
    fn test_recovery_phrase_roundtrip() {
        let key = VaultKey::generate().unwrap();
        let phrase = key.to_recovery_phrase().unwrap();
        let restored = VaultKey::from_recovery_phrase(&phrase).unwrap();
        assert_eq!(key.as_bytes(), restored.as_bytes());
    }

    #[test]
    fn test_device_secret_seals_vault_key() {
        let secret = DeviceSecret::derive(&[9u8; 32]).unwrap();
        let key = VaultKey::generate().unwrap();

        let sealed = secret.seal_vault_key(&key).unwrap();
        let opened = secret.open_vault_key(&sealed).unwrap();
        assert_eq!(key.as_bytes(), opened.as_bytes());

        // A different device cannot open it
        let other = DeviceSecret::derive(&[10u8; 32]).unwrap();
        assert!(other.open_vault_key(&sealed).is_err());
    }

    #[test]
    fn test_debug_does_not_leak_bytes() {
        let key = VaultKey::from_bytes(&[0xEE; 32]).unwrap();
        let dbg = format!("{key:?}");
        assert!(!dbg.contains("238")); // 0xEE
        assert!(dbg.contains(key.fingerprint().as_str()));
    }
}

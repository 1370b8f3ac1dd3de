//! XChaCha20-Poly1305 authenticated encryption.
//!
//! The sealed format is `nonce (24 bytes) || ciphertext || tag (16 bytes)`.
//! The extended 192-bit nonce is drawn fresh from the OS for every seal, so
//! random nonces are safe without any counter state.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};

use crate::random::fill_random;
use crate::CryptoError;

/// Nonce size in bytes (192-bit extended nonce)
pub const NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Encrypt `plaintext` under `key`, binding `aad` into the tag.
///
/// Returns `nonce || ciphertext+tag`.
///
/// # Errors
///
/// Returns `CryptoError::RandomFailed` if nonce generation fails and
/// `CryptoError::EncryptionFailed` if the cipher rejects the input.
pub fn seal(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());

    let mut nonce = [0u8; NONCE_SIZE];
    fill_random(&mut nonce)?;

    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a blob produced by [`seal`] with the same `key` and `aad`.
///
/// # Errors
///
/// Returns `CryptoError::Truncated` if the blob cannot hold a nonce and tag,
/// and `CryptoError::TagFailed` if authentication fails (wrong key, wrong
/// aad, or tampered ciphertext).
pub fn open(key: &[u8; 32], sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::Truncated(sealed.len()));
    }

    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());

    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::TagFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x42; 32];

    #[test]
    fn test_seal_open_roundtrip() {
        let sealed = seal(&KEY, b"vault snapshot bytes", b"").unwrap();
        let opened = open(&KEY, &sealed, b"").unwrap();
        assert_eq!(opened, b"vault snapshot bytes");
    }

    #[test]
    fn test_roundtrip_with_aad() {
        let sealed = seal(&KEY, b"payload", b"peervault-snapshot").unwrap();
        let opened = open(&KEY, &sealed, b"peervault-snapshot").unwrap();
        assert_eq!(opened, b"payload");

        // Wrong aad must fail authentication
        assert!(matches!(
            open(&KEY, &sealed, b"other-key"),
            Err(CryptoError::TagFailed)
        ));
    }

    #[test]
    fn test_tamper_detection_every_byte() {
        let sealed = seal(&KEY, b"short secret", b"").unwrap();
        for i in 0..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[i] ^= 0x01;
            assert!(
                open(&KEY, &tampered, b"").is_err(),
                "tampering byte {i} went undetected"
            );
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = seal(&KEY, b"secret", b"").unwrap();
        let other = [0x43u8; 32];
        assert!(matches!(
            open(&other, &sealed, b""),
            Err(CryptoError::TagFailed)
        ));
    }

    #[test]
    fn test_truncated_blob_rejected() {
        assert!(matches!(
            open(&KEY, &[0u8; 10], b""),
            Err(CryptoError::Truncated(10))
        ));
    }

    #[test]
    fn test_nonces_are_unique() {
        let a = seal(&KEY, b"same plaintext", b"").unwrap();
        let b = seal(&KEY, b"same plaintext", b"").unwrap();
        assert_ne!(&a[..NONCE_SIZE], &b[..NONCE_SIZE]);
        assert_ne!(a, b);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_roundtrip(
                plaintext in prop::collection::vec(any::<u8>(), 0..4096),
                aad in prop::collection::vec(any::<u8>(), 0..64),
            ) {
                let sealed = seal(&KEY, &plaintext, &aad).unwrap();
                let opened = open(&KEY, &sealed, &aad).unwrap();
                prop_assert_eq!(opened, plaintext);
            }

            #[test]
            fn prop_open_never_panics(data in prop::collection::vec(any::<u8>(), 0..512)) {
                let _ = open(&KEY, &data, b"");
            }
        }
    }
}

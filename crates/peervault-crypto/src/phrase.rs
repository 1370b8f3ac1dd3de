//! BIP-39 recovery-phrase codec for vault keys.
//!
//! A 32-byte vault key maps to a 24-word English mnemonic and back. The
//! phrase carries the key itself, not a seed, so the round trip is exact.

use bip39::Mnemonic;

use crate::CryptoError;

/// Encode 32 bytes of key material as a 24-word recovery phrase.
///
/// # Errors
///
/// Returns `CryptoError::InvalidKeyLength` if `key_bytes` is not 32 bytes.
pub fn key_bytes_to_phrase(key_bytes: &[u8]) -> Result<String, CryptoError> {
    if key_bytes.len() != 32 {
        return Err(CryptoError::InvalidKeyLength {
            expected: 32,
            actual: key_bytes.len(),
        });
    }

    let mnemonic = Mnemonic::from_entropy(key_bytes)
        .map_err(|e| CryptoError::InvalidPhrase(e.to_string()))?;
    Ok(mnemonic.to_string())
}

/// Decode a recovery phrase back into 32 bytes of key material.
///
/// Whitespace is normalized; the phrase must be 24 valid English words with
/// a correct checksum.
///
/// # Errors
///
/// Returns `CryptoError::InvalidPhrase` on unknown words, bad checksum, or
/// an entropy size other than 32 bytes.
pub fn phrase_to_key_bytes(phrase: &str) -> Result<[u8; 32], CryptoError> {
    let normalized = phrase.split_whitespace().collect::<Vec<_>>().join(" ");
    let mnemonic = Mnemonic::parse_normalized(&normalized)
        .map_err(|e| CryptoError::InvalidPhrase(e.to_string()))?;

    let entropy = mnemonic.to_entropy();
    if entropy.len() != 32 {
        return Err(CryptoError::InvalidPhrase(format!(
            "expected a 24-word phrase, got {} words",
            mnemonic.word_count()
        )));
    }

    let mut out = [0u8; 32];
    out.copy_from_slice(&entropy);
    Ok(out)
}

//! # PeerVault Crypto
//!
//! Cryptographic services for the vault:
//! - **AEAD**: `XChaCha20-Poly1305` authenticated encryption (256-bit key,
//!   192-bit nonce, 128-bit tag) for values at rest and cloud deltas
//! - **Key derivation**: Argon2id password-to-key derivation
//! - **Vault keys**: generation, fingerprinting, sealing under a device
//!   secret, and BIP-39 recovery-phrase export/import
//!
//! All key material is zeroized on drop. Every component that needs crypto
//! receives these services as explicit values; nothing here is process-global.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod error;
pub mod key;
pub mod kdf;
pub mod phrase;
pub mod random;

pub use aead::{open, seal, NONCE_SIZE, TAG_SIZE};
pub use error::CryptoError;
pub use kdf::KdfParams;
pub use key::{DeviceSecret, KeyFingerprint, VaultKey, KEY_SIZE};
pub use phrase::{phrase_to_key_bytes, key_bytes_to_phrase};
pub use random::fill_random;

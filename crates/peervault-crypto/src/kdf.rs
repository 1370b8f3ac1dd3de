//! Argon2id password-to-key derivation.

use argon2::{Algorithm, Argon2, Params, ParamsBuilder, Version};
use serde::{Deserialize, Serialize};

use crate::CryptoError;

/// Parameters for Argon2id key derivation.
///
/// Defaults follow the OWASP recommendation for high-value secrets:
/// 64 MiB of memory, 4 iterations, parallelism 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_cost_kib: u32,
    /// Number of iterations
    pub iterations: u32,
    /// Degree of parallelism
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_cost_kib: 65536, // 64 MiB
            iterations: 4,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for tests. Not suitable for real passwords.
    #[must_use]
    pub fn low_security() -> Self {
        Self {
            memory_cost_kib: 4096, // 4 MiB
            iterations: 1,
            parallelism: 1,
        }
    }

    fn build(&self) -> Result<Params, CryptoError> {
        ParamsBuilder::new()
            .m_cost(self.memory_cost_kib)
            .t_cost(self.iterations)
            .p_cost(self.parallelism)
            .build()
            .map_err(|e| CryptoError::Derivation(format!("argon2 params: {e}")))
    }
}

/// Derive a 32-byte key from a password and salt.
///
/// # Errors
///
/// Returns `CryptoError::Derivation` if the parameters are invalid or the
/// derivation itself fails.
pub fn derive_key(
    password: &[u8],
    salt: &[u8],
    params: KdfParams,
) -> Result<[u8; 32], CryptoError> {
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.build()?);

    let mut out = [0u8; 32];
    argon2
        .hash_password_into(password, salt, &mut out)
        .map_err(|e| CryptoError::Derivation(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let params = KdfParams::low_security();
        let a = derive_key(b"correct horse", b"salt-salt-salt-salt", params).unwrap();
        let b = derive_key(b"correct horse", b"salt-salt-salt-salt", params).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_password_different_key() {
        let params = KdfParams::low_security();
        let a = derive_key(b"password-one", b"salt-salt-salt-salt", params).unwrap();
        let b = derive_key(b"password-two", b"salt-salt-salt-salt", params).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_different_salt_different_key() {
        let params = KdfParams::low_security();
        let a = derive_key(b"password", b"salt-aaaa-aaaa-aaaa", params).unwrap();
        let b = derive_key(b"password", b"salt-bbbb-bbbb-bbbb", params).unwrap();
        assert_ne!(a, b);
    }
}

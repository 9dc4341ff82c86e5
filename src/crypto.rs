//! # Secret KDF
//!
//! The tree never sees plaintext secrets at rest. Everything it stores is
//! the output of a key derivation function hidden behind the `SecretKdf`
//! trait:
//!
//! - **Argon2Kdf**: argon2id with configurable cost, PHC-string output
//!   (production).
//! - **DigestKdf**: single SHA-256 digest, constant-time compare
//!   (tests and development only; costs nothing, protects nothing).
//!
//! ## Contract
//!
//! - `verify(secure(s), s)` succeeds; any other secret fails with
//!   `AuthorizationFailure`.
//! - Verification is constant time with respect to the stored blob.
//! - An empty or unparseable blob never verifies.
//! - Failure to produce a blob surfaces as `InternalError`.
//!
//! ## Example
//!
//! ```rust
//! use netauth_core::crypto::{DigestKdf, SecretKdf};
//!
//! let kdf = DigestKdf;
//! let blob = kdf.secure("hunter2").unwrap();
//! assert!(kdf.verify(&blob, "hunter2").is_ok());
//! assert!(kdf.verify(&blob, "hunter3").is_err());
//! ```

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("authorization failure")]
    AuthorizationFailure,

    #[error("internal crypto error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

// ============================================================================
// TRAIT: SecretKdf
// ============================================================================

/// Pluggable key derivation function for login secrets.
///
/// Implementations must make `verify` constant time with respect to the
/// blob contents and must treat an empty blob as a failed verification,
/// never as a match.
pub trait SecretKdf: Send + Sync {
    /// Derive a storable blob from a plaintext secret. Output value is
    /// salted and therefore non-deterministic; length is stable for a
    /// given configuration.
    fn secure(&self, secret: &str) -> Result<String>;

    /// Check a plaintext secret against a stored blob.
    fn verify(&self, blob: &str, secret: &str) -> Result<()>;
}

// ============================================================================
// ARGON2 (production)
// ============================================================================

/// Cost parameters for [`Argon2Kdf`]. Defaults follow the argon2 crate's
/// recommended parameters; deployments override them from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfConfig {
    /// Memory cost in KiB.
    pub m_cost: u32,
    /// Iteration count.
    pub t_cost: u32,
    /// Lane count.
    pub p_cost: u32,
}

impl Default for KdfConfig {
    fn default() -> Self {
        KdfConfig {
            m_cost: Params::DEFAULT_M_COST,
            t_cost: Params::DEFAULT_T_COST,
            p_cost: Params::DEFAULT_P_COST,
        }
    }
}

/// Argon2id KDF producing PHC-formatted strings.
///
/// Verification reads the cost parameters back out of the stored blob, so
/// raising the configured cost only affects newly secured secrets and old
/// blobs keep verifying.
pub struct Argon2Kdf {
    inner: Argon2<'static>,
}

impl Argon2Kdf {
    pub fn new(config: KdfConfig) -> Result<Self> {
        let params = Params::new(config.m_cost, config.t_cost, config.p_cost, None)
            .map_err(|e| CryptoError::InternalError(e.to_string()))?;
        Ok(Argon2Kdf {
            inner: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }
}

impl SecretKdf for Argon2Kdf {
    fn secure(&self, secret: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .inner
            .hash_password(secret.as_bytes(), &salt)
            .map_err(|e| CryptoError::InternalError(e.to_string()))?;
        Ok(hash.to_string())
    }

    fn verify(&self, blob: &str, secret: &str) -> Result<()> {
        if blob.is_empty() {
            return Err(CryptoError::AuthorizationFailure);
        }
        // A blob that does not parse can never have been produced by
        // secure(), so it fails authentication rather than erroring out.
        let parsed = PasswordHash::new(blob).map_err(|_| CryptoError::AuthorizationFailure)?;
        self.inner
            .verify_password(secret.as_bytes(), &parsed)
            .map_err(|_| CryptoError::AuthorizationFailure)
    }
}

// ============================================================================
// DIGEST (tests and development)
// ============================================================================

/// Unsalted SHA-256 digest standing in for a real KDF.
///
/// Useful where KDF latency would dominate, never where the stored blobs
/// matter. The comparison still runs in constant time.
pub struct DigestKdf;

impl SecretKdf for DigestKdf {
    fn secure(&self, secret: &str) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    fn verify(&self, blob: &str, secret: &str) -> Result<()> {
        if blob.is_empty() {
            return Err(CryptoError::AuthorizationFailure);
        }
        let stored = hex::decode(blob).map_err(|_| CryptoError::AuthorizationFailure)?;
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        let computed = hasher.finalize();
        if bool::from(computed.as_slice().ct_eq(&stored)) {
            Ok(())
        } else {
            Err(CryptoError::AuthorizationFailure)
        }
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Which KDF engine to construct.
#[derive(Debug, Clone)]
pub enum KdfBackend {
    Argon2(KdfConfig),
    Digest,
}

/// Build a KDF from configuration.
pub fn create_kdf(backend: KdfBackend) -> Result<Box<dyn SecretKdf>> {
    match backend {
        KdfBackend::Argon2(config) => Ok(Box::new(Argon2Kdf::new(config)?)),
        KdfBackend::Digest => Ok(Box::new(DigestKdf)),
    }
}

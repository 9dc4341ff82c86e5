//! # Token Service
//!
//! Mints and validates the signed bearer tokens clients present with
//! every privileged call. A token is two base64url segments joined by a
//! dot: the serialized claims, then an Ed25519 signature over those exact
//! bytes. Claims are JSON, so a token is self-describing to anything
//! holding the public key.
//!
//! There is no revocation list. Lifetimes are short and expiry is the
//! revocation mechanism.
//!
//! ## Example
//!
//! ```rust
//! use netauth_core::capability::Capability;
//! use netauth_core::token::{TokenConfig, TokenKeys, TokenService};
//!
//! let service = TokenService::new(TokenKeys::generate(), TokenConfig::default());
//! let token = service.generate("camille", vec![Capability::CreateEntity]).unwrap();
//!
//! let claims = service.validate(&token).unwrap();
//! assert_eq!(claims.subject, "camille");
//! assert!(claims.has_capability(Capability::CreateEntity));
//! assert!(!claims.has_capability(Capability::DestroyEntity));
//! ```

use crate::capability::Capability;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use ed25519_compact::{KeyPair, Seed, Signature};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token signing key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("token invalid")]
    TokenInvalid,

    #[error("internal token error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, TokenError>;

// ============================================================================
// CLAIMS
// ============================================================================

/// Claim bundle carried inside a token. Timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Entity id the token was issued to.
    pub subject: String,

    /// Capabilities the token can exercise.
    pub capabilities: Vec<Capability>,

    pub issued_at: i64,
    pub not_before: i64,
    pub not_after: i64,

    /// Deadline past which this token can no longer seed a renewal.
    pub renews_not_after: i64,
}

impl Claims {
    /// Whether the token carries `cap`. `GLOBAL_ROOT` answers for
    /// everything.
    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.iter().any(|c| c.satisfies(cap))
    }

    /// Whether `now` falls inside the validity window.
    pub fn is_current(&self, now: i64) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// Whether the token could still be exchanged for a fresh one.
    pub fn renewable(&self, now: i64) -> bool {
        now <= self.renews_not_after
    }
}

// ============================================================================
// SIGNING KEYS
// ============================================================================

/// Ed25519 signing key pair for the token service.
///
/// The seed lives in a hex-encoded file owned by the service process.
/// Keys never travel through the tree or the store.
pub struct TokenKeys {
    keypair: KeyPair,
}

impl TokenKeys {
    /// Fresh ephemeral keys. Tokens die with the process; fine for tests
    /// and single-run tools.
    pub fn generate() -> Self {
        TokenKeys {
            keypair: KeyPair::from_seed(Seed::generate()),
        }
    }

    /// Load the seed from `path`. A missing or malformed file is
    /// `KeyUnavailable`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())
            .map_err(|e| TokenError::KeyUnavailable(e.to_string()))?;
        Self::from_seed_hex(text.trim())
    }

    /// Load the seed from `path`, creating and persisting a new one if
    /// the file does not exist yet.
    pub fn load_or_generate<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(text) => Self::from_seed_hex(text.trim()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let mut seed = [0u8; Seed::BYTES];
                rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut seed);
                fs::write(path, hex::encode(seed))
                    .map_err(|e| TokenError::KeyUnavailable(e.to_string()))?;
                Ok(TokenKeys {
                    keypair: KeyPair::from_seed(Seed::new(seed)),
                })
            }
            Err(e) => Err(TokenError::KeyUnavailable(e.to_string())),
        }
    }

    fn from_seed_hex(text: &str) -> Result<Self> {
        let bytes = hex::decode(text).map_err(|e| TokenError::KeyUnavailable(e.to_string()))?;
        let seed = Seed::from_slice(&bytes).map_err(|e| TokenError::KeyUnavailable(e.to_string()))?;
        Ok(TokenKeys {
            keypair: KeyPair::from_seed(seed),
        })
    }

    /// Public key bytes, for out-of-process validators.
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.keypair.pk.as_ref().to_vec()
    }

    /// Short stable identifier for logs: truncated SHA-256 of the public
    /// key.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.keypair.pk.as_ref());
        hex::encode(hasher.finalize())[..16].to_string()
    }
}

// ============================================================================
// SERVICE
// ============================================================================

/// Token lifetime policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenConfig {
    /// Seconds from issuance to `not_after`.
    pub lifetime_secs: i64,
    /// Seconds from issuance to `renews_not_after`.
    pub renew_window_secs: i64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        TokenConfig {
            lifetime_secs: 8 * 3600,
            renew_window_secs: 24 * 3600,
        }
    }
}

/// Mints and validates bearer tokens. Immutable after construction and
/// safe to share across handler threads.
pub struct TokenService {
    keys: TokenKeys,
    config: TokenConfig,
}

impl TokenService {
    pub fn new(keys: TokenKeys, config: TokenConfig) -> Self {
        TokenService { keys, config }
    }

    pub fn config(&self) -> TokenConfig {
        self.config
    }

    /// Issue a token for `subject` carrying `capabilities`.
    pub fn generate(&self, subject: &str, capabilities: Vec<Capability>) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            subject: subject.to_string(),
            capabilities,
            issued_at: now,
            not_before: now,
            not_after: now + self.config.lifetime_secs,
            renews_not_after: now + self.config.renew_window_secs,
        };
        self.sign(&claims)
    }

    fn sign(&self, claims: &Claims) -> Result<String> {
        let body = serde_json::to_vec(claims).map_err(|e| TokenError::Internal(e.to_string()))?;
        let sig = self.keys.keypair.sk.sign(&body, None);
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&body),
            URL_SAFE_NO_PAD.encode(sig.to_vec())
        ))
    }

    /// Validate a token string and return its claims.
    ///
    /// Structural damage, a bad signature, or an expired or not-yet-valid
    /// window all collapse into `TokenInvalid`; callers learn nothing
    /// about which check failed.
    pub fn validate(&self, token: &str) -> Result<Claims> {
        self.validate_at(token, Utc::now().timestamp())
    }

    fn validate_at(&self, token: &str, now: i64) -> Result<Claims> {
        let (body_b64, sig_b64) = token.split_once('.').ok_or(TokenError::TokenInvalid)?;
        let body = URL_SAFE_NO_PAD.decode(body_b64).map_err(|_| TokenError::TokenInvalid)?;
        let sig_bytes = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| TokenError::TokenInvalid)?;

        let sig = Signature::from_slice(&sig_bytes).map_err(|_| TokenError::TokenInvalid)?;
        self.keys
            .keypair
            .pk
            .verify(&body, &sig)
            .map_err(|_| TokenError::TokenInvalid)?;

        let claims: Claims = serde_json::from_slice(&body).map_err(|_| TokenError::TokenInvalid)?;
        if !claims.is_current(now) {
            return Err(TokenError::TokenInvalid);
        }
        Ok(claims)
    }
}

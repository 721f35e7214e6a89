//! # conduit-crypto
//!
//! The cryptographic capability used by the conduit transport, expressed as a
//! trait so the heavy lifting can live in a platform-specific implementation
//! (or in a hardware token) without the transport caring.
//!
//! The transport needs exactly four operations:
//!
//! | Operation     | Purpose                                                  |
//! |---------------|----------------------------------------------------------|
//! | `decode_auth` | Derive the envelope auth field from the raw session token |
//! | `encrypt`     | Seal a JSON payload under the session key                 |
//! | `decrypt`     | Open an inbound `data_enc` blob with the session key      |
//! | `sign`        | Sign a sealed payload with the account's private key      |
//!
//! [`Passthrough`] is a no-op codec for tests and local development against a
//! plaintext server.

#![deny(unsafe_code)]

use std::fmt;

use serde_json::Value;

// ─── CryptoError ──────────────────────────────────────────────────────────────

/// An error reported by the crypto capability.
#[derive(Debug, Clone, PartialEq)]
pub enum CryptoError {
    /// The auth token or key material was malformed.
    InvalidKey(String),
    /// Encryption, decryption or signing failed.
    Cipher(String),
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKey(s) => write!(f, "invalid key material: {s}"),
            Self::Cipher(s)     => write!(f, "cipher error: {s}"),
        }
    }
}

impl std::error::Error for CryptoError {}

// ─── CryptoProvider ───────────────────────────────────────────────────────────

/// The four-operation crypto capability the transport is built against.
///
/// Implementations must be cheap to share across tasks; all methods are
/// synchronous CPU work and must not block on I/O.
pub trait CryptoProvider: Send + Sync {
    /// Derive the value carried in the envelope's auth field from the raw
    /// session token. Deterministic: the same token always yields the same
    /// result, which is why callers may cache it.
    fn decode_auth(&self, auth: &str) -> Result<String, CryptoError>;

    /// Seal a JSON payload under the symmetric session key, producing the
    /// opaque string placed in a `data_enc` field.
    fn encrypt(&self, payload: &Value, key: &str) -> Result<String, CryptoError>;

    /// Open an inbound `data_enc` blob with the session key.
    fn decrypt(&self, ciphertext: &str, key: &str) -> Result<Value, CryptoError>;

    /// Sign a sealed payload with the account's private key.
    fn sign(&self, private_key: &str, ciphertext: &str) -> Result<String, CryptoError>;
}

// ─── Passthrough ──────────────────────────────────────────────────────────────

/// A codec that performs no cryptography at all.
///
/// `encrypt` serializes the payload to a JSON string and `decrypt` parses it
/// back; `decode_auth` returns the token unchanged and `sign` produces an
/// empty signature. Useful for unit tests and for driving the transport
/// against a local plaintext endpoint.
#[derive(Clone, Copy, Debug, Default)]
pub struct Passthrough;

impl CryptoProvider for Passthrough {
    fn decode_auth(&self, auth: &str) -> Result<String, CryptoError> {
        Ok(auth.to_string())
    }

    fn encrypt(&self, payload: &Value, _key: &str) -> Result<String, CryptoError> {
        serde_json::to_string(payload).map_err(|e| CryptoError::Cipher(e.to_string()))
    }

    fn decrypt(&self, ciphertext: &str, _key: &str) -> Result<Value, CryptoError> {
        serde_json::from_str(ciphertext).map_err(|e| CryptoError::Cipher(e.to_string()))
    }

    fn sign(&self, _private_key: &str, _ciphertext: &str) -> Result<String, CryptoError> {
        Ok(String::new())
    }
}

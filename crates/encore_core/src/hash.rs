//! Cryptographic hashes and content-addressable call keys.
//!
//! Uses BLAKE3 for all hashing operations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A BLAKE3 hash (256 bits / 32 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; 32]);

impl Hash {
    /// The number of bytes in a hash
    pub const LEN: usize = 32;

    /// Compute BLAKE3 hash of data
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Convert to hex string
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    ///
    /// # Errors
    ///
    /// Returns error if hex is invalid or not 32 bytes
    pub fn from_hex(hex: &str) -> Result<Self, HashError> {
        let bytes = hex::decode(hex).map_err(|_| HashError::InvalidHex)?;
        if bytes.len() != Self::LEN {
            return Err(HashError::InvalidLength(bytes.len()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Hash-related errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HashError {
    /// Invalid hex encoding
    #[error("Invalid hex encoding")]
    InvalidHex,
    /// Invalid length (not 32 bytes)
    #[error("Invalid hash length: {0} (expected 32)")]
    InvalidLength(usize),
    /// Malformed call key
    #[error("Invalid call key: {0}")]
    InvalidKey(String),
}

/// Prefix carried by keys derived from the string-rendering fallback.
pub const FALLBACK_PREFIX: &str = "fallback";

/// Content-addressable identity of one intercepted call.
///
/// Canonical keys are the hex digest of the canonical encoding of the call.
/// Fallback keys read `fallback:<qualified method>:<hex digest>` so the
/// method stays visible even when the arguments could not be encoded.
/// Deserialization goes through [`CallKey::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CallKey(String);

impl CallKey {
    /// Key for a canonically encoded call
    #[must_use]
    pub fn canonical(hash: Hash) -> Self {
        Self(hash.to_hex())
    }

    /// Key for a call hashed through its string rendering
    #[must_use]
    pub fn fallback(method: &str, hash: Hash) -> Self {
        Self(format!("{}:{}:{}", FALLBACK_PREFIX, method, hash.to_hex()))
    }

    /// Whether this key came from the fallback path
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.0.starts_with(FALLBACK_PREFIX) && self.0.as_bytes().get(FALLBACK_PREFIX.len()) == Some(&b':')
    }

    /// Get the key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a key read back from a checkpoint
    ///
    /// # Errors
    ///
    /// Returns error if the key is neither a 32-byte hex digest nor a
    /// well-formed fallback key
    pub fn parse(s: &str) -> Result<Self, HashError> {
        if let Some(rest) = s
            .strip_prefix(FALLBACK_PREFIX)
            .and_then(|rest| rest.strip_prefix(':'))
        {
            let (method, digest) = rest
                .rsplit_once(':')
                .ok_or_else(|| HashError::InvalidKey(s.to_string()))?;
            if method.is_empty() {
                return Err(HashError::InvalidKey(s.to_string()));
            }
            Hash::from_hex(digest)?;
            return Ok(Self(s.to_string()));
        }
        Hash::from_hex(s)?;
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CallKey {
    type Error = HashError;

    fn try_from(s: String) -> Result<Self, HashError> {
        Self::parse(&s)
    }
}

impl From<CallKey> for String {
    fn from(key: CallKey) -> Self {
        key.0
    }
}

impl AsRef<str> for CallKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

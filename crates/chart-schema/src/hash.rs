//! SHA-256 digests.

use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors produced when validating a digest string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DigestError {
    /// The hex portion is not exactly 64 characters long.
    #[error("Invalid SHA256 digest: expected 64 hex characters, got {len} in '{value}'")]
    InvalidLength {
        /// Length of the hex portion that was supplied.
        len: usize,
        /// The offending input.
        value: String,
    },

    /// The input contains characters outside `[0-9a-fA-F]`.
    #[error("Invalid SHA256 digest: contains non-hex characters in '{0}'")]
    NonHex(String),
}

/// A validated SHA256 digest (64 hex characters)
///
/// Every chart digest is validated at deserialization time, so an invalid hex
/// string never reaches a content unit. Stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Sha256Digest(String);

impl Sha256Digest {
    /// Create a new `Sha256Digest`, validating the input.
    ///
    /// Accepts strings with or without a `sha256:` prefix.
    pub fn new(s: impl Into<String>) -> Result<Self, DigestError> {
        let s = s.into();
        let hex = s.strip_prefix("sha256:").unwrap_or(&s);

        if hex.len() != 64 {
            return Err(DigestError::InvalidLength {
                len: hex.len(),
                value: s.clone(),
            });
        }

        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DigestError::NonHex(s.clone()));
        }

        Ok(Self(hex.to_lowercase()))
    }

    /// Compute the SHA256 digest of `data`.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap an already-finalized hasher.
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self(hex::encode(hasher.finalize()))
    }

    /// Get the digest as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Sha256Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Sha256Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for Sha256Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

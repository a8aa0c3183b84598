//! Identities and input fingerprints
//!
//! Both are SHA-256 digests over named, length-prefixed inputs. The identity
//! names the workspace a unit of work owns; the fingerprint is what the
//! execution history compares before reusing that workspace.

use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::Path;

const DIGEST_HEX_LEN: usize = 64;

/// Deterministic key for a unit of work
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Parse an identity from its hex form
    ///
    /// Identities are used as directory and file names, so anything other
    /// than 64 lowercase hex characters is rejected.
    pub fn parse(s: &str) -> CacheResult<Self> {
        if is_digest_hex(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(CacheError::InvalidIdentity(s.to_string()))
        }
    }

    /// Hex representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log lines
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Identity {
    type Error = CacheError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Identity> for String {
    fn from(value: Identity) -> Self {
        value.0
    }
}

/// Digest of the inputs that produced a workspace
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputFingerprint(String);

impl InputFingerprint {
    /// Hex representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InputFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incremental hasher for identities and fingerprints
///
/// Every field is written as `len(name) name len(value) value` so that
/// `("ab", "c")` and `("a", "bc")` never collide.
#[derive(Clone, Default)]
pub struct IdentityHasher {
    hasher: Sha256,
}

impl IdentityHasher {
    /// Start an empty hasher
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named input
    pub fn input(mut self, name: &str, value: impl AsRef<[u8]>) -> Self {
        let value = value.as_ref();
        self.hasher.update((name.len() as u64).to_le_bytes());
        self.hasher.update(name.as_bytes());
        self.hasher.update((value.len() as u64).to_le_bytes());
        self.hasher.update(value);
        self
    }

    /// Add the implementation version of the work
    pub fn implementation(self, version: &str) -> Self {
        self.input("implementation", version)
    }

    /// Add the contents of a file as an input
    pub fn file(self, name: &str, path: &Path) -> CacheResult<Self> {
        let contents = fs::read(path)
            .map_err(|e| CacheError::io(format!("reading input file {}", path.display()), e))?;
        Ok(self.input(name, contents))
    }

    /// Finish as an identity
    pub fn identity(self) -> Identity {
        Identity(hex::encode(self.hasher.finalize()))
    }

    /// Finish as an input fingerprint
    pub fn fingerprint(self) -> InputFingerprint {
        InputFingerprint(hex::encode(self.hasher.finalize()))
    }
}

fn is_digest_hex(s: &str) -> bool {
    s.len() == DIGEST_HEX_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

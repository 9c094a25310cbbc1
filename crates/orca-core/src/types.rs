//! Core data types for Orca

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// A 32-byte SHA-256 digest
pub type Hash256 = [u8; 32];

/// Overlay node identifier: SHA-256 of the node's public key
pub type NodeId = Hash256;

/// SHA-256 of arbitrary bytes
pub fn sha256(data: &[u8]) -> Hash256 {
    Sha256::digest(data).into()
}

/// Content address of a blob
///
/// Always derived from the blob's bytes with [`ContentKey::of`]. Keys parsed
/// from hex are only good for lookups; stores recompute the key themselves.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ContentKey(Hash256);

impl ContentKey {
    /// Compute the key for the given bytes
    pub fn of(data: &[u8]) -> Self {
        Self(sha256(data))
    }

    pub fn as_bytes(&self) -> &Hash256 {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex_to_hash(s).map(Self)
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentKey({})", &self.to_hex()[..12])
    }
}

impl FromStr for ContentKey {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<ContentKey> for String {
    fn from(key: ContentKey) -> Self {
        key.to_hex()
    }
}

impl TryFrom<String> for ContentKey {
    type Error = hex::FromHexError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s)
    }
}

/// One candidate holder of a piece of content, as returned by a location query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageQuote {
    /// `host:port` of the HTTP transfer endpoint
    pub address: String,
    /// Asking price for the whole file
    pub price: f64,
    /// Size of the file in bytes
    pub size: u64,
    /// Set on the final entry of a candidate stream
    #[serde(default)]
    pub is_last_candidate: bool,
}

/// Helper to format a hash as hex string
pub fn hash_to_hex(hash: &Hash256) -> String {
    hex::encode(hash)
}

/// Helper to parse a hex string into a 32-byte hash
pub fn hex_to_hash(s: &str) -> Result<Hash256, hex::FromHexError> {
    let bytes = hex::decode(s)?;
    if bytes.len() != 32 {
        return Err(hex::FromHexError::InvalidStringLength);
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    Ok(hash)
}

/// Seconds since the Unix epoch
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

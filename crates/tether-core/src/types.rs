//! Core types for the Tether protocol
//!
//! Newtypes for the identifiers that cross module boundaries, so a device id
//! can never be passed where a user id is expected.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Result, TetherError};

/// Wall-clock timestamp, serialized as ISO-8601
pub type Timestamp = DateTime<Utc>;

/// Domain separator for user hashes broadcast in advertisements
const USER_HASH_CONTEXT: &[u8] = b"tether-user-hash-v1";

// ----------------------------------------------------------------------------
// User Identifier
// ----------------------------------------------------------------------------

/// Stable user identifier derived from a long-term public key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Derive the user id for a public key (hex of the first 16 bytes of its SHA-256)
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let digest = Sha256::digest(public_key);
        Self(hex::encode(&digest[..16]))
    }

    /// Wrap an already-derived identifier
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Truncated hash broadcast in advertisements
    pub fn user_hash(&self) -> UserHash {
        let mut hasher = Sha256::new();
        hasher.update(USER_HASH_CONTEXT);
        hasher.update(self.0.as_bytes());
        let digest = hasher.finalize();
        let mut hash = [0u8; UserHash::LEN];
        hash.copy_from_slice(&digest[..UserHash::LEN]);
        UserHash(hash)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

// ----------------------------------------------------------------------------
// Device Identifier
// ----------------------------------------------------------------------------

/// Platform-local radio identifier; not stable across OS versions
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

// ----------------------------------------------------------------------------
// Fixed-width advertisement fields
// ----------------------------------------------------------------------------

/// Copy `bytes` into a fixed array, truncating or zero-padding
fn fit<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    let len = core::cmp::min(bytes.len(), N);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

/// 6-byte truncated hash of a user's long-term identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct UserHash([u8; 6]);

impl UserHash {
    pub const LEN: usize = 6;

    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Build from an arbitrary slice, truncating or zero-padding to 6 bytes
    pub fn from_slice_lossy(bytes: &[u8]) -> Self {
        Self(fit(bytes))
    }

    /// Parse hex; wrong lengths are truncated or padded, bad hex yields zeros
    pub fn from_hex_lossy(hex_str: &str) -> Self {
        Self::from_slice_lossy(&hex::decode(hex_str).unwrap_or_default())
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 6]
    }
}

impl fmt::Display for UserHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for UserHash {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes =
            hex::decode(s).map_err(|_| TetherError::invalid_payload("Invalid hex in user hash"))?;
        if bytes.len() != Self::LEN {
            return Err(TetherError::invalid_payload(
                "User hash must be exactly 6 bytes",
            ));
        }
        Ok(Self::from_slice_lossy(&bytes))
    }
}

/// 4-byte rotating token that limits long-term passive tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FollowToken([u8; 4]);

impl FollowToken {
    pub const LEN: usize = 4;

    pub fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    pub fn from_slice_lossy(bytes: &[u8]) -> Self {
        Self(fit(bytes))
    }

    pub fn from_hex_lossy(hex_str: &str) -> Self {
        Self::from_slice_lossy(&hex::decode(hex_str).unwrap_or_default())
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for FollowToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_is_derived_from_public_key() {
        let a = UserId::from_public_key(&[1u8; 32]);
        let b = UserId::from_public_key(&[1u8; 32]);
        let c = UserId::from_public_key(&[2u8; 32]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn user_hash_is_stable_and_short() {
        let id = UserId::new("abc");
        assert_eq!(id.user_hash(), id.user_hash());
        assert_ne!(id.user_hash(), UserId::new("abd").user_hash());
    }

    #[test]
    fn lossy_hex_truncates_and_pads() {
        assert_eq!(
            UserHash::from_hex_lossy("0102030405060708").as_bytes(),
            &[1, 2, 3, 4, 5, 6]
        );
        assert_eq!(
            UserHash::from_hex_lossy("0102").as_bytes(),
            &[1, 2, 0, 0, 0, 0]
        );
        assert!(UserHash::from_hex_lossy("zz").is_zero());
        assert_eq!(
            FollowToken::from_hex_lossy("aabbccddee").as_bytes(),
            &[0xaa, 0xbb, 0xcc, 0xdd]
        );
    }

    #[test]
    fn strict_user_hash_parsing() {
        assert!("010203040506".parse::<UserHash>().is_ok());
        assert!("0102".parse::<UserHash>().is_err());
        assert!("not-hex!".parse::<UserHash>().is_err());
    }
}

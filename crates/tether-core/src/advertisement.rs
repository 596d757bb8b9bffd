//! Advertisement payload codec
//!
//! One canonical byte layout for the broadcast payload:
//!
//! ```text
//! [version:1][nameLen:1][name:nameLen][userHash:6][followToken:4]
//! ```
//!
//! Transports that carry arbitrary bytes put this frame in manufacturer data.
//! Transports that only reliably carry a local name use the string form
//! `"TTR:<name>:<hashHex>:<tokenHex>"`, which carries the same logical fields.
//! Decoding never fails: malformed or missing input yields the zero payload,
//! which the scanner reports as an unknown peer.

use serde::{Deserialize, Serialize};

use crate::types::{FollowToken, UserHash};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Current frame version; 0 is reserved for "unknown peer"
pub const ADVERTISEMENT_VERSION: u8 = 1;

/// Maximum display-name length in bytes
pub const MAX_NAME_LEN: usize = 12;

/// Smallest valid frame: version, name length, hash, token
pub const MIN_FRAME_LEN: usize = 2 + UserHash::LEN + FollowToken::LEN;

/// Largest frame the codec ever produces
pub const MAX_FRAME_LEN: usize = MIN_FRAME_LEN + MAX_NAME_LEN;

/// Manufacturer id used for the binary frame (reserved test/development id)
pub const MANUFACTURER_ID: u16 = 0xFFFF;

/// Tag prefix for the string-encoded fallback
pub const NAME_TAG: &str = "TTR";

/// Bytes of AD structures a legacy advertising PDU can carry
pub const LEGACY_ADVERTISING_BUDGET: usize = 31;

const AD_TYPE_FLAGS: u8 = 0x01;
const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;
/// LE general discoverable, BR/EDR not supported
const AD_FLAGS: u8 = 0x06;

// ----------------------------------------------------------------------------
// Payload
// ----------------------------------------------------------------------------

/// Decoded advertisement contents
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvertisementPayload {
    pub version: u8,
    pub display_name: Option<String>,
    pub user_hash: UserHash,
    pub follow_token: FollowToken,
}

impl AdvertisementPayload {
    /// Build a current-version payload, normalizing the display name
    pub fn new(display_name: &str, user_hash: UserHash, follow_token: FollowToken) -> Self {
        let name = normalize_display_name(display_name);
        Self {
            version: ADVERTISEMENT_VERSION,
            display_name: if name.is_empty() { None } else { Some(name) },
            user_hash,
            follow_token,
        }
    }

    /// Payload for a sighting whose identity is unknown until a GATT read
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Whether this payload carries a decoded identity
    pub fn is_known(&self) -> bool {
        self.version != 0
    }

    /// Encode into the canonical binary frame
    pub fn to_bytes(&self) -> Vec<u8> {
        let name = self
            .display_name
            .as_deref()
            .map(normalize_display_name)
            .unwrap_or_default();
        let mut frame = Vec::with_capacity(MIN_FRAME_LEN + name.len());
        frame.push(self.version);
        frame.push(name.len() as u8);
        frame.extend_from_slice(name.as_bytes());
        frame.extend_from_slice(self.user_hash.as_bytes());
        frame.extend_from_slice(self.follow_token.as_bytes());
        frame
    }

    /// AD structures radiated for this payload: flags, then manufacturer data
    pub fn advertising_data(&self) -> Vec<u8> {
        let frame = self.to_bytes();
        let mut data = Vec::with_capacity(7 + frame.len());
        data.extend_from_slice(&[2, AD_TYPE_FLAGS, AD_FLAGS]);
        data.push((3 + frame.len()) as u8);
        data.push(AD_TYPE_MANUFACTURER_DATA);
        data.extend_from_slice(&MANUFACTURER_ID.to_le_bytes());
        data.extend_from_slice(&frame);
        data
    }

    /// Decode a binary frame; never fails
    pub fn from_bytes(data: &[u8]) -> Self {
        decode_frame(data).unwrap_or_else(Self::unknown)
    }

    /// Encode into the string fallback carried in the local name
    pub fn to_name_string(&self) -> String {
        let name = self
            .display_name
            .as_deref()
            .map(normalize_display_name)
            .unwrap_or_default();
        format!(
            "{}:{}:{}:{}",
            NAME_TAG, name, self.user_hash, self.follow_token
        )
    }

    /// Decode the string fallback; never fails
    pub fn from_name_string(value: &str) -> Self {
        decode_name_string(value).unwrap_or_else(Self::unknown)
    }
}

// ----------------------------------------------------------------------------
// Codec Functions
// ----------------------------------------------------------------------------

/// Trim, drop anything outside printable ASCII, and cap at 12 bytes
pub fn normalize_display_name(name: &str) -> String {
    let printable: String = name
        .chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .collect();
    printable
        .trim()
        .chars()
        .take(MAX_NAME_LEN)
        .collect::<String>()
        .trim_end()
        .to_string()
}

/// Encode from hex inputs; mismatched hex lengths are truncated or zero-padded
pub fn encode(display_name: &str, user_hash_hex: &str, follow_token_hex: &str) -> Vec<u8> {
    AdvertisementPayload::new(
        display_name,
        UserHash::from_hex_lossy(user_hash_hex),
        FollowToken::from_hex_lossy(follow_token_hex),
    )
    .to_bytes()
}

/// Decode a binary frame, returning the zero payload on any malformation
pub fn decode(data: &[u8]) -> AdvertisementPayload {
    AdvertisementPayload::from_bytes(data)
}

fn decode_frame(data: &[u8]) -> Option<AdvertisementPayload> {
    if data.len() < MIN_FRAME_LEN {
        return None;
    }
    let version = data[0];
    if version == 0 {
        return None;
    }
    let name_len = data[1] as usize;
    if name_len > MAX_NAME_LEN {
        return None;
    }
    let name_end = 2 + name_len;
    let hash_end = name_end + UserHash::LEN;
    let token_end = hash_end + FollowToken::LEN;
    if data.len() < token_end {
        return None;
    }

    let name = core::str::from_utf8(&data[2..name_end]).ok()?;
    let name = normalize_display_name(name);

    Some(AdvertisementPayload {
        version,
        display_name: if name.is_empty() { None } else { Some(name) },
        user_hash: UserHash::from_slice_lossy(&data[name_end..hash_end]),
        follow_token: FollowToken::from_slice_lossy(&data[hash_end..token_end]),
    })
}

fn decode_name_string(value: &str) -> Option<AdvertisementPayload> {
    let rest = value.strip_prefix(NAME_TAG)?.strip_prefix(':')?;
    // Hash and token are fixed-width hex, so the name may itself contain ':'
    let mut parts = rest.rsplitn(3, ':');
    let token_hex = parts.next()?;
    let hash_hex = parts.next()?;
    let name = parts.next()?;

    if hash_hex.len() != UserHash::LEN * 2 || token_hex.len() != FollowToken::LEN * 2 {
        return None;
    }
    let hash = hex::decode(hash_hex).ok()?;
    let token = hex::decode(token_hex).ok()?;

    let name = normalize_display_name(name);
    Some(AdvertisementPayload {
        version: ADVERTISEMENT_VERSION,
        display_name: if name.is_empty() { None } else { Some(name) },
        user_hash: UserHash::from_slice_lossy(&hash),
        follow_token: FollowToken::from_slice_lossy(&token),
    })
}

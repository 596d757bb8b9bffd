//! GATT schema and handshake wire payloads
//!
//! Both roles must agree byte-for-byte on these UUIDs and JSON shapes.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::{KeyStore, PublicKey};
use crate::types::{Timestamp, UserId};
use crate::{Result, TetherError};

// ----------------------------------------------------------------------------
// BLE Service and Characteristic UUIDs
// ----------------------------------------------------------------------------

/// Tether BLE service UUID
pub const TETHER_SERVICE_UUID: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);

/// Read-only characteristic serving the local profile
pub const PROFILE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);

/// Write-only characteristic accepting handshake messages
pub const HANDSHAKE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

// ----------------------------------------------------------------------------
// Profile
// ----------------------------------------------------------------------------

/// Identity card served by the Profile characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub user_id: UserId,
    pub display_name: String,
    pub public_key: PublicKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_photo: Option<String>,
}

impl Profile {
    /// Profile for the identity held by `keys`
    pub fn for_identity<K: KeyStore + ?Sized>(
        keys: &K,
        display_name: impl Into<String>,
        profile_photo: Option<String>,
    ) -> Self {
        Self {
            user_id: keys.user_id().clone(),
            display_name: display_name.into(),
            public_key: keys.public_key(),
            profile_photo,
        }
    }

    /// UTF-8 JSON bytes served over GATT
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse and check that the user id matches the public key
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let profile: Profile = serde_json::from_slice(data)?;
        profile.validate()?;
        Ok(profile)
    }

    fn validate(&self) -> Result<()> {
        if self.public_key.user_id() != self.user_id {
            return Err(TetherError::invalid_payload(
                "userId does not match publicKey",
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Handshake Messages
// ----------------------------------------------------------------------------

/// Response decision carried back to a requester
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Accepted,
    Rejected,
    Pending,
}

/// Sent by the requester over the Handshake characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRequest {
    pub user_id: UserId,
    pub display_name: String,
    pub public_key: PublicKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_photo: Option<String>,
    pub timestamp: Timestamp,
}

impl ConnectionRequest {
    pub fn from_profile(profile: &Profile) -> Self {
        Self {
            user_id: profile.user_id.clone(),
            display_name: profile.display_name.clone(),
            public_key: profile.public_key,
            profile_photo: profile.profile_photo.clone(),
            timestamp: Utc::now(),
        }
    }

    /// Sender's profile as carried in the request
    pub fn sender(&self) -> Profile {
        Profile {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            public_key: self.public_key,
            profile_photo: self.profile_photo.clone(),
        }
    }
}

/// Sent by the responder, inline or best-effort later
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionResponse {
    pub user_id: UserId,
    pub display_name: String,
    pub public_key: PublicKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_photo: Option<String>,
    pub timestamp: Timestamp,
    pub status: ResponseStatus,
}

impl ConnectionResponse {
    pub fn from_profile(profile: &Profile, status: ResponseStatus) -> Self {
        Self {
            user_id: profile.user_id.clone(),
            display_name: profile.display_name.clone(),
            public_key: profile.public_key,
            profile_photo: profile.profile_photo.clone(),
            timestamp: Utc::now(),
            status,
        }
    }

    pub fn sender(&self) -> Profile {
        Profile {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            public_key: self.public_key,
            profile_photo: self.profile_photo.clone(),
        }
    }
}

/// Envelope written to the Handshake characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HandshakeMessage {
    Request(ConnectionRequest),
    Response(ConnectionResponse),
}

impl HandshakeMessage {
    /// Sender user id, whichever direction
    pub fn sender_id(&self) -> &UserId {
        match self {
            HandshakeMessage::Request(req) => &req.user_id,
            HandshakeMessage::Response(resp) => &resp.user_id,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a written value; the sender's user id must match its public key
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let message: HandshakeMessage = serde_json::from_slice(data)?;
        let (user_id, public_key) = match &message {
            HandshakeMessage::Request(req) => (&req.user_id, &req.public_key),
            HandshakeMessage::Response(resp) => (&resp.user_id, &resp.public_key),
        };
        if &public_key.user_id() != user_id {
            return Err(TetherError::invalid_payload(
                "userId does not match publicKey",
            ));
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::LocalKeyStore;

    fn profile() -> Profile {
        let keys = LocalKeyStore::generate().unwrap();
        Profile::for_identity(&keys, "Ada", None)
    }

    #[test]
    fn uuids_share_the_nordic_base() {
        assert_eq!(
            TETHER_SERVICE_UUID.to_string(),
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            PROFILE_CHARACTERISTIC_UUID.to_string(),
            "6e400002-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            HANDSHAKE_CHARACTERISTIC_UUID.to_string(),
            "6e400003-b5a3-f393-e0a9-e50e24dcca9e"
        );
    }

    #[test]
    fn profile_json_uses_camel_case() {
        let profile = profile();
        let json: serde_json::Value = serde_json::from_slice(&profile.to_bytes().unwrap()).unwrap();
        assert!(json.get("userId").is_some());
        assert!(json.get("displayName").is_some());
        assert!(json.get("publicKey").unwrap().is_string());
        assert!(json.get("profilePhoto").is_none());
        assert_eq!(Profile::from_bytes(&profile.to_bytes().unwrap()).unwrap(), profile);
    }

    #[test]
    fn profile_with_forged_user_id_is_rejected() {
        let mut profile = profile();
        profile.user_id = UserId::new("00000000000000000000000000000000");
        assert!(Profile::from_bytes(&profile.to_bytes().unwrap()).is_err());
    }

    #[test]
    fn handshake_envelope_is_tagged() {
        let request = HandshakeMessage::Request(ConnectionRequest::from_profile(&profile()));
        let json: serde_json::Value = serde_json::from_slice(&request.to_bytes().unwrap()).unwrap();
        assert_eq!(json["type"], "request");
        assert!(json["timestamp"].as_str().unwrap().contains('T'));

        let response = HandshakeMessage::Response(ConnectionResponse::from_profile(
            &profile(),
            ResponseStatus::Accepted,
        ));
        let json: serde_json::Value =
            serde_json::from_slice(&response.to_bytes().unwrap()).unwrap();
        assert_eq!(json["type"], "response");
        assert_eq!(json["status"], "accepted");
    }

    #[test]
    fn malformed_handshake_is_an_error() {
        assert!(HandshakeMessage::from_bytes(b"not json").is_err());
        assert!(HandshakeMessage::from_bytes(br#"{"type":"hello"}"#).is_err());
    }
}

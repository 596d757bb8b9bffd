//! Persisted relationship records

use core::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::{KeyStore, PublicKey, SharedSecret};
use crate::protocol::Profile;
use crate::types::{Timestamp, UserId};
use crate::Result;

/// Relationship status, independent of which role discovered whom
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionStatus {
    /// I requested, awaiting their acceptance
    PendingSent,
    /// They requested, awaiting my decision
    PendingReceived,
    /// Both sides consider the relationship established
    Mutual,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::PendingSent => "pending-sent",
            ConnectionStatus::PendingReceived => "pending-received",
            ConnectionStatus::Mutual => "mutual",
        };
        f.write_str(name)
    }
}

/// Trust level assigned to a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Unknown,
    /// Met in person over BLE
    Casual,
    Trusted,
    /// Fingerprint verified out of band
    Verified,
}

impl Default for TrustLevel {
    fn default() -> Self {
        TrustLevel::Casual
    }
}

/// A relationship with one remote user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: Uuid,
    pub user_id: UserId,
    pub display_name: String,
    pub public_key: PublicKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_photo: Option<String>,
    /// Derived on first use; not required to establish the connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_secret: Option<SharedSecret>,
    pub connected_at: Timestamp,
    pub status: ConnectionStatus,
    #[serde(default)]
    pub trust_level: TrustLevel,
}

impl Connection {
    pub fn new(peer: &Profile, status: ConnectionStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: peer.user_id.clone(),
            display_name: peer.display_name.clone(),
            public_key: peer.public_key,
            profile_photo: peer.profile_photo.clone(),
            shared_secret: None,
            connected_at: Utc::now(),
            status,
            trust_level: TrustLevel::default(),
        }
    }

    pub fn is_mutual(&self) -> bool {
        self.status == ConnectionStatus::Mutual
    }

    /// Secret shared with this peer, derived on first use and cached here
    ///
    /// The flag is true when the secret was derived by this call, so the
    /// caller knows the record needs saving.
    pub fn shared_secret<K: KeyStore + ?Sized>(&mut self, keys: &K) -> Result<(SharedSecret, bool)> {
        if let Some(secret) = &self.shared_secret {
            return Ok((secret.clone(), false));
        }
        let secret = keys.derive_shared_secret(&self.public_key)?;
        self.shared_secret = Some(secret.clone());
        Ok((secret, true))
    }

    /// Refresh presentation fields from a newer profile
    ///
    /// Returns whether anything changed. The public key is left alone: a
    /// different key under the same user id is rejected upstream.
    pub fn refresh_from(&mut self, peer: &Profile) -> bool {
        let mut changed = false;
        if self.display_name != peer.display_name {
            self.display_name = peer.display_name.clone();
            changed = true;
        }
        if self.profile_photo != peer.profile_photo {
            self.profile_photo = peer.profile_photo.clone();
            changed = true;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{KeyStore, LocalKeyStore};

    #[test]
    fn status_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&ConnectionStatus::PendingReceived).unwrap(),
            "\"pending-received\""
        );
        assert_eq!(ConnectionStatus::PendingSent.to_string(), "pending-sent");
    }

    #[test]
    fn shared_secret_is_absent_until_derived() {
        let keys = LocalKeyStore::generate().unwrap();
        let profile = Profile::for_identity(&keys, "Ada", None);
        let connection = Connection::new(&profile, ConnectionStatus::PendingSent);
        assert!(connection.shared_secret.is_none());
        assert_eq!(&connection.user_id, keys.user_id());
        assert_eq!(connection.trust_level, TrustLevel::Casual);

        let json = serde_json::to_value(&connection).unwrap();
        assert!(json.get("sharedSecret").is_none());
    }

    #[test]
    fn shared_secret_is_cached_after_first_derivation() {
        let me = LocalKeyStore::generate().unwrap();
        let peer = LocalKeyStore::generate().unwrap();
        let mut connection = Connection::new(
            &Profile::for_identity(&peer, "peer", None),
            ConnectionStatus::Mutual,
        );

        let (first, derived) = connection.shared_secret(&me).unwrap();
        assert!(derived);
        let (second, derived) = connection.shared_secret(&me).unwrap();
        assert!(!derived);
        assert_eq!(first, second);
        assert_eq!(first, peer.derive_shared_secret(&me.public_key()).unwrap());
    }
}

//! Follow handshake state machine
//!
//! Relationship records move between `pending-sent`, `pending-received` and
//! `mutual`. Either role may discover the other first; every path below is
//! idempotent so replays and crossing requests converge on one record per peer.
//!
//! ```text
//!   record_outgoing_request        handle_incoming_request
//!            |                          |              |
//!            v                   auto_accept      !auto_accept
//!      pending-sent                     |              v
//!       |   |    \ response(rejected)   |       pending-received
//!       |   |     `-> deleted           |          |        |
//!       |   `-- profile re-read --.     |   accept |        | reject
//!       `-- response(accepted) ---+-----+----------'        `-> deleted
//!                                 v
//!                               mutual
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionStatus};
use crate::identity::{KeyStore, SharedSecret};
use crate::protocol::{ConnectionRequest, ConnectionResponse, Profile, ResponseStatus};
use crate::storage::ConnectionStore;
use crate::types::{Timestamp, UserId};
use crate::{Result, TetherError};

// ----------------------------------------------------------------------------
// Policy
// ----------------------------------------------------------------------------

/// Tunables for the follow handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakePolicy {
    /// Accept every incoming request without asking
    pub auto_accept: bool,
    /// How long the requester waits for an inline response
    pub response_timeout_ms: u64,
    /// Age after which an unanswered `pending-sent` record is dropped
    pub pending_sent_expiry_secs: Option<u64>,
}

impl Default for HandshakePolicy {
    fn default() -> Self {
        Self {
            auto_accept: true,
            response_timeout_ms: 2_000,
            pending_sent_expiry_secs: None,
        }
    }
}

impl HandshakePolicy {
    pub fn with_auto_accept(mut self, auto_accept: bool) -> Self {
        self.auto_accept = auto_accept;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_pending_sent_expiry(mut self, expiry: Option<Duration>) -> Self {
        self.pending_sent_expiry_secs = expiry.map(|d| d.as_secs());
        self
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Connection Manager
// ----------------------------------------------------------------------------

/// Drives relationship records through the follow handshake
pub struct ConnectionManager {
    keys: Arc<dyn KeyStore>,
    store: Arc<dyn ConnectionStore>,
    policy: HandshakePolicy,
    local_profile: Profile,
}

impl ConnectionManager {
    pub fn new(
        keys: Arc<dyn KeyStore>,
        store: Arc<dyn ConnectionStore>,
        local_profile: Profile,
        policy: HandshakePolicy,
    ) -> Self {
        Self {
            keys,
            store,
            policy,
            local_profile,
        }
    }

    pub fn policy(&self) -> &HandshakePolicy {
        &self.policy
    }

    pub fn local_profile(&self) -> &Profile {
        &self.local_profile
    }

    pub fn store(&self) -> &Arc<dyn ConnectionStore> {
        &self.store
    }

    /// Request carrying the local profile
    pub fn outgoing_request(&self) -> ConnectionRequest {
        ConnectionRequest::from_profile(&self.local_profile)
    }

    fn response(&self, status: ResponseStatus) -> ConnectionResponse {
        ConnectionResponse::from_profile(&self.local_profile, status)
    }

    pub fn get(&self, user_id: &UserId) -> Result<Option<Connection>> {
        self.store.get_connection_by_user_id(user_id)
    }

    pub fn list(&self) -> Result<Vec<Connection>> {
        self.store.list_connections()
    }

    /// Load the record for `peer`, refusing a key change under a known user id
    fn existing_for(&self, peer: &Profile) -> Result<Option<Connection>> {
        let existing = self.store.get_connection_by_user_id(&peer.user_id)?;
        if let Some(connection) = &existing {
            if connection.public_key != peer.public_key {
                return Err(TetherError::invalid_transition(
                    peer.user_id.as_str(),
                    "public key differs from the recorded one",
                ));
            }
        }
        Ok(existing)
    }

    fn transition(&self, mut connection: Connection, status: ConnectionStatus) -> Result<Connection> {
        if connection.status != status {
            info!(
                user_id = %connection.user_id,
                from = %connection.status,
                to = %status,
                "Connection status changed"
            );
            connection.status = status;
        }
        self.store.save_connection(connection.clone())?;
        Ok(connection)
    }

    // ------------------------------------------------------------------------
    // Requester side
    // ------------------------------------------------------------------------

    /// Record that a request was written to `peer`
    pub fn record_outgoing_request(&self, peer: &Profile) -> Result<Connection> {
        match self.existing_for(peer)? {
            Some(mut connection) => {
                connection.refresh_from(peer);
                let status = match connection.status {
                    // They asked first and now we ask too
                    ConnectionStatus::PendingReceived => ConnectionStatus::Mutual,
                    status => status,
                };
                self.transition(connection, status)
            }
            None => {
                let connection = Connection::new(peer, ConnectionStatus::PendingSent);
                info!(user_id = %connection.user_id, "Follow request sent");
                self.store.save_connection(connection.clone())?;
                Ok(connection)
            }
        }
    }

    /// Apply a response from a peer we asked
    ///
    /// Returns the resulting record, or `None` when there is none (rejected,
    /// or a response for a request this device no longer tracks).
    pub fn handle_response(&self, response: &ConnectionResponse) -> Result<Option<Connection>> {
        let peer = response.sender();
        let Some(mut connection) = self.existing_for(&peer)? else {
            debug!(user_id = %peer.user_id, "Response for unknown connection ignored");
            return Ok(None);
        };
        connection.refresh_from(&peer);

        match response.status {
            ResponseStatus::Accepted => self.transition(connection, ConnectionStatus::Mutual).map(Some),
            ResponseStatus::Pending => self.transition(connection.clone(), connection.status).map(Some),
            ResponseStatus::Rejected => {
                if connection.status == ConnectionStatus::PendingSent {
                    info!(user_id = %peer.user_id, "Follow request rejected");
                    self.store.delete_connection(&peer.user_id)?;
                    Ok(None)
                } else {
                    debug!(
                        user_id = %peer.user_id,
                        status = %connection.status,
                        "Rejection ignored for non-pending connection"
                    );
                    Ok(Some(connection))
                }
            }
        }
    }

    /// A later profile read is proof the peer can be reached; upgrade `pending-sent`
    pub fn on_profile_read(&self, peer: &Profile) -> Result<Option<Connection>> {
        let Some(mut connection) = self.existing_for(peer)? else {
            return Ok(None);
        };
        connection.refresh_from(peer);
        let status = match connection.status {
            ConnectionStatus::PendingSent => ConnectionStatus::Mutual,
            status => status,
        };
        self.transition(connection, status).map(Some)
    }

    // ------------------------------------------------------------------------
    // Responder side
    // ------------------------------------------------------------------------

    /// Process a request written to our Handshake characteristic
    pub fn handle_incoming_request(
        &self,
        request: &ConnectionRequest,
    ) -> Result<(Connection, ConnectionResponse)> {
        let peer = request.sender();
        match self.existing_for(&peer)? {
            Some(mut connection) => {
                connection.refresh_from(&peer);
                match connection.status {
                    ConnectionStatus::Mutual => {
                        debug!(user_id = %peer.user_id, "Repeated request from mutual connection");
                        let connection = self.transition(connection, ConnectionStatus::Mutual)?;
                        Ok((connection, self.response(ResponseStatus::Accepted)))
                    }
                    ConnectionStatus::PendingSent => {
                        // Both sides asked
                        let connection = self.transition(connection, ConnectionStatus::Mutual)?;
                        Ok((connection, self.response(ResponseStatus::Accepted)))
                    }
                    ConnectionStatus::PendingReceived => {
                        let connection =
                            self.transition(connection, ConnectionStatus::PendingReceived)?;
                        Ok((connection, self.response(ResponseStatus::Pending)))
                    }
                }
            }
            None if self.policy.auto_accept => {
                let connection = Connection::new(&peer, ConnectionStatus::Mutual);
                info!(user_id = %peer.user_id, "Follow request auto-accepted");
                self.store.save_connection(connection.clone())?;
                Ok((connection, self.response(ResponseStatus::Accepted)))
            }
            None => {
                let connection = Connection::new(&peer, ConnectionStatus::PendingReceived);
                info!(user_id = %peer.user_id, "Follow request awaiting approval");
                self.store.save_connection(connection.clone())?;
                Ok((connection, self.response(ResponseStatus::Pending)))
            }
        }
    }

    /// Approve a `pending-received` request
    pub fn accept_request(&self, user_id: &UserId) -> Result<(Connection, ConnectionResponse)> {
        let connection = self
            .store
            .get_connection_by_user_id(user_id)?
            .ok_or_else(|| TetherError::connection_not_found(user_id.as_str()))?;

        match connection.status {
            ConnectionStatus::PendingReceived | ConnectionStatus::Mutual => {
                let connection = self.transition(connection, ConnectionStatus::Mutual)?;
                Ok((connection, self.response(ResponseStatus::Accepted)))
            }
            ConnectionStatus::PendingSent => Err(TetherError::invalid_transition(
                user_id.as_str(),
                "cannot accept a request this device sent",
            )),
        }
    }

    /// Decline a `pending-received` request and forget the peer
    pub fn reject_request(&self, user_id: &UserId) -> Result<ConnectionResponse> {
        let connection = self
            .store
            .get_connection_by_user_id(user_id)?
            .ok_or_else(|| TetherError::connection_not_found(user_id.as_str()))?;

        if connection.status != ConnectionStatus::PendingReceived {
            return Err(TetherError::invalid_transition(
                user_id.as_str(),
                format!("cannot reject a {} connection", connection.status),
            ));
        }
        self.store.delete_connection(user_id)?;
        info!(user_id = %user_id, "Follow request rejected locally");
        Ok(self.response(ResponseStatus::Rejected))
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Unfollow: delete the record regardless of status
    pub fn remove(&self, user_id: &UserId) -> Result<bool> {
        let removed = self.store.delete_connection(user_id)?;
        if removed {
            info!(user_id = %user_id, "Connection removed");
        }
        Ok(removed)
    }

    /// Drop `pending-sent` records older than the configured expiry
    pub fn expire_pending(&self, now: Timestamp) -> Result<Vec<UserId>> {
        let Some(expiry_secs) = self.policy.pending_sent_expiry_secs else {
            return Ok(Vec::new());
        };
        let expiry = chrono::Duration::seconds(expiry_secs as i64);

        let mut expired = Vec::new();
        for connection in self.store.list_connections()? {
            if connection.status == ConnectionStatus::PendingSent
                && now.signed_duration_since(connection.connected_at) >= expiry
            {
                self.store.delete_connection(&connection.user_id)?;
                expired.push(connection.user_id);
            }
        }
        if !expired.is_empty() {
            warn!(count = expired.len(), "Expired unanswered follow requests");
        }
        Ok(expired)
    }

    /// [`ConnectionManager::expire_pending`] against the current clock
    pub fn expire_pending_now(&self) -> Result<Vec<UserId>> {
        self.expire_pending(Utc::now())
    }

    /// Shared secret with `user_id`, derived on first use and cached in the record
    pub fn shared_secret_for(&self, user_id: &UserId) -> Result<SharedSecret> {
        let mut connection = self
            .store
            .get_connection_by_user_id(user_id)?
            .ok_or_else(|| TetherError::connection_not_found(user_id.as_str()))?;
        let (secret, derived) = connection.shared_secret(self.keys.as_ref())?;
        if derived {
            debug!(user_id = %user_id, "Derived shared secret");
            self.store.save_connection(connection)?;
        }
        Ok(secret)
    }
}

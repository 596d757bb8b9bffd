//! Storage boundary
//!
//! The persistent engine lives outside this crate. These traits are the narrow
//! interface the state machine and content engine need; [`MemoryStore`] backs
//! tests and the CLI.

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::connection::{Connection, ConnectionStatus};
use crate::content::EncryptedPost;
use crate::errors::StorageError;
use crate::types::UserId;
use crate::Result;

// ----------------------------------------------------------------------------
// Storage Traits
// ----------------------------------------------------------------------------

/// Persistence for connection records, keyed by record id and by user id
pub trait ConnectionStore: Send + Sync {
    /// Insert or replace the record for `connection.user_id`
    fn save_connection(&self, connection: Connection) -> Result<()>;

    fn get_connection_by_user_id(&self, user_id: &UserId) -> Result<Option<Connection>>;

    fn get_connection(&self, id: &Uuid) -> Result<Option<Connection>>;

    /// Returns the updated record, or `StorageError::NotFound`
    fn update_connection_status(
        &self,
        user_id: &UserId,
        status: ConnectionStatus,
    ) -> Result<Connection>;

    /// Returns whether a record was removed
    fn delete_connection(&self, user_id: &UserId) -> Result<bool>;

    fn list_connections(&self) -> Result<Vec<Connection>>;
}

/// Persistence for sealed posts
pub trait PostStore: Send + Sync {
    fn save_post(&self, post: EncryptedPost) -> Result<()>;

    /// Posts in ascending timestamp order
    fn get_encrypted_posts(&self) -> Result<Vec<EncryptedPost>>;
}

// ----------------------------------------------------------------------------
// In-memory Store
// ----------------------------------------------------------------------------

/// Concurrent in-memory store; clones share the same maps
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    connections: Arc<DashMap<UserId, Connection>>,
    posts: Arc<DashMap<Uuid, EncryptedPost>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConnectionStore for MemoryStore {
    fn save_connection(&self, connection: Connection) -> Result<()> {
        self.connections
            .insert(connection.user_id.clone(), connection);
        Ok(())
    }

    fn get_connection_by_user_id(&self, user_id: &UserId) -> Result<Option<Connection>> {
        Ok(self.connections.get(user_id).map(|entry| entry.clone()))
    }

    fn get_connection(&self, id: &Uuid) -> Result<Option<Connection>> {
        Ok(self
            .connections
            .iter()
            .find(|entry| &entry.id == id)
            .map(|entry| entry.clone()))
    }

    fn update_connection_status(
        &self,
        user_id: &UserId,
        status: ConnectionStatus,
    ) -> Result<Connection> {
        let mut entry = self
            .connections
            .get_mut(user_id)
            .ok_or_else(|| StorageError::NotFound {
                id: user_id.to_string(),
            })?;
        entry.status = status;
        Ok(entry.clone())
    }

    fn delete_connection(&self, user_id: &UserId) -> Result<bool> {
        Ok(self.connections.remove(user_id).is_some())
    }

    fn list_connections(&self) -> Result<Vec<Connection>> {
        let mut connections: Vec<Connection> =
            self.connections.iter().map(|entry| entry.clone()).collect();
        connections.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        Ok(connections)
    }
}

impl PostStore for MemoryStore {
    fn save_post(&self, post: EncryptedPost) -> Result<()> {
        self.posts.insert(post.post_id, post);
        Ok(())
    }

    fn get_encrypted_posts(&self) -> Result<Vec<EncryptedPost>> {
        let mut posts: Vec<EncryptedPost> = self.posts.iter().map(|entry| entry.clone()).collect();
        posts.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(posts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::LocalKeyStore;
    use crate::protocol::Profile;

    fn connection(status: ConnectionStatus) -> Connection {
        let keys = LocalKeyStore::generate().unwrap();
        Connection::new(&Profile::for_identity(&keys, "peer", None), status)
    }

    #[test]
    fn save_replaces_by_user_id() {
        let store = MemoryStore::new();
        let mut record = connection(ConnectionStatus::PendingSent);
        store.save_connection(record.clone()).unwrap();
        record.status = ConnectionStatus::Mutual;
        store.save_connection(record.clone()).unwrap();

        assert_eq!(store.list_connections().unwrap().len(), 1);
        let found = store.get_connection(&record.id).unwrap().unwrap();
        assert_eq!(found.status, ConnectionStatus::Mutual);
    }

    #[test]
    fn update_missing_record_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .update_connection_status(&UserId::new("nobody"), ConnectionStatus::Mutual)
            .unwrap_err();
        assert!(matches!(
            err,
            crate::TetherError::Storage(StorageError::NotFound { .. })
        ));
    }

    #[test]
    fn delete_reports_whether_anything_was_removed() {
        let store = MemoryStore::new();
        let record = connection(ConnectionStatus::PendingReceived);
        store.save_connection(record.clone()).unwrap();
        assert!(store.delete_connection(&record.user_id).unwrap());
        assert!(!store.delete_connection(&record.user_id).unwrap());
        assert!(store
            .get_connection_by_user_id(&record.user_id)
            .unwrap()
            .is_none());
    }
}

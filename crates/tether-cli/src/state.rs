//! State persistence for the Tether CLI
//!
//! The identity seed lives in `identity.seed` (hex) and connection records in
//! `connections.json`, both under the configured data directory.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use uuid::Uuid;

use tether_core::{
    Connection, ConnectionStatus, ConnectionStore, LocalKeyStore, MemoryStore, StorageError,
    TetherError, UserId,
};

use crate::error::{CliError, Result};

const IDENTITY_FILE: &str = "identity.seed";
const CONNECTIONS_FILE: &str = "connections.json";

// ----------------------------------------------------------------------------
// Identity
// ----------------------------------------------------------------------------

/// Load the identity seed from `dir`, creating a new identity on first use
pub fn load_or_create_identity(dir: &Path) -> Result<LocalKeyStore> {
    let path = dir.join(IDENTITY_FILE);
    if path.exists() {
        let encoded = fs::read_to_string(&path)?;
        let bytes = hex::decode(encoded.trim())?;
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            CliError::Identity(format!("{} must hold 32 bytes", path.display()))
        })?;
        let keys = LocalKeyStore::from_seed(seed)?;
        debug!(path = %path.display(), "Identity loaded");
        return Ok(keys);
    }

    fs::create_dir_all(dir)?;
    let keys = LocalKeyStore::generate()?;
    write_private(&path, hex::encode(keys.seed_bytes()).as_bytes())?;
    info!(path = %path.display(), "New identity created");
    Ok(keys)
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(contents)?;
    Ok(())
}

// ----------------------------------------------------------------------------
// Connection Records
// ----------------------------------------------------------------------------

/// Connection store that rewrites `connections.json` after every change
pub struct FileStore {
    path: PathBuf,
    memory: MemoryStore,
}

impl FileStore {
    /// Open the store in `dir`, loading any existing records
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(CONNECTIONS_FILE);
        let memory = MemoryStore::new();

        if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let connections: Vec<Connection> = serde_json::from_str(&contents).map_err(|e| {
                CliError::StatePersistence(format!("Failed to parse {}: {}", path.display(), e))
            })?;
            debug!(count = connections.len(), "Connection records loaded");
            for connection in connections {
                memory.save_connection(connection)?;
            }
        }
        Ok(Self { path, memory })
    }

    fn persist(&self) -> tether_core::Result<()> {
        let connections = self.memory.list_connections()?;
        let encoded = serde_json::to_vec_pretty(&connections)?;
        // Staged write; readers never see a partial file
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, encoded)
            .and_then(|()| fs::rename(&staging, &self.path))
            .map_err(|e| {
                TetherError::Storage(StorageError::Unavailable {
                    reason: e.to_string(),
                })
            })
    }
}

impl ConnectionStore for FileStore {
    fn save_connection(&self, connection: Connection) -> tether_core::Result<()> {
        self.memory.save_connection(connection)?;
        self.persist()
    }

    fn get_connection_by_user_id(&self, user_id: &UserId) -> tether_core::Result<Option<Connection>> {
        self.memory.get_connection_by_user_id(user_id)
    }

    fn get_connection(&self, id: &Uuid) -> tether_core::Result<Option<Connection>> {
        self.memory.get_connection(id)
    }

    fn update_connection_status(
        &self,
        user_id: &UserId,
        status: ConnectionStatus,
    ) -> tether_core::Result<Connection> {
        let connection = self.memory.update_connection_status(user_id, status)?;
        self.persist()?;
        Ok(connection)
    }

    fn delete_connection(&self, user_id: &UserId) -> tether_core::Result<bool> {
        let removed = self.memory.delete_connection(user_id)?;
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    fn list_connections(&self) -> tether_core::Result<Vec<Connection>> {
        self.memory.list_connections()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{KeyStore, Profile};

    fn peer(name: &str) -> Profile {
        let keys = LocalKeyStore::generate().unwrap();
        Profile::for_identity(&keys, name, None)
    }

    #[test]
    fn identity_survives_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create_identity(dir.path()).unwrap();
        let second = load_or_create_identity(dir.path()).unwrap();
        assert_eq!(first.user_id(), second.user_id());
        assert_eq!(first.public_key(), second.public_key());
    }

    #[test]
    fn corrupt_identity_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(IDENTITY_FILE), "abcd").unwrap();
        assert!(matches!(
            load_or_create_identity(dir.path()),
            Err(CliError::Identity(_))
        ));
    }

    #[test]
    fn connections_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let bob = peer("bob");
        let carol = peer("carol");
        {
            let store = FileStore::open(dir.path()).unwrap();
            store
                .save_connection(Connection::new(&bob, ConnectionStatus::PendingSent))
                .unwrap();
            store
                .save_connection(Connection::new(&carol, ConnectionStatus::Mutual))
                .unwrap();
            store
                .update_connection_status(&bob.user_id, ConnectionStatus::Mutual)
                .unwrap();
            assert!(store.delete_connection(&carol.user_id).unwrap());
        }

        let store = FileStore::open(dir.path()).unwrap();
        let connections = store.list_connections().unwrap();
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].user_id, bob.user_id);
        assert_eq!(connections[0].status, ConnectionStatus::Mutual);
    }
}

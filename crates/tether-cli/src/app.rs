//! Tether application: identity, connection records and the proximity node

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use tether_ble::{platform, ProximityNode};
use tether_core::{
    AdvertisementPayload, Connection, ConnectionStore, DeviceId, DiscoveredDevice,
    FollowTokenSchedule, KeyStore, LocalKeyStore, Profile, UserHash, UserId,
};

use crate::config::CliAppConfig;
use crate::error::{CliError, Result};
use crate::state::{self, FileStore};

/// How often range checks poll the discovery table
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Loaded identity and records; the radio node is created on demand
pub struct TetherApp {
    config: CliAppConfig,
    keys: Arc<LocalKeyStore>,
    store: Arc<FileStore>,
}

impl TetherApp {
    /// Load (or create) the identity and open the connection records
    pub fn open(config: CliAppConfig) -> Result<Self> {
        let data_dir = config.data_dir()?;
        let keys = Arc::new(state::load_or_create_identity(&data_dir)?);
        let store = Arc::new(FileStore::open(&data_dir)?);
        info!(user_id = %keys.user_id(), data_dir = %data_dir.display(), "Identity ready");
        Ok(Self {
            config,
            keys,
            store,
        })
    }

    pub fn config(&self) -> &CliAppConfig {
        &self.config
    }

    pub fn user_id(&self) -> &UserId {
        self.keys.user_id()
    }

    pub fn profile(&self) -> Profile {
        Profile::for_identity(
            self.keys.as_ref(),
            self.config.identity.display_name.clone(),
            self.config.identity.profile_photo.clone(),
        )
    }

    /// Advertisement this identity radiates right now
    pub fn current_advertisement(&self) -> AdvertisementPayload {
        let schedule = FollowTokenSchedule::new(self.config.ble.follow_token_interval());
        AdvertisementPayload::new(
            &self.config.identity.display_name,
            self.user_id().user_hash(),
            schedule.current(self.keys.as_ref(), Utc::now()),
        )
    }

    pub fn connections(&self) -> Result<Vec<Connection>> {
        Ok(self.store.list_connections()?)
    }

    /// Delete a record without touching the radio
    pub fn forget(&self, user_id: &UserId) -> Result<bool> {
        Ok(self.store.delete_connection(user_id)?)
    }

    /// Build the node on the platform radios and start advertising and scanning
    pub async fn start_node(&self) -> Result<ProximityNode> {
        let keys: Arc<dyn KeyStore> = self.keys.clone();
        let store: Arc<dyn ConnectionStore> = self.store.clone();
        let node = ProximityNode::new(
            keys,
            store,
            self.profile(),
            platform::platform_peripheral(),
            platform::platform_central(),
            self.config.ble.clone(),
        );
        node.start().await?;
        Ok(node)
    }
}

/// Wait until `device_id` shows up in range
pub async fn wait_for_device(
    node: &ProximityNode,
    device_id: &DeviceId,
    wait: Duration,
) -> Result<DiscoveredDevice> {
    let search = async {
        loop {
            if let Some(device) = node
                .nearby()
                .await?
                .into_iter()
                .find(|device| &device.device_id == device_id)
            {
                return Ok::<_, CliError>(device);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };
    match tokio::time::timeout(wait, search).await {
        Ok(result) => result,
        Err(_) => Err(CliError::PeerNotFound(device_id.to_string())),
    }
}

/// Wait until the advertiser of `user_hash` shows up in range
pub async fn wait_for_user(
    node: &ProximityNode,
    user_hash: UserHash,
    wait: Duration,
) -> Option<DiscoveredDevice> {
    let search = async {
        loop {
            match node.central().find_by_user_hash(user_hash).await {
                Ok(Some(device)) => return Some(device),
                Ok(None) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(e) => {
                    debug!("Range check failed: {}", e);
                    return None;
                }
            }
        }
    };
    tokio::time::timeout(wait, search).await.ok().flatten()
}

//! Proximity Node
//!
//! Owns one peripheral engine, one central engine and the connection manager,
//! and runs the follow handshake across them:
//!
//! - advertises the local identity with a rotating follow token
//! - scans for nearby peers and serves the local profile
//! - answers follow requests written to the Handshake characteristic
//! - re-reads the profile of any re-sighted peer it holds a `pending-sent`
//!   record for, upgrading the record once the peer is seen again
//!
//! Engines are injected at construction; nothing here is global.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tether_core::{
    BleEvent, Connection, ConnectionManager, ConnectionResponse, ConnectionStatus,
    ConnectionStore, DeviceId, DiscoveredDevice, ErrorCode, EventSink, FollowTokenSchedule,
    HandshakeMessage, KeyStore, OperationError, Profile, Result, TetherError, UserHash, UserId,
};

use crate::central::{CentralEngine, CentralHandle};
use crate::config::BleConfig;
use crate::peripheral::{PeripheralEngine, PeripheralHandle};
use crate::radio::{CentralRadio, PeripheralRadio};

// ----------------------------------------------------------------------------
// Proximity Node
// ----------------------------------------------------------------------------

/// Dual-role BLE node running the follow protocol
#[derive(Clone)]
pub struct ProximityNode {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    keys: Arc<dyn KeyStore>,
    manager: ConnectionManager,
    peripheral: PeripheralHandle,
    central: CentralHandle,
    events: EventSink,
    config: BleConfig,
    schedule: FollowTokenSchedule,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    last_resync: Mutex<HashMap<DeviceId, Instant>>,
}

impl ProximityNode {
    /// Spawn both engines on the current runtime; nothing is radiated until `start`
    pub fn new<P, C>(
        keys: Arc<dyn KeyStore>,
        store: Arc<dyn ConnectionStore>,
        profile: Profile,
        peripheral: P,
        central: C,
        config: BleConfig,
    ) -> Self
    where
        P: PeripheralRadio,
        C: CentralRadio,
    {
        let events = EventSink::new(config.event_capacity);
        let peripheral = PeripheralEngine::spawn(peripheral, events.clone(), &config);
        let central = CentralEngine::spawn(central, events.clone(), &config);
        let manager = ConnectionManager::new(keys.clone(), store, profile, config.handshake.clone());
        let schedule = FollowTokenSchedule::new(config.follow_token_interval());

        Self {
            inner: Arc::new(NodeInner {
                keys,
                manager,
                peripheral,
                central,
                events,
                config,
                schedule,
                tasks: Mutex::new(Vec::new()),
                last_resync: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.inner.manager
    }

    pub fn peripheral(&self) -> &PeripheralHandle {
        &self.inner.peripheral
    }

    pub fn central(&self) -> &CentralHandle {
        &self.inner.central
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BleEvent> {
        self.inner.events.subscribe()
    }

    pub fn user_id(&self) -> &UserId {
        self.inner.keys.user_id()
    }

    /// Serve the profile, advertise, scan, and start background tasks
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.inner.tasks.lock().await;
        if !tasks.is_empty() {
            debug!("Proximity node already started");
            return Ok(());
        }

        // Subscribe before anything is radiated so no event is missed
        let events = self.inner.events.subscribe();

        let inner = &self.inner;
        inner
            .peripheral
            .set_profile_data(inner.manager.local_profile())
            .await?;
        match inner.advertise().await {
            Ok(()) => {}
            // Scan-only platforms still discover and follow
            Err(e) if e.code() == ErrorCode::Unsupported => {
                warn!("Advertising unavailable, running scan-only: {}", e);
            }
            Err(e) => return Err(e),
        }
        inner.central.start_scan().await?;

        tasks.push(tokio::spawn(NodeInner::run_events(self.inner.clone(), events)));
        tasks.push(tokio::spawn(NodeInner::run_rotation(self.inner.clone())));
        info!(user_id = %inner.keys.user_id(), "Proximity node started");
        Ok(())
    }

    /// Stop background tasks, advertising and scanning
    pub async fn stop(&self) -> Result<()> {
        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.inner.peripheral.stop_advertising().await?;
        self.inner.central.stop_scan().await?;
        info!("Proximity node stopped");
        Ok(())
    }

    /// Stop and shut both engines down
    pub async fn shutdown(&self) {
        if let Err(e) = self.stop().await {
            warn!("Error while stopping node: {}", e);
        }
        self.inner.peripheral.shutdown().await;
        self.inner.central.shutdown().await;
    }

    /// Devices currently within range, strongest first
    pub async fn nearby(&self) -> Result<Vec<DiscoveredDevice>> {
        self.inner.central.discovered_devices().await
    }

    /// Send a follow request to `device_id`
    ///
    /// Reads the peer profile, writes our request, records `pending-sent`, then
    /// waits a bounded time for an inline response. Returns the record as it
    /// stands afterwards; `None` when the peer rejected.
    pub async fn follow(&self, device_id: &DeviceId) -> Result<Option<Connection>> {
        let central = &self.inner.central;
        central.connect(device_id, None).await?;
        let result = self.inner.follow_connected(device_id).await;
        if let Err(e) = central.disconnect(device_id).await {
            warn!(device_id = %device_id, "Failed to disconnect after follow: {}", e);
        }
        result
    }

    /// Approve a `pending-received` request and tell the requester, best-effort
    pub async fn accept(&self, user_id: &UserId) -> Result<Connection> {
        let (connection, response) = self.inner.manager.accept_request(user_id)?;
        if let Err(e) = self.inner.deliver(user_id, response).await {
            warn!(user_id = %user_id, "Acceptance not delivered: {}", e);
        }
        Ok(connection)
    }

    /// Decline a `pending-received` request and tell the requester, best-effort
    pub async fn reject(&self, user_id: &UserId) -> Result<()> {
        let response = self.inner.manager.reject_request(user_id)?;
        if let Err(e) = self.inner.deliver(user_id, response).await {
            warn!(user_id = %user_id, "Rejection not delivered: {}", e);
        }
        Ok(())
    }

    /// Forget a connection regardless of its status
    pub fn unfollow(&self, user_id: &UserId) -> Result<bool> {
        self.inner.manager.remove(user_id)
    }

    pub fn connections(&self) -> Result<Vec<Connection>> {
        self.inner.manager.list()
    }

    /// Re-read the profile of `device_id` now, ignoring the cooldown
    pub async fn resync(&self, device_id: &DeviceId) -> Result<Option<Connection>> {
        self.inner.resync(device_id).await
    }
}

impl NodeInner {
    fn user_hash(&self) -> UserHash {
        self.keys.user_id().user_hash()
    }

    async fn advertise(&self) -> Result<()> {
        let token = self.schedule.current(self.keys.as_ref(), Utc::now());
        self.peripheral
            .start_advertising(&self.manager.local_profile().display_name, self.user_hash(), token)
            .await
    }

    async fn follow_connected(&self, device_id: &DeviceId) -> Result<Option<Connection>> {
        let bytes = self.central.read_profile(device_id).await?;
        let peer = Profile::from_bytes(&bytes)?;
        if &peer.user_id == self.keys.user_id() {
            return Err(TetherError::invalid_transition(
                peer.user_id.as_str(),
                "cannot follow our own profile",
            ));
        }
        self.manager.on_profile_read(&peer)?;

        // Subscribe before writing so an inline response cannot slip past
        let mut events = self.events.subscribe();
        let request = HandshakeMessage::Request(self.manager.outgoing_request());
        self.central.write_handshake(device_id, &request).await?;
        let connection = self.manager.record_outgoing_request(&peer)?;
        info!(
            device_id = %device_id,
            user_id = %peer.user_id,
            status = %connection.status,
            "Follow request written"
        );

        let timeout = self.manager.policy().response_timeout();
        match tokio::time::timeout(timeout, wait_for_response(&mut events, &peer.user_id)).await {
            Ok(Some(response)) => self.manager.handle_response(&response),
            _ => {
                debug!(user_id = %peer.user_id, "No inline response; relying on re-discovery");
                self.manager.get(&peer.user_id)
            }
        }
    }

    /// Connect to wherever `user_id` is advertising and write `response`
    async fn deliver(&self, user_id: &UserId, response: ConnectionResponse) -> Result<()> {
        let device = self
            .central
            .find_by_user_hash(user_id.user_hash())
            .await?
            .ok_or_else(|| OperationError::DeviceNotFound {
                device_id: format!("advertiser of {}", user_id),
            })?;
        let device_id = device.device_id;

        self.central.connect(&device_id, None).await?;
        let result = self
            .central
            .write_handshake(&device_id, &HandshakeMessage::Response(response))
            .await;
        if let Err(e) = self.central.disconnect(&device_id).await {
            warn!(device_id = %device_id, "Failed to disconnect after delivery: {}", e);
        }
        if result.is_ok() {
            debug!(user_id = %user_id, device_id = %device_id, "Handshake response delivered");
        }
        result
    }

    async fn resync(&self, device_id: &DeviceId) -> Result<Option<Connection>> {
        self.central.connect(device_id, None).await?;
        let result = async {
            let bytes = self.central.read_profile(device_id).await?;
            let peer = Profile::from_bytes(&bytes)?;
            self.manager.on_profile_read(&peer)
        }
        .await;
        if let Err(e) = self.central.disconnect(device_id).await {
            warn!(device_id = %device_id, "Failed to disconnect after resync: {}", e);
        }
        result
    }

    /// Whether a `pending-sent` record exists for the advertiser of `user_hash`
    fn has_pending_sent(&self, user_hash: &UserHash) -> Result<bool> {
        Ok(self.manager.list()?.iter().any(|connection| {
            connection.status == ConnectionStatus::PendingSent
                && &connection.user_id.user_hash() == user_hash
        }))
    }

    /// Claim the resync slot for `device_id` unless it is cooling down
    async fn claim_resync(&self, device_id: &DeviceId) -> bool {
        let mut last_resync = self.last_resync.lock().await;
        claim_slot(
            &mut last_resync,
            device_id,
            Instant::now(),
            self.config.resync_cooldown(),
        )
    }

    // ------------------------------------------------------------------------
    // Background Tasks
    // ------------------------------------------------------------------------

    async fn run_events(self: Arc<Self>, mut events: broadcast::Receiver<BleEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.handle_event(event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Node event loop lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Node event loop finished");
    }

    async fn handle_event(self: &Arc<Self>, event: BleEvent) {
        match event {
            BleEvent::FollowRequestReceived {
                from_device_id,
                payload: HandshakeMessage::Request(request),
            } => match self.manager.handle_incoming_request(&request) {
                Ok((connection, response)) => {
                    info!(
                        device_id = %from_device_id,
                        user_id = %connection.user_id,
                        status = %connection.status,
                        "Follow request processed"
                    );
                    let inner = self.clone();
                    let user_id = request.user_id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = inner.deliver(&user_id, response).await {
                            warn!(user_id = %user_id, "Inline response not delivered: {}", e);
                        }
                    });
                }
                Err(e) => {
                    warn!(device_id = %from_device_id, "Follow request refused: {}", e);
                    self.events.emit_error(&e);
                }
            },
            BleEvent::FollowRequestReceived {
                payload: HandshakeMessage::Response(response),
                ..
            } => {
                if let Err(e) = self.manager.handle_response(&response) {
                    warn!(user_id = %response.user_id, "Follow response refused: {}", e);
                    self.events.emit_error(&e);
                }
            }
            BleEvent::DeviceDiscovered {
                device_id, payload, ..
            } if payload.is_known() => {
                match self.has_pending_sent(&payload.user_hash) {
                    Ok(true) => {}
                    Ok(false) => return,
                    Err(e) => {
                        warn!("Failed to check pending connections: {}", e);
                        return;
                    }
                }
                if !self.claim_resync(&device_id).await {
                    return;
                }
                let inner = self.clone();
                tokio::spawn(async move {
                    match inner.resync(&device_id).await {
                        Ok(Some(connection)) => info!(
                            user_id = %connection.user_id,
                            status = %connection.status,
                            "Re-sighted peer synced"
                        ),
                        Ok(None) => {}
                        Err(e) => warn!(device_id = %device_id, "Resync failed: {}", e),
                    }
                });
            }
            _ => {}
        }
    }

    /// Re-advertise with each new follow token and expire stale requests
    async fn run_rotation(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.schedule.until_next_rotation(Utc::now())).await;

            let token = self.schedule.current(self.keys.as_ref(), Utc::now());
            let display_name = &self.manager.local_profile().display_name;
            match self
                .peripheral
                .update_advertisement(display_name, self.user_hash(), token)
                .await
            {
                Ok(()) => debug!(follow_token = %token, "Follow token rotated"),
                Err(e) => warn!("Failed to rotate follow token: {}", e),
            }

            if let Err(e) = self.manager.expire_pending_now() {
                warn!("Failed to expire pending requests: {}", e);
            }
        }
    }
}

/// Claim `device_id` at `now` unless it is cooling down; expired claims are dropped
fn claim_slot(
    slots: &mut HashMap<DeviceId, Instant>,
    device_id: &DeviceId,
    now: Instant,
    cooldown: Duration,
) -> bool {
    slots.retain(|_, last| now.duration_since(*last) < cooldown);
    if slots.contains_key(device_id) {
        return false;
    }
    slots.insert(device_id.clone(), now);
    true
}

async fn wait_for_response(
    events: &mut broadcast::Receiver<BleEvent>,
    peer: &UserId,
) -> Option<ConnectionResponse> {
    loop {
        match events.recv().await {
            Ok(BleEvent::FollowRequestReceived {
                payload: HandshakeMessage::Response(response),
                ..
            }) if &response.user_id == peer => return Some(response),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed events while waiting for a response");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resync_slots_cool_down_and_expire() {
        let cooldown = Duration::from_secs(30);
        let start = Instant::now();
        let mut slots = HashMap::new();
        let alice = DeviceId::new("alice");

        assert!(claim_slot(&mut slots, &alice, start, cooldown));
        assert!(!claim_slot(&mut slots, &alice, start + Duration::from_secs(10), cooldown));
        assert!(claim_slot(&mut slots, &alice, start + cooldown, cooldown));
    }

    #[test]
    fn rotated_addresses_do_not_accumulate() {
        let cooldown = Duration::from_secs(30);
        let start = Instant::now();
        let mut slots = HashMap::new();

        for i in 0..100u64 {
            let device_id = DeviceId::new(format!("rotated-{i}"));
            let now = start + Duration::from_secs(i * 31);
            assert!(claim_slot(&mut slots, &device_id, now, cooldown));
            assert_eq!(slots.len(), 1);
        }
    }
}

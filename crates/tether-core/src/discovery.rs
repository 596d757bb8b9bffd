//! Discovered-device table with proximity filtering
//!
//! One entry per device id. Sightings below the RSSI threshold are dropped,
//! repeat sightings update the entry in place, and entries expire after a TTL
//! or when a new scan session begins.

use std::time::Duration;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::advertisement::AdvertisementPayload;
use crate::types::{DeviceId, Timestamp, UserHash};

/// Default proximity threshold in dBm (inclusive)
pub const DEFAULT_RSSI_THRESHOLD: i16 = -70;

/// Default lifetime of an entry without a fresh sighting
pub const DEFAULT_DEVICE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredDevice {
    pub device_id: DeviceId,
    pub rssi: i16,
    pub payload: AdvertisementPayload,
    pub last_seen: Timestamp,
}

#[derive(Debug, Clone)]
pub struct DiscoveryTable {
    devices: HashMap<DeviceId, DiscoveredDevice>,
    rssi_threshold: i16,
    ttl: Duration,
}

impl DiscoveryTable {
    pub fn new(rssi_threshold: i16, ttl: Duration) -> Self {
        Self {
            devices: HashMap::new(),
            rssi_threshold,
            ttl,
        }
    }

    pub fn rssi_threshold(&self) -> i16 {
        self.rssi_threshold
    }

    pub fn accepts(&self, rssi: i16) -> bool {
        rssi >= self.rssi_threshold
    }

    /// Record a sighting; `None` when it falls below the threshold
    pub fn observe(
        &mut self,
        device_id: DeviceId,
        rssi: i16,
        payload: AdvertisementPayload,
        now: Timestamp,
    ) -> Option<&DiscoveredDevice> {
        if !self.accepts(rssi) {
            debug!(device_id = %device_id, rssi, "Sighting below proximity threshold");
            return None;
        }

        let entry = self
            .devices
            .entry(device_id.clone())
            .or_insert_with(|| DiscoveredDevice {
                device_id,
                rssi,
                payload: AdvertisementPayload::unknown(),
                last_seen: now,
            });
        entry.rssi = rssi;
        entry.last_seen = now;
        // A payload-less re-sighting keeps what an earlier one decoded
        if payload.is_known() || !entry.payload.is_known() {
            entry.payload = payload;
        }
        Some(entry)
    }

    /// Forget everything from the previous scan session
    pub fn begin_session(&mut self) {
        self.devices.clear();
    }

    /// Drop entries not seen within the TTL, returning their ids
    pub fn evict_stale(&mut self, now: Timestamp) -> Vec<DeviceId> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        let stale: Vec<DeviceId> = self
            .devices
            .values()
            .filter(|device| now.signed_duration_since(device.last_seen) > ttl)
            .map(|device| device.device_id.clone())
            .collect();
        for device_id in &stale {
            self.devices.remove(device_id);
        }
        stale
    }

    pub fn get(&self, device_id: &DeviceId) -> Option<&DiscoveredDevice> {
        self.devices.get(device_id)
    }

    /// Most recently seen device advertising `user_hash`
    pub fn find_by_user_hash(&self, user_hash: &UserHash) -> Option<&DiscoveredDevice> {
        self.devices
            .values()
            .filter(|device| device.payload.is_known() && &device.payload.user_hash == user_hash)
            .max_by_key(|device| device.last_seen)
    }

    pub fn devices(&self) -> impl Iterator<Item = &DiscoveredDevice> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl Default for DiscoveryTable {
    fn default() -> Self {
        Self::new(DEFAULT_RSSI_THRESHOLD, DEFAULT_DEVICE_TTL)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::types::FollowToken;

    fn payload(hash: u8) -> AdvertisementPayload {
        AdvertisementPayload::new("peer", UserHash::new([hash; 6]), FollowToken::new([1; 4]))
    }

    #[test]
    fn threshold_is_inclusive() {
        let mut table = DiscoveryTable::default();
        let now = Utc::now();
        assert!(table
            .observe(DeviceId::new("a"), -71, payload(1), now)
            .is_none());
        assert!(table
            .observe(DeviceId::new("b"), -70, payload(1), now)
            .is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn unknown_resighting_keeps_decoded_payload() {
        let mut table = DiscoveryTable::default();
        let now = Utc::now();
        table.observe(DeviceId::new("a"), -50, payload(3), now);
        table.observe(DeviceId::new("a"), -40, AdvertisementPayload::unknown(), now);

        let device = table.get(&DeviceId::new("a")).unwrap();
        assert_eq!(device.rssi, -40);
        assert_eq!(device.payload.user_hash, UserHash::new([3; 6]));
    }

    #[test]
    fn stale_entries_are_evicted() {
        let mut table = DiscoveryTable::new(-70, Duration::from_secs(60));
        let start = Utc::now();
        table.observe(DeviceId::new("old"), -50, payload(1), start);
        table.observe(
            DeviceId::new("new"),
            -50,
            payload(2),
            start + chrono::Duration::seconds(30),
        );

        let evicted = table.evict_stale(start + chrono::Duration::seconds(61));
        assert_eq!(evicted, vec![DeviceId::new("old")]);
        assert!(table.get(&DeviceId::new("new")).is_some());

        table.begin_session();
        assert!(table.is_empty());
    }

    #[test]
    fn finds_latest_device_for_user_hash() {
        let mut table = DiscoveryTable::default();
        let now = Utc::now();
        table.observe(DeviceId::new("a"), -50, payload(9), now);
        table.observe(
            DeviceId::new("b"),
            -50,
            payload(9),
            now + chrono::Duration::seconds(1),
        );
        let found = table.find_by_user_hash(&UserHash::new([9; 6])).unwrap();
        assert_eq!(found.device_id, DeviceId::new("b"));
        assert!(table.find_by_user_hash(&UserHash::new([8; 6])).is_none());
    }
}

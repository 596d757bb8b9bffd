//! BLE engine configuration

use std::time::Duration;

use tether_core::discovery::{DEFAULT_DEVICE_TTL, DEFAULT_RSSI_THRESHOLD};
use tether_core::events::DEFAULT_EVENT_CAPACITY;
use tether_core::follow_token::DEFAULT_ROTATION_INTERVAL;
use tether_core::HandshakePolicy;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for both engines and the proximity node
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// Weakest RSSI (dBm) still considered nearby, inclusive
    pub rssi_threshold: i16,
    /// Discovered devices are forgotten after this long without a sighting
    pub device_ttl_ms: u64,
    /// Connect attempts fail after this long; 0 disables the timer
    pub connect_timeout_ms: u64,
    /// Scan sessions stop on their own after this long, if set
    pub scan_duration_ms: Option<u64>,
    /// Bytes served per Profile read when the platform does not negotiate
    pub default_mtu: usize,
    /// Follow token rotation window
    pub follow_token_interval_ms: u64,
    /// Minimum gap between automatic profile re-reads of one device
    pub resync_cooldown_ms: u64,
    /// Command mailbox size per engine
    pub command_buffer: usize,
    /// Event buffer before slow subscribers lag
    pub event_capacity: usize,
    /// Follow handshake tunables
    pub handshake: HandshakePolicy,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            rssi_threshold: DEFAULT_RSSI_THRESHOLD,
            device_ttl_ms: DEFAULT_DEVICE_TTL.as_millis() as u64,
            connect_timeout_ms: 10_000,
            scan_duration_ms: None,
            default_mtu: 185,
            follow_token_interval_ms: DEFAULT_ROTATION_INTERVAL.as_millis() as u64,
            resync_cooldown_ms: 30_000,
            command_buffer: 64,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            handshake: HandshakePolicy::default(),
        }
    }
}

impl BleConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rssi_threshold(mut self, threshold: i16) -> Self {
        self.rssi_threshold = threshold;
        self
    }

    pub fn with_device_ttl(mut self, ttl: Duration) -> Self {
        self.device_ttl_ms = ttl.as_millis() as u64;
        self
    }

    /// `Duration::ZERO` disables the connect timer
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_scan_duration(mut self, duration: Option<Duration>) -> Self {
        self.scan_duration_ms = duration.map(|d| d.as_millis() as u64);
        self
    }

    pub fn with_default_mtu(mut self, mtu: usize) -> Self {
        self.default_mtu = mtu;
        self
    }

    pub fn with_follow_token_interval(mut self, interval: Duration) -> Self {
        self.follow_token_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_resync_cooldown(mut self, cooldown: Duration) -> Self {
        self.resync_cooldown_ms = cooldown.as_millis() as u64;
        self
    }

    pub fn with_handshake(mut self, handshake: HandshakePolicy) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn device_ttl(&self) -> Duration {
        Duration::from_millis(self.device_ttl_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn scan_duration(&self) -> Option<Duration> {
        self.scan_duration_ms.map(Duration::from_millis)
    }

    pub fn follow_token_interval(&self) -> Duration {
        Duration::from_millis(self.follow_token_interval_ms)
    }

    pub fn resync_cooldown(&self) -> Duration {
        Duration::from_millis(self.resync_cooldown_ms)
    }
}

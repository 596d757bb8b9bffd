//! Event stream shared by both engines and the node

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::advertisement::AdvertisementPayload;
use crate::errors::{ErrorCode, TetherError};
use crate::protocol::HandshakeMessage;
use crate::types::DeviceId;

/// Default event buffer before slow subscribers start lagging
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

// ----------------------------------------------------------------------------
// Event Types
// ----------------------------------------------------------------------------

/// Link-layer state reported for a central connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

/// Events emitted by the engines; errors without a direct caller land here too
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BleEvent {
    /// A sighting passed the proximity filter
    #[serde(rename_all = "camelCase")]
    DeviceDiscovered {
        device_id: DeviceId,
        rssi: i16,
        payload: AdvertisementPayload,
    },
    #[serde(rename_all = "camelCase")]
    ConnectionStateChanged { device_id: DeviceId, state: LinkState },
    /// A valid handshake envelope was written to our GATT server
    #[serde(rename_all = "camelCase")]
    FollowRequestReceived {
        from_device_id: DeviceId,
        payload: HandshakeMessage,
    },
    ScanStopped,
    Error {
        message: String,
        code: Option<ErrorCode>,
    },
}

impl BleEvent {
    pub fn error(error: &TetherError) -> Self {
        BleEvent::Error {
            message: error.to_string(),
            code: Some(error.code()),
        }
    }
}

// ----------------------------------------------------------------------------
// Event Sink
// ----------------------------------------------------------------------------

/// Broadcast sender handed to every engine; clones share one channel
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: broadcast::Sender<BleEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BleEvent> {
        self.sender.subscribe()
    }

    /// Publish `event`; having no subscribers is not an error
    pub fn emit(&self, event: BleEvent) {
        if self.sender.send(event).is_err() {
            debug!("Event dropped: no subscribers");
        }
    }

    pub fn emit_error(&self, error: &TetherError) {
        self.emit(BleEvent::error(error));
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

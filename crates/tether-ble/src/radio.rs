//! Radio shim traits
//!
//! A shim submits requests to the platform stack and reports everything the
//! stack says back as typed inputs on the engine's input channel: state
//! changes, completions, sightings and GATT server requests. Engines never
//! await a platform operation to completion; they hold the caller's responder
//! until the matching input arrives.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use tether_core::{AdvertisementPayload, DeviceId, RadioState, Result};

/// Sender half handed to a shim; unbounded so callbacks never block
pub type InputSender<T> = mpsc::UnboundedSender<T>;

// ----------------------------------------------------------------------------
// Peripheral Role
// ----------------------------------------------------------------------------

/// Platform callbacks for the advertiser and GATT server
#[derive(Debug)]
pub enum PeripheralInput {
    StateChanged(RadioState),
    /// Completion of the last `start_advertising` submission
    AdvertisingStarted(Result<()>),
    /// A connected central reads a characteristic
    ReadRequest {
        device_id: DeviceId,
        characteristic: Uuid,
        offset: usize,
        mtu: Option<usize>,
        respond: oneshot::Sender<Result<Vec<u8>>>,
    },
    /// A connected central writes a characteristic
    WriteRequest {
        device_id: DeviceId,
        characteristic: Uuid,
        value: Vec<u8>,
        respond: oneshot::Sender<Result<()>>,
    },
}

/// Advertiser and GATT server of one platform
#[async_trait]
pub trait PeripheralRadio: Send + 'static {
    /// Start the stack; the current radio state is reported as an input
    async fn power_on(&mut self, inputs: InputSender<PeripheralInput>) -> Result<()>;

    /// Register the Tether service with its Profile and Handshake characteristics
    async fn publish_service(&mut self) -> Result<()>;

    /// Submit an advertisement; completion arrives as `AdvertisingStarted`
    async fn start_advertising(&mut self, payload: AdvertisementPayload) -> Result<()>;

    async fn stop_advertising(&mut self) -> Result<()>;
}

// ----------------------------------------------------------------------------
// Central Role
// ----------------------------------------------------------------------------

/// Platform callbacks for the scanner and GATT client
#[derive(Debug)]
pub enum CentralInput {
    StateChanged(RadioState),
    /// Raw sighting; the engine decodes and filters it
    Advertisement {
        device_id: DeviceId,
        rssi: i16,
        manufacturer_data: Option<Vec<u8>>,
        local_name: Option<String>,
    },
    Connected {
        device_id: DeviceId,
    },
    ConnectFailed {
        device_id: DeviceId,
        reason: String,
    },
    Disconnected {
        device_id: DeviceId,
    },
    /// Characteristics found under the Tether service
    ServicesDiscovered {
        device_id: DeviceId,
        result: Result<Vec<Uuid>>,
    },
    ReadComplete {
        device_id: DeviceId,
        characteristic: Uuid,
        result: Result<Vec<u8>>,
    },
    WriteComplete {
        device_id: DeviceId,
        characteristic: Uuid,
        result: Result<()>,
    },
    /// Engine timer: a connect attempt ran out of time
    ConnectTimeout {
        device_id: DeviceId,
        attempt: u64,
    },
    /// Engine timer: a scan session reached its configured duration
    ScanTimeout {
        session: u64,
    },
}

/// Scanner and GATT client of one platform
#[async_trait]
pub trait CentralRadio: Send + 'static {
    /// Start the stack; state and sightings are reported as inputs
    async fn power_on(&mut self, inputs: InputSender<CentralInput>) -> Result<()>;

    async fn start_scan(&mut self) -> Result<()>;

    async fn stop_scan(&mut self) -> Result<()>;

    /// Completion arrives as `Connected` or `ConnectFailed`
    async fn connect(&mut self, device_id: &DeviceId) -> Result<()>;

    /// Also cancels a pending connect; completion arrives as `Disconnected`
    async fn disconnect(&mut self, device_id: &DeviceId) -> Result<()>;

    /// Completion arrives as `ServicesDiscovered`
    async fn discover_services(&mut self, device_id: &DeviceId) -> Result<()>;

    /// Full-value read; completion arrives as `ReadComplete`
    async fn read(&mut self, device_id: &DeviceId, characteristic: Uuid) -> Result<()>;

    /// Write with response; completion arrives as `WriteComplete`
    async fn write(&mut self, device_id: &DeviceId, characteristic: Uuid, value: Vec<u8>) -> Result<()>;
}

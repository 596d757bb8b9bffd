//! Central shim over btleplug
//!
//! btleplug calls are awaited on spawned tasks and their outcome is reported
//! back as [`CentralInput`]s, so the engine never blocks on the radio.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tether_core::{DeviceId, RadioState, Result, MANUFACTURER_ID, TETHER_SERVICE_UUID};

use crate::error::BleTransportError;
use crate::radio::{CentralInput, CentralRadio, InputSender};

type PeripheralIds = Arc<RwLock<HashMap<DeviceId, PeripheralId>>>;

// ----------------------------------------------------------------------------
// btleplug Central
// ----------------------------------------------------------------------------

pub struct BtleplugCentral {
    adapter: Option<Adapter>,
    inputs: Option<InputSender<CentralInput>>,
    peripherals: PeripheralIds,
    event_task: Option<JoinHandle<()>>,
}

impl BtleplugCentral {
    pub fn new() -> Self {
        Self {
            adapter: None,
            inputs: None,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            event_task: None,
        }
    }

    fn adapter(&self) -> Result<&Adapter> {
        self.adapter
            .as_ref()
            .ok_or_else(|| BleTransportError::AdapterNotAvailable.into())
    }

    fn inputs(&self) -> Result<InputSender<CentralInput>> {
        self.inputs
            .clone()
            .ok_or_else(|| BleTransportError::InputChannelClosed.into())
    }

    async fn peripheral(&self, device_id: &DeviceId) -> Result<Peripheral> {
        let id = self
            .peripherals
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| BleTransportError::UnknownDevice {
                device_id: device_id.to_string(),
            })?;
        self.adapter()?.peripheral(&id).await.map_err(|_| {
            BleTransportError::UnknownDevice {
                device_id: device_id.to_string(),
            }
            .into()
        })
    }
}

impl Default for BtleplugCentral {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BtleplugCentral {
    fn drop(&mut self) {
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
    }
}

fn device_id_of(id: &PeripheralId) -> DeviceId {
    DeviceId::new(id.to_string())
}

/// Forward adapter events to the engine until the channel closes
async fn pump_events(
    adapter: Adapter,
    peripherals: PeripheralIds,
    inputs: InputSender<CentralInput>,
) {
    let mut events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            warn!("{}", BleTransportError::EventStreamFailed(e.to_string()));
            return;
        }
    };

    while let Some(event) = events.next().await {
        let input = match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ManufacturerDataAdvertisement { id, .. } => {
                match sighting(&adapter, &peripherals, id).await {
                    Some(input) => input,
                    None => continue,
                }
            }
            // Connects are confirmed by the task awaiting them; disconnects of
            // either side only surface here
            CentralEvent::DeviceDisconnected(id) => CentralInput::Disconnected {
                device_id: device_id_of(&id),
            },
            _ => continue,
        };
        if inputs.send(input).is_err() {
            debug!("Central engine gone, stopping btleplug event pump");
            break;
        }
    }
}

async fn sighting(adapter: &Adapter, peripherals: &PeripheralIds, id: PeripheralId) -> Option<CentralInput> {
    let peripheral = adapter.peripheral(&id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    // Sightings without signal strength cannot be placed against the threshold
    let rssi = properties.rssi?;

    let device_id = device_id_of(&id);
    peripherals.write().await.insert(device_id.clone(), id);
    Some(CentralInput::Advertisement {
        device_id,
        rssi,
        manufacturer_data: properties.manufacturer_data.get(&MANUFACTURER_ID).cloned(),
        local_name: properties.local_name,
    })
}

/// Input for a finished connect; the adapter's own connect event is not forwarded
fn connect_outcome(device_id: DeviceId, result: std::result::Result<(), String>) -> CentralInput {
    match result {
        Ok(()) => CentralInput::Connected { device_id },
        Err(e) => CentralInput::ConnectFailed {
            device_id,
            reason: BleTransportError::ConnectionFailed(e).to_string(),
        },
    }
}

/// Input for a finished local disconnect
///
/// A successful disconnect is reported by the adapter's event stream, which
/// also carries remote disconnects. Only a failure is reported here, so the
/// caller is not left waiting.
fn disconnect_outcome(
    device_id: DeviceId,
    result: std::result::Result<(), String>,
) -> Option<CentralInput> {
    match result {
        Ok(()) => None,
        Err(e) => {
            warn!(device_id = %device_id, "btleplug disconnect failed: {}", e);
            Some(CentralInput::Disconnected { device_id })
        }
    }
}

#[async_trait]
impl CentralRadio for BtleplugCentral {
    async fn power_on(&mut self, inputs: InputSender<CentralInput>) -> Result<()> {
        let manager = Manager::new()
            .await
            .map_err(|e| BleTransportError::PermissionDenied(e.to_string()))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| BleTransportError::EventStreamFailed(e.to_string()))?;

        let Some(adapter) = adapters.into_iter().next() else {
            warn!("No BLE adapter available");
            let _ = inputs.send(CentralInput::StateChanged(RadioState::Unsupported));
            return Ok(());
        };
        info!("BLE adapter initialized for scanning");

        self.event_task = Some(tokio::spawn(pump_events(
            adapter.clone(),
            self.peripherals.clone(),
            inputs.clone(),
        )));
        // btleplug reports no reliable power state; an adapter we can open is usable
        let _ = inputs.send(CentralInput::StateChanged(RadioState::PoweredOn));
        self.adapter = Some(adapter);
        self.inputs = Some(inputs);
        Ok(())
    }

    async fn start_scan(&mut self) -> Result<()> {
        // Unfiltered: peers without a readable payload still surface as unknown
        self.adapter()?
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| BleTransportError::EventStreamFailed(e.to_string()))?;
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<()> {
        self.adapter()?
            .stop_scan()
            .await
            .map_err(|e| BleTransportError::EventStreamFailed(e.to_string()))?;
        Ok(())
    }

    async fn connect(&mut self, device_id: &DeviceId) -> Result<()> {
        let peripheral = self.peripheral(device_id).await?;
        let inputs = self.inputs()?;
        let device_id = device_id.clone();
        tokio::spawn(async move {
            let result = peripheral.connect().await.map_err(|e| e.to_string());
            let _ = inputs.send(connect_outcome(device_id, result));
        });
        Ok(())
    }

    async fn disconnect(&mut self, device_id: &DeviceId) -> Result<()> {
        let peripheral = self.peripheral(device_id).await?;
        let inputs = self.inputs()?;
        let device_id = device_id.clone();
        tokio::spawn(async move {
            let result = peripheral.disconnect().await.map_err(|e| e.to_string());
            if let Some(input) = disconnect_outcome(device_id, result) {
                let _ = inputs.send(input);
            }
        });
        Ok(())
    }

    async fn discover_services(&mut self, device_id: &DeviceId) -> Result<()> {
        let peripheral = self.peripheral(device_id).await?;
        let inputs = self.inputs()?;
        let device_id = device_id.clone();
        tokio::spawn(async move {
            let result: Result<Vec<Uuid>> = match peripheral.discover_services().await {
                Ok(()) => Ok(peripheral
                    .characteristics()
                    .into_iter()
                    .filter(|c| c.service_uuid == TETHER_SERVICE_UUID)
                    .map(|c| c.uuid)
                    .collect()),
                Err(e) => Err(BleTransportError::ServiceDiscoveryFailed(e.to_string()).into()),
            };
            let _ = inputs.send(CentralInput::ServicesDiscovered { device_id, result });
        });
        Ok(())
    }

    async fn read(&mut self, device_id: &DeviceId, characteristic: Uuid) -> Result<()> {
        let peripheral = self.peripheral(device_id).await?;
        let inputs = self.inputs()?;
        let device_id = device_id.clone();
        tokio::spawn(async move {
            let target = peripheral
                .characteristics()
                .into_iter()
                .find(|c| c.uuid == characteristic);
            let result: Result<Vec<u8>> = match target {
                Some(target) => peripheral
                    .read(&target)
                    .await
                    .map_err(|e| BleTransportError::ReadFailed(e.to_string()).into()),
                None => Err(BleTransportError::ReadFailed(format!(
                    "characteristic {characteristic} not discovered"
                ))
                .into()),
            };
            let _ = inputs.send(CentralInput::ReadComplete {
                device_id,
                characteristic,
                result,
            });
        });
        Ok(())
    }

    async fn write(&mut self, device_id: &DeviceId, characteristic: Uuid, value: Vec<u8>) -> Result<()> {
        let peripheral = self.peripheral(device_id).await?;
        let inputs = self.inputs()?;
        let device_id = device_id.clone();
        tokio::spawn(async move {
            let target = peripheral
                .characteristics()
                .into_iter()
                .find(|c| c.uuid == characteristic);
            let result: Result<()> = match target {
                Some(target) => peripheral
                    .write(&target, &value, WriteType::WithResponse)
                    .await
                    .map_err(|e| BleTransportError::WriteFailed(e.to_string()).into()),
                None => Err(BleTransportError::WriteFailed(format!(
                    "characteristic {characteristic} not discovered"
                ))
                .into()),
            };
            let _ = inputs.send(CentralInput::WriteComplete {
                device_id,
                characteristic,
                result,
            });
        });
        Ok(())
    }
}

//! In-memory radios
//!
//! [`RadioMedium`] is a shared simulated airspace: loopback peripherals
//! advertise into it, loopback centrals scanning it receive their sightings,
//! and GATT traffic is routed straight into the target peripheral engine.
//! Recording radios log every call and complete nothing, so a test drives the
//! engine by injecting inputs itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use tether_core::{
    AdvertisementPayload, DeviceId, RadioState, Result, TetherError,
    HANDSHAKE_CHARACTERISTIC_UUID, PROFILE_CHARACTERISTIC_UUID,
};

use crate::radio::{CentralInput, CentralRadio, InputSender, PeripheralInput, PeripheralRadio};

/// Bytes requested per read by loopback centrals unless changed
pub const LOOPBACK_MTU: usize = 20;

// ----------------------------------------------------------------------------
// Medium
// ----------------------------------------------------------------------------

#[derive(Default)]
struct PeripheralSlot {
    inputs: Option<InputSender<PeripheralInput>>,
    advertisement: Option<AdvertisementPayload>,
    rssi: i16,
    unresponsive: bool,
}

#[derive(Default)]
struct CentralSlot {
    inputs: Option<InputSender<CentralInput>>,
    scanning: bool,
    mtu: usize,
}

#[derive(Default)]
struct MediumState {
    peripherals: HashMap<DeviceId, PeripheralSlot>,
    centrals: HashMap<DeviceId, CentralSlot>,
    radio_states: HashMap<DeviceId, RadioState>,
}

impl MediumState {
    fn radio_state(&self, address: &DeviceId) -> RadioState {
        self.radio_states
            .get(address)
            .copied()
            .unwrap_or(RadioState::PoweredOn)
    }

    /// Deliver `peripheral`'s advertisement to every scanning central
    fn broadcast(&self, peripheral: &DeviceId) {
        let Some(slot) = self.peripherals.get(peripheral) else {
            return;
        };
        let Some(payload) = &slot.advertisement else {
            return;
        };
        for central in self.centrals.values().filter(|c| c.scanning) {
            if let Some(inputs) = &central.inputs {
                let _ = inputs.send(sighting(peripheral, slot.rssi, payload));
            }
        }
    }
}

fn sighting(device_id: &DeviceId, rssi: i16, payload: &AdvertisementPayload) -> CentralInput {
    CentralInput::Advertisement {
        device_id: device_id.clone(),
        rssi,
        manufacturer_data: Some(payload.to_bytes()),
        local_name: None,
    }
}

/// Shared simulated airspace; clones refer to the same medium
#[derive(Clone, Default)]
pub struct RadioMedium {
    inner: Arc<Mutex<MediumState>>,
}

impl RadioMedium {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MediumState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Peripheral radio at `address`, heard by centrals at `rssi`
    pub fn peripheral(&self, address: &str, rssi: i16) -> LoopbackPeripheral {
        let address = DeviceId::new(address);
        self.lock().peripherals.insert(
            address.clone(),
            PeripheralSlot {
                rssi,
                ..PeripheralSlot::default()
            },
        );
        LoopbackPeripheral {
            medium: self.clone(),
            address,
        }
    }

    /// Central radio at `address`; peripherals see it under that id
    pub fn central(&self, address: &str) -> LoopbackCentral {
        let address = DeviceId::new(address);
        self.lock().centrals.insert(
            address.clone(),
            CentralSlot {
                mtu: LOOPBACK_MTU,
                ..CentralSlot::default()
            },
        );
        LoopbackCentral {
            medium: self.clone(),
            address,
        }
    }

    /// Change the radio state of both roles at `address`
    ///
    /// Before the engines power on this sets the state they start in.
    pub fn set_radio_state(&self, address: &str, state: RadioState) {
        let address = DeviceId::new(address);
        let mut medium = self.lock();
        medium.radio_states.insert(address.clone(), state);
        if !state.is_ready() {
            if let Some(slot) = medium.peripherals.get_mut(&address) {
                slot.advertisement = None;
            }
            if let Some(slot) = medium.centrals.get_mut(&address) {
                slot.scanning = false;
            }
        }
        if let Some(inputs) = medium.peripherals.get(&address).and_then(|s| s.inputs.as_ref()) {
            let _ = inputs.send(PeripheralInput::StateChanged(state));
        }
        if let Some(inputs) = medium.centrals.get(&address).and_then(|s| s.inputs.as_ref()) {
            let _ = inputs.send(CentralInput::StateChanged(state));
        }
    }

    /// Change how strongly `address` is heard and re-announce it
    pub fn set_rssi(&self, address: &str, rssi: i16) {
        let address = DeviceId::new(address);
        let mut medium = self.lock();
        if let Some(slot) = medium.peripherals.get_mut(&address) {
            slot.rssi = rssi;
        }
        medium.broadcast(&address);
    }

    /// Re-deliver the current advertisement of `address` to scanning centrals
    pub fn announce(&self, address: &str) {
        self.lock().broadcast(&DeviceId::new(address));
    }

    /// Connects to an unresponsive peripheral never complete
    pub fn set_unresponsive(&self, address: &str, unresponsive: bool) {
        if let Some(slot) = self.lock().peripherals.get_mut(&DeviceId::new(address)) {
            slot.unresponsive = unresponsive;
        }
    }

    /// Bytes a loopback central asks for per read
    pub fn set_mtu(&self, central: &str, mtu: usize) {
        if let Some(slot) = self.lock().centrals.get_mut(&DeviceId::new(central)) {
            slot.mtu = mtu.max(1);
        }
    }

    /// Payload currently advertised at `address`
    pub fn advertisement(&self, address: &str) -> Option<AdvertisementPayload> {
        self.lock()
            .peripherals
            .get(&DeviceId::new(address))
            .and_then(|slot| slot.advertisement.clone())
    }
}

// ----------------------------------------------------------------------------
// Loopback Peripheral
// ----------------------------------------------------------------------------

pub struct LoopbackPeripheral {
    medium: RadioMedium,
    address: DeviceId,
}

#[async_trait]
impl PeripheralRadio for LoopbackPeripheral {
    async fn power_on(&mut self, inputs: InputSender<PeripheralInput>) -> Result<()> {
        let mut medium = self.medium.lock();
        let state = medium.radio_state(&self.address);
        let _ = inputs.send(PeripheralInput::StateChanged(state));
        if let Some(slot) = medium.peripherals.get_mut(&self.address) {
            slot.inputs = Some(inputs);
        }
        Ok(())
    }

    async fn publish_service(&mut self) -> Result<()> {
        Ok(())
    }

    async fn start_advertising(&mut self, payload: AdvertisementPayload) -> Result<()> {
        let mut medium = self.medium.lock();
        let ready = medium.radio_state(&self.address).is_ready();
        let Some(slot) = medium.peripherals.get_mut(&self.address) else {
            return Err(TetherError::platform("peripheral not registered"));
        };
        let result = if ready {
            slot.advertisement = Some(payload);
            Ok(())
        } else {
            Err(TetherError::platform("radio not powered on"))
        };
        if let Some(inputs) = &slot.inputs {
            let _ = inputs.send(PeripheralInput::AdvertisingStarted(result));
        }
        medium.broadcast(&self.address);
        Ok(())
    }

    async fn stop_advertising(&mut self) -> Result<()> {
        if let Some(slot) = self.medium.lock().peripherals.get_mut(&self.address) {
            slot.advertisement = None;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Loopback Central
// ----------------------------------------------------------------------------

pub struct LoopbackCentral {
    medium: RadioMedium,
    address: DeviceId,
}

impl LoopbackCentral {
    fn inputs(&self) -> Result<InputSender<CentralInput>> {
        self.medium
            .lock()
            .centrals
            .get(&self.address)
            .and_then(|slot| slot.inputs.clone())
            .ok_or_else(|| TetherError::channel_error("central not powered on"))
    }

    fn peripheral_inputs(&self, device_id: &DeviceId) -> Option<InputSender<PeripheralInput>> {
        self.medium
            .lock()
            .peripherals
            .get(device_id)
            .and_then(|slot| slot.inputs.clone())
    }
}

#[async_trait]
impl CentralRadio for LoopbackCentral {
    async fn power_on(&mut self, inputs: InputSender<CentralInput>) -> Result<()> {
        let mut medium = self.medium.lock();
        let state = medium.radio_state(&self.address);
        let _ = inputs.send(CentralInput::StateChanged(state));
        if let Some(slot) = medium.centrals.get_mut(&self.address) {
            slot.inputs = Some(inputs);
        }
        Ok(())
    }

    async fn start_scan(&mut self) -> Result<()> {
        let mut medium = self.medium.lock();
        let Some(slot) = medium.centrals.get_mut(&self.address) else {
            return Err(TetherError::platform("central not registered"));
        };
        slot.scanning = true;
        let Some(inputs) = slot.inputs.clone() else {
            return Ok(());
        };
        for (device_id, peripheral) in &medium.peripherals {
            if let Some(payload) = &peripheral.advertisement {
                let _ = inputs.send(sighting(device_id, peripheral.rssi, payload));
            }
        }
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<()> {
        if let Some(slot) = self.medium.lock().centrals.get_mut(&self.address) {
            slot.scanning = false;
        }
        Ok(())
    }

    async fn connect(&mut self, device_id: &DeviceId) -> Result<()> {
        let inputs = self.inputs()?;
        let reachable = self
            .medium
            .lock()
            .peripherals
            .get(device_id)
            .map(|slot| !slot.unresponsive);
        match reachable {
            Some(true) => {
                let _ = inputs.send(CentralInput::Connected {
                    device_id: device_id.clone(),
                });
            }
            Some(false) => debug!(device_id = %device_id, "Loopback connect left pending"),
            None => {
                let _ = inputs.send(CentralInput::ConnectFailed {
                    device_id: device_id.clone(),
                    reason: "no such peripheral".to_string(),
                });
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self, device_id: &DeviceId) -> Result<()> {
        let _ = self.inputs()?.send(CentralInput::Disconnected {
            device_id: device_id.clone(),
        });
        Ok(())
    }

    async fn discover_services(&mut self, device_id: &DeviceId) -> Result<()> {
        let result = match self.peripheral_inputs(device_id) {
            Some(_) => Ok(vec![
                PROFILE_CHARACTERISTIC_UUID,
                HANDSHAKE_CHARACTERISTIC_UUID,
            ]),
            None => Err(TetherError::platform("peripheral went away")),
        };
        let _ = self.inputs()?.send(CentralInput::ServicesDiscovered {
            device_id: device_id.clone(),
            result,
        });
        Ok(())
    }

    async fn read(&mut self, device_id: &DeviceId, characteristic: Uuid) -> Result<()> {
        let inputs = self.inputs()?;
        let peripheral = self.peripheral_inputs(device_id);
        let mtu = self
            .medium
            .lock()
            .centrals
            .get(&self.address)
            .map(|slot| slot.mtu)
            .unwrap_or(LOOPBACK_MTU);
        let central = self.address.clone();
        let device_id = device_id.clone();

        // Long read: keep asking by offset until a short chunk arrives
        tokio::spawn(async move {
            let result = match peripheral {
                Some(peripheral) => {
                    read_all(&peripheral, &central, characteristic, mtu).await
                }
                None => Err(TetherError::disconnected(device_id.as_str())),
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
        let inputs = self.inputs()?;
        let peripheral = self.peripheral_inputs(device_id);
        let central = self.address.clone();
        let device_id = device_id.clone();

        tokio::spawn(async move {
            let result = match peripheral {
                Some(peripheral) => {
                    let (respond, reply) = oneshot::channel();
                    let request = PeripheralInput::WriteRequest {
                        device_id: central,
                        characteristic,
                        value,
                        respond,
                    };
                    match peripheral.send(request) {
                        Ok(()) => reply.await.unwrap_or_else(|_| {
                            Err(TetherError::channel_error("peripheral dropped the write"))
                        }),
                        Err(_) => Err(TetherError::disconnected(device_id.as_str())),
                    }
                }
                None => Err(TetherError::disconnected(device_id.as_str())),
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

async fn read_all(
    peripheral: &InputSender<PeripheralInput>,
    central: &DeviceId,
    characteristic: Uuid,
    mtu: usize,
) -> Result<Vec<u8>> {
    let mut value = Vec::new();
    loop {
        let (respond, reply) = oneshot::channel();
        peripheral
            .send(PeripheralInput::ReadRequest {
                device_id: central.clone(),
                characteristic,
                offset: value.len(),
                mtu: Some(mtu),
                respond,
            })
            .map_err(|_| TetherError::disconnected(central.as_str()))?;
        let chunk = reply
            .await
            .map_err(|_| TetherError::channel_error("peripheral dropped the read"))??;
        let done = chunk.len() < mtu;
        value.extend_from_slice(&chunk);
        if done {
            return Ok(value);
        }
    }
}

// ----------------------------------------------------------------------------
// Recording Radios
// ----------------------------------------------------------------------------

/// One call made by an engine into a recording radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    PowerOn,
    PublishService,
    StartAdvertising(AdvertisementPayload),
    StopAdvertising,
    StartScan,
    StopScan,
    Connect(DeviceId),
    Disconnect(DeviceId),
    DiscoverServices(DeviceId),
    Read(DeviceId, Uuid),
    Write(DeviceId, Uuid, Vec<u8>),
}

/// Shared log of radio calls
#[derive(Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<RadioCall>>>,
}

impl CallLog {
    fn push(&self, call: RadioCall) {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(call);
    }

    pub fn calls(&self) -> Vec<RadioCall> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn count(&self, matches: impl Fn(&RadioCall) -> bool) -> usize {
        self.calls().iter().filter(|call| matches(call)).count()
    }
}

/// Peripheral radio that records calls and completes nothing
#[derive(Clone, Default)]
pub struct RecordingPeripheral {
    pub log: CallLog,
}

#[async_trait]
impl PeripheralRadio for RecordingPeripheral {
    async fn power_on(&mut self, _inputs: InputSender<PeripheralInput>) -> Result<()> {
        self.log.push(RadioCall::PowerOn);
        Ok(())
    }

    async fn publish_service(&mut self) -> Result<()> {
        self.log.push(RadioCall::PublishService);
        Ok(())
    }

    async fn start_advertising(&mut self, payload: AdvertisementPayload) -> Result<()> {
        self.log.push(RadioCall::StartAdvertising(payload));
        Ok(())
    }

    async fn stop_advertising(&mut self) -> Result<()> {
        self.log.push(RadioCall::StopAdvertising);
        Ok(())
    }
}

/// Central radio that records calls and completes nothing
#[derive(Clone, Default)]
pub struct RecordingCentral {
    pub log: CallLog,
}

#[async_trait]
impl CentralRadio for RecordingCentral {
    async fn power_on(&mut self, _inputs: InputSender<CentralInput>) -> Result<()> {
        self.log.push(RadioCall::PowerOn);
        Ok(())
    }

    async fn start_scan(&mut self) -> Result<()> {
        self.log.push(RadioCall::StartScan);
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<()> {
        self.log.push(RadioCall::StopScan);
        Ok(())
    }

    async fn connect(&mut self, device_id: &DeviceId) -> Result<()> {
        self.log.push(RadioCall::Connect(device_id.clone()));
        Ok(())
    }

    async fn disconnect(&mut self, device_id: &DeviceId) -> Result<()> {
        self.log.push(RadioCall::Disconnect(device_id.clone()));
        Ok(())
    }

    async fn discover_services(&mut self, device_id: &DeviceId) -> Result<()> {
        self.log.push(RadioCall::DiscoverServices(device_id.clone()));
        Ok(())
    }

    async fn read(&mut self, device_id: &DeviceId, characteristic: Uuid) -> Result<()> {
        self.log.push(RadioCall::Read(device_id.clone(), characteristic));
        Ok(())
    }

    async fn write(&mut self, device_id: &DeviceId, characteristic: Uuid, value: Vec<u8>) -> Result<()> {
        self.log
            .push(RadioCall::Write(device_id.clone(), characteristic, value));
        Ok(())
    }
}

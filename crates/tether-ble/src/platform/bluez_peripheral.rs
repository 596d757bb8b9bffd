//! Peripheral shim over BlueZ (`bluer`)
//!
//! GATT callbacks forward each request to the engine as a
//! [`PeripheralInput`] and answer the central with whatever the engine
//! replies.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bluer::adv::{Advertisement, AdvertisementHandle, Type};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicRead, CharacteristicWrite,
    CharacteristicWriteMethod, ReqError, Service,
};
use bluer::{AdapterEvent, AdapterProperty};
use futures::{FutureExt, StreamExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tether_core::{
    AdvertisementPayload, DeviceId, ErrorCode, RadioState, Result, TetherError,
    HANDSHAKE_CHARACTERISTIC_UUID, MANUFACTURER_ID, PROFILE_CHARACTERISTIC_UUID,
    TETHER_SERVICE_UUID,
};

use crate::error::BleTransportError;
use crate::radio::{InputSender, PeripheralInput, PeripheralRadio};

// ----------------------------------------------------------------------------
// BlueZ Peripheral
// ----------------------------------------------------------------------------

pub struct BluezPeripheral {
    session: Option<bluer::Session>,
    adapter: Option<bluer::Adapter>,
    inputs: Option<InputSender<PeripheralInput>>,
    application: Option<ApplicationHandle>,
    advertisement: Option<AdvertisementHandle>,
    monitor: Option<JoinHandle<()>>,
}

impl BluezPeripheral {
    pub fn new() -> Self {
        Self {
            session: None,
            adapter: None,
            inputs: None,
            application: None,
            advertisement: None,
            monitor: None,
        }
    }

    fn adapter(&self) -> Result<&bluer::Adapter> {
        self.adapter
            .as_ref()
            .ok_or_else(|| BleTransportError::AdapterNotAvailable.into())
    }

    fn inputs(&self) -> Result<InputSender<PeripheralInput>> {
        self.inputs
            .clone()
            .ok_or_else(|| BleTransportError::InputChannelClosed.into())
    }
}

impl Default for BluezPeripheral {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BluezPeripheral {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

/// ATT error for an engine failure
fn req_error(error: &TetherError) -> ReqError {
    match error.code() {
        ErrorCode::InvalidOffset => ReqError::InvalidOffset,
        ErrorCode::CharacteristicNotFound => ReqError::NotSupported,
        ErrorCode::InvalidPayload => ReqError::InvalidValueLength,
        _ => ReqError::Failed,
    }
}

fn profile_characteristic(inputs: InputSender<PeripheralInput>) -> Characteristic {
    Characteristic {
        uuid: PROFILE_CHARACTERISTIC_UUID,
        read: Some(CharacteristicRead {
            read: true,
            fun: Box::new(move |request| {
                let inputs = inputs.clone();
                async move {
                    let (respond, reply) = oneshot::channel();
                    inputs
                        .send(PeripheralInput::ReadRequest {
                            device_id: DeviceId::new(request.device_address.to_string()),
                            characteristic: PROFILE_CHARACTERISTIC_UUID,
                            offset: request.offset as usize,
                            mtu: Some(request.mtu as usize),
                            respond,
                        })
                        .map_err(|_| ReqError::Failed)?;
                    match reply.await {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(e)) => Err(req_error(&e)),
                        Err(_) => Err(ReqError::Failed),
                    }
                }
                .boxed()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn handshake_characteristic(inputs: InputSender<PeripheralInput>) -> Characteristic {
    Characteristic {
        uuid: HANDSHAKE_CHARACTERISTIC_UUID,
        write: Some(CharacteristicWrite {
            write: true,
            method: CharacteristicWriteMethod::Fun(Box::new(move |value, request| {
                let inputs = inputs.clone();
                async move {
                    let (respond, reply) = oneshot::channel();
                    inputs
                        .send(PeripheralInput::WriteRequest {
                            device_id: DeviceId::new(request.device_address.to_string()),
                            characteristic: HANDSHAKE_CHARACTERISTIC_UUID,
                            value,
                            respond,
                        })
                        .map_err(|_| ReqError::Failed)?;
                    match reply.await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(req_error(&e)),
                        Err(_) => Err(ReqError::Failed),
                    }
                }
                .boxed()
            })),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Manufacturer data only, so the legacy PDU holds the whole frame
fn advertisement(payload: &AdvertisementPayload) -> Advertisement {
    Advertisement {
        advertisement_type: Type::Peripheral,
        manufacturer_data: BTreeMap::from([(MANUFACTURER_ID, payload.to_bytes())]),
        discoverable: Some(true),
        ..Default::default()
    }
}

/// Report adapter power changes until the engine goes away
async fn monitor_power(adapter: bluer::Adapter, inputs: InputSender<PeripheralInput>) {
    let mut events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            warn!("{}", BleTransportError::EventStreamFailed(e.to_string()));
            return;
        }
    };
    while let Some(event) = events.next().await {
        if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
            let state = if powered {
                RadioState::PoweredOn
            } else {
                RadioState::PoweredOff
            };
            debug!(?state, "BlueZ adapter power changed");
            if inputs.send(PeripheralInput::StateChanged(state)).is_err() {
                break;
            }
        }
    }
}

#[async_trait]
impl PeripheralRadio for BluezPeripheral {
    async fn power_on(&mut self, inputs: InputSender<PeripheralInput>) -> Result<()> {
        let session = match bluer::Session::new().await {
            Ok(session) => session,
            Err(e) => {
                warn!("BlueZ unavailable: {}", e);
                let _ = inputs.send(PeripheralInput::StateChanged(RadioState::Unsupported));
                return Ok(());
            }
        };
        let adapter = match session.default_adapter().await {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!("No BlueZ adapter: {}", e);
                let _ = inputs.send(PeripheralInput::StateChanged(RadioState::Unsupported));
                return Ok(());
            }
        };

        // Enable adapter if needed
        if !adapter.is_powered().await.unwrap_or(false) {
            if let Err(e) = adapter.set_powered(true).await {
                warn!("Failed to power on adapter: {}", e);
            }
        }
        let state = match adapter.is_powered().await {
            Ok(true) => RadioState::PoweredOn,
            Ok(false) => RadioState::PoweredOff,
            Err(e) if e.kind == bluer::ErrorKind::NotAuthorized => RadioState::Unauthorized,
            Err(_) => RadioState::Unknown,
        };
        info!(?state, adapter = adapter.name(), "BlueZ adapter initialized for advertising");

        self.monitor = Some(tokio::spawn(monitor_power(adapter.clone(), inputs.clone())));
        let _ = inputs.send(PeripheralInput::StateChanged(state));
        self.session = Some(session);
        self.adapter = Some(adapter);
        self.inputs = Some(inputs);
        Ok(())
    }

    async fn publish_service(&mut self) -> Result<()> {
        let inputs = self.inputs()?;
        let application = Application {
            services: vec![Service {
                uuid: TETHER_SERVICE_UUID,
                primary: true,
                characteristics: vec![
                    profile_characteristic(inputs.clone()),
                    handshake_characteristic(inputs),
                ],
                ..Default::default()
            }],
            ..Default::default()
        };

        let handle = self
            .adapter()?
            .serve_gatt_application(application)
            .await
            .map_err(|e| BleTransportError::ServiceRegistrationFailed(e.to_string()))?;
        self.application = Some(handle);
        Ok(())
    }

    async fn start_advertising(&mut self, payload: AdvertisementPayload) -> Result<()> {
        let inputs = self.inputs()?;
        // Replacing the handle unregisters any previous advertisement
        self.advertisement = None;

        let result: Result<()> = match self.adapter()?.advertise(advertisement(&payload)).await {
            Ok(handle) => {
                self.advertisement = Some(handle);
                Ok(())
            }
            Err(e) => Err(BleTransportError::AdvertisingFailed(e.to_string()).into()),
        };
        let _ = inputs.send(PeripheralInput::AdvertisingStarted(result));
        Ok(())
    }

    async fn stop_advertising(&mut self) -> Result<()> {
        // Dropping the handle unregisters the advertisement
        self.advertisement = None;
        Ok(())
    }
}

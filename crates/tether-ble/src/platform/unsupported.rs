//! Peripheral shim for platforms without GATT server support

use async_trait::async_trait;
use tracing::warn;

use tether_core::{AdvertisementPayload, RadioError, RadioState, Result};

use crate::radio::{InputSender, PeripheralInput, PeripheralRadio};

/// Reports the radio as unsupported; every request fails
#[derive(Debug, Default)]
pub struct UnsupportedPeripheral;

impl UnsupportedPeripheral {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeripheralRadio for UnsupportedPeripheral {
    async fn power_on(&mut self, inputs: InputSender<PeripheralInput>) -> Result<()> {
        warn!("BLE peripheral role is not supported on this platform; this device will not be discoverable");
        let _ = inputs.send(PeripheralInput::StateChanged(RadioState::Unsupported));
        Ok(())
    }

    async fn publish_service(&mut self) -> Result<()> {
        Err(RadioError::Unsupported.into())
    }

    async fn start_advertising(&mut self, _payload: AdvertisementPayload) -> Result<()> {
        Err(RadioError::Unsupported.into())
    }

    async fn stop_advertising(&mut self) -> Result<()> {
        Ok(())
    }
}

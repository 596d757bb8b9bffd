//! Platform radio shims
//!
//! - Central role: btleplug on every platform it supports
//! - Peripheral role: BlueZ through `bluer` on Linux; elsewhere the
//!   peripheral reports the radio as unsupported, so advertising fails with
//!   a distinguishable error while scanning keeps working

mod btleplug_central;
#[cfg(target_os = "linux")]
mod bluez_peripheral;
mod unsupported;

pub use btleplug_central::BtleplugCentral;
#[cfg(target_os = "linux")]
pub use bluez_peripheral::BluezPeripheral;
pub use unsupported::UnsupportedPeripheral;

/// Peripheral radio for the current platform
#[cfg(target_os = "linux")]
pub type PlatformPeripheral = BluezPeripheral;

/// Peripheral radio for the current platform
#[cfg(not(target_os = "linux"))]
pub type PlatformPeripheral = UnsupportedPeripheral;

/// Central radio for the current platform
pub type PlatformCentral = BtleplugCentral;

pub fn platform_peripheral() -> PlatformPeripheral {
    PlatformPeripheral::new()
}

pub fn platform_central() -> PlatformCentral {
    PlatformCentral::new()
}

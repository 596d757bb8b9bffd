//! Bluetooth Low Energy engines for the Tether follow protocol
//!
//! This crate runs the radio half of Tether on top of `tether-core`.
//!
//! ## Architecture
//!
//! - [`peripheral`] - advertiser and GATT server (Profile read, Handshake write)
//! - [`central`] - scanner, proximity filter and GATT client with lazy discovery
//! - [`node`] - both engines plus the connection manager running the handshake
//! - [`radio`] - shim traits and the typed inputs radios report back
//! - [`platform`] - btleplug central, BlueZ peripheral, unsupported fallback
//! - [`testing`] - in-memory radios for tests and simulations
//!
//! Each engine is a single tokio task owning its state. Handles send commands
//! over a bounded channel and await the reply; radio callbacks arrive on a
//! second channel into the same task, so every state change is serialized.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tether_ble::{platform, BleConfig, ProximityNode};
//! use tether_core::{KeyStore, LocalKeyStore, MemoryStore, Profile};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let keys = Arc::new(LocalKeyStore::generate()?);
//! let profile = Profile::for_identity(keys.as_ref(), "alice", None);
//! let node = ProximityNode::new(
//!     keys,
//!     Arc::new(MemoryStore::new()),
//!     profile,
//!     platform::platform_peripheral(),
//!     platform::platform_central(),
//!     BleConfig::default(),
//! );
//!
//! node.start().await?;
//! for device in node.nearby().await? {
//!     println!("{} at {} dBm", device.device_id, device.rssi);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Support
//!
//! - **Linux**: advertising and GATT server via `bluer`, scanning via btleplug
//! - **Other platforms**: scanning only; the peripheral reports `Unsupported`

pub mod central;
mod config;
mod error;
pub mod node;
mod pending;
pub mod peripheral;
pub mod platform;
pub mod radio;
pub mod testing;

// Public API exports
pub use central::{CentralEngine, CentralHandle, CentralStatus};
pub use config::BleConfig;
pub use error::BleTransportError;
pub use node::ProximityNode;
pub use pending::GattKey;
pub use peripheral::{PeripheralEngine, PeripheralHandle, PeripheralState, PeripheralStatus};
pub use radio::{CentralInput, CentralRadio, InputSender, PeripheralInput, PeripheralRadio};

//! Tether Core Protocol Implementation
//!
//! Platform-neutral pieces of the Tether proximity follow protocol: identity
//! and key store, the advertisement codec, GATT wire payloads, the discovery
//! table, the follow handshake state machine, the storage boundary and the
//! recipient-hiding content encryption. Radio engines live in `tether-ble`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod advertisement;
pub mod connection;
pub mod content;
pub mod crypto;
pub mod discovery;
pub mod errors;
pub mod events;
pub mod follow_token;
pub mod handshake;
pub mod identity;
pub mod protocol;
pub mod radio;
pub mod storage;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use advertisement::{AdvertisementPayload, MANUFACTURER_ID};
pub use connection::{Connection, ConnectionStatus, TrustLevel};
pub use content::{decrypt_post, encrypt_post, ContentEngine, EncryptedPost, Post};
pub use crypto::LookupId;
pub use discovery::{DiscoveredDevice, DiscoveryTable, DEFAULT_RSSI_THRESHOLD};
pub use errors::{
    CryptographicError, ErrorCode, OperationError, RadioError, Result, StorageError,
    TetherError, TetherResult,
};
pub use events::{BleEvent, EventSink, LinkState};
pub use follow_token::FollowTokenSchedule;
pub use handshake::{ConnectionManager, HandshakePolicy};
pub use identity::{KeyStore, LocalKeyStore, PublicKey, SharedSecret};
pub use protocol::{
    ConnectionRequest, ConnectionResponse, HandshakeMessage, Profile, ResponseStatus,
    HANDSHAKE_CHARACTERISTIC_UUID, PROFILE_CHARACTERISTIC_UUID, TETHER_SERVICE_UUID,
};
pub use radio::RadioState;
pub use storage::{ConnectionStore, MemoryStore, PostStore};
pub use types::{DeviceId, FollowToken, Timestamp, UserHash, UserId};

//! gattc - GATT client topology engine for Bluetooth LE
//!
//! Discovers a remote device's attribute hierarchy (services, included
//! services, characteristics, descriptors), caches it per device, persists it
//! between connections and multiplexes it across the applications sharing one
//! physical link. The ATT bearer and the connection manager are consumed
//! through the [`att::AttributeProtocol`] and [`gap::ConnectionManager`] traits.

pub mod att;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gap;
pub mod gatt;
pub mod uuid;

// Re-export common types for convenience
pub use att::{AttErrorCode, AttributeProtocol, AttributeProtocolCallback, RequestId};
pub use config::GattClientConfig;
pub use error::{GattError, GattResult};
pub use gap::{BdAddr, ConnectionManager, ConnectionObserver, DeviceIdentity, Transport};
pub use gatt::{
    AppId, AttributeCache, Characteristic, CharacteristicProperties, ConnectionState, Descriptor,
    GattClient, GattClientCallback, IncludeService, Service,
};
pub use uuid::Uuid;

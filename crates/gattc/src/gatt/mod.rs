//! GATT (Generic Attribute Profile) client
//!
//! This module discovers, caches and persists a remote device's attribute
//! hierarchy and shares it between the applications using that device.

pub mod cache;
pub mod callback;
pub mod client;
pub mod discovery;
pub mod persist;
pub mod registry;
pub mod types;

#[cfg(test)]
pub(crate) mod mock;

pub use cache::AttributeCache;
pub use callback::GattClientCallback;
pub use client::GattClient;
pub use discovery::{DiscoveryOrchestrator, DiscoveryStatus, DiscoveryTask};
pub use persist::{CacheError, CacheResult, CacheStore};
pub use registry::{AppId, ApplicationRegistry, ConnectionState, Registration};
pub use types::{Characteristic, CharacteristicProperties, Descriptor, IncludeService, Service};

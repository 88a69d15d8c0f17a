//! Common types for GATT operations
//!
//! This module defines the attribute hierarchy discovered on a remote server.
//! Child collections are keyed by handle so iteration is handle-ascending.

use crate::uuid::Uuid;
use bitflags::bitflags;
use std::collections::BTreeMap;

bitflags! {
    /// Characteristic properties as defined in the Bluetooth specification
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CharacteristicProperties: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

impl CharacteristicProperties {
    pub fn can_read(&self) -> bool {
        self.contains(Self::READ)
    }

    pub fn can_write(&self) -> bool {
        self.contains(Self::WRITE)
    }

    pub fn can_write_without_response(&self) -> bool {
        self.contains(Self::WRITE_WITHOUT_RESPONSE)
    }

    pub fn can_notify(&self) -> bool {
        self.contains(Self::NOTIFY)
    }

    pub fn can_indicate(&self) -> bool {
        self.contains(Self::INDICATE)
    }
}

/// A GATT service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    /// Service declaration handle (start of the service range)
    pub handle: u16,
    /// Last handle belonging to this service
    pub end_handle: u16,
    /// Whether this is a primary or secondary service
    pub is_primary: bool,
    /// Service UUID
    pub uuid: Uuid,
    /// Include declarations, in discovery order
    pub include_services: Vec<IncludeService>,
    /// Characteristics keyed by declaration handle
    pub characteristics: BTreeMap<u16, Characteristic>,
}

impl Service {
    /// Create a service with no children
    pub fn new(handle: u16, end_handle: u16, uuid: Uuid, is_primary: bool) -> Self {
        Self {
            handle,
            end_handle,
            is_primary,
            uuid,
            include_services: Vec::new(),
            characteristics: BTreeMap::new(),
        }
    }

    /// Whether `handle` falls inside this service's range
    pub fn contains(&self, handle: u16) -> bool {
        (self.handle..=self.end_handle).contains(&handle)
    }
}

/// An include declaration referencing another service range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncludeService {
    /// Handle of the include declaration itself
    pub handle: u16,
    /// Start handle of the included service
    pub start_handle: u16,
    /// End handle of the included service
    pub end_handle: u16,
    /// UUID of the included service
    pub uuid: Uuid,
}

impl IncludeService {
    pub fn new(handle: u16, start_handle: u16, end_handle: u16, uuid: Uuid) -> Self {
        Self {
            handle,
            start_handle,
            end_handle,
            uuid,
        }
    }
}

/// A GATT characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    /// Declaration handle
    pub handle: u16,
    /// Value handle, normally `handle + 1`
    pub value_handle: u16,
    /// Characteristic properties
    pub properties: CharacteristicProperties,
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Descriptors keyed by handle
    pub descriptors: BTreeMap<u16, Descriptor>,
}

impl Characteristic {
    pub fn new(
        handle: u16,
        value_handle: u16,
        properties: CharacteristicProperties,
        uuid: Uuid,
    ) -> Self {
        Self {
            handle,
            value_handle,
            properties,
            uuid,
            descriptors: BTreeMap::new(),
        }
    }
}

/// A characteristic descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub handle: u16,
    pub uuid: Uuid,
}

impl Descriptor {
    pub fn new(handle: u16, uuid: Uuid) -> Self {
        Self { handle, uuid }
    }
}

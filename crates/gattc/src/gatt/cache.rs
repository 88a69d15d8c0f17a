//! Attribute cache for one remote device
//!
//! Holds the discovered service hierarchy and a reverse index from value
//! handles to their owners so notifications and reads resolve in O(1).
//! Every insert that creates a characteristic or descriptor updates the index
//! in the same call, so an indexed handle always resolves to a live entry.

use crate::error::{GattError, GattResult};
use crate::gatt::types::{Characteristic, Descriptor, IncludeService, Service};
use crate::uuid::Uuid;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound::{Excluded, Unbounded};

/// Owner of an indexed value handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Owner {
    service: u16,
    characteristic: u16,
}

/// In-memory attribute hierarchy of a remote device
#[derive(Debug, Clone, Default)]
pub struct AttributeCache {
    services: BTreeMap<u16, Service>,
    /// value handle (characteristic value or descriptor) -> owner
    value_handles: HashMap<u16, Owner>,
    /// characteristic declaration handle -> service handle
    characteristic_services: HashMap<u16, u16>,
}

impl AttributeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a service, or merge `end_handle` and `uuid` into an existing one.
    pub fn add_service(&mut self, service: Service) {
        match self.services.get_mut(&service.handle) {
            Some(existing) => {
                existing.end_handle = service.end_handle;
                existing.uuid = service.uuid;
            }
            None => {
                let mut service = service;
                // Children arrive through their own add_* calls.
                service.include_services.clear();
                service.characteristics.clear();
                self.services.insert(service.handle, service);
            }
        }
    }

    /// Append an include declaration to a known service.
    pub fn add_include_service(
        &mut self,
        service_handle: u16,
        include: IncludeService,
    ) -> GattResult<()> {
        let service = self
            .services
            .get_mut(&service_handle)
            .ok_or(GattError::NotFound)?;
        service.include_services.push(include);
        Ok(())
    }

    /// Insert a characteristic under a known service, or update `properties`
    /// and `uuid` of an existing one.
    pub fn add_characteristic(
        &mut self,
        service_handle: u16,
        characteristic: Characteristic,
    ) -> GattResult<()> {
        let service = self
            .services
            .get_mut(&service_handle)
            .ok_or(GattError::NotFound)?;

        if let Some(existing) = service.characteristics.get_mut(&characteristic.handle) {
            existing.properties = characteristic.properties;
            existing.uuid = characteristic.uuid;
            return Ok(());
        }

        let mut characteristic = characteristic;
        characteristic.descriptors.clear();
        self.value_handles.insert(
            characteristic.value_handle,
            Owner {
                service: service_handle,
                characteristic: characteristic.handle,
            },
        );
        self.characteristic_services
            .insert(characteristic.handle, service_handle);
        service
            .characteristics
            .insert(characteristic.handle, characteristic);
        Ok(())
    }

    /// Insert a descriptor under the characteristic declared at
    /// `characteristic_handle`, wherever its service is.
    pub fn add_descriptor(
        &mut self,
        characteristic_handle: u16,
        descriptor: Descriptor,
    ) -> GattResult<()> {
        let service_handle = *self
            .characteristic_services
            .get(&characteristic_handle)
            .ok_or(GattError::NotFound)?;
        let characteristic = self
            .services
            .get_mut(&service_handle)
            .and_then(|service| service.characteristics.get_mut(&characteristic_handle))
            .ok_or(GattError::NotFound)?;

        characteristic
            .descriptors
            .insert(descriptor.handle, descriptor);
        self.value_handles.insert(
            descriptor.handle,
            Owner {
                service: service_handle,
                characteristic: characteristic_handle,
            },
        );
        Ok(())
    }

    /// Last handle that can belong to the characteristic at
    /// `characteristic_handle`: one before the next characteristic of the same
    /// service, or the service end handle for the last one.
    ///
    /// Returns `None` when either the service or the characteristic is unknown.
    pub fn characteristic_end_handle(
        &self,
        service_handle: u16,
        characteristic_handle: u16,
    ) -> Option<u16> {
        let service = self.services.get(&service_handle)?;
        if !service.characteristics.contains_key(&characteristic_handle) {
            return None;
        }
        match service
            .characteristics
            .range((Excluded(characteristic_handle), Unbounded))
            .next()
        {
            Some((&next, _)) => Some(next - 1),
            None => Some(service.end_handle),
        }
    }

    /// Resolve a characteristic by its value handle.
    pub fn characteristic_by_value_handle(&self, value_handle: u16) -> Option<&Characteristic> {
        let owner = self.value_handles.get(&value_handle)?;
        self.services
            .get(&owner.service)?
            .characteristics
            .get(&owner.characteristic)
            .filter(|c| c.value_handle == value_handle)
    }

    /// Resolve a descriptor by its handle.
    pub fn descriptor(&self, handle: u16) -> Option<&Descriptor> {
        let owner = self.value_handles.get(&handle)?;
        self.services
            .get(&owner.service)?
            .characteristics
            .get(&owner.characteristic)?
            .descriptors
            .get(&handle)
    }

    /// Service and characteristic declaration handles owning `value_handle`.
    pub fn owner_of(&self, value_handle: u16) -> Option<(u16, u16)> {
        self.value_handles
            .get(&value_handle)
            .map(|owner| (owner.service, owner.characteristic))
    }

    /// Characteristic by declaration handle.
    pub fn characteristic(&self, characteristic_handle: u16) -> Option<&Characteristic> {
        let service = self.characteristic_services.get(&characteristic_handle)?;
        self.services
            .get(service)?
            .characteristics
            .get(&characteristic_handle)
    }

    pub fn service(&self, service_handle: u16) -> Option<&Service> {
        self.services.get(&service_handle)
    }

    /// Services in handle order.
    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    /// Owned copy of every service, in handle order.
    pub fn snapshot(&self) -> Vec<Service> {
        self.services.values().cloned().collect()
    }

    pub fn find_service(&self, uuid: &Uuid) -> Option<&Service> {
        self.services.values().find(|s| s.uuid == *uuid)
    }

    pub fn find_characteristic(&self, uuid: &Uuid) -> Option<&Characteristic> {
        self.services
            .values()
            .flat_map(|s| s.characteristics.values())
            .find(|c| c.uuid == *uuid)
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Drop every service and index entry.
    pub fn clear(&mut self) {
        self.services.clear();
        self.value_handles.clear();
        self.characteristic_services.clear();
    }
}
